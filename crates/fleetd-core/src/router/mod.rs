//! Command routing module.
//!
//! Maps envelope commands onto ordered lists of registered handlers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use crate::envelope::Envelope;

/// Error type handlers may surface; dispatch logs and swallows it.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A registered message handler.
///
/// Handlers receive a borrowed envelope and must not retain it. They run on
/// the dispatching task with no router or process-table lock held, so they
/// are free to call back into the supervisor.
pub type Handler = Arc<dyn Fn(&Envelope) -> Result<(), HandlerError> + Send + Sync>;

/// Command-to-handler dispatch table.
#[derive(Default)]
pub struct Router {
    handlers: Mutex<HashMap<String, Vec<Handler>>>,
}

impl Router {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler to the list for `command`.
    pub fn register(&self, command: impl Into<String>, handler: Handler) {
        let mut handlers = self.handlers.lock().expect("router lock poisoned");
        handlers.entry(command.into()).or_default().push(handler);
    }

    /// Dispatch an envelope to every handler registered for its command, in
    /// registration order.
    ///
    /// Handler failures are logged and swallowed; an unknown command is a
    /// silent drop. The handler list is cloned out of the table lock before
    /// invocation, so dispatch is safe against concurrent registration.
    pub fn dispatch(&self, envelope: &Envelope) {
        let matched = {
            let handlers = self.handlers.lock().expect("router lock poisoned");
            handlers.get(&envelope.command).cloned()
        };
        let Some(matched) = matched else {
            debug!(command = %envelope.command, "no handler registered, dropping envelope");
            return;
        };
        for handler in matched {
            if let Err(err) = handler(envelope) {
                error!(
                    command = %envelope.command,
                    source = %envelope.source,
                    "message handler failed: {err}"
                );
            }
        }
    }

    /// Remove every registered handler.
    pub fn unregister_all(&self) {
        self.handlers.lock().expect("router lock poisoned").clear();
    }

    /// Number of handlers registered for `command`.
    #[must_use]
    pub fn handler_count(&self, command: &str) -> usize {
        self.handlers
            .lock()
            .expect("router lock poisoned")
            .get(command)
            .map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.lock().expect("router lock poisoned");
        let mut map = f.debug_map();
        for (command, list) in handlers.iter() {
            map.entry(command, &list.len());
        }
        map.finish()
    }
}
