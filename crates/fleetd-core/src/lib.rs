//! # fleetd-core
//!
//! Core library for fleetd - a local process supervisor for heterogeneous
//! worker fleets.
//!
//! This crate provides the supervision and messaging engine of a desktop
//! application that fans out work to child binaries written in different
//! languages and keeps them alive as a coherent fleet.
//!
//! ## Features
//!
//! - **Process Lifecycle**: Dependency-ordered startup, crash detection,
//!   and bounded-attempt restart
//! - **IPC Channels**: Pluggable envelope transports (file-drop and stdio
//!   pipes) bound per process
//! - **Message Routing**: Validated envelopes dispatched to registered
//!   command handlers
//! - **Event Loop**: Channel polling multiplexed with supervision timers
//!   and signal-driven shutdown
//!
//! ## Example
//!
//! ```rust,no_run
//! use fleetd_core::channel::ChannelKind;
//! use fleetd_core::process::ProcessConfig;
//! use fleetd_core::supervisor::Supervisor;
//!
//! # async fn example() -> Result<(), fleetd_core::supervisor::SupervisorError> {
//! let supervisor = Supervisor::new();
//!
//! let config = ProcessConfig::builder()
//!     .name("worker")
//!     .executable_path("./worker")
//!     .transport(ChannelKind::Stdio)
//!     .build();
//!
//! supervisor.register_process(config).await?;
//! supervisor.run().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod adapter;
pub mod channel;
pub mod config;
pub mod envelope;
pub mod process;
pub mod router;
pub mod supervisor;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::channel::{Channel, ChannelKind};
    pub use crate::config::FleetConfig;
    pub use crate::envelope::{Envelope, EnvelopeKind};
    pub use crate::process::{ProcessConfig, ProcessKind, ProcessState};
    pub use crate::supervisor::{Supervisor, SupervisorOptions};
}

/// Re-export commonly used types at the crate root.
pub use config::FleetConfig;
pub use envelope::{Envelope, EnvelopeKind};
pub use process::{ProcessConfig, ProcessState};
pub use supervisor::Supervisor;
