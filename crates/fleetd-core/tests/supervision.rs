//! End-to-end supervision scenarios driving real child processes.

#![cfg(unix)]

use std::time::{Duration, Instant};

use fleetd_core::envelope::{Envelope, EnvelopeKind};
use fleetd_core::process::{ProcessConfig, ProcessState};
use fleetd_core::supervisor::Supervisor;

fn shell(name: &str, script: &str) -> ProcessConfig {
    ProcessConfig::builder()
        .name(name)
        .executable_path("/bin/sh")
        .args(["-c", script])
        .heartbeat_enabled(false)
        .auto_restart(false)
        .build()
}

async fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}

#[tokio::test]
async fn test_dependency_ordered_startup_and_shutdown() {
    let supervisor = Supervisor::new();

    // Register the dependent first: start_all must still bring the
    // dependency up before it.
    let b = ProcessConfig::builder()
        .name("b")
        .executable_path("/bin/sh")
        .args(["-c", "sleep 30"])
        .heartbeat_enabled(false)
        .auto_restart(false)
        .depends_on("a")
        .build();
    supervisor.register_process(b).await.unwrap();
    supervisor.register_process(shell("a", "sleep 30")).await.unwrap();

    supervisor.start_all().await;

    assert_eq!(
        supervisor.get_process_state("a"),
        Some(ProcessState::Running)
    );
    assert_eq!(
        supervisor.get_process_state("b"),
        Some(ProcessState::Running)
    );

    // The dependency was running strictly before the dependent started.
    let rows = supervisor.get_all_processes();
    let started_a = rows.iter().find(|r| r.name == "a").unwrap().started_at.unwrap();
    let started_b = rows.iter().find(|r| r.name == "b").unwrap().started_at.unwrap();
    assert!(started_a <= started_b);

    supervisor.stop_all().await;
    assert_eq!(
        supervisor.get_process_state("a"),
        Some(ProcessState::Stopped)
    );
    assert_eq!(
        supervisor.get_process_state("b"),
        Some(ProcessState::Stopped)
    );

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_crash_restart_until_attempts_exhausted() {
    let supervisor = Supervisor::new();
    let config = ProcessConfig::builder()
        .name("x")
        .executable_path("/bin/sh")
        .args(["-c", "exit 42"])
        .heartbeat_enabled(false)
        .auto_restart(true)
        .max_restart_attempts(2)
        .restart_delay(Duration::from_millis(100))
        .build();
    supervisor.register_process(config).await.unwrap();

    supervisor.start_process("x").await.unwrap();

    // Crash, restart, crash, restart, crash: terminal after two restarts.
    let exhausted = wait_for(
        || {
            let rows = supervisor.get_all_processes();
            let row = &rows[0];
            row.state == ProcessState::Crashed && row.restart_count == 2
        },
        Duration::from_secs(20),
    )
    .await;
    assert!(exhausted, "process never reached terminal crashed state");

    // Terminal: no further restarts happen.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let rows = supervisor.get_all_processes();
    assert_eq!(rows[0].state, ProcessState::Crashed);
    assert_eq!(rows[0].restart_count, 2);
    assert_eq!(rows[0].last_error.as_deref(), Some("exited with code 42"));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_timeout_marks_process_crashed() {
    let supervisor = Supervisor::new();
    let config = ProcessConfig::builder()
        .name("y")
        .executable_path("/bin/sh")
        .args(["-c", "sleep 30"])
        .heartbeat_enabled(true)
        .heartbeat_timeout(Duration::from_secs(2))
        .auto_restart(false)
        .build();
    supervisor.register_process(config).await.unwrap();

    supervisor.start_process("y").await.unwrap();
    assert_eq!(
        supervisor.get_process_state("y"),
        Some(ProcessState::Running)
    );

    let crashed = wait_for(
        || supervisor.get_process_state("y") == Some(ProcessState::Crashed),
        Duration::from_secs(8),
    )
    .await;
    assert!(crashed, "heartbeat timeout never fired");

    let rows = supervisor.get_all_processes();
    assert_eq!(rows[0].last_error.as_deref(), Some("heartbeat timeout"));

    // Shutdown reaps the hung child.
    supervisor.shutdown().await;
    assert!(supervisor.get_all_processes().is_empty());
}

#[tokio::test]
async fn test_heartbeats_keep_a_silent_process_alive() {
    let supervisor = Supervisor::new();
    let config = ProcessConfig::builder()
        .name("z")
        .executable_path("/bin/sh")
        .args(["-c", "sleep 30"])
        .heartbeat_enabled(true)
        .heartbeat_timeout(Duration::from_secs(2))
        .auto_restart(false)
        .build();
    supervisor.register_process(config).await.unwrap();
    supervisor.start_process("z").await.unwrap();

    // Inject heartbeats faster than the timeout for longer than the
    // timeout window.
    for seq in 0..7 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let beat = Envelope::new(EnvelopeKind::Heartbeat, "z", "sup", "heartbeat")
            .with_timestamp(seq)
            .with_id(format!("hb-{seq}"));
        supervisor.inject_envelope(&beat);
    }

    assert_eq!(
        supervisor.get_process_state("z"),
        Some(ProcessState::Running)
    );

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_stop_start_preserves_restart_count() {
    let supervisor = Supervisor::new();
    supervisor
        .register_process(shell("w", "sleep 30"))
        .await
        .unwrap();

    supervisor.start_process("w").await.unwrap();
    supervisor.stop_process("w", false).await.unwrap();
    assert_eq!(
        supervisor.get_process_state("w"),
        Some(ProcessState::Stopped)
    );

    supervisor.start_process("w").await.unwrap();
    assert_eq!(
        supervisor.get_process_state("w"),
        Some(ProcessState::Running)
    );
    assert_eq!(supervisor.get_all_processes()[0].restart_count, 0);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_restart_increments_count_and_returns_to_running() {
    let supervisor = Supervisor::new();
    supervisor
        .register_process(shell("r", "sleep 30"))
        .await
        .unwrap();

    supervisor.start_process("r").await.unwrap();
    supervisor.restart_process("r").await.unwrap();

    assert_eq!(
        supervisor.get_process_state("r"),
        Some(ProcessState::Running)
    );
    assert_eq!(supervisor.get_all_processes()[0].restart_count, 1);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_running_fleet_within_grace() {
    let supervisor = Supervisor::new();
    supervisor
        .register_process(shell("one", "sleep 30"))
        .await
        .unwrap();
    supervisor
        .register_process(shell("two", "sleep 30"))
        .await
        .unwrap();
    supervisor.start_all().await;
    assert_eq!(supervisor.running_count(), 2);

    let started = Instant::now();
    supervisor.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(6));

    // Table is cleared; a second shutdown is a no-op.
    assert!(supervisor.get_all_processes().is_empty());
    supervisor.shutdown().await;
    assert_eq!(supervisor.process_count(), 0);
}

#[tokio::test]
async fn test_spawn_failure_marks_process_crashed() {
    let supervisor = Supervisor::new();
    let config = ProcessConfig::builder()
        .name("broken")
        .executable_path("/nonexistent/command/12345")
        .heartbeat_enabled(false)
        .auto_restart(false)
        .build();
    supervisor.register_process(config).await.unwrap();

    assert!(supervisor.start_process("broken").await.is_err());
    assert_eq!(
        supervisor.get_process_state("broken"),
        Some(ProcessState::Crashed)
    );
    let rows = supervisor.get_all_processes();
    assert!(rows[0].last_error.is_some());

    supervisor.shutdown().await;
}
