//! Runtime bookkeeping of spawned applications: spawning with environment
//! hints, non-blocking reaping with bounded restart, and graceful
//! termination with SIGKILL escalation.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{error, info, warn};
use vecu_core::com::binding::REQUEST_EVENTS_ENV;

use crate::manifest::{AppConfig, RestartPolicy};

/// Restart attempts allowed per application before giving up.
pub const MAX_RESTARTS: u32 = 3;

/// A spawned application under supervision.
#[derive(Debug)]
pub struct AppRuntime {
    /// The manifest this application was spawned from.
    pub config: AppConfig,
    /// Child handle while the process is alive.
    pub child: Option<Child>,
    /// Restarts performed so far.
    pub restart_count: u32,
}

impl AppRuntime {
    /// OS process id of the child, if it is still attached.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }
}

/// Spawn an application, exporting its event-subscription hint into the
/// environment variable the binding consumes.
///
/// # Errors
///
/// Returns the spawn error from the OS.
pub fn spawn_app(config: &AppConfig) -> std::io::Result<Child> {
    let mut command = Command::new(&config.executable);
    command.stdin(Stdio::null()).kill_on_drop(false);

    if let Some(hint) = config.event_hint() {
        command.env(REQUEST_EVENTS_ENV, hint);
    }

    let child = command.spawn()?;
    info!(
        app = %config.app_id,
        pid = child.id(),
        executable = %config.executable.display(),
        "launched application"
    );
    Ok(child)
}

/// Non-blocking reap of exited children, with bounded restart on abnormal
/// exit under the on-failure policy. Exited children are removed; restarted
/// ones are re-inserted with the same environment hint.
pub fn reap_and_restart(children: &mut HashMap<String, AppRuntime>) {
    let mut exited = Vec::new();
    for (app_id, runtime) in children.iter_mut() {
        let Some(child) = runtime.child.as_mut() else {
            continue;
        };
        match child.try_wait() {
            Ok(Some(status)) => exited.push((app_id.clone(), status)),
            Ok(None) => {}
            Err(e) => warn!(app = %app_id, error = %e, "failed to poll child"),
        }
    }

    for (app_id, status) in exited {
        let Some(runtime) = children.remove(&app_id) else {
            continue;
        };
        info!(app = %app_id, %status, "application exited");

        let abnormal = !status.success();
        if runtime.config.restart_policy != RestartPolicy::OnFailure || !abnormal {
            continue;
        }

        let attempt = runtime.restart_count + 1;
        if attempt > MAX_RESTARTS {
            warn!(app = %app_id, "max restart attempts reached, giving up");
            continue;
        }

        info!(app = %app_id, attempt, "restarting application");
        match spawn_app(&runtime.config) {
            Ok(child) => {
                children.insert(
                    app_id,
                    AppRuntime {
                        config: runtime.config,
                        child: Some(child),
                        restart_count: attempt,
                    },
                );
            }
            Err(e) => error!(app = %app_id, error = %e, "restart failed"),
        }
    }
}

/// Terminate every child: SIGTERM first, poll for exits during the grace
/// period, then SIGKILL the stragglers. The map is empty on return.
pub async fn shutdown_children(
    children: &mut HashMap<String, AppRuntime>,
    grace: Duration,
    poll_interval: Duration,
) {
    if children.is_empty() {
        return;
    }
    info!(count = children.len(), "stopping applications");

    for runtime in children.values() {
        if let Some(pid) = runtime.pid() {
            #[allow(clippy::cast_possible_wrap)]
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }

    let polls = (grace.as_millis() / poll_interval.as_millis().max(1)).max(1);
    for _ in 0..polls {
        let mut gone = Vec::new();
        for (app_id, runtime) in children.iter_mut() {
            let Some(child) = runtime.child.as_mut() else {
                gone.push(app_id.clone());
                continue;
            };
            if let Ok(Some(status)) = child.try_wait() {
                info!(app = %app_id, %status, "application terminated");
                gone.push(app_id.clone());
            }
        }
        for app_id in gone {
            children.remove(&app_id);
        }
        if children.is_empty() {
            return;
        }
        tokio::time::sleep(poll_interval).await;
    }

    for (app_id, runtime) in children.iter_mut() {
        if let Some(child) = runtime.child.as_mut() {
            warn!(app = %app_id, "graceful stop timed out, killing");
            let _ = child.kill().await;
        }
    }
    children.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(json: &str) -> AppConfig {
        serde_json::from_str(json).unwrap()
    }

    #[tokio::test]
    async fn test_spawn_and_reap() {
        let cfg = config(r#"{"app_id":"ok","executable":"/bin/true","start_on_boot":true}"#);
        let mut child = spawn_app(&cfg).unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_spawn_missing_executable_fails() {
        let cfg = config(r#"{"app_id":"ghost","executable":"/nonexistent/binary/xyz"}"#);
        assert!(spawn_app(&cfg).is_err());
    }

    #[tokio::test]
    async fn test_event_hint_exported_to_child() {
        let cfg = config(
            r#"{
                "app_id": "env_probe",
                "executable": "/bin/sh",
                "com.someip": {
                    "service_id": "0x1234",
                    "instance_id": 1,
                    "subscribe": ["0x8001"]
                }
            }"#,
        );

        let mut command = Command::new("/bin/sh");
        command
            .args(["-c", r#"test "$SOMEIP_REQUEST_EVENTS" = "0x1234:0x1:0x8001@0x1""#])
            .env(REQUEST_EVENTS_ENV, cfg.event_hint().unwrap());
        let status = command.status().await.unwrap();
        assert!(status.success());
    }
}
