//! External state-change hook
//!
//! Runs `<hook> on|off` after every hardware switch. The controller never
//! waits for the hook; a watcher thread reaps it and kills it if it overruns.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use wb_core::constants::daemon::HOOK_TIMEOUT_MS;
use wb_core::{StateObserver, WbState};
use wb_error::{Result, WbError};

const REAP_POLL: Duration = Duration::from_millis(50);

pub struct CommandHook {
    program: PathBuf,
}

impl CommandHook {
    pub fn new(program: PathBuf) -> Result<Self> {
        if !program.is_absolute() {
            return Err(WbError::InvalidConfig {
                field: "daemon.state_hook".into(),
                reason: "must be an absolute path".into(),
            });
        }
        Ok(Self { program })
    }
}

impl StateObserver for CommandHook {
    fn on_state_change(&self, state: WbState) -> Result<()> {
        let child = Command::new(&self.program)
            .arg(state.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| WbError::generic(format!("{}: {}", self.program.display(), e)))?;

        let program = self.program.display().to_string();
        std::thread::spawn(move || reap(child, &program));
        Ok(())
    }
}

fn reap(mut child: Child, program: &str) {
    let deadline = Instant::now() + Duration::from_millis(HOOK_TIMEOUT_MS);
    loop {
        match child.try_wait() {
            Ok(Some(status)) if status.success() => {
                debug!("Hook {} finished", program);
                return;
            }
            Ok(Some(status)) => {
                warn!("Hook {} exited with {}", program, status);
                return;
            }
            Ok(None) if Instant::now() >= deadline => {
                warn!("Hook {} timed out, killing", program);
                let _ = child.kill();
                let _ = child.wait();
                return;
            }
            Ok(None) => std::thread::sleep(REAP_POLL),
            Err(e) => {
                warn!("Failed to wait for hook {}: {}", program, e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_hook_rejected() {
        assert!(CommandHook::new(PathBuf::from("hooks/wb.sh")).is_err());
    }

    #[test]
    fn test_missing_program_reported() {
        let hook = CommandHook::new(PathBuf::from("/nonexistent/wb-hook")).unwrap();
        assert!(hook.on_state_change(WbState::On).is_err());
    }

    #[test]
    fn test_hook_runs() {
        let hook = CommandHook::new(PathBuf::from("/bin/true")).unwrap();
        assert!(hook.on_state_change(WbState::Off).is_ok());
    }
}
