//! SIGTERM, grace period, SIGKILL.

use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;

#[derive(Debug, thiserror::Error)]
pub enum TerminateError {
    #[error("failed to send {signal} to pid {pid}: {source}")]
    Signal {
        pid: u32,
        signal: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait for pid {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("signalling processes is only supported on unix")]
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

impl Signal {
    pub fn name(self) -> &'static str {
        match self {
            Signal::Terminate => "SIGTERM",
            Signal::Kill => "SIGKILL",
        }
    }
}

/// Returns `Ok(false)` when the process was already gone.
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: Signal) -> Result<bool, TerminateError> {
    let raw = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let Ok(pid_i32) = i32::try_from(pid) else {
        return Ok(false);
    };
    if unsafe { libc::kill(pid_i32, raw) } == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(false);
    }
    Err(TerminateError::Signal {
        pid,
        signal: signal.name(),
        source: err,
    })
}

#[cfg(not(unix))]
pub fn send_signal(_pid: u32, _signal: Signal) -> Result<bool, TerminateError> {
    Err(TerminateError::Unsupported)
}

/// Stop a child this process owns: SIGTERM, wait up to `grace`, then
/// SIGKILL. Returns the reaped exit status.
pub async fn terminate_child(child: &mut Child, grace: Duration) -> Result<ExitStatus, TerminateError> {
    let Some(pid) = child.id() else {
        // Already reaped.
        return child.wait().await.map_err(|source| TerminateError::Wait { pid: 0, source });
    };

    match send_signal(pid, Signal::Terminate) {
        Ok(_) | Err(TerminateError::Unsupported) => {}
        Err(err) => return Err(err),
    }

    if let Ok(waited) = tokio::time::timeout(grace, child.wait()).await {
        return waited.map_err(|source| TerminateError::Wait { pid, source });
    }

    child
        .kill()
        .await
        .map_err(|source| TerminateError::Signal {
            pid,
            signal: Signal::Kill.name(),
            source,
        })?;
    child
        .wait()
        .await
        .map_err(|source| TerminateError::Wait { pid, source })
}

/// Exit code with signal deaths mapped to `128 + signal`.
pub fn exit_code(status: &ExitStatus) -> Option<i32> {
    if let Some(code) = status.code() {
        return Some(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal().map(|signal| 128 + signal)
    }
    #[cfg(not(unix))]
    {
        None
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::process::Stdio;
    use std::time::Duration;

    use tokio::process::Command;

    use super::{exit_code, send_signal, terminate_child, Signal};

    #[tokio::test]
    async fn terminate_child_stops_cooperative_process() {
        let mut child = Command::new("sh")
            .args(["-c", "sleep 30"])
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn sleep");

        let status = terminate_child(&mut child, Duration::from_secs(5))
            .await
            .expect("terminate");
        assert_eq!(exit_code(&status), Some(128 + libc::SIGTERM));
    }

    #[tokio::test]
    async fn terminate_child_escalates_to_kill() {
        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; while :; do sleep 1; done"])
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn stubborn shell");
        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = terminate_child(&mut child, Duration::from_millis(300))
            .await
            .expect("terminate");
        assert_eq!(exit_code(&status), Some(128 + libc::SIGKILL));
    }

    #[tokio::test]
    async fn signalling_a_reaped_pid_reports_gone() {
        let mut child = Command::new("sh")
            .args(["-c", "exit 0"])
            .spawn()
            .expect("spawn");
        let pid = child.id().expect("pid");
        child.wait().await.expect("wait");

        assert!(!send_signal(pid, Signal::Terminate).expect("signal"));
    }
}
