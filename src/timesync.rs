//! System clock synchronisation.
//!
//! Decoder timestamps carry no date, so the correctness of every event time
//! rests on the host clock. Bringup asks the platform to resync before the
//! workers start; failure is a warning, not a stop, since the operator may
//! have the clock disciplined some other way.

use std::time::Duration;

use tokio::process::Command;
use tracing::info;

use crate::errors::ClientError;

const SYNC_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Pluggable clock synchronisation.
pub trait ClockSync {
    /// Attempt to bring the system clock in line. Returns a human-readable
    /// summary of what was done.
    fn sync(&self) -> impl std::future::Future<Output = Result<String, ClientError>> + Send;
}

/// Sync via the platform's own time service command.
#[derive(Debug, Default)]
pub struct SystemClockSync;

/// The resync command for the current platform.
fn platform_command() -> (&'static str, &'static [&'static str]) {
    if cfg!(target_os = "windows") {
        ("w32tm", &["/resync", "/force"])
    } else if cfg!(target_os = "macos") {
        ("sntp", &["-sS", "pool.ntp.org"])
    } else {
        ("timedatectl", &["set-ntp", "true"])
    }
}

impl ClockSync for SystemClockSync {
    async fn sync(&self) -> Result<String, ClientError> {
        let (program, args) = platform_command();
        info!("Synchronising clock via {}", program);

        let output = tokio::time::timeout(
            SYNC_COMMAND_TIMEOUT,
            Command::new(program).args(args).output(),
        )
        .await
        .map_err(|_| {
            ClientError::IoError(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("{} timed out", program),
            ))
        })??;

        if output.status.success() {
            Ok(format!("Clock synchronised via {}", program))
        } else {
            Err(ClientError::IoError(std::io::Error::other(format!(
                "{} exited with {}",
                program, output.status
            ))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_command_is_nonempty() {
        let (program, args) = platform_command();
        assert!(!program.is_empty());
        assert!(!args.is_empty());
    }

    /// Sync strategy that always reports success; used to exercise callers.
    pub struct NoopClockSync;

    impl ClockSync for NoopClockSync {
        async fn sync(&self) -> Result<String, ClientError> {
            Ok("clock assumed correct".to_string())
        }
    }

    #[tokio::test]
    async fn callers_can_plug_their_own_strategy() {
        let message = NoopClockSync.sync().await.unwrap();
        assert_eq!(message, "clock assumed correct");
    }
}
