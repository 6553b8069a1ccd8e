//! Decoder child process lifecycle.
//!
//! The decoder is an external executable that opens the TCP listener the
//! parser reads from. The supervisor owns it: spawn at bringup, probe the
//! port until it answers, terminate on shutdown. `kill_on_drop` keeps the
//! child from outliving the client on panic or early-error exits.

use std::process::Stdio;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::config::DecoderConfig;
use crate::errors::ClientError;

/// Bringup probe gives the decoder this many chances to open its port.
pub const MAX_PROBE_ATTEMPTS: u32 = 10;

/// Time a terminated decoder gets to exit before it is force-killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Handle to the running decoder child.
#[derive(Debug)]
pub struct DecoderProcess {
    child: Child,
}

impl DecoderProcess {
    /// Launch `executable command_args`.
    ///
    /// The child's stdio is discarded; the only contract is the TCP listener
    /// it opens.
    pub fn spawn(config: &DecoderConfig) -> Result<Self, ClientError> {
        if !config.executable.exists() {
            return Err(ClientError::DecoderNotFound {
                path: config.executable.clone(),
            });
        }

        let child = Command::new(&config.executable)
            .arg(&config.command_args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ClientError::DecoderSpawnError {
                origin: e.to_string(),
            })?;

        info!(
            "Decoder started: {} {} (pid {:?})",
            config.executable.display(),
            config.command_args,
            child.id()
        );

        Ok(Self { child })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Stop the decoder: ask it to exit, wait out the grace period, then
    /// force-kill if it is still running.
    pub async fn shutdown(mut self) {
        self.request_exit();

        match tokio::time::timeout(TERMINATE_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => info!("Decoder exited: {}", status),
            Ok(Err(e)) => warn!("Failed to reap decoder: {}", e),
            Err(_) => {
                warn!("Decoder still running after {:?}, killing", TERMINATE_GRACE);
                if let Err(e) = self.child.kill().await {
                    warn!("Failed to kill decoder: {}", e);
                }
            }
        }
    }

    /// Ask the child to terminate. SIGTERM where the platform has it; the
    /// hard kill is reserved for the post-grace fallback in `shutdown`.
    #[cfg(unix)]
    fn request_exit(&mut self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            // Already exited; wait() will reap it immediately.
            return;
        };
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!("Failed to signal decoder: {}", e);
        }
    }

    #[cfg(not(unix))]
    fn request_exit(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!("Failed to signal decoder: {}", e);
        }
    }
}

/// Wait for the decoder's TCP listener to come up.
///
/// Up to [`MAX_PROBE_ATTEMPTS`] connect probes spaced by `reconnect_delay`,
/// each bounded by the configured connect timeout. Exhausting the attempts
/// is fatal to bringup.
pub async fn wait_for_port(config: &DecoderConfig) -> Result<(), ClientError> {
    let host = config.host.as_str();
    let port = config.port;

    for attempt in 1..=MAX_PROBE_ATTEMPTS {
        info!(
            "Probing decoder port {}:{} (attempt {}/{})",
            host, port, attempt, MAX_PROBE_ATTEMPTS
        );

        match tokio::time::timeout(config.timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => {
                info!("Decoder port is up ({}:{})", host, port);
                return Ok(());
            }
            Ok(Err(e)) => warn!("Decoder port not ready: {}", e),
            Err(_) => warn!("Decoder port probe timed out"),
        }

        if attempt < MAX_PROBE_ATTEMPTS {
            tokio::time::sleep(config.reconnect_delay).await;
        }
    }

    Err(ClientError::DecoderUnreachable {
        host: host.to_string(),
        port,
        attempts: MAX_PROBE_ATTEMPTS,
    })
}
