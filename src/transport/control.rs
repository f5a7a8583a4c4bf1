//! Local control socket.
//!
//! Line-oriented Unix socket used by operators to drive the daemon's modules:
//!
//! | Request       | Reply                                             |
//! |---------------|---------------------------------------------------|
//! | `core.start`  | `ACK` after broadcasting `core.start`             |
//! | `core.stop`   | `ACK` once every module confirmed stopping        |
//! | `core.status` | one `name=running\|stopped` line per module, `ACK` |
//! | anything else | `ERR unknown command`                             |

use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{ProtocolError, Result};
use crate::events::{types, Event};
use crate::modules::ModuleRegistry;

/// Source name on events published from the control socket
pub const CONTROL_SOURCE: &str = "CLI";

pub const REPLY_ACK: &str = "ACK";
pub const REPLY_UNKNOWN: &str = "ERR unknown command";

const MAX_LINE_LENGTH: usize = 1024;

fn line_error(e: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::Custom(format!("control line error: {e}"))
}

/// Unix socket server for control commands
pub struct ControlServer {
    path: PathBuf,
    modules: Arc<ModuleRegistry>,
    stop_timeout: Option<Duration>,
    drain_timeout: Duration,
}

impl ControlServer {
    pub fn new(path: impl Into<PathBuf>, modules: Arc<ModuleRegistry>) -> Self {
        Self {
            path: path.into(),
            modules,
            stop_timeout: None,
            drain_timeout: Duration::from_secs(10),
        }
    }

    /// Bound `core.stop` to `limit` instead of waiting for every module indefinitely.
    pub fn with_stop_timeout(mut self, limit: Option<Duration>) -> Self {
        self.stop_timeout = limit;
        self
    }

    pub fn with_drain_timeout(mut self, limit: Duration) -> Self {
        self.drain_timeout = limit;
        self
    }

    /// Bind the socket, replacing a stale socket file.
    ///
    /// Refuses to touch a path that is not a socket, and a socket another process
    /// still accepts connections on.
    #[instrument(skip(self), fields(socket_path = %self.path.display()))]
    pub async fn bind(&self) -> Result<UnixListener> {
        if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
            if !metadata.file_type().is_socket() {
                return Err(ProtocolError::NotASocket(self.path.display().to_string()));
            }
            match std::os::unix::net::UnixStream::connect(&self.path) {
                Ok(_stream) => {
                    return Err(ProtocolError::SocketInUse(self.path.display().to_string()));
                }
                Err(e)
                    if e.kind() == io::ErrorKind::ConnectionRefused
                        || e.kind() == io::ErrorKind::NotFound =>
                {
                    debug!(path = %self.path.display(), "Removing stale control socket");
                    tokio::fs::remove_file(&self.path).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        let listener = UnixListener::bind(&self.path)?;
        info!(path = %self.path.display(), "Listening on control socket");
        Ok(listener)
    }

    pub async fn run(self, shutdown: mpsc::Receiver<()>) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Serve control clients until `shutdown` fires, then remove the socket file.
    pub async fn serve(self, listener: UnixListener, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        let active = Arc::new(AtomicUsize::new(0));

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutting down control socket");

                    let timeout = tokio::time::sleep(self.drain_timeout);
                    tokio::pin!(timeout);

                    while active.load(Ordering::Acquire) > 0 {
                        tokio::select! {
                            _ = &mut timeout => {
                                warn!("Control clients still connected, closing anyway");
                                break;
                            }
                            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                        }
                    }

                    if self.path.exists() {
                        if let Err(e) = tokio::fs::remove_file(&self.path).await {
                            error!(error = %e, path = %self.path.display(), "Failed to remove socket file");
                        } else {
                            info!(path = %self.path.display(), "Removed socket file");
                        }
                    }
                    return Ok(());
                }

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _)) => {
                            active.fetch_add(1, Ordering::AcqRel);
                            let active = active.clone();
                            let modules = self.modules.clone();
                            let stop_timeout = self.stop_timeout;

                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, modules, stop_timeout).await {
                                    debug!(error = %e, "Control client error");
                                }
                                active.fetch_sub(1, Ordering::AcqRel);
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Error accepting control connection");
                        }
                    }
                }
            }
        }
    }
}

async fn handle_client(
    stream: UnixStream,
    modules: Arc<ModuleRegistry>,
    stop_timeout: Option<Duration>,
) -> Result<()> {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    while let Some(line) = framed.next().await {
        let line = line.map_err(line_error)?;
        let command = line.trim();
        info!(command, "Control command received");

        for reply in execute(command, &modules, stop_timeout).await {
            framed.send(reply).await.map_err(line_error)?;
        }
    }
    Ok(())
}

/// Run one control command and produce its reply lines.
pub async fn execute(
    command: &str,
    modules: &Arc<ModuleRegistry>,
    stop_timeout: Option<Duration>,
) -> Vec<String> {
    match command {
        types::CORE_START => {
            modules
                .bus()
                .publish(Event::new(CONTROL_SOURCE, types::CORE_START));
            vec![REPLY_ACK.to_string()]
        }
        types::CORE_STOP => {
            let registry = modules.clone();
            let stopped = tokio::task::spawn_blocking(move || match stop_timeout {
                Some(limit) => registry.stop_all_within(limit),
                None => registry.stop_all(),
            })
            .await;

            match stopped {
                Ok(Ok(())) => vec![REPLY_ACK.to_string()],
                Ok(Err(e)) => vec![format!("ERR {e}")],
                Err(e) => vec![format!("ERR shutdown barrier failed: {e}")],
            }
        }
        types::CORE_STATUS => {
            modules
                .bus()
                .publish(Event::new(CONTROL_SOURCE, types::CORE_STATUS));
            let mut lines: Vec<String> = modules
                .statuses()
                .into_iter()
                .map(|(name, running)| {
                    format!("{name}={}", if running { "running" } else { "stopped" })
                })
                .collect();
            lines.push(REPLY_ACK.to_string());
            lines
        }
        _ => vec![REPLY_UNKNOWN.to_string()],
    }
}

/// Connect to a control socket
#[instrument(skip(path), fields(socket_path = %path.as_ref().display()))]
pub async fn connect<P: AsRef<Path>>(path: P) -> Result<Framed<UnixStream, LinesCodec>> {
    let stream = UnixStream::connect(path).await?;
    Ok(Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)))
}

/// Send one command and collect the reply lines up to and including the final
/// `ACK` or `ERR ...` line.
pub async fn send_command<P: AsRef<Path>>(path: P, command: &str) -> Result<Vec<String>> {
    let mut framed = connect(path).await?;
    framed.send(command).await.map_err(line_error)?;

    let mut lines = Vec::new();
    while let Some(line) = framed.next().await {
        let line = line.map_err(line_error)?;
        let last = line == REPLY_ACK || line.starts_with("ERR");
        lines.push(line);
        if last {
            break;
        }
    }
    Ok(lines)
}
