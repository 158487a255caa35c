//! Unix Socket Server (Hardened)
//!
//! Control surface for the write-booster controller.
//!
//! # Security Features
//! - **Socket permissions**: symlink attack prevention before bind
//! - **Peer credentials**: audit logging of UID/GID/PID for every write request
//! - **Connection limits**: maximum concurrent connections enforced
//! - **Timeouts**: read/write timeouts prevent resource exhaustion
//! - **Message limits**: maximum message size prevents memory exhaustion
//! - **Input validation**: every request validated before dispatch

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use wb_core::{Controller, ReasonId};
use wb_protocol::{Request, RequestEnvelope, Response, ResponseData, ResponseEnvelope};

use crate::io_monitor::MonitorState;

// ============================================================================
// Security Constants
// ============================================================================

/// Maximum concurrent client connections
const MAX_CONNECTIONS: usize = 64;

/// Maximum message size in bytes
const MAX_MESSAGE_SIZE: usize = wb_protocol::MAX_MESSAGE_SIZE;

/// Read timeout per message
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Write timeout per message
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Socket permissions (owner and group read/write)
const SOCKET_MODE: u32 = 0o660;

/// Global connection counter
static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

/// Everything a request handler may touch
#[derive(Clone)]
pub struct ServerContext {
    pub controller: Controller,
    pub monitor: Arc<MonitorState>,
}

async fn read_line_bounded<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    out: &mut Vec<u8>,
    max_len: usize,
) -> std::io::Result<usize> {
    out.clear();

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(0);
        }

        let mut take_len = available.len();
        let mut found_newline = false;
        if let Some(pos) = available.iter().position(|b| *b == b'\n') {
            take_len = pos + 1;
            found_newline = true;
        }

        let remaining = max_len.saturating_sub(out.len());
        if take_len > remaining {
            let consume_len = remaining.min(available.len());
            reader.consume(consume_len);
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Message too large",
            ));
        }

        out.extend_from_slice(&available[..take_len]);
        reader.consume(take_len);

        if found_newline {
            return Ok(out.len());
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// Serve the control socket until `shutdown` resolves
pub async fn run_server(
    socket_path: &str,
    ctx: ServerContext,
    shutdown: impl Future<Output = ()>,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = Path::new(socket_path);

    // SECURITY: Remove existing socket only if it's not a symlink
    if path.exists() {
        let metadata = path.symlink_metadata()?;
        if metadata.file_type().is_symlink() {
            return Err("Socket path is a symlink - refusing for security".into());
        }
        std::fs::remove_file(path)?;
        debug!("Removed existing socket file");
    }

    let listener = UnixListener::bind(socket_path)?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(SOCKET_MODE))?;

    info!("Listening on {} (mode {:o})", socket_path, SOCKET_MODE);
    info!("Limits: max_conn={}, max_msg={}", MAX_CONNECTIONS, MAX_MESSAGE_SIZE);

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let current = ACTIVE_CONNECTIONS.load(Ordering::SeqCst);
                        if current >= MAX_CONNECTIONS {
                            warn!("Connection limit reached ({}), rejecting new connection", current);
                            drop(stream);
                            continue;
                        }

                        ACTIVE_CONNECTIONS.fetch_add(1, Ordering::SeqCst);
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            handle_client(stream, ctx).await;
                            ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    let _ = std::fs::remove_file(socket_path);
    info!(
        "Server stopped ({} connections still open)",
        ACTIVE_CONNECTIONS.load(Ordering::SeqCst)
    );

    Ok(())
}

/// Client credentials from Unix socket peer
#[derive(Debug, Clone, Copy)]
pub(crate) struct PeerCredentials {
    uid: u32,
    gid: u32,
    pid: i32,
}

async fn handle_client(stream: UnixStream, ctx: ServerContext) {
    let cred = match get_peer_credentials(&stream) {
        Some(c) => c,
        None => {
            error!("Failed to get peer credentials, rejecting connection");
            return;
        }
    };

    debug!(
        "Connection from uid={}, gid={}, pid={}",
        cred.uid, cred.gid, cred.pid
    );

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line: Vec<u8> = Vec::with_capacity(MAX_MESSAGE_SIZE);
    let mut request_count: u64 = 0;
    let connection_start = Instant::now();

    loop {
        let read_result = timeout(
            READ_TIMEOUT,
            read_line_bounded(&mut reader, &mut line, MAX_MESSAGE_SIZE),
        )
        .await;

        match read_result {
            Ok(Ok(0)) => {
                debug!(
                    "Client disconnected: uid={}, pid={}, requests={}, duration={:?}",
                    cred.uid,
                    cred.pid,
                    request_count,
                    connection_start.elapsed()
                );
                break;
            }
            Ok(Ok(n)) => {
                request_count += 1;
                trace!("Request #{} from uid={}: {} bytes", request_count, cred.uid, n);

                let line_str = match std::str::from_utf8(&line) {
                    Ok(s) => s,
                    Err(e) => {
                        debug!("Non-UTF8 request from uid={}: {}", cred.uid, e);
                        let envelope =
                            ResponseEnvelope::new(0, Response::error("Invalid request encoding"));
                        let _ = send_response(&mut writer, &envelope).await;
                        break;
                    }
                };

                let envelope = process_request(line_str, &cred, &ctx).await;
                if send_response(&mut writer, &envelope).await.is_err() {
                    break;
                }
            }
            Ok(Err(e)) => {
                if e.kind() == std::io::ErrorKind::InvalidData {
                    warn!(
                        "Message too large (>{} bytes) from uid={}, pid={}",
                        MAX_MESSAGE_SIZE, cred.uid, cred.pid
                    );
                    let envelope = ResponseEnvelope::new(0, Response::error("Message too large"));
                    let _ = send_response(&mut writer, &envelope).await;
                } else {
                    error!("Read error from uid={}, pid={}: {}", cred.uid, cred.pid, e);
                }
                break;
            }
            Err(_) => {
                debug!("Read timeout for uid={}, pid={}", cred.uid, cred.pid);
                let envelope = ResponseEnvelope::new(0, Response::error("Read timeout"));
                let _ = send_response(&mut writer, &envelope).await;
                break;
            }
        }
    }
}

/// Send response with timeout
async fn send_response<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    envelope: &ResponseEnvelope,
) -> Result<(), ()> {
    let json = serde_json::to_string(envelope).unwrap_or_else(|_| {
        r#"{"id":0,"status":"error","message":"Serialization error"}"#.to_string()
    });

    let write_result = timeout(WRITE_TIMEOUT, async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok::<_, std::io::Error>(())
    })
    .await;

    match write_result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("Write error: {}", e);
            Err(())
        }
        Err(_) => {
            error!("Write timeout");
            Err(())
        }
    }
}

/// Get peer credentials (uid, gid, pid) from Unix socket
fn get_peer_credentials(stream: &UnixStream) -> Option<PeerCredentials> {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();

    #[cfg(target_os = "linux")]
    {
        // SAFETY: ucred is a plain C struct; all-zero is a valid value.
        let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        // SAFETY: fd is a live socket owned by `stream`, cred/len describe a
        // correctly sized ucred buffer.
        let result = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                &mut cred as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };

        if result == 0 {
            return Some(PeerCredentials {
                uid: cred.uid,
                gid: cred.gid,
                pid: cred.pid,
            });
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        let mut uid: libc::uid_t = 0;
        let mut gid: libc::gid_t = 0;

        // SAFETY: fd is a live socket, uid and gid are valid out pointers.
        let result = unsafe { libc::getpeereid(fd, &mut uid, &mut gid) };

        if result == 0 {
            return Some(PeerCredentials { uid, gid, pid: 0 });
        }
    }

    None
}

// ============================================================================
// Request Dispatch
// ============================================================================

pub(crate) async fn process_request(
    line: &str,
    cred: &PeerCredentials,
    ctx: &ServerContext,
) -> ResponseEnvelope {
    let envelope: RequestEnvelope = match serde_json::from_str(line.trim()) {
        Ok(e) => e,
        Err(e) => {
            debug!("Invalid JSON from uid={}: {}", cred.uid, e);
            return ResponseEnvelope::new(0, Response::error("Invalid request format"));
        }
    };

    let request_id = envelope.id;
    let request = envelope.request;

    // Double validation: clients validate too
    if let Err(e) = request.validate() {
        warn!("Request validation failed from uid={}: {}", cred.uid, e);
        return ResponseEnvelope::new(request_id, Response::error(e));
    }

    let request_type = request.type_name();
    if request.is_write() {
        info!(
            "AUDIT: {} (id={}) by uid={}, gid={}, pid={}",
            request_type, request_id, cred.uid, cred.gid, cred.pid
        );
    } else {
        debug!(
            "Processing {} (id={}) from uid={}, pid={}",
            request_type, request_id, cred.uid, cred.pid
        );
    }

    let response = dispatch(request, ctx).await;
    ResponseEnvelope::new(request_id, response)
}

async fn dispatch(request: Request, ctx: &ServerContext) -> Response {
    let controller = &ctx.controller;

    match request {
        Request::Ping => Response::ok_string("pong"),

        Request::Version => Response::ok_string(env!("CARGO_PKG_VERSION")),

        Request::GetStatus => {
            // Reflect every command accepted before this request
            if let Err(e) = controller.flush().await {
                return Response::error(e.to_string());
            }
            Response::Ok(ResponseData::status(controller.status().into()))
        }

        Request::SetVote { reason, active, wait } => {
            let reason: ReasonId = match reason.parse() {
                Ok(r) => r,
                Err(e) => return Response::error(format!("{}", e)),
            };
            let result = if wait {
                controller.set_vote(reason, active).await
            } else {
                controller.set_vote_nowait(reason, active)
            };
            match result {
                Ok(()) => Response::ok(),
                Err(e) => Response::error(e.to_string()),
            }
        }

        Request::Boost { duration_ms } => {
            match controller
                .request_boost(Duration::from_millis(u64::from(duration_ms)))
                .await
            {
                Ok(effective) => Response::Ok(ResponseData::boost(effective.as_millis() as u64)),
                Err(e) => Response::error(e.to_string()),
            }
        }

        Request::GetThresholds => {
            Response::Ok(ResponseData::thresholds(controller.thresholds().into()))
        }

        Request::SetThresholds { update } => {
            match controller.update_thresholds(update).await {
                Ok(merged) => Response::Ok(ResponseData::thresholds(merged.into())),
                Err(e) => Response::error(e.to_string()),
            }
        }

        Request::NotifyReset => match controller.notify_reset() {
            Ok(()) => Response::ok(),
            Err(e) => Response::error(e.to_string()),
        },

        Request::Poke => {
            if controller.poke() {
                Response::ok_string("queued")
            } else {
                Response::ok_string("coalesced")
            }
        }

        Request::ReloadConfig => {
            ctx.monitor.signal_reload();
            Response::ok_string("Configuration reload signaled")
        }
    }
}
