//! Per-connection sessions.
//!
//! One task per connection, handling its requests strictly in order.
//! Dispatch runs under `spawn_blocking` because an operation may park in
//! a lock wait; while one is in flight the task watches the socket so a
//! dropped client cancels the wait (the request completes, its response
//! is discarded). Disconnection tears the session down: transaction
//! aborted, locks released, handles closed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::task;
use tracing::{debug, warn};

use xtrieve_common::types::SessionId;
use xtrieve_engine::{Engine, Request, Response};

use crate::protocol;

/// Resolves a wire path against the data directory.
fn resolve_path(data_dir: &Path, wire_path: &str) -> PathBuf {
    let path = Path::new(wire_path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        data_dir.join(path)
    }
}

/// Runs one connection to completion.
pub async fn run(stream: TcpStream, engine: Arc<Engine>, session: SessionId, data_dir: PathBuf) {
    let peer = stream.peer_addr().ok();
    debug!(%session, ?peer, "client connected");

    engine.register_session(session);

    let (mut reader, mut writer) = stream.into_split();
    loop {
        let mut request = match protocol::read_request(&mut reader).await {
            Ok(request) => request,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!(%session, "client disconnected");
                break;
            }
            Err(e) => {
                warn!(%session, error = %e, "bad request frame");
                break;
            }
        };

        if !request.file_path.is_empty() {
            request.file_path = resolve_path(&data_dir, &request.file_path)
                .to_string_lossy()
                .into_owned();
        }

        let Some(response) = execute(&mut reader, &engine, session, request).await else {
            break;
        };

        if let Err(e) = protocol::write_response(&mut writer, &response).await {
            debug!(%session, error = %e, "response write failed");
            break;
        }
    }

    engine.close_session(session);
    drop(writer);
    debug!(%session, "session closed");
}

/// Dispatches one request on a blocking thread while watching the socket
/// for a client disconnect. Returns `None` when the client is gone; the
/// request still ran to completion, its response is dropped.
async fn execute(
    reader: &mut OwnedReadHalf,
    engine: &Arc<Engine>,
    session: SessionId,
    request: Request,
) -> Option<Response> {
    let worker = {
        let engine = Arc::clone(engine);
        task::spawn_blocking(move || engine.dispatch(session, request))
    };
    tokio::pin!(worker);

    let mut cancelled = false;
    loop {
        tokio::select! {
            result = &mut worker => {
                let response = result.expect("dispatch task panicked");
                return if cancelled { None } else { Some(response) };
            }
            _ = tokio::time::sleep(Duration::from_millis(200)), if !cancelled => {
                if peer_gone(reader).await {
                    debug!(%session, "client vanished mid-request, cancelling waits");
                    engine.cancel_session(session);
                    cancelled = true;
                }
            }
        }
    }
}

/// True once the peer has closed its end.
async fn peer_gone(reader: &mut OwnedReadHalf) -> bool {
    let mut probe = [0u8; 1];
    matches!(reader.peek(&mut probe).await, Ok(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_path() {
        let data_dir = Path::new("/srv/xtrieve");
        assert_eq!(
            resolve_path(data_dir, "customers.xtv"),
            PathBuf::from("/srv/xtrieve/customers.xtv")
        );
        assert_eq!(
            resolve_path(data_dir, "/tmp/abs.xtv"),
            PathBuf::from("/tmp/abs.xtv")
        );
    }
}
