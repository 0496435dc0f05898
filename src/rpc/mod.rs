//! Stdio JSON-RPC front-end.
//!
//! Reads newline-delimited JSON requests from stdin and writes responses
//! and engine-initiated events to stdout, one JSON value per line. A
//! single writer task serializes the output stream; responses go out in
//! completion order and interleave with events. Stdin EOF is the quit
//! signal: in-flight requests drain for a bounded period, downloads are
//! snapshotted, and the process exits cleanly.

pub mod methods;
pub mod protocol;

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use self::protocol::{RpcError, RpcRequest, event_line, response_err, response_ok};
use crate::controller::Controller;

/// How long in-flight requests may drain after stdin EOF.
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Output channel depth; the writer task drains it to stdout.
const WRITER_QUEUE: usize = 1024;

/// Serves RPC over this process's stdin/stdout until EOF.
///
/// # Errors
///
/// Only I/O errors on stdin surface; everything else is reported to the
/// client in-band.
pub async fn serve_stdio(controller: Controller) -> std::io::Result<()> {
    let (line_tx, line_rx) = mpsc::channel::<String>(WRITER_QUEUE);

    let writer = tokio::spawn(write_loop(line_rx));
    let event_forwarder = tokio::spawn(forward_events(controller.clone(), line_tx.clone()));

    let mut in_flight = JoinSet::new();
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    info!("RPC front-end ready");
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                handle_line(&controller, &line_tx, &mut in_flight, line);
            }
            Ok(None) => {
                debug!("stdin EOF, shutting down");
                break;
            }
            Err(e) => {
                warn!(error = %e, "stdin read failed, shutting down");
                break;
            }
        }
    }

    // Drain in-flight requests for a bounded period, then cancel.
    let drain = async {
        while in_flight.join_next().await.is_some() {}
    };
    if tokio::time::timeout(DRAIN_DEADLINE, drain).await.is_err() {
        warn!("drain deadline exceeded, cancelling in-flight requests");
        in_flight.abort_all();
    }

    controller.shutdown().await;
    event_forwarder.abort();
    drop(line_tx);
    let _ = writer.await;
    info!("RPC front-end stopped");
    Ok(())
}

/// Parses one input line and spawns its handler.
fn handle_line(
    controller: &Controller,
    line_tx: &mpsc::Sender<String>,
    in_flight: &mut JoinSet<()>,
    line: String,
) {
    let request: RpcRequest = match serde_json::from_str(&line) {
        Ok(request) => request,
        Err(e) => {
            // Recover the id if the line was at least a JSON object, so
            // the client can correlate the failure.
            let id = serde_json::from_str::<serde_json::Value>(&line)
                .ok()
                .and_then(|v| v.get("id").and_then(serde_json::Value::as_i64));
            match id {
                Some(id) => {
                    let error = RpcError::invalid_params(format!("malformed request: {e}"));
                    let _ = line_tx.try_send(response_err(id, &error));
                }
                None => warn!(error = %e, "dropping undecodable input line"),
            }
            return;
        }
    };

    let controller = controller.clone();
    let line_tx = line_tx.clone();
    in_flight.spawn(async move {
        let id = request.id;
        let reply = match methods::dispatch(&controller, &request.method, request.params).await {
            Ok(result) => response_ok(id, result),
            Err(error) => response_err(id, &error),
        };
        let _ = line_tx.send(reply).await;
    });
}

/// The single writer: everything on stdout goes through here.
async fn write_loop(mut rx: mpsc::Receiver<String>) {
    let mut stdout = tokio::io::stdout();
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if stdout.write_all(line.as_bytes()).await.is_err() {
            return;
        }
        let _ = stdout.flush().await;
    }
}

/// Forwards engine events onto the output stream.
async fn forward_events(controller: Controller, line_tx: mpsc::Sender<String>) {
    let mut events = controller.events().subscribe();
    loop {
        match events.recv().await {
            Ok(event) => {
                let data = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
                let line = event_line(event.name(), data);
                if line_tx.send(line).await.is_err() {
                    return;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event stream lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::events::EngineEvent;

    #[tokio::test]
    async fn test_write_loop_appends_newlines() {
        let (tx, rx) = mpsc::channel(4);
        let writer = tokio::spawn(write_loop(rx));
        tx.send("{\"id\":1}".to_string()).await.unwrap();
        drop(tx);
        writer.await.unwrap();
    }

    #[test]
    fn test_event_envelope_matches_contract() {
        let event = EngineEvent::EngineStatus { connected: true, restarting: false };
        let data = serde_json::to_value(&event).unwrap();
        let line = event_line(event.name(), data);
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["event"], "engine-status");
        assert_eq!(value["data"]["connected"], true);
    }
}
