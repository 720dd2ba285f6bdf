use std::fmt::Display;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use gpg_bridge_protocol::OutboundResult;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::GpgAgent;
use crate::processor::process_command;

/// Result queue for one command. Closed by the reader once the processor
/// returns.
type CommandQueue = mpsc::Receiver<OutboundResult>;

/// Run a session over an upgraded WebSocket.
pub async fn handle_socket(
    socket: WebSocket,
    agent: Arc<GpgAgent>,
    queue_capacity: usize,
    shutdown: CancellationToken,
) {
    let (sink, stream) = socket.split();
    run_session(stream, sink, agent, queue_capacity, shutdown).await;
}

/// Drive one connection until the peer goes away or `shutdown` is cancelled.
///
/// Architecture:
/// - The current task is the reader. Each text frame becomes a command group
///   with its own bounded result queue; the reader hands the queue to the
///   writer, runs the processor, then drops the sender to close the queue.
/// - A spawned writer task drains command queues one at a time, in arrival
///   order, serializing each result as a text frame. It exits once the reader
///   is done and the last queue is drained.
/// - Shutdown is only observed between commands: a command already being
///   processed runs to completion and its results are still written.
pub async fn run_session<St, E, Si>(
    stream: St,
    sink: Si,
    agent: Arc<GpgAgent>,
    queue_capacity: usize,
    shutdown: CancellationToken,
) where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
    Si: Sink<Message> + Unpin + Send + 'static,
    Si::Error: Display,
{
    let (queue_tx, queue_rx) = mpsc::channel::<CommandQueue>(1);
    let writer = tokio::spawn(write_loop(sink, queue_rx));

    read_loop(stream, &agent, queue_capacity.max(1), queue_tx, &shutdown).await;

    if let Err(e) = writer.await {
        warn!("session writer failed: {e}");
    }
    debug!("session closed");
}

async fn read_loop<St, E>(
    mut stream: St,
    agent: &GpgAgent,
    queue_capacity: usize,
    queues: mpsc::Sender<CommandQueue>,
    shutdown: &CancellationToken,
) where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let frame = tokio::select! {
            () = shutdown.cancelled() => {
                info!("closing idle session for shutdown");
                break;
            }
            frame = stream.next() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("ws read error: {e}");
                break;
            }
        };

        let (results, queue) = mpsc::channel(queue_capacity);
        if queues.send(queue).await.is_err() {
            warn!("session writer gone, dropping command");
            break;
        }

        process_command(agent, text.as_str(), &results).await;
        drop(results);
    }
}

async fn write_loop<Si>(mut sink: Si, mut queues: mpsc::Receiver<CommandQueue>)
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    while let Some(mut queue) = queues.recv().await {
        while let Some(result) = queue.recv().await {
            let json = match serde_json::to_string(&result) {
                Ok(json) => json,
                Err(e) => {
                    warn!("failed to encode result: {e}");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::text(json)).await {
                warn!("ws write error: {e}");
            } else if result.is_signing_terminal() {
                debug!(communication = %result.communication, "signing exchange delivered");
            }
        }
    }

    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use gpg_bridge_protocol::communication;
    use tokio_util::sync::PollSender;

    fn unreachable_agent() -> Arc<GpgAgent> {
        Arc::new(GpgAgent::new("/nonexistent/gpg-bridge-test/gpg"))
    }

    async fn run_frames(frames: Vec<Message>) -> Vec<OutboundResult> {
        let input = stream::iter(frames.into_iter().map(Ok::<_, axum::Error>));
        let (tx, mut rx) = mpsc::channel::<Message>(16);
        run_session(
            input,
            PollSender::new(tx),
            unreachable_agent(),
            5,
            CancellationToken::new(),
        )
        .await;

        let mut out = Vec::new();
        while let Some(msg) = rx.recv().await {
            if let Message::Text(text) = msg {
                out.push(serde_json::from_str(text.as_str()).unwrap());
            }
        }
        out
    }

    #[tokio::test]
    async fn results_follow_command_order() {
        let results = run_frames(vec![
            Message::text(r#"{"command":"sign","message":"aGVsbG8=","fingerprint":"ABCD"}"#),
            Message::text(r#"{"command":"delete"}"#),
            Message::text("not-json"),
        ])
        .await;

        let lines: Vec<_> = results.iter().map(|r| r.communication.as_str()).collect();
        assert_eq!(
            lines,
            [
                communication::SIGNING_STARTED,
                communication::SIGNING_FAILED,
                communication::UNKNOWN_COMMAND,
                communication::INVALID_PAYLOAD,
            ]
        );
    }

    #[tokio::test]
    async fn non_text_frames_are_ignored() {
        let results = run_frames(vec![
            Message::binary(vec![1u8, 2, 3]),
            Message::text(r#"{"command":"delete"}"#),
        ])
        .await;
        assert_eq!(results, vec![OutboundResult::unknown_command()]);
    }

    #[tokio::test]
    async fn close_frame_stops_reading() {
        let results = run_frames(vec![
            Message::text(r#"{"command":"delete"}"#),
            Message::Close(None),
            Message::text("not-json"),
        ])
        .await;
        assert_eq!(results, vec![OutboundResult::unknown_command()]);
    }

    #[tokio::test]
    async fn read_error_ends_session_after_draining() {
        let input = stream::iter(vec![
            Ok(Message::text(r#"{"command":"delete"}"#)),
            Err("connection reset"),
            Ok(Message::text("not-json")),
        ]);
        let (tx, mut rx) = mpsc::channel::<Message>(16);
        run_session(
            input,
            PollSender::new(tx),
            unreachable_agent(),
            5,
            CancellationToken::new(),
        )
        .await;

        let mut frames = 0;
        while let Some(msg) = rx.recv().await {
            assert!(matches!(msg, Message::Text(_)));
            frames += 1;
        }
        assert_eq!(frames, 1);
    }

    #[tokio::test]
    async fn writer_survives_send_failures() {
        let input = stream::iter(vec![Ok::<_, axum::Error>(Message::text(
            r#"{"command":"sign","message":"aGVsbG8=","fingerprint":"ABCD"}"#,
        ))]);
        let (tx, rx) = mpsc::channel::<Message>(16);
        drop(rx);
        // Every write fails; the session must still finish.
        run_session(
            input,
            PollSender::new(tx),
            unreachable_agent(),
            5,
            CancellationToken::new(),
        )
        .await;
    }

    #[tokio::test]
    async fn cancelled_session_stops_waiting_for_frames() {
        let (tx, mut rx) = mpsc::channel::<Message>(16);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        // The peer never sends anything nor closes.
        let input = stream::pending::<Result<Message, axum::Error>>();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            run_session(input, PollSender::new(tx), unreachable_agent(), 5, shutdown),
        )
        .await
        .expect("session ignored shutdown");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_lets_current_command_finish() {
        let (frames_tx, frames_rx) = mpsc::channel::<Result<Message, axum::Error>>(4);
        let (tx, mut rx) = mpsc::channel::<Message>(16);
        let shutdown = CancellationToken::new();

        let input = Box::pin(stream::unfold(frames_rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        }));
        let session = tokio::spawn(run_session(
            input,
            PollSender::new(tx),
            unreachable_agent(),
            5,
            shutdown.clone(),
        ));
        frames_tx
            .send(Ok(Message::text(
                r#"{"command":"sign","message":"aGVsbG8=","fingerprint":"ABCD"}"#,
            )))
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        shutdown.cancel();
        session.await.unwrap();

        let mut frames = vec![first];
        while let Some(msg) = rx.recv().await {
            frames.push(msg);
        }
        assert_eq!(frames.len(), 2);
        drop(frames_tx);
    }
}
