use gpg_bridge_protocol::{DecodeError, InboundCommand, OutboundResult};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::agent::GpgAgent;

/// Producer side of a session's bounded result queue.
pub type ResultSink = mpsc::Sender<OutboundResult>;

/// Queue a result for the session writer.
///
/// If the writer is gone (peer disconnected) the result is dropped and logged;
/// the caller carries on so that cleanup still runs.
pub async fn emit(results: &ResultSink, result: OutboundResult) {
    debug!(communication = %result.communication, "queueing result");
    if results.send(result).await.is_err() {
        warn!("result queue closed, dropping result");
    }
}

/// Decode one inbound text frame and run it against the agent.
///
/// Every frame produces at least one result: `sign` produces two, everything
/// else one. The sink is left open; closing it is the session's job.
pub async fn process_command(agent: &GpgAgent, frame: &str, results: &ResultSink) {
    let command = match InboundCommand::decode(frame) {
        Ok(command) => command,
        Err(DecodeError::InvalidPayload) => {
            debug!("invalid payload");
            emit(results, OutboundResult::invalid_payload()).await;
            return;
        }
        Err(DecodeError::UnknownCommand(tag)) => {
            debug!(command = %tag, "unknown command");
            emit(results, OutboundResult::unknown_command()).await;
            return;
        }
    };

    debug!(command = command.tag(), "processing command");
    match command {
        InboundCommand::GetKeys => {
            let result = agent.list_keys().await;
            emit(results, result).await;
        }
        InboundCommand::Sign {
            message,
            fingerprint,
        } => agent.sign_message(&message, &fingerprint, results).await,
    }
}
