use thiserror::Error;

/// Failures inside the agent adapter that are not the agent's own verdict.
///
/// A non-zero exit from the agent is reported through the agent's output, not
/// through this type; these cover the cases where no verdict was produced.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to stage payload file: {0}")]
    TempFile(#[source] std::io::Error),
}
