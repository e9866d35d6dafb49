//! Streamed command execution.
//!
//! - `lines`: chunk to line decoder shared by every exec stream.
//! - `exec`: streaming POST client, exit code sentinel and line callbacks.

/// Streaming exec requests and exit code detection.
pub mod exec;
/// Line decoding for chunked response bodies.
pub mod lines;

/// Resource kinds that expose a container shell.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ExecResource {
    Container,
    Deployment,
    Stack,
}

impl ExecResource {
    /// Path segment used by exec and terminal routes.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Deployment => "deployment",
            Self::Stack => "stack",
        }
    }
}
