use std::fmt;

use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::rpc::{KomodoClient, RpcError};
use crate::terminal::lines::decode_lines;
use crate::terminal::ExecResource;

/// Prefix of the final line Periphery writes once the command exits.
///
/// ```text
/// __KOMODO_EXIT_CODE:0
/// ```
pub const KOMODO_EXIT_CODE: &str = "__KOMODO_EXIT_CODE";
/// Reported when the stream ends without an exit code line.
pub const EARLY_EXIT_WITHOUT_CODE: &str = "Early exit without code";

const NO_RESPONSE_BODY: &str = "No response body";

/// Output lines of one exec request, in arrival order.
pub type ExecLines = BoxStream<'static, String>;

/// How an exec stream finished.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExecExit {
    /// Raw code text reported by the remote shell.
    Code(String),
    /// The stream closed before an exit code arrived, eg. the command ran
    /// `exit` or the connection dropped.
    EarlyExit,
}

impl ExecExit {
    /// Raw exit code text, or the early exit message.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Code(code) => code,
            Self::EarlyExit => EARLY_EXIT_WITHOUT_CODE,
        }
    }

    /// Numeric code, when the remote reported one that parses.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Code(code) => code.trim().parse().ok(),
            Self::EarlyExit => None,
        }
    }
}

impl fmt::Display for ExecExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns the code text if `line` is an exit code sentinel.
///
/// The code is everything after the first `:`; it is not validated.
pub fn parse_exit_code(line: &str) -> Option<&str> {
    if !line.starts_with(KOMODO_EXIT_CODE) {
        return None;
    }
    Some(line.split_once(':').map(|(_, code)| code).unwrap_or_default())
}

/// Feeds `lines` to `on_line` until an exit code sentinel or the end of the
/// stream. The sentinel itself is not passed to `on_line`.
pub async fn drive_exec_lines<S, L>(mut lines: S, mut on_line: L) -> ExecExit
where
    S: Stream<Item = String> + Unpin,
    L: FnMut(String),
{
    while let Some(line) = lines.next().await {
        if let Some(code) = parse_exit_code(&line) {
            return ExecExit::Code(code.to_string());
        }
        on_line(line);
    }
    ExecExit::EarlyExit
}

/// Body of `/terminal/execute`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExecuteTerminalBody {
    /// Server id or name.
    pub server: String,
    /// Terminal name. Created if it does not exist.
    pub terminal: String,
    pub command: String,
    /// Command run when the terminal is first created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<String>,
}

/// Body of `/terminal/execute/container`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExecuteContainerExecBody {
    pub server: String,
    pub container: String,
    pub shell: String,
    pub command: String,
}

/// Body of `/terminal/execute/deployment`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExecuteDeploymentExecBody {
    pub deployment: String,
    pub shell: String,
    pub command: String,
}

/// Body of `/terminal/execute/stack`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExecuteStackExecBody {
    pub stack: String,
    pub service: String,
    pub shell: String,
    pub command: String,
}

impl KomodoClient {
    /// Runs a command on a server terminal and streams its output lines.
    ///
    /// The last line is normally the [`KOMODO_EXIT_CODE`] sentinel.
    pub async fn execute_terminal_stream(
        &self,
        body: &ExecuteTerminalBody,
    ) -> Result<ExecLines, RpcError> {
        self.exec_stream("/terminal/execute", body).await
    }

    /// Runs a command in a container and streams its output lines.
    pub async fn execute_container_exec_stream(
        &self,
        body: &ExecuteContainerExecBody,
    ) -> Result<ExecLines, RpcError> {
        self.resource_exec_stream(ExecResource::Container, body).await
    }

    /// Runs a command in a deployment's container and streams its output lines.
    pub async fn execute_deployment_exec_stream(
        &self,
        body: &ExecuteDeploymentExecBody,
    ) -> Result<ExecLines, RpcError> {
        self.resource_exec_stream(ExecResource::Deployment, body).await
    }

    /// Runs a command in a stack service container and streams its output lines.
    pub async fn execute_stack_exec_stream(
        &self,
        body: &ExecuteStackExecBody,
    ) -> Result<ExecLines, RpcError> {
        self.resource_exec_stream(ExecResource::Stack, body).await
    }

    /// Runs a terminal command, calling `on_line` for each output line and
    /// `on_finish` once with the exit code or [`ExecExit::EarlyExit`].
    ///
    /// Returns `Err` only if the request itself was rejected; neither
    /// callback fires in that case.
    pub async fn execute_terminal<L, F>(
        &self,
        body: &ExecuteTerminalBody,
        on_line: L,
        on_finish: F,
    ) -> Result<(), RpcError>
    where
        L: FnMut(String),
        F: FnOnce(ExecExit),
    {
        let lines = self.execute_terminal_stream(body).await?;
        on_finish(drive_exec_lines(lines, on_line).await);
        Ok(())
    }

    /// Callback form of [`KomodoClient::execute_container_exec_stream`].
    pub async fn execute_container_exec<L, F>(
        &self,
        body: &ExecuteContainerExecBody,
        on_line: L,
        on_finish: F,
    ) -> Result<(), RpcError>
    where
        L: FnMut(String),
        F: FnOnce(ExecExit),
    {
        let lines = self.execute_container_exec_stream(body).await?;
        on_finish(drive_exec_lines(lines, on_line).await);
        Ok(())
    }

    /// Callback form of [`KomodoClient::execute_deployment_exec_stream`].
    pub async fn execute_deployment_exec<L, F>(
        &self,
        body: &ExecuteDeploymentExecBody,
        on_line: L,
        on_finish: F,
    ) -> Result<(), RpcError>
    where
        L: FnMut(String),
        F: FnOnce(ExecExit),
    {
        let lines = self.execute_deployment_exec_stream(body).await?;
        on_finish(drive_exec_lines(lines, on_line).await);
        Ok(())
    }

    /// Callback form of [`KomodoClient::execute_stack_exec_stream`].
    pub async fn execute_stack_exec<L, F>(
        &self,
        body: &ExecuteStackExecBody,
        on_line: L,
        on_finish: F,
    ) -> Result<(), RpcError>
    where
        L: FnMut(String),
        F: FnOnce(ExecExit),
    {
        let lines = self.execute_stack_exec_stream(body).await?;
        on_finish(drive_exec_lines(lines, on_line).await);
        Ok(())
    }

    async fn resource_exec_stream<B: Serialize + ?Sized>(
        &self,
        resource: ExecResource,
        body: &B,
    ) -> Result<ExecLines, RpcError> {
        let path = format!("/terminal/execute/{}", resource.as_str());
        self.exec_stream(&path, body).await
    }

    async fn exec_stream<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ExecLines, RpcError> {
        let url = format!("{}{}", self.address(), path);
        debug!(event = "exec_stream_request", path);

        let response = self
            .post(&url, body)
            .send()
            .await
            .map_err(RpcError::transport)?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(RpcError::from_response(response).await);
        }
        if response.content_length() == Some(0) {
            return Err(RpcError::new(status.as_u16(), NO_RESPONSE_BODY, Vec::new()));
        }

        let path = path.to_string();
        let lines = decode_lines(Box::pin(response.bytes_stream()), move |err| {
            warn!(event = "exec_stream_interrupted", path = %path, error = %err);
        });
        Ok(lines.boxed())
    }
}

#[cfg(test)]
mod tests {
    use futures_util::stream;

    use super::{drive_exec_lines, parse_exit_code, ExecExit, EARLY_EXIT_WITHOUT_CODE};

    fn lines(items: &[&str]) -> impl futures_util::Stream<Item = String> + Unpin {
        stream::iter(
            items
                .iter()
                .map(|line| line.to_string())
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn sentinel_yields_text_after_first_colon() {
        assert_eq!(parse_exit_code("__KOMODO_EXIT_CODE:0"), Some("0"));
        assert_eq!(parse_exit_code("__KOMODO_EXIT_CODE:127"), Some("127"));
        assert_eq!(parse_exit_code("__KOMODO_EXIT_CODE:a:b"), Some("a:b"));
        assert_eq!(parse_exit_code("__KOMODO_EXIT_CODE"), Some(""));
    }

    #[test]
    fn ordinary_lines_are_not_sentinels() {
        assert_eq!(parse_exit_code("hello"), None);
        assert_eq!(parse_exit_code(" __KOMODO_EXIT_CODE:0"), None);
        assert_eq!(parse_exit_code(""), None);
    }

    #[tokio::test]
    async fn lines_then_exit_code() {
        let mut seen = Vec::new();
        let exit = drive_exec_lines(lines(&["hello", "__KOMODO_EXIT_CODE:0"]), |line| {
            seen.push(line)
        })
        .await;

        assert_eq!(seen, vec!["hello"]);
        assert_eq!(exit, ExecExit::Code("0".to_string()));
        assert_eq!(exit.code(), Some(0));
    }

    #[tokio::test]
    async fn stream_end_without_sentinel_is_early_exit() {
        let mut seen = Vec::new();
        let exit = drive_exec_lines(lines(&["hello"]), |line| seen.push(line)).await;

        assert_eq!(seen, vec!["hello"]);
        assert_eq!(exit, ExecExit::EarlyExit);
        assert_eq!(exit.to_string(), EARLY_EXIT_WITHOUT_CODE);
        assert_eq!(exit.code(), None);
    }

    #[tokio::test]
    async fn lines_after_sentinel_are_not_delivered() {
        let mut seen = Vec::new();
        let exit = drive_exec_lines(
            lines(&["a", "__KOMODO_EXIT_CODE:2", "trailing"]),
            |line| seen.push(line),
        )
        .await;

        assert_eq!(seen, vec!["a"]);
        assert_eq!(exit.as_str(), "2");
    }

    #[test]
    fn non_numeric_code_is_kept_raw() {
        let exit = ExecExit::Code("SIGKILL".to_string());
        assert_eq!(exit.as_str(), "SIGKILL");
        assert_eq!(exit.code(), None);
    }
}
