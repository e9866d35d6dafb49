use std::fmt;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::auth::{Credentials, Session};
use crate::poll::PollOptions;
use crate::retry::{retry_async, RetryPolicy};

/// Status reported when no HTTP response was obtained at all.
pub const TRANSPORT_FAILURE_STATUS: u16 = 1;
/// Default address of a Core instance on this machine.
pub const LOCAL_KOMODO_ADDRESS: &str = "http://localhost:9120";

const REQUEST_FAILED: &str = "Request failed with error";
const BODY_UNAVAILABLE: &str = "Failed to get response body";
const BODY_UNPARSEABLE: &str = "Failed to parse response body";

/// Default client settings.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClientDefaults;

impl ClientDefaults {
    /// TCP connect timeout for HTTP requests.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Pause between `GetUpdate` polls.
    pub const POLL_INTERVAL: Duration = Duration::from_millis(1000);
}

/// Settings for [`KomodoClient::with_options`].
#[derive(Clone, Debug)]
pub struct KomodoClientOptions {
    /// TCP connect timeout for HTTP requests.
    pub connect_timeout: Duration,
    /// Applied to RPC calls only; streaming exec requests are never cut off.
    pub request_timeout: Option<Duration>,
    /// Defaults for [`KomodoClient::poll_update_until_complete`].
    pub poll: PollOptions,
}

impl Default for KomodoClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: ClientDefaults::CONNECT_TIMEOUT,
            request_timeout: None,
            poll: PollOptions::default(),
        }
    }
}

/// RPC groupings exposed by Komodo Core.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Namespace {
    Auth,
    User,
    Read,
    Write,
    Execute,
}

impl Namespace {
    /// Path segment of the namespace.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::User => "user",
            Self::Read => "read",
            Self::Write => "write",
            Self::Execute => "execute",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client for Komodo Core bound to one [`Session`].
#[derive(Clone, Debug)]
pub struct KomodoClient {
    http: Client,
    address: String,
    session: Session,
    request_timeout: Option<Duration>,
    poll: PollOptions,
}

impl KomodoClient {
    /// Client for the Core at `address` with default options.
    pub fn new(address: impl Into<String>, session: Session) -> Result<Self, ClientConfigError> {
        Self::with_options(address, session, KomodoClientOptions::default())
    }

    /// Client for the Core at `address` with explicit options.
    pub fn with_options(
        address: impl Into<String>,
        session: Session,
        options: KomodoClientOptions,
    ) -> Result<Self, ClientConfigError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(ClientConfigError::Http)?;

        let address = address.into();
        Ok(Self {
            http,
            address: address.trim().trim_end_matches('/').to_string(),
            session,
            request_timeout: options.request_timeout,
            poll: options.poll,
        })
    }

    /// Builds a client from `KOMODO_ADDRESS` plus either `KOMODO_API_KEY` /
    /// `KOMODO_API_SECRET` or `KOMODO_JWT`. With neither set the session is
    /// anonymous.
    pub fn from_env() -> Result<Self, ClientConfigError> {
        let address =
            env_var("KOMODO_ADDRESS").ok_or(ClientConfigError::MissingEnv("KOMODO_ADDRESS"))?;

        let session = match (env_var("KOMODO_API_KEY"), env_var("KOMODO_API_SECRET")) {
            (Some(key), Some(secret)) => Session::new(Credentials::api_key_pair(key, secret)),
            (Some(_), None) => return Err(ClientConfigError::MissingEnv("KOMODO_API_SECRET")),
            (None, Some(_)) => return Err(ClientConfigError::MissingEnv("KOMODO_API_KEY")),
            (None, None) => match env_var("KOMODO_JWT") {
                Some(jwt) => Session::new(Credentials::bearer(jwt)),
                None => Session::anonymous(),
            },
        };

        Self::new(address, session)
    }

    /// Core address without a trailing `/`.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Session shared by requests and persistent connections.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Poll settings used by the execute helpers.
    pub fn poll_options(&self) -> &PollOptions {
        &self.poll
    }

    /// Sends one RPC and decodes the typed result.
    ///
    /// Never retries. See [`KomodoClient::call_with_retry`].
    pub async fn call<P, R>(
        &self,
        namespace: Namespace,
        operation: &str,
        params: &P,
    ) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.rpc_url(namespace, operation);
        debug!(event = "rpc_request", %namespace, operation);

        let mut builder = self.post(&url, params);
        if let Some(timeout) = self.request_timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(RpcError::transport)?;
        let status = response.status();
        if status != StatusCode::OK {
            let error = RpcError::from_response(response).await;
            debug!(
                event = "rpc_failed",
                %namespace,
                operation,
                status = error.status,
                error = %error.result.error
            );
            return Err(error);
        }

        let body = response
            .text()
            .await
            .map_err(|err| RpcError::new(status.as_u16(), BODY_UNAVAILABLE, vec![err.to_string()]))?;
        serde_json::from_str(&body)
            .map_err(|err| RpcError::new(status.as_u16(), BODY_UNPARSEABLE, vec![err.to_string()]))
    }

    /// [`KomodoClient::call`] wrapped in a caller supplied retry policy.
    /// Only transport failures, 429 and 5xx are retried.
    pub async fn call_with_retry<P, R>(
        &self,
        policy: &RetryPolicy,
        namespace: Namespace,
        operation: &str,
        params: &P,
    ) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        retry_async(
            policy,
            |_| self.call(namespace, operation, params),
            RpcError::is_retryable,
        )
        .await
    }

    /// Calls `auth/{operation}`.
    pub async fn auth<P, R>(&self, operation: &str, params: &P) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call(Namespace::Auth, operation, params).await
    }

    /// Calls `user/{operation}`.
    pub async fn user<P, R>(&self, operation: &str, params: &P) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call(Namespace::User, operation, params).await
    }

    /// Calls `read/{operation}`.
    pub async fn read<P, R>(&self, operation: &str, params: &P) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call(Namespace::Read, operation, params).await
    }

    /// Calls `write/{operation}`.
    pub async fn write<P, R>(&self, operation: &str, params: &P) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call(Namespace::Write, operation, params).await
    }

    /// Calls `execute/{operation}`. Returns as soon as the task is queued.
    pub async fn execute<P, R>(&self, operation: &str, params: &P) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call(Namespace::Execute, operation, params).await
    }

    fn rpc_url(&self, namespace: Namespace, operation: &str) -> String {
        format!("{}/{}/{}", self.address, namespace, operation)
    }

    /// Authenticated JSON POST against the Core address.
    pub(crate) fn post<P: Serialize + ?Sized>(&self, url: &str, body: &P) -> RequestBuilder {
        self.session.authorize(self.http.post(url).json(body))
    }

    /// Core address with the leading `http` swapped for `ws`.
    pub(crate) fn ws_address(&self) -> String {
        self.address.replacen("http", "ws", 1)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Error body returned by Core, also used for locally synthesized failures.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcErrorBody {
    /// Top level error message.
    pub error: String,
    /// Error chain, outermost first.
    #[serde(default)]
    pub trace: Vec<String>,
}

/// Failed RPC or streaming request.
///
/// `status` is the HTTP status, or [`TRANSPORT_FAILURE_STATUS`] when no
/// response was received.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("komodo request failed with status {status}: {}", .result.error)]
pub struct RpcError {
    /// HTTP status, or [`TRANSPORT_FAILURE_STATUS`].
    pub status: u16,
    /// Server or synthesized error body.
    pub result: RpcErrorBody,
}

impl RpcError {
    /// Error with an explicit status, message and trace.
    pub fn new(status: u16, error: impl Into<String>, trace: Vec<String>) -> Self {
        Self {
            status,
            result: RpcErrorBody {
                error: error.into(),
                trace,
            },
        }
    }

    pub(crate) fn transport(err: reqwest::Error) -> Self {
        Self::new(TRANSPORT_FAILURE_STATUS, REQUEST_FAILED, vec![err.to_string()])
    }

    /// Shapes a non-200 response into an error, keeping the server's
    /// `{error, trace}` body when it parses.
    pub(crate) async fn from_response(response: Response) -> Self {
        let status = response.status().as_u16();
        match response.text().await {
            Ok(body) => Self::from_error_body(status, &body),
            Err(err) => Self::new(status, BODY_UNAVAILABLE, vec![err.to_string()]),
        }
    }

    pub(crate) fn from_error_body(status: u16, body: &str) -> Self {
        match serde_json::from_str::<RpcErrorBody>(body) {
            Ok(result) => Self { status, result },
            Err(err) => Self::new(status, BODY_UNAVAILABLE, vec![err.to_string()]),
        }
    }

    /// No HTTP response was received.
    pub fn is_transport(&self) -> bool {
        self.status == TRANSPORT_FAILURE_STATUS
    }

    /// Transport failures, 429 and 5xx.
    pub fn is_retryable(&self) -> bool {
        if self.is_transport() {
            return true;
        }
        StatusCode::from_u16(self.status)
            .map(|status| status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS)
            .unwrap_or(false)
    }
}

/// Failure building a [`KomodoClient`].
#[derive(Debug, Error)]
pub enum ClientConfigError {
    #[error("failed to build http client: {0}")]
    Http(reqwest::Error),

    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),
}
