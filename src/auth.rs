//! Credentials and the shared session that owns them.
//!
//! Every request and every persistent connection reads the session at the
//! moment it needs credentials, so replacing them (account switch, key
//! rotation) takes effect on the next request or the next reconnect.

use std::sync::{Arc, RwLock};

use reqwest::RequestBuilder;
use secrecy::{ExposeSecret, SecretString};

use crate::stream::proto::LoginMessage;

/// Header carrying a bearer token.
pub const AUTHORIZATION_HEADER: &str = "authorization";
/// Header carrying the API key of a key pair.
pub const API_KEY_HEADER: &str = "x-api-key";
/// Header carrying the API secret of a key pair.
pub const API_SECRET_HEADER: &str = "x-api-secret";

/// Credentials used to authenticate against Komodo Core.
#[derive(Clone, Debug)]
pub enum Credentials {
    /// JWT issued by one of the `auth` login flows.
    Bearer { token: SecretString },
    /// Long-lived API key pair.
    ApiKeyPair { key: String, secret: SecretString },
}

impl Credentials {
    /// JWT credentials, sent as the `authorization` header.
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer {
            token: SecretString::new(token.into()),
        }
    }

    /// API key pair, sent as `x-api-key` and `x-api-secret`.
    pub fn api_key_pair(key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self::ApiKeyPair {
            key: key.into(),
            secret: SecretString::new(secret.into()),
        }
    }

    /// Builds the websocket login message for these credentials.
    pub fn login_message(&self) -> LoginMessage {
        match self {
            Self::Bearer { token } => LoginMessage::Jwt {
                jwt: token.expose_secret().clone(),
            },
            Self::ApiKeyPair { key, secret } => LoginMessage::ApiKeys {
                key: key.clone(),
                secret: secret.expose_secret().clone(),
            },
        }
    }

    /// Attaches exactly one auth header set to `builder`.
    pub(crate) fn apply(&self, builder: RequestBuilder) -> RequestBuilder {
        match self {
            Self::Bearer { token } => builder.header(AUTHORIZATION_HEADER, token.expose_secret()),
            Self::ApiKeyPair { key, secret } => builder
                .header(API_KEY_HEADER, key)
                .header(API_SECRET_HEADER, secret.expose_secret()),
        }
    }
}

/// Cloneable handle to the credentials of one logged in account.
///
/// Clones share state, so a [`Session`] handed to a long running
/// subscription observes later calls to [`Session::set_credentials`].
/// Separate accounts use separate sessions.
#[derive(Clone, Debug, Default)]
pub struct Session {
    credentials: Arc<RwLock<Option<Credentials>>>,
}

impl Session {
    /// Session without credentials. Requests are sent anonymously.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Session logged in with `credentials`.
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials: Arc::new(RwLock::new(Some(credentials))),
        }
    }

    /// Snapshot of the current credentials.
    pub fn credentials(&self) -> Option<Credentials> {
        match self.credentials.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replaces the credentials for every clone of this session.
    pub fn set_credentials(&self, credentials: Credentials) {
        self.replace(Some(credentials));
    }

    /// Drops the credentials; later requests go out anonymously.
    pub fn clear_credentials(&self) {
        self.replace(None);
    }

    /// Login message for a connection opening now, if any credentials are set.
    pub fn login_message(&self) -> Option<LoginMessage> {
        self.credentials().map(|credentials| credentials.login_message())
    }

    pub(crate) fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.credentials() {
            Some(credentials) => credentials.apply(builder),
            None => builder,
        }
    }

    fn replace(&self, credentials: Option<Credentials>) {
        match self.credentials.write() {
            Ok(mut guard) => *guard = credentials,
            Err(poisoned) => *poisoned.into_inner() = credentials,
        }
    }
}
