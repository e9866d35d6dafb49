//! Login handshake shared by every persistent connection.
//!
//! ```text
//! Opening --open--> AwaitingLogin --"LOGGED_IN"--> Authenticated
//!    \                    \                             |
//!     `------------------- `-----------close-----------> Closed
//! ```
//!
//! The machine is transport agnostic: the connection runner feeds it frame
//! events and performs whatever [`HandshakeAction`] comes back.

use thiserror::Error;
use tracing::warn;

use crate::stream::proto::{LoginMessage, LOGGED_IN};

/// How authenticated traffic is framed for the application.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PayloadFraming {
    /// Structured text messages (update feed).
    Text,
    /// Raw pty bytes (terminal and exec channels).
    Binary,
}

/// Login progress of one connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandshakeState {
    Opening,
    AwaitingLogin,
    Authenticated,
    Closed,
}

/// Inbound frame after transport level control frames are handled.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Authenticated payload handed to the application.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
}

/// What the connection runner does next.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HandshakeAction {
    /// Send this login message; the connection is now awaiting login.
    SendLogin(LoginMessage),
    /// Login acknowledged.
    LoggedIn,
    /// Forward to the application.
    Deliver(Payload),
    /// Drop the frame.
    Ignore,
    /// Connection closed; fired once.
    Closed,
}

/// Login protocol violations and failures.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum HandshakeError {
    #[error("no credentials configured for websocket login")]
    MissingCredentials,
    #[error("connection opened twice")]
    AlreadyOpen,
    #[error("binary frame received before login")]
    BinaryBeforeLogin,
    #[error("frame received on a connection that never opened")]
    FrameBeforeOpen,
    #[error("server did not acknowledge login in time")]
    LoginTimedOut,
    #[error("login rejected: {0}")]
    LoginRejected(String),
}

/// Explicit login state for one connection.
#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
    framing: PayloadFraming,
    rejection: Option<String>,
}

impl Handshake {
    /// Fresh handshake in `Opening`.
    pub fn new(framing: PayloadFraming) -> Self {
        Self {
            state: HandshakeState::Opening,
            framing,
            rejection: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Framing currently expected from the peer. Terminal channels switch to
    /// binary only once authenticated.
    pub fn active_framing(&self) -> PayloadFraming {
        match self.state {
            HandshakeState::Authenticated => self.framing,
            _ => PayloadFraming::Text,
        }
    }

    /// `LOGGED_IN` was received.
    pub fn is_authenticated(&self) -> bool {
        self.state == HandshakeState::Authenticated
    }

    /// Last text frame received while awaiting login. Core sends its
    /// rejection reason this way right before closing.
    pub fn login_rejection(&self) -> Option<&str> {
        self.rejection.as_deref()
    }

    /// Transport reported open. `login` is built by the caller from the
    /// session at this exact moment.
    pub fn on_open(
        &mut self,
        login: Option<LoginMessage>,
    ) -> Result<HandshakeAction, HandshakeError> {
        if self.state != HandshakeState::Opening {
            return Err(HandshakeError::AlreadyOpen);
        }
        let login = login.ok_or(HandshakeError::MissingCredentials)?;
        self.state = HandshakeState::AwaitingLogin;
        Ok(HandshakeAction::SendLogin(login))
    }

    /// Inbound text or binary frame.
    pub fn on_frame(&mut self, frame: InboundFrame) -> Result<HandshakeAction, HandshakeError> {
        match self.state {
            HandshakeState::Opening => Err(HandshakeError::FrameBeforeOpen),
            HandshakeState::Closed => Ok(HandshakeAction::Ignore),
            HandshakeState::AwaitingLogin => match frame {
                InboundFrame::Text(text) if text == LOGGED_IN => {
                    self.state = HandshakeState::Authenticated;
                    Ok(HandshakeAction::LoggedIn)
                }
                InboundFrame::Text(text) => {
                    warn!(event = "ws_frame_before_login", message = %text);
                    self.rejection = Some(text);
                    Ok(HandshakeAction::Ignore)
                }
                InboundFrame::Binary(_) => Err(HandshakeError::BinaryBeforeLogin),
            },
            HandshakeState::Authenticated => Ok(HandshakeAction::Deliver(self.payload(frame))),
        }
    }

    /// Remote close, transport end, or local close. Only the first call
    /// yields [`HandshakeAction::Closed`].
    pub fn on_close(&mut self) -> HandshakeAction {
        if self.state == HandshakeState::Closed {
            return HandshakeAction::Ignore;
        }
        self.state = HandshakeState::Closed;
        HandshakeAction::Closed
    }

    fn payload(&self, frame: InboundFrame) -> Payload {
        match (self.framing, frame) {
            (PayloadFraming::Binary, InboundFrame::Text(text)) => Payload::Bytes(text.into_bytes()),
            (PayloadFraming::Binary, InboundFrame::Binary(bytes)) => Payload::Bytes(bytes),
            (PayloadFraming::Text, InboundFrame::Text(text)) => Payload::Text(text),
            (PayloadFraming::Text, InboundFrame::Binary(bytes)) => Payload::Bytes(bytes),
        }
    }
}
