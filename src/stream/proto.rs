use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Literal text frame the server sends once the login message is accepted.
pub const LOGGED_IN: &str = "LOGGED_IN";

/// First client frame on every persistent connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "params")]
pub enum LoginMessage {
    Jwt { jwt: String },
    ApiKeys { key: String, secret: String },
}

/// Mongo style object id, `{"$oid": "..."}` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectId {
    /// Hex encoded id.
    #[serde(rename = "$oid")]
    pub oid: String,
}

/// Lifecycle of an [`Update`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum UpdateStatus {
    #[default]
    Queued,
    InProgress,
    Complete,
    #[serde(other)]
    Unknown,
}

/// Server side task record pushed on the update feed and returned by
/// `execute` calls.
///
/// Only the fields the client acts on are typed; everything else is kept
/// in `fields` so the record round trips unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Update {
    /// Absent on records not yet stored.
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    /// Defaults to `Queued` when missing.
    #[serde(default)]
    pub status: UpdateStatus,
    /// All other fields, untouched.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Update {
    /// Update id as a plain string.
    pub fn id(&self) -> Option<&str> {
        self.id.as_ref().map(|id| id.oid.as_str())
    }

    /// The task finished, successfully or not.
    pub fn is_complete(&self) -> bool {
        self.status == UpdateStatus::Complete
    }
}

/// Element of a batch execution response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", content = "data")]
pub enum BatchExecutionItem {
    Ok(Update),
    Err(Value),
}

/// Pty dimensions sent with [`TerminalInput::Resize`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResizeDimensions {
    /// Terminal height in rows.
    pub rows: u16,
    /// Terminal width in columns.
    pub cols: u16,
}

/// Client to server traffic on an authenticated terminal connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalInput {
    /// Raw bytes written to the pty stdin.
    Data(Vec<u8>),
    Resize(ResizeDimensions),
}

const TERMINAL_DATA_PREFIX: u8 = 0x00;
const TERMINAL_RESIZE_PREFIX: u8 = 0xFF;

impl TerminalInput {
    /// Binary frame for this input: a one byte kind prefix followed by the
    /// payload.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Self::Data(bytes) => {
                let mut frame = Vec::with_capacity(bytes.len() + 1);
                frame.push(TERMINAL_DATA_PREFIX);
                frame.extend_from_slice(bytes);
                Ok(frame)
            }
            Self::Resize(dimensions) => {
                let mut frame = vec![TERMINAL_RESIZE_PREFIX];
                serde_json::to_writer(&mut frame, dimensions)?;
                Ok(frame)
            }
        }
    }
}

/// Query for `/ws/terminal`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectTerminalQuery {
    /// Server id or name.
    pub server: String,
    /// Terminal name. An existing terminal with this name is attached to.
    pub terminal: String,
    /// Command run when the terminal is first created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<String>,
}

/// Query for `/ws/container/terminal`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectContainerExecQuery {
    pub server: String,
    pub container: String,
    pub shell: String,
}

/// Query for `/ws/deployment/terminal`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectDeploymentExecQuery {
    pub deployment: String,
    pub shell: String,
}

/// Query for `/ws/stack/terminal`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectStackExecQuery {
    pub stack: String,
    pub service: String,
    pub shell: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        BatchExecutionItem, LoginMessage, ResizeDimensions, TerminalInput, Update, UpdateStatus,
    };

    #[test]
    fn login_message_matches_server_contract() {
        let jwt = serde_json::to_value(LoginMessage::Jwt {
            jwt: "token".to_string(),
        })
        .expect("serialize jwt login");
        assert_eq!(jwt, json!({"type": "Jwt", "params": {"jwt": "token"}}));

        let keys = serde_json::to_value(LoginMessage::ApiKeys {
            key: "k".to_string(),
            secret: "s".to_string(),
        })
        .expect("serialize api key login");
        assert_eq!(
            keys,
            json!({"type": "ApiKeys", "params": {"key": "k", "secret": "s"}})
        );
    }

    #[test]
    fn update_keeps_untyped_fields() {
        let raw = json!({
            "_id": {"$oid": "abc"},
            "status": "InProgress",
            "operation": "Deploy",
            "logs": [],
        });
        let update: Update = serde_json::from_value(raw.clone()).expect("parse update");

        assert_eq!(update.id(), Some("abc"));
        assert_eq!(update.status, UpdateStatus::InProgress);
        assert_eq!(serde_json::to_value(&update).expect("serialize"), raw);
    }

    #[test]
    fn unknown_update_status_is_tolerated() {
        let update: Update =
            serde_json::from_value(json!({"status": "Cancelled"})).expect("parse update");
        assert_eq!(update.status, UpdateStatus::Unknown);
        assert!(update.id().is_none());
    }

    #[test]
    fn batch_items_are_tagged_by_status() {
        let items: Vec<BatchExecutionItem> = serde_json::from_value(json!([
            {"status": "Err", "data": {"name": "a", "error": {"error": "nope", "trace": []}}},
            {"status": "Ok", "data": {"_id": {"$oid": "u1"}, "status": "Queued"}},
        ]))
        .expect("parse batch");

        assert!(matches!(items[0], BatchExecutionItem::Err(_)));
        match &items[1] {
            BatchExecutionItem::Ok(update) => assert_eq!(update.id(), Some("u1")),
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[test]
    fn terminal_input_frames_carry_kind_prefix() {
        let data = TerminalInput::Data(b"ls\n".to_vec())
            .encode()
            .expect("encode data");
        assert_eq!(data, b"\x00ls\n".to_vec());

        let resize = TerminalInput::Resize(ResizeDimensions { rows: 24, cols: 80 })
            .encode()
            .expect("encode resize");
        assert_eq!(resize[0], 0xFF);
        let dimensions: ResizeDimensions =
            serde_json::from_slice(&resize[1..]).expect("parse resize payload");
        assert_eq!(dimensions, ResizeDimensions { rows: 24, cols: 80 });
    }
}
