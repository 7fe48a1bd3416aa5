use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::util::MatrixId;

pub mod pdu;
pub mod room;
pub mod room_version;

pub use pdu::StoredPdu;
pub use room_version::VersionedPdu;

use room::EventType;

/// An event in the format clients consume: no hashes, no signatures, no DAG
/// bookkeeping.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Event {
    pub content: JsonValue,
    #[serde(rename = "type")]
    pub ty: String,
    pub event_id: String,
    /// Sometimes this is present outside this struct, in which case None is used
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    pub sender: MatrixId,
    pub origin_server_ts: i64,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<JsonValue>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
}

/// The reduced state-event form carried inside invites and previews: content,
/// type, state key and sender only, no signatures to verify.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StrippedState {
    pub content: JsonValue,
    pub state_key: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub sender: MatrixId,
}

/// Content discriminated by event type, for the places (auth rules, resolver)
/// that need to see inside. Everything else stays opaque in `Other`.
#[derive(Clone, Debug)]
pub enum EventContent {
    Create(room::Create),
    Member(room::Member),
    JoinRules(room::JoinRules),
    PowerLevels(room::PowerLevels),
    HistoryVisibility(room::HistoryVisibility),
    Redaction(room::Redaction),
    Tombstone(room::Tombstone),
    ServerAcl(room::ServerAcl),
    Other(String, JsonValue),
}

impl EventContent {
    pub fn from_parts(ty: &str, content: &JsonValue) -> Result<Self, serde_json::Error> {
        fn parse<T: EventType>(content: &JsonValue) -> Result<T, serde_json::Error> {
            serde_json::from_value(content.clone())
        }

        Ok(match ty {
            "m.room.create" => EventContent::Create(parse(content)?),
            "m.room.member" => EventContent::Member(parse(content)?),
            "m.room.join_rules" => EventContent::JoinRules(parse(content)?),
            "m.room.power_levels" => EventContent::PowerLevels(parse(content)?),
            "m.room.history_visibility" => EventContent::HistoryVisibility(parse(content)?),
            "m.room.redaction" => EventContent::Redaction(parse(content)?),
            "m.room.tombstone" => EventContent::Tombstone(parse(content)?),
            "m.room.server_acl" => EventContent::ServerAcl(parse(content)?),
            _ => EventContent::Other(ty.to_owned(), content.clone()),
        })
    }

    pub fn get_type(&self) -> &str {
        match self {
            EventContent::Create(_) => "m.room.create",
            EventContent::Member(_) => "m.room.member",
            EventContent::JoinRules(_) => "m.room.join_rules",
            EventContent::PowerLevels(_) => "m.room.power_levels",
            EventContent::HistoryVisibility(_) => "m.room.history_visibility",
            EventContent::Redaction(_) => "m.room.redaction",
            EventContent::Tombstone(_) => "m.room.tombstone",
            EventContent::ServerAcl(_) => "m.room.server_acl",
            EventContent::Other(ty, _) => ty,
        }
    }
}
