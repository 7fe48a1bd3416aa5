use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{error::Error, sign::SigningKey, util::MatrixId};

use super::{Event, EventContent};

pub mod v11;

pub use v11::{EventHash, PduV11, UnhashedPdu};

/// The room versions this server can be resident in.
pub const SUPPORTED_ROOM_VERSIONS: &[&str] = &["11"];

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum VersionedPdu {
    V11(PduV11),
}

/// Getter functions for all non-version-specific fields
impl VersionedPdu {
    pub fn event_content(&self) -> Result<EventContent, Error> {
        match self {
            VersionedPdu::V11(pdu) => EventContent::from_parts(&pdu.ty, &pdu.content)
                .map_err(|e| crate::error::ErrorKind::BadJson(e.to_string()).into()),
        }
    }

    pub fn ty(&self) -> &str {
        match self {
            VersionedPdu::V11(pdu) => &pdu.ty,
        }
    }

    pub fn content(&self) -> &JsonValue {
        match self {
            VersionedPdu::V11(pdu) => &pdu.content,
        }
    }

    pub fn room_id(&self) -> &str {
        match self {
            VersionedPdu::V11(pdu) => &pdu.room_id,
        }
    }

    pub fn sender(&self) -> &MatrixId {
        match self {
            VersionedPdu::V11(pdu) => &pdu.sender,
        }
    }

    /// The server whose signature makes this event well-formed. Current room
    /// versions have no origin field; the sender's domain is authoritative.
    pub fn origin(&self) -> &str {
        self.sender().domain()
    }

    pub fn state_key(&self) -> Option<&str> {
        match self {
            VersionedPdu::V11(pdu) => pdu.state_key.as_deref(),
        }
    }

    pub fn unsigned(&self) -> Option<&JsonValue> {
        match self {
            VersionedPdu::V11(pdu) => pdu.unsigned.as_ref(),
        }
    }

    pub fn origin_server_ts(&self) -> i64 {
        match self {
            VersionedPdu::V11(pdu) => pdu.origin_server_ts,
        }
    }

    pub fn prev_events(&self) -> &[String] {
        match self {
            VersionedPdu::V11(pdu) => &pdu.prev_events,
        }
    }

    pub fn auth_events(&self) -> &[String] {
        match self {
            VersionedPdu::V11(pdu) => &pdu.auth_events,
        }
    }

    pub fn depth(&self) -> i64 {
        match self {
            VersionedPdu::V11(pdu) => pdu.depth,
        }
    }
}

/// Delegations to version-specific functionality
impl VersionedPdu {
    pub fn event_id(&self) -> Result<String, Error> {
        match self {
            VersionedPdu::V11(pdu) => pdu.event_id(),
        }
    }

    pub fn content_hash(&self) -> Result<String, Error> {
        match self {
            VersionedPdu::V11(pdu) => pdu.content_hash(),
        }
    }

    pub fn declared_hash(&self) -> &str {
        match self {
            VersionedPdu::V11(pdu) => &pdu.hashes.sha256,
        }
    }

    pub fn redact(self) -> Self {
        match self {
            VersionedPdu::V11(pdu) => VersionedPdu::V11(pdu.redact()),
        }
    }

    pub fn sign(&mut self, server_name: &str, key: &SigningKey) -> Result<(), Error> {
        match self {
            VersionedPdu::V11(pdu) => pdu.sign(server_name, key),
        }
    }

    pub fn verify_signature(
        &self,
        server_name: &str,
        key_id: &str,
        public_key: &[u8],
    ) -> Result<(), Error> {
        match self {
            VersionedPdu::V11(pdu) => pdu.verify_signature(server_name, key_id, public_key),
        }
    }

    pub fn signature_key_ids(&self, server_name: &str) -> Vec<String> {
        match self {
            VersionedPdu::V11(pdu) => pdu.signature_key_ids(server_name),
        }
    }

    pub fn to_client_format(self, event_id: String) -> Event {
        match self {
            VersionedPdu::V11(pdu) => Event {
                content: pdu.content,
                ty: pdu.ty,
                event_id,
                room_id: Some(pdu.room_id),
                sender: pdu.sender,
                origin_server_ts: pdu.origin_server_ts,
                unsigned: pdu.unsigned,
                state_key: pdu.state_key,
            },
        }
    }
}
