use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use enum_extract::extract;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{
    error::Error,
    events::{room::Membership, EventContent, StoredPdu, StrippedState},
    util::MatrixId,
};

#[cfg(feature = "storage-mem")]
pub mod mem;
#[cfg(feature = "storage-sled")]
pub mod sled;

/// (event_type, state_key) -> event_id, the persisted form of a state
/// snapshot. State groups are append-only and shared: many events can point
/// at the same group id.
pub type StateMap = HashMap<(String, String), String>;

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct UserProfile {
    pub avatar_url: Option<String>,
    pub displayname: Option<String>,
}

#[async_trait]
pub trait StorageManager: Send + Sync {
    async fn get_handle(&self) -> Result<Box<dyn Storage>, Error>;
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Atomically persists a batch of PDUs. Duplicate event ids are a no-op.
    /// Newly stored non-outlier, non-soft-failed events supersede their
    /// prev_events in the room's forward extremity set.
    async fn add_pdus(&self, pdus: &[StoredPdu]) -> Result<(), Error>;

    async fn get_pdu(&self, room_id: &str, event_id: &str) -> Result<Option<StoredPdu>, Error>;

    async fn has_pdu(&self, room_id: &str, event_id: &str) -> Result<bool, Error> {
        Ok(self.get_pdu(room_id, event_id).await?.is_some())
    }

    /// All PDUs of a room in insertion order. Iteration order is stable
    /// across calls.
    async fn get_room_pdus(&self, room_id: &str) -> Result<Vec<StoredPdu>, Error>;

    /// Clears the outlier flag once an event has been integrated into the
    /// DAG proper.
    async fn mark_not_outlier(&self, room_id: &str, event_id: &str) -> Result<(), Error>;

    /// Rewrites the stored copy of an event through the redaction algorithm.
    async fn redact_pdu(&self, room_id: &str, event_id: &str) -> Result<(), Error>;

    async fn get_rooms(&self) -> Result<Vec<String>, Error>;

    async fn forward_extremities(&self, room_id: &str) -> Result<HashSet<String>, Error>;

    // State groups: integer-addressed snapshots, created on every state
    // change, never destroyed.

    async fn create_state_group(&self, room_id: &str, state: StateMap) -> Result<u64, Error>;

    async fn get_state_group(&self, room_id: &str, group: u64) -> Result<Option<StateMap>, Error>;

    /// Records the state of the room *after* the given event.
    async fn set_event_state_group(
        &self,
        room_id: &str,
        event_id: &str,
        group: u64,
    ) -> Result<(), Error>;

    async fn event_state_group(&self, room_id: &str, event_id: &str)
        -> Result<Option<u64>, Error>;

    async fn set_current_state_group(&self, room_id: &str, group: u64) -> Result<(), Error>;

    async fn current_state_group(&self, room_id: &str) -> Result<Option<u64>, Error>;

    // Ephemeral per-room and global data, fed by EDUs.

    async fn set_typing(
        &self,
        room_id: &str,
        user_id: &MatrixId,
        is_typing: bool,
        timeout_ms: u32,
    ) -> Result<(), Error>;

    async fn get_typing(&self, room_id: &str) -> Result<HashSet<MatrixId>, Error>;

    async fn set_ephemeral(
        &self,
        room_id: &str,
        event_type: &str,
        content: Option<JsonValue>,
    ) -> Result<(), Error>;

    async fn get_ephemeral(
        &self,
        room_id: &str,
        event_type: &str,
    ) -> Result<Option<JsonValue>, Error>;

    async fn set_presence(&self, user_id: &MatrixId, content: JsonValue) -> Result<(), Error>;

    async fn get_presence(&self, user_id: &MatrixId) -> Result<Option<JsonValue>, Error>;

    // Invites: the stripped state shown to an invited user before they join.

    async fn set_invite_state(
        &self,
        user_id: &MatrixId,
        room_id: &str,
        events: Vec<StrippedState>,
    ) -> Result<(), Error>;

    async fn remove_invite(&self, user_id: &MatrixId, room_id: &str) -> Result<(), Error>;

    async fn get_invited_rooms(
        &self,
        user_id: &MatrixId,
    ) -> Result<HashMap<String, Vec<StrippedState>>, Error>;

    // Profiles, backing the federation profile query.

    async fn get_profile(&self, localpart: &str) -> Result<Option<UserProfile>, Error>;

    async fn set_profile(&self, localpart: &str, profile: UserProfile) -> Result<(), Error>;

    // Transaction replay: a duplicate txn id from the same origin must get
    // the original response back.

    async fn record_txn(
        &self,
        origin: &str,
        txn_id: &str,
        response: JsonValue,
    ) -> Result<(), Error>;

    async fn get_txn(&self, origin: &str, txn_id: &str) -> Result<Option<JsonValue>, Error>;

    // Derived lookups with one implementation for every backend.

    async fn current_state(&self, room_id: &str) -> Result<StateMap, Error> {
        match self.current_state_group(room_id).await? {
            Some(group) => Ok(self.get_state_group(room_id, group).await?.unwrap_or_default()),
            None => Ok(StateMap::new()),
        }
    }

    /// The current state event occupying `(event_type, state_key)`, if any.
    async fn get_state_event(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<StoredPdu>, Error> {
        let state = self.current_state(room_id).await?;
        match state.get(&(event_type.to_owned(), state_key.to_owned())) {
            Some(event_id) => self.get_pdu(room_id, event_id).await,
            None => Ok(None),
        }
    }

    async fn get_membership(
        &self,
        user_id: &MatrixId,
        room_id: &str,
    ) -> Result<Option<Membership>, Error> {
        let event = self.get_state_event(room_id, "m.room.member", user_id.as_str()).await?;
        let membership = match event {
            Some(pdu) => {
                Some(extract!(EventContent::Member(_), pdu.event_content()?).unwrap().membership)
            },
            None => None,
        };
        Ok(membership)
    }

    /// The room version recorded in the create event, if the room is known.
    async fn room_version(&self, room_id: &str) -> Result<Option<String>, Error> {
        let create = self.get_state_event(room_id, "m.room.create", "").await?;
        Ok(create.and_then(|pdu| {
            pdu.content()
                .get("room_version")
                .and_then(JsonValue::as_str)
                .map(str::to_owned)
        }))
    }

    /// Transitive closure over auth_events, breadth-first over the id set.
    async fn auth_chain(
        &self,
        room_id: &str,
        event_ids: &[String],
    ) -> Result<HashSet<String>, Error> {
        let mut ret = HashSet::new();
        let mut to_check: Vec<String> = event_ids.to_vec();
        while let Some(event_id) = to_check.pop() {
            let pdu = self
                .get_pdu(room_id, &event_id)
                .await?
                .ok_or_else(|| crate::error::ErrorKind::NotFound)?;
            for auth_event_id in pdu.auth_events() {
                if ret.insert(auth_event_id.clone()) {
                    to_check.push(auth_event_id.clone());
                }
            }
        }
        Ok(ret)
    }

    /// Domains that currently have at least one joined user in the room.
    async fn get_servers_in_room(&self, room_id: &str) -> Result<HashSet<String>, Error> {
        let state = self.current_state(room_id).await?;
        let mut servers = HashSet::new();
        for ((ty, state_key), event_id) in state.iter() {
            if ty != "m.room.member" {
                continue;
            }
            let pdu = match self.get_pdu(room_id, event_id).await? {
                Some(pdu) => pdu,
                None => continue,
            };
            let content = pdu.event_content()?;
            if extract!(EventContent::Member(_), content).unwrap().membership == Membership::Join {
                if let Some((_, domain)) = state_key.split_once(':') {
                    servers.insert(domain.to_owned());
                }
            }
        }
        Ok(servers)
    }
}
