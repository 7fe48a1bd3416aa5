use std::{
    collections::{HashMap, HashSet},
    convert::TryInto,
    path::Path,
    sync::Arc,
};

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::{
    error::{Error, ErrorKind},
    events::{StoredPdu, StrippedState},
    util::MatrixId,
};

use super::{StateMap, Storage, StorageManager, UserProfile};

/// Sled-backed storage. Multi-key writes rely on the per-room write lock the
/// ingress pipeline already holds; sled gives atomicity per key.
pub struct SledStorageManager {
    db: sled::Db,
}

pub struct SledStorageHandle {
    pdus: sled::Tree,
    pdu_order: sled::Tree,
    extremities: sled::Tree,
    state_groups: sled::Tree,
    state_group_index: sled::Tree,
    event_groups: sled::Tree,
    current_groups: sled::Tree,
    ephemeral: sled::Tree,
    typing: sled::Tree,
    presence: sled::Tree,
    invites: sled::Tree,
    profiles: sled::Tree,
    txns: sled::Tree,
    rooms: sled::Tree,
}

impl SledStorageManager {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, Error> {
        let db = sled::open(path).map_err(db_err)?;
        Ok(SledStorageManager { db })
    }
}

#[async_trait]
impl StorageManager for SledStorageManager {
    async fn get_handle(&self) -> Result<Box<dyn Storage>, Error> {
        Ok(Box::new(SledStorageHandle {
            pdus: self.db.open_tree("pdus").map_err(db_err)?,
            pdu_order: self.db.open_tree("pdu_order").map_err(db_err)?,
            extremities: self.db.open_tree("extremities").map_err(db_err)?,
            state_groups: self.db.open_tree("state_groups").map_err(db_err)?,
            state_group_index: self.db.open_tree("state_group_index").map_err(db_err)?,
            event_groups: self.db.open_tree("event_groups").map_err(db_err)?,
            current_groups: self.db.open_tree("current_groups").map_err(db_err)?,
            ephemeral: self.db.open_tree("ephemeral").map_err(db_err)?,
            typing: self.db.open_tree("typing").map_err(db_err)?,
            presence: self.db.open_tree("presence").map_err(db_err)?,
            invites: self.db.open_tree("invites").map_err(db_err)?,
            profiles: self.db.open_tree("profiles").map_err(db_err)?,
            txns: self.db.open_tree("txns").map_err(db_err)?,
            rooms: self.db.open_tree("rooms").map_err(db_err)?,
        }))
    }
}

fn db_err(e: sled::Error) -> Error {
    ErrorKind::DbError(format!("{}", e)).into()
}

fn ser_err(e: impl std::fmt::Display) -> Error {
    ErrorKind::DbError(format!("serialization: {}", e)).into()
}

fn scoped(room_id: &str, rest: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(room_id.len() + rest.len() + 1);
    key.extend_from_slice(room_id.as_bytes());
    key.push(0);
    key.extend_from_slice(rest.as_bytes());
    key
}

fn group_key(room_id: &str, group: u64) -> Vec<u8> {
    let mut key = scoped(room_id, "");
    key.extend_from_slice(&group.to_be_bytes());
    key
}

fn be_u64(bytes: &[u8]) -> Option<u64> {
    bytes.try_into().ok().map(u64::from_be_bytes)
}

/// State maps are stored as their sorted entry list so equality of snapshots
/// is equality of bytes.
fn encode_state(state: &StateMap) -> Result<Vec<u8>, Error> {
    let mut entries: Vec<_> = state.iter().collect();
    entries.sort();
    bincode::serialize(&entries).map_err(ser_err)
}

fn decode_state(bytes: &[u8]) -> Result<StateMap, Error> {
    let entries: Vec<((String, String), String)> =
        bincode::deserialize(bytes).map_err(ser_err)?;
    Ok(entries.into_iter().collect())
}

impl SledStorageHandle {
    fn load_extremities(&self, room_id: &str) -> Result<HashSet<String>, Error> {
        Ok(match self.extremities.get(room_id.as_bytes()).map_err(db_err)? {
            Some(bytes) => bincode::deserialize(&bytes).map_err(ser_err)?,
            None => HashSet::new(),
        })
    }

    fn store_extremities(&self, room_id: &str, extremities: &HashSet<String>) -> Result<(), Error> {
        self.extremities
            .insert(room_id.as_bytes(), bincode::serialize(extremities).map_err(ser_err)?)
            .map_err(db_err)?;
        Ok(())
    }

    fn load_pdu(&self, room_id: &str, event_id: &str) -> Result<Option<StoredPdu>, Error> {
        Ok(match self.pdus.get(scoped(room_id, event_id)).map_err(db_err)? {
            Some(bytes) => Some(serde_json::from_slice(&bytes).map_err(ser_err)?),
            None => None,
        })
    }

    fn store_pdu(&self, pdu: &StoredPdu) -> Result<(), Error> {
        self.pdus
            .insert(
                scoped(pdu.room_id(), pdu.event_id()),
                serde_json::to_vec(pdu).map_err(ser_err)?,
            )
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl Storage for SledStorageHandle {
    async fn add_pdus(&self, pdus: &[StoredPdu]) -> Result<(), Error> {
        for pdu in pdus {
            let room_id = pdu.room_id();
            if self.pdus.contains_key(scoped(room_id, pdu.event_id())).map_err(db_err)? {
                continue;
            }
            self.rooms.insert(room_id.as_bytes(), &[]).map_err(db_err)?;
            self.store_pdu(pdu)?;

            let seq = self.pdu_order.scan_prefix(scoped(room_id, "")).count() as u64;
            let mut order_key = scoped(room_id, "");
            order_key.extend_from_slice(&seq.to_be_bytes());
            self.pdu_order
                .insert(order_key, pdu.event_id().as_bytes())
                .map_err(db_err)?;

            if !pdu.outlier() && !pdu.soft_failed() {
                let mut extremities = self.load_extremities(room_id)?;
                for parent in pdu.prev_events() {
                    extremities.remove(parent);
                }
                extremities.insert(pdu.event_id().to_owned());
                self.store_extremities(room_id, &extremities)?;
            }
        }
        self.pdus.flush_async().await.map_err(db_err)?;
        Ok(())
    }

    async fn get_pdu(&self, room_id: &str, event_id: &str) -> Result<Option<StoredPdu>, Error> {
        self.load_pdu(room_id, event_id)
    }

    async fn get_room_pdus(&self, room_id: &str) -> Result<Vec<StoredPdu>, Error> {
        let mut out = Vec::new();
        for entry in self.pdu_order.scan_prefix(scoped(room_id, "")) {
            let (_, event_id) = entry.map_err(db_err)?;
            let event_id = String::from_utf8(event_id.to_vec()).map_err(ser_err)?;
            if let Some(pdu) = self.load_pdu(room_id, &event_id)? {
                out.push(pdu);
            }
        }
        Ok(out)
    }

    async fn mark_not_outlier(&self, room_id: &str, event_id: &str) -> Result<(), Error> {
        if let Some(mut pdu) = self.load_pdu(room_id, event_id)? {
            pdu.clear_outlier();
            self.store_pdu(&pdu)?;
        }
        Ok(())
    }

    async fn redact_pdu(&self, room_id: &str, event_id: &str) -> Result<(), Error> {
        if let Some(mut pdu) = self.load_pdu(room_id, event_id)? {
            pdu.apply_redaction();
            self.store_pdu(&pdu)?;
        }
        Ok(())
    }

    async fn get_rooms(&self) -> Result<Vec<String>, Error> {
        let mut out = Vec::new();
        for entry in self.rooms.iter() {
            let (key, _) = entry.map_err(db_err)?;
            out.push(String::from_utf8(key.to_vec()).map_err(ser_err)?);
        }
        Ok(out)
    }

    async fn forward_extremities(&self, room_id: &str) -> Result<HashSet<String>, Error> {
        self.load_extremities(room_id)
    }

    async fn create_state_group(&self, room_id: &str, state: StateMap) -> Result<u64, Error> {
        let encoded = encode_state(&state)?;
        let digest = ring::digest::digest(&ring::digest::SHA256, &encoded);
        let mut index_key = scoped(room_id, "");
        index_key.extend_from_slice(digest.as_ref());

        if let Some(existing) = self.state_group_index.get(&index_key).map_err(db_err)? {
            if let Some(group) = be_u64(&existing) {
                return Ok(group);
            }
        }

        let group = self.state_groups.scan_prefix(scoped(room_id, "")).count() as u64;
        self.state_groups
            .insert(group_key(room_id, group), encoded)
            .map_err(db_err)?;
        self.state_group_index
            .insert(index_key, &group.to_be_bytes())
            .map_err(db_err)?;
        Ok(group)
    }

    async fn get_state_group(&self, room_id: &str, group: u64) -> Result<Option<StateMap>, Error> {
        Ok(match self.state_groups.get(group_key(room_id, group)).map_err(db_err)? {
            Some(bytes) => Some(decode_state(&bytes)?),
            None => None,
        })
    }

    async fn set_event_state_group(
        &self,
        room_id: &str,
        event_id: &str,
        group: u64,
    ) -> Result<(), Error> {
        self.event_groups
            .insert(scoped(room_id, event_id), &group.to_be_bytes())
            .map_err(db_err)?;
        Ok(())
    }

    async fn event_state_group(
        &self,
        room_id: &str,
        event_id: &str,
    ) -> Result<Option<u64>, Error> {
        Ok(self
            .event_groups
            .get(scoped(room_id, event_id))
            .map_err(db_err)?
            .and_then(|bytes| be_u64(&bytes)))
    }

    async fn set_current_state_group(&self, room_id: &str, group: u64) -> Result<(), Error> {
        self.current_groups
            .insert(room_id.as_bytes(), &group.to_be_bytes())
            .map_err(db_err)?;
        Ok(())
    }

    async fn current_state_group(&self, room_id: &str) -> Result<Option<u64>, Error> {
        Ok(self
            .current_groups
            .get(room_id.as_bytes())
            .map_err(db_err)?
            .and_then(|bytes| be_u64(&bytes)))
    }

    async fn set_typing(
        &self,
        room_id: &str,
        user_id: &MatrixId,
        is_typing: bool,
        timeout_ms: u32,
    ) -> Result<(), Error> {
        let key = scoped(room_id, user_id.as_str());
        if is_typing {
            let until = chrono::Utc::now().timestamp_millis() + timeout_ms as i64;
            self.typing.insert(key, &until.to_be_bytes()).map_err(db_err)?;
        } else {
            self.typing.remove(key).map_err(db_err)?;
        }
        Ok(())
    }

    async fn get_typing(&self, room_id: &str) -> Result<HashSet<MatrixId>, Error> {
        use std::convert::TryFrom;
        let now = chrono::Utc::now().timestamp_millis();
        let mut out = HashSet::new();
        for entry in self.typing.scan_prefix(scoped(room_id, "")) {
            let (key, value) = entry.map_err(db_err)?;
            let until = value
                .as_ref()
                .try_into()
                .map(i64::from_be_bytes)
                .unwrap_or(0);
            if until <= now {
                continue;
            }
            let user = &key[room_id.len() + 1..];
            let user = std::str::from_utf8(user).map_err(ser_err)?;
            if let Ok(user) = MatrixId::try_from(user) {
                out.insert(user);
            }
        }
        Ok(out)
    }

    async fn set_ephemeral(
        &self,
        room_id: &str,
        event_type: &str,
        content: Option<JsonValue>,
    ) -> Result<(), Error> {
        let key = scoped(room_id, event_type);
        match content {
            Some(content) => {
                self.ephemeral
                    .insert(key, serde_json::to_vec(&content).map_err(ser_err)?)
                    .map_err(db_err)?;
            },
            None => {
                self.ephemeral.remove(key).map_err(db_err)?;
            },
        }
        Ok(())
    }

    async fn get_ephemeral(
        &self,
        room_id: &str,
        event_type: &str,
    ) -> Result<Option<JsonValue>, Error> {
        Ok(match self.ephemeral.get(scoped(room_id, event_type)).map_err(db_err)? {
            Some(bytes) => Some(serde_json::from_slice(&bytes).map_err(ser_err)?),
            None => None,
        })
    }

    async fn set_presence(&self, user_id: &MatrixId, content: JsonValue) -> Result<(), Error> {
        self.presence
            .insert(user_id.as_str().as_bytes(), serde_json::to_vec(&content).map_err(ser_err)?)
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_presence(&self, user_id: &MatrixId) -> Result<Option<JsonValue>, Error> {
        Ok(match self.presence.get(user_id.as_str().as_bytes()).map_err(db_err)? {
            Some(bytes) => Some(serde_json::from_slice(&bytes).map_err(ser_err)?),
            None => None,
        })
    }

    async fn set_invite_state(
        &self,
        user_id: &MatrixId,
        room_id: &str,
        events: Vec<StrippedState>,
    ) -> Result<(), Error> {
        self.invites
            .insert(
                scoped(user_id.as_str(), room_id),
                serde_json::to_vec(&events).map_err(ser_err)?,
            )
            .map_err(db_err)?;
        Ok(())
    }

    async fn remove_invite(&self, user_id: &MatrixId, room_id: &str) -> Result<(), Error> {
        self.invites.remove(scoped(user_id.as_str(), room_id)).map_err(db_err)?;
        Ok(())
    }

    async fn get_invited_rooms(
        &self,
        user_id: &MatrixId,
    ) -> Result<HashMap<String, Vec<StrippedState>>, Error> {
        let prefix = scoped(user_id.as_str(), "");
        let mut out = HashMap::new();
        for entry in self.invites.scan_prefix(&prefix) {
            let (key, value) = entry.map_err(db_err)?;
            let room_id = String::from_utf8(key[prefix.len()..].to_vec()).map_err(ser_err)?;
            out.insert(room_id, serde_json::from_slice(&value).map_err(ser_err)?);
        }
        Ok(out)
    }

    async fn get_profile(&self, localpart: &str) -> Result<Option<UserProfile>, Error> {
        Ok(match self.profiles.get(localpart.as_bytes()).map_err(db_err)? {
            Some(bytes) => Some(bincode::deserialize(&bytes).map_err(ser_err)?),
            None => None,
        })
    }

    async fn set_profile(&self, localpart: &str, profile: UserProfile) -> Result<(), Error> {
        self.profiles
            .insert(localpart.as_bytes(), bincode::serialize(&profile).map_err(ser_err)?)
            .map_err(db_err)?;
        Ok(())
    }

    async fn record_txn(
        &self,
        origin: &str,
        txn_id: &str,
        response: JsonValue,
    ) -> Result<(), Error> {
        self.txns
            .insert(scoped(origin, txn_id), serde_json::to_vec(&response).map_err(ser_err)?)
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_txn(&self, origin: &str, txn_id: &str) -> Result<Option<JsonValue>, Error> {
        Ok(match self.txns.get(scoped(origin, txn_id)).map_err(db_err)? {
            Some(bytes) => Some(serde_json::from_slice(&bytes).map_err(ser_err)?),
            None => None,
        })
    }
}
