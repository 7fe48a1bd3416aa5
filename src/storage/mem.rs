use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use crate::{
    error::{Error, ErrorKind},
    events::{StoredPdu, StrippedState},
    util::MatrixId,
};

use super::{StateMap, Storage, StorageManager, UserProfile};

#[derive(Default)]
struct MemStorage {
    rooms: HashMap<String, Room>,
    presence: HashMap<MatrixId, JsonValue>,
    profiles: HashMap<String, UserProfile>,
    invites: HashMap<MatrixId, HashMap<String, Vec<StrippedState>>>,
    txns: HashMap<(String, String), JsonValue>,
}

#[derive(Default)]
struct Room {
    /// Insertion order; the index doubles as the stable iteration order.
    pdus: Vec<StoredPdu>,
    by_id: HashMap<String, usize>,
    extremities: HashSet<String>,
    state_groups: Vec<StateMap>,
    /// content -> group id, so an unchanged snapshot reuses its group
    state_group_index: HashMap<Vec<((String, String), String)>, u64>,
    event_state_groups: HashMap<String, u64>,
    current_group: Option<u64>,
    ephemeral: HashMap<String, JsonValue>,
    typing: HashMap<MatrixId, Instant>,
}

pub struct MemStorageManager {
    storage: Arc<RwLock<MemStorage>>,
}

pub struct MemStorageHandle {
    inner: Arc<RwLock<MemStorage>>,
}

impl MemStorageManager {
    pub fn new() -> Self {
        MemStorageManager { storage: Arc::new(RwLock::new(MemStorage::default())) }
    }
}

impl Default for MemStorageManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageManager for MemStorageManager {
    async fn get_handle(&self) -> Result<Box<dyn Storage>, Error> {
        Ok(Box::new(MemStorageHandle { inner: Arc::clone(&self.storage) }))
    }
}

#[async_trait]
impl Storage for MemStorageHandle {
    async fn add_pdus(&self, pdus: &[StoredPdu]) -> Result<(), Error> {
        let mut db = self.inner.write().await;
        for pdu in pdus {
            let room = db.rooms.entry(pdu.room_id().to_owned()).or_default();
            if room.by_id.contains_key(pdu.event_id()) {
                continue;
            }
            room.by_id.insert(pdu.event_id().to_owned(), room.pdus.len());
            if !pdu.outlier() && !pdu.soft_failed() {
                for parent in pdu.prev_events() {
                    room.extremities.remove(parent);
                }
                room.extremities.insert(pdu.event_id().to_owned());
            }
            tracing::trace!(event_id = pdu.event_id(), "adding event to storage");
            room.pdus.push(pdu.clone());
        }
        Ok(())
    }

    async fn get_pdu(&self, room_id: &str, event_id: &str) -> Result<Option<StoredPdu>, Error> {
        let db = self.inner.read().await;
        Ok(db
            .rooms
            .get(room_id)
            .and_then(|room| room.by_id.get(event_id).map(|&i| room.pdus[i].clone())))
    }

    async fn get_room_pdus(&self, room_id: &str) -> Result<Vec<StoredPdu>, Error> {
        let db = self.inner.read().await;
        Ok(db.rooms.get(room_id).map(|room| room.pdus.clone()).unwrap_or_default())
    }

    async fn mark_not_outlier(&self, room_id: &str, event_id: &str) -> Result<(), Error> {
        let mut db = self.inner.write().await;
        let room = db.rooms.get_mut(room_id).ok_or(ErrorKind::RoomNotFound(room_id.into()))?;
        if let Some(&i) = room.by_id.get(event_id) {
            room.pdus[i].clear_outlier();
        }
        Ok(())
    }

    async fn redact_pdu(&self, room_id: &str, event_id: &str) -> Result<(), Error> {
        let mut db = self.inner.write().await;
        let room = db.rooms.get_mut(room_id).ok_or(ErrorKind::RoomNotFound(room_id.into()))?;
        if let Some(&i) = room.by_id.get(event_id) {
            room.pdus[i].apply_redaction();
        }
        Ok(())
    }

    async fn get_rooms(&self) -> Result<Vec<String>, Error> {
        let db = self.inner.read().await;
        Ok(db.rooms.keys().cloned().collect())
    }

    async fn forward_extremities(&self, room_id: &str) -> Result<HashSet<String>, Error> {
        let db = self.inner.read().await;
        Ok(db.rooms.get(room_id).map(|room| room.extremities.clone()).unwrap_or_default())
    }

    async fn create_state_group(&self, room_id: &str, state: StateMap) -> Result<u64, Error> {
        let mut db = self.inner.write().await;
        let room = db.rooms.entry(room_id.to_owned()).or_default();
        let mut index_key: Vec<_> = state.clone().into_iter().collect();
        index_key.sort();
        if let Some(&group) = room.state_group_index.get(&index_key) {
            return Ok(group);
        }
        room.state_groups.push(state);
        let group = (room.state_groups.len() - 1) as u64;
        room.state_group_index.insert(index_key, group);
        Ok(group)
    }

    async fn get_state_group(&self, room_id: &str, group: u64) -> Result<Option<StateMap>, Error> {
        let db = self.inner.read().await;
        Ok(db
            .rooms
            .get(room_id)
            .and_then(|room| room.state_groups.get(group as usize).cloned()))
    }

    async fn set_event_state_group(
        &self,
        room_id: &str,
        event_id: &str,
        group: u64,
    ) -> Result<(), Error> {
        let mut db = self.inner.write().await;
        let room = db.rooms.get_mut(room_id).ok_or(ErrorKind::RoomNotFound(room_id.into()))?;
        room.event_state_groups.insert(event_id.to_owned(), group);
        Ok(())
    }

    async fn event_state_group(
        &self,
        room_id: &str,
        event_id: &str,
    ) -> Result<Option<u64>, Error> {
        let db = self.inner.read().await;
        Ok(db
            .rooms
            .get(room_id)
            .and_then(|room| room.event_state_groups.get(event_id).copied()))
    }

    async fn set_current_state_group(&self, room_id: &str, group: u64) -> Result<(), Error> {
        let mut db = self.inner.write().await;
        let room = db.rooms.get_mut(room_id).ok_or(ErrorKind::RoomNotFound(room_id.into()))?;
        room.current_group = Some(group);
        Ok(())
    }

    async fn current_state_group(&self, room_id: &str) -> Result<Option<u64>, Error> {
        let db = self.inner.read().await;
        Ok(db.rooms.get(room_id).and_then(|room| room.current_group))
    }

    async fn set_typing(
        &self,
        room_id: &str,
        user_id: &MatrixId,
        is_typing: bool,
        timeout_ms: u32,
    ) -> Result<(), Error> {
        let mut db = self.inner.write().await;
        let room = db.rooms.get_mut(room_id).ok_or(ErrorKind::RoomNotFound(room_id.into()))?;
        if is_typing {
            room.typing
                .insert(user_id.clone(), Instant::now() + Duration::from_millis(timeout_ms as u64));
        } else {
            room.typing.remove(user_id);
        }
        Ok(())
    }

    async fn get_typing(&self, room_id: &str) -> Result<HashSet<MatrixId>, Error> {
        let db = self.inner.read().await;
        let now = Instant::now();
        Ok(db
            .rooms
            .get(room_id)
            .map(|room| {
                room.typing
                    .iter()
                    .filter(|(_, timeout)| **timeout > now)
                    .map(|(user, _)| user.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_ephemeral(
        &self,
        room_id: &str,
        event_type: &str,
        content: Option<JsonValue>,
    ) -> Result<(), Error> {
        let mut db = self.inner.write().await;
        let room = db.rooms.get_mut(room_id).ok_or(ErrorKind::RoomNotFound(room_id.into()))?;
        match content {
            Some(c) => room.ephemeral.insert(event_type.to_owned(), c),
            None => room.ephemeral.remove(event_type),
        };
        Ok(())
    }

    async fn get_ephemeral(
        &self,
        room_id: &str,
        event_type: &str,
    ) -> Result<Option<JsonValue>, Error> {
        let db = self.inner.read().await;
        Ok(db.rooms.get(room_id).and_then(|room| room.ephemeral.get(event_type).cloned()))
    }

    async fn set_presence(&self, user_id: &MatrixId, content: JsonValue) -> Result<(), Error> {
        let mut db = self.inner.write().await;
        db.presence.insert(user_id.clone(), content);
        Ok(())
    }

    async fn get_presence(&self, user_id: &MatrixId) -> Result<Option<JsonValue>, Error> {
        let db = self.inner.read().await;
        Ok(db.presence.get(user_id).cloned())
    }

    async fn set_invite_state(
        &self,
        user_id: &MatrixId,
        room_id: &str,
        events: Vec<StrippedState>,
    ) -> Result<(), Error> {
        let mut db = self.inner.write().await;
        db.invites
            .entry(user_id.clone())
            .or_default()
            .insert(room_id.to_owned(), events);
        Ok(())
    }

    async fn remove_invite(&self, user_id: &MatrixId, room_id: &str) -> Result<(), Error> {
        let mut db = self.inner.write().await;
        if let Some(rooms) = db.invites.get_mut(user_id) {
            rooms.remove(room_id);
        }
        Ok(())
    }

    async fn get_invited_rooms(
        &self,
        user_id: &MatrixId,
    ) -> Result<HashMap<String, Vec<StrippedState>>, Error> {
        let db = self.inner.read().await;
        Ok(db.invites.get(user_id).cloned().unwrap_or_default())
    }

    async fn get_profile(&self, localpart: &str) -> Result<Option<UserProfile>, Error> {
        let db = self.inner.read().await;
        Ok(db.profiles.get(localpart).cloned())
    }

    async fn set_profile(&self, localpart: &str, profile: UserProfile) -> Result<(), Error> {
        let mut db = self.inner.write().await;
        db.profiles.insert(localpart.to_owned(), profile);
        Ok(())
    }

    async fn record_txn(
        &self,
        origin: &str,
        txn_id: &str,
        response: JsonValue,
    ) -> Result<(), Error> {
        let mut db = self.inner.write().await;
        db.txns.insert((origin.to_owned(), txn_id.to_owned()), response);
        Ok(())
    }

    async fn get_txn(&self, origin: &str, txn_id: &str) -> Result<Option<JsonValue>, Error> {
        let db = self.inner.read().await;
        Ok(db.txns.get(&(origin.to_owned(), txn_id.to_owned())).cloned())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::events::{room_version::UnhashedPdu, StoredPdu, VersionedPdu};
    use crate::storage::Storage;
    use std::convert::TryFrom;

    fn pdu(depth: i64, prev: Vec<String>) -> StoredPdu {
        let unhashed = UnhashedPdu {
            room_id: "!r:example.org".to_owned(),
            sender: MatrixId::try_from("@alice:example.org").unwrap(),
            origin_server_ts: depth,
            ty: "m.room.test".to_owned(),
            state_key: None,
            content: json!({"depth": depth}),
            prev_events: prev,
            depth,
            auth_events: vec![],
            unsigned: None,
        };
        StoredPdu::accepted(VersionedPdu::V11(unhashed.finalize().unwrap())).unwrap()
    }

    #[tokio::test]
    async fn duplicate_adds_are_a_no_op() {
        let db = MemStorageManager::new().get_handle().await.unwrap();
        let a = pdu(0, vec![]);
        db.add_pdus(&[a.clone(), a.clone()]).await.unwrap();
        db.add_pdus(&[a.clone()]).await.unwrap();
        assert_eq!(db.get_room_pdus("!r:example.org").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn extremities_follow_the_dag_tip() {
        let db = MemStorageManager::new().get_handle().await.unwrap();
        let a = pdu(0, vec![]);
        let b = pdu(1, vec![a.event_id().to_owned()]);
        db.add_pdus(&[a.clone(), b.clone()]).await.unwrap();
        let extremities = db.forward_extremities("!r:example.org").await.unwrap();
        assert!(extremities.contains(b.event_id()));
        assert!(!extremities.contains(a.event_id()));

        // a fork widens the tip
        let c = pdu(1, vec![a.event_id().to_owned()]);
        db.add_pdus(&[c.clone()]).await.unwrap();
        let extremities = db.forward_extremities("!r:example.org").await.unwrap();
        assert_eq!(extremities.len(), 2);
    }

    #[tokio::test]
    async fn soft_failed_events_are_stored_but_not_extremities() {
        let db = MemStorageManager::new().get_handle().await.unwrap();
        let a = pdu(0, vec![]);
        db.add_pdus(&[a.clone()]).await.unwrap();
        let soft = StoredPdu::new(
            pdu(1, vec![a.event_id().to_owned()]).into_inner(),
            true,
            false,
        )
        .unwrap();
        db.add_pdus(&[soft.clone()]).await.unwrap();
        assert!(db.get_pdu("!r:example.org", soft.event_id()).await.unwrap().is_some());
        let extremities = db.forward_extremities("!r:example.org").await.unwrap();
        assert!(extremities.contains(a.event_id()));
        assert!(!extremities.contains(soft.event_id()));
    }

    #[tokio::test]
    async fn state_groups_are_stable_handles() {
        let db = MemStorageManager::new().get_handle().await.unwrap();
        let mut state = StateMap::new();
        state.insert(("m.room.create".into(), "".into()), "$c".into());
        let g0 = db.create_state_group("!r:example.org", state.clone()).await.unwrap();
        state.insert(("m.room.name".into(), "".into()), "$n".into());
        let g1 = db.create_state_group("!r:example.org", state.clone()).await.unwrap();
        assert_ne!(g0, g1);
        assert_eq!(db.get_state_group("!r:example.org", g0).await.unwrap().unwrap().len(), 1);
        assert_eq!(db.get_state_group("!r:example.org", g1).await.unwrap().unwrap().len(), 2);
    }
}
