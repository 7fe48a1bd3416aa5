use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::{
    error::Error,
    events::{
        room_version::{UnhashedPdu, VersionedPdu},
        StoredPdu,
    },
    sign::SigningKey,
    state::{self, State, StateResolver},
    storage::Storage,
    util::MatrixId,
    validate::auth::{auth_check, auth_types},
};

/// A locally authored event before it becomes a PDU: the DAG bookkeeping
/// (prev_events, depth, auth_events, hash, signature) is filled in by
/// `build_pdu`.
#[derive(Clone, Debug)]
pub struct NewEvent {
    pub ty: String,
    pub content: JsonValue,
    pub sender: MatrixId,
    pub state_key: Option<String>,
    pub unsigned: Option<JsonValue>,
}

/// The auth_events a new event must cite: whatever currently occupies the
/// state slots its authorization depends on. Sorted for a deterministic
/// wire form.
pub fn calc_auth_events(event: &NewEvent, state: &State) -> Vec<String> {
    let mut ret: Vec<String> =
        auth_types(&event.ty, event.state_key.as_deref(), &event.content, &event.sender)
            .into_iter()
            .filter_map(|(ty, key)| state.get((ty.as_str(), key.as_str())).map(str::to_owned))
            .collect();
    ret.sort();
    ret.dedup();
    ret
}

/// Hangs a new event off the room's current forward extremities: resolves
/// the extremity state, computes auth_events and depth, hashes and signs.
/// Returns the finished PDU and the state it was built against; nothing is
/// persisted.
pub async fn build_pdu(
    db: &dyn Storage,
    resolver: &StateResolver,
    room_id: &str,
    event: NewEvent,
    server_name: &str,
    key: &SigningKey,
) -> Result<(VersionedPdu, State), Error> {
    let mut prev_events: Vec<String> =
        db.forward_extremities(room_id).await?.into_iter().collect();
    prev_events.sort();

    let state = resolver.resolve(room_id, &prev_events).await?;

    let mut depth: i64 = 0;
    for prev in prev_events.iter() {
        if let Some(parent) = db.get_pdu(room_id, prev).await? {
            depth = depth.max(parent.depth());
        }
    }

    let auth_events = calc_auth_events(&event, &state);
    let mut pdu = VersionedPdu::V11(
        UnhashedPdu {
            room_id: room_id.to_owned(),
            sender: event.sender,
            origin_server_ts: chrono::Utc::now().timestamp_millis(),
            ty: event.ty,
            state_key: event.state_key,
            content: event.content,
            prev_events,
            depth: depth.saturating_add(1),
            auth_events,
            unsigned: event.unsigned,
        }
        .finalize()
        .map_err(crate::error::ErrorKind::from)?,
    );
    pdu.sign(server_name, key)?;
    Ok((pdu, state))
}

#[async_trait]
pub trait StorageExt {
    /// Appends a locally authored event to the head of the room, checking
    /// authorization against the state it is built on, and commits it.
    /// Callers hold the room's write lock.
    async fn append_event(
        &self,
        room_id: &str,
        event: NewEvent,
        resolver: &StateResolver,
        server_name: &str,
        key: &SigningKey,
    ) -> Result<StoredPdu, Error>;
}

#[async_trait]
impl StorageExt for dyn Storage {
    async fn append_event(
        &self,
        room_id: &str,
        event: NewEvent,
        resolver: &StateResolver,
        server_name: &str,
        key: &SigningKey,
    ) -> Result<StoredPdu, Error> {
        let (pdu, state) = build_pdu(self, resolver, room_id, event, server_name, key).await?;
        auth_check(self, &pdu, &state).await?.or_reject()?;

        let stored = StoredPdu::accepted(pdu)?;
        state::commit_pdu(self, resolver, &stored).await?;
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        events::room_version::UnhashedPdu,
        state::StateResolver,
        storage::{mem::MemStorageManager, StorageManager},
    };

    #[tokio::test]
    async fn append_event_extends_the_dag_and_state() {
        let manager = MemStorageManager::new();
        let db = manager.get_handle().await.unwrap();
        let resolver = StateResolver::new(manager.get_handle().await.unwrap());
        let key = SigningKey::from_seed(&[5u8; 32], "1");
        let alice = MatrixId::new("alice", "hq.test").unwrap();
        let room_id = "!new:hq.test";

        // bootstrap the room outside the append path
        let create = VersionedPdu::V11(
            UnhashedPdu {
                room_id: room_id.to_owned(),
                sender: alice.clone(),
                origin_server_ts: 0,
                ty: "m.room.create".to_owned(),
                state_key: Some(String::new()),
                content: json!({"room_version": "11"}),
                prev_events: vec![],
                depth: 0,
                auth_events: vec![],
                unsigned: None,
            }
            .finalize()
            .unwrap(),
        );
        let create = StoredPdu::accepted(create).unwrap();
        state::commit_pdu(&*db, &resolver, &create).await.unwrap();

        let join = db
            .append_event(
                room_id,
                NewEvent {
                    ty: "m.room.member".to_owned(),
                    content: json!({"membership": "join"}),
                    sender: alice.clone(),
                    state_key: Some(alice.clone_inner()),
                    unsigned: None,
                },
                &resolver,
                "hq.test",
                &key,
            )
            .await
            .unwrap();

        assert_eq!(join.prev_events(), &[create.event_id().to_owned()]);
        assert_eq!(join.depth(), 1);
        assert_eq!(join.auth_events(), &[create.event_id().to_owned()]);

        let extremities = db.forward_extremities(room_id).await.unwrap();
        assert_eq!(extremities.len(), 1);
        assert!(extremities.contains(join.event_id()));

        // current state was advanced in the same commit
        let current = db.current_state(room_id).await.unwrap();
        assert_eq!(
            current.get(&("m.room.member".to_owned(), alice.clone_inner())).unwrap(),
            join.event_id(),
        );

        // a sender who is not in the room is refused
        let bob = MatrixId::new("bob", "elsewhere.test").unwrap();
        let err = db
            .append_event(
                room_id,
                NewEvent {
                    ty: "m.room.name".to_owned(),
                    content: json!({"name": "nope"}),
                    sender: bob,
                    state_key: Some(String::new()),
                    unsigned: None,
                },
                &resolver,
                "hq.test",
                &key,
            )
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), crate::error::ErrorKind::AuthFailed(_)));
    }
}
