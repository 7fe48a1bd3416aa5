use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

use crate::{
    error::{Error, ErrorKind},
    events::{
        room_version::{UnhashedPdu, SUPPORTED_ROOM_VERSIONS},
        StoredPdu, VersionedPdu,
    },
    storage::StateMap,
    util::MatrixId,
};

use super::ingest::{parse_pdu, Ingester};

/// Joins a local user to a room via resident servers, in candidate priority
/// order. On success the join event is a forward extremity and the room's
/// state is the resident state plus the join.
pub async fn join_remote_room(
    ingester: &Ingester,
    room_id: &str,
    user_id: &MatrixId,
    candidate_servers: &[String],
) -> Result<String, Error> {
    if ingester.client().is_none() {
        return Err(ErrorKind::Unknown("no federation client configured".to_owned()).into());
    }

    let mut last_error: Error = ErrorKind::Unreachable(room_id.to_owned()).into();
    for candidate in candidate_servers {
        match join_via(ingester, candidate, room_id, user_id).await {
            Ok(event_id) => {
                info!(%room_id, %candidate, "joined room");
                ingester.db().remove_invite(user_id, room_id).await?;
                return Ok(event_id);
            },
            Err(e) => {
                warn!(%candidate, error = %e, "join attempt failed, trying next candidate");
                last_error = e;
            },
        }
    }
    Err(last_error)
}

async fn join_via(
    ingester: &Ingester,
    resident: &str,
    room_id: &str,
    user_id: &MatrixId,
) -> Result<String, Error> {
    let client = ingester.client().unwrap();
    let keyring = ingester.keyring();

    // 1: ask the resident for a draft join event
    let draft_response = client
        .make_join(resident, room_id, user_id, SUPPORTED_ROOM_VERSIONS)
        .await?;
    let room_version = draft_response
        .get("room_version")
        .and_then(JsonValue::as_str)
        .unwrap_or("11");
    if room_version != "11" {
        return Err(ErrorKind::UnsupportedRoomVersion.into());
    }
    let draft = draft_response
        .get("event")
        .ok_or_else(|| ErrorKind::RemoteError("make_join without event".to_owned()))?;

    // 2: finish the draft locally: membership, timestamp, hash, signature
    let mut content = draft.get("content").cloned().unwrap_or_else(|| json!({}));
    content
        .as_object_mut()
        .ok_or_else(|| ErrorKind::RemoteError("draft content is not an object".to_owned()))?
        .insert("membership".to_owned(), JsonValue::String("join".to_owned()));

    let mut pdu = VersionedPdu::V11(
        UnhashedPdu {
            room_id: room_id.to_owned(),
            sender: user_id.clone(),
            origin_server_ts: chrono::Utc::now().timestamp_millis(),
            ty: "m.room.member".to_owned(),
            state_key: Some(user_id.clone_inner()),
            content,
            prev_events: string_array(draft.get("prev_events")),
            depth: draft.get("depth").and_then(JsonValue::as_i64).unwrap_or(0),
            auth_events: string_array(draft.get("auth_events")),
            unsigned: None,
        }
        .finalize()
        .map_err(ErrorKind::from)?,
    );
    pdu.sign(keyring.server_name(), keyring.local_key())?;
    let event_id = pdu.event_id()?;

    // 3: submit and receive the room's state and auth chain
    let response = client
        .send_join(resident, room_id, &event_id, &serde_json::to_value(&pdu).unwrap())
        .await?;

    absorb_join_response(ingester, room_id, user_id, pdu, &response).await
}

/// Steps 4-6 of the join: verify and store the returned state and auth chain
/// as outliers, then commit the join event as the room's new extremity with
/// the resident state in force.
async fn absorb_join_response(
    ingester: &Ingester,
    room_id: &str,
    user_id: &MatrixId,
    mut pdu: VersionedPdu,
    response: &JsonValue,
) -> Result<String, Error> {
    let db = ingester.db();
    let event_id = pdu.event_id()?;

    // ordering by depth makes auth ancestors land before their dependents
    let mut returned: Vec<VersionedPdu> = Vec::new();
    for key in ["auth_chain", "state"] {
        for event_json in response
            .get(key)
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default()
        {
            match parse_pdu(event_json) {
                Ok(event) if event.room_id() == room_id => returned.push(event),
                Ok(_) => {
                    return Err(ErrorKind::RemoteError(
                        "join response smuggled another room's event".to_owned(),
                    )
                    .into())
                },
                Err(e) => warn!(error = %e, "skipping malformed event in join response"),
            }
        }
    }
    returned.sort_by_key(VersionedPdu::depth);
    let mut state_ids: StateMap = StateMap::new();
    for event in returned {
        let is_state = event.state_key().is_some();
        let slot = is_state.then(|| {
            (event.ty().to_owned(), event.state_key().unwrap_or_default().to_owned())
        });
        match ingester.ingest_outlier(event).await {
            Ok(id) => {
                if let Some(slot) = slot {
                    state_ids.insert(slot, id);
                }
            },
            Err(e) => warn!(error = %e, "rejecting event from join response"),
        }
    }
    if !state_ids.contains_key(&("m.room.create".to_owned(), String::new())) {
        return Err(ErrorKind::RemoteError("join response without a create event".to_owned()).into());
    }

    // prefer the resident's countersigned copy of the join (restricted joins
    // carry their authorising signature there)
    if let Some(event_json) = response.get("event").cloned() {
        let countersigned = parse_pdu(event_json)?;
        if countersigned.event_id()? == event_id {
            pdu = countersigned;
        }
    }

    // the join itself is no outlier; it becomes the forward extremity and
    // the returned state plus the join becomes current state
    let stored = StoredPdu::accepted(pdu)?;
    db.add_pdus(std::slice::from_ref(&stored)).await?;

    // the join's parents carry the resident state; recording it makes them
    // resolvable anchors for whatever other servers build on them
    let before_group = db.create_state_group(room_id, state_ids.clone()).await?;
    for prev in stored.prev_events() {
        if db.has_pdu(room_id, prev).await? {
            db.set_event_state_group(room_id, prev, before_group).await?;
            db.mark_not_outlier(room_id, prev).await?;
        }
    }

    state_ids.insert(
        ("m.room.member".to_owned(), user_id.clone_inner()),
        stored.event_id().to_owned(),
    );
    let group = db.create_state_group(room_id, state_ids).await?;
    db.set_event_state_group(room_id, stored.event_id(), group).await?;
    db.set_current_state_group(room_id, group).await?;

    ingester.notifier().publish(&stored.clone().to_client_format());
    Ok(event_id)
}

fn string_array(value: Option<&JsonValue>) -> Vec<String> {
    value
        .and_then(JsonValue::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(JsonValue::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::{convert::TryFrom, sync::Arc};

    use serde_json::json;

    use super::*;
    use crate::{
        events::room_version::UnhashedPdu,
        keyring::Keyring,
        sign::SigningKey,
        state::StateResolver,
        storage::{mem::MemStorageManager, StorageManager},
        sync::Notifier,
        util::locks::RoomLocks,
    };

    const ROOM: &str = "!shared:remote.test";

    fn signed(
        key: &SigningKey,
        server: &str,
        sender: &str,
        ty: &str,
        state_key: Option<&str>,
        content: serde_json::Value,
        prev_events: Vec<String>,
        depth: i64,
        auth_events: Vec<String>,
    ) -> VersionedPdu {
        let mut pdu = VersionedPdu::V11(
            UnhashedPdu {
                room_id: ROOM.to_owned(),
                sender: MatrixId::try_from(sender).unwrap(),
                origin_server_ts: depth,
                ty: ty.to_owned(),
                state_key: state_key.map(String::from),
                content,
                prev_events,
                depth,
                auth_events,
                unsigned: None,
            }
            .finalize()
            .unwrap(),
        );
        pdu.sign(server, key).unwrap();
        pdu
    }

    /// A send_join response from a resident server is verified, absorbed as
    /// outliers, and leaves the room joined with the resident state plus the
    /// join as current state.
    #[tokio::test]
    async fn absorbing_a_join_response_makes_the_room_live() {
        let manager = MemStorageManager::new();
        let resolver = Arc::new(StateResolver::new(manager.get_handle().await.unwrap()));
        let local_key = SigningKey::from_seed(&[11u8; 32], "l");
        let keyring = Arc::new(Keyring::new("hq.test".to_owned(), Arc::new(local_key)));
        let remote = SigningKey::from_seed(&[7u8; 32], "r");
        keyring
            .cache_key(
                "remote.test",
                "ed25519:r",
                crate::sign::decode_b64(&remote.public_key_b64()).unwrap(),
                chrono::Utc::now().timestamp_millis() + 3_600_000,
            )
            .await;
        let ingester = Ingester::new(
            manager.get_handle().await.unwrap(),
            Arc::clone(&resolver),
            keyring,
            None,
            Arc::new(RoomLocks::new()),
            Arc::new(Notifier::new()),
        );
        let db = ingester.db();

        // the resident room: create, alice's join, a public join rule
        let create = signed(
            &remote,
            "remote.test",
            "@alice:remote.test",
            "m.room.create",
            Some(""),
            json!({"room_version": "11"}),
            vec![],
            0,
            vec![],
        );
        let create_id = create.event_id().unwrap();
        let alice_join = signed(
            &remote,
            "remote.test",
            "@alice:remote.test",
            "m.room.member",
            Some("@alice:remote.test"),
            json!({"membership": "join"}),
            vec![create_id.clone()],
            1,
            vec![create_id.clone()],
        );
        let alice_join_id = alice_join.event_id().unwrap();
        let rules = signed(
            &remote,
            "remote.test",
            "@alice:remote.test",
            "m.room.join_rules",
            Some(""),
            json!({"join_rule": "public"}),
            vec![alice_join_id.clone()],
            2,
            vec![create_id.clone(), alice_join_id.clone()],
        );
        let rules_id = rules.event_id().unwrap();

        // our own join, as make_join would have drafted it
        let me = MatrixId::try_from("@carol:hq.test").unwrap();
        let mut join = VersionedPdu::V11(
            UnhashedPdu {
                room_id: ROOM.to_owned(),
                sender: me.clone(),
                origin_server_ts: 3,
                ty: "m.room.member".to_owned(),
                state_key: Some(me.clone_inner()),
                content: json!({"membership": "join"}),
                prev_events: vec![rules_id.clone()],
                depth: 3,
                auth_events: vec![create_id.clone(), rules_id.clone()],
                unsigned: None,
            }
            .finalize()
            .unwrap(),
        );
        join.sign("hq.test", ingester.keyring().local_key()).unwrap();

        let response = json!({
            "origin": "remote.test",
            "auth_chain": [
                serde_json::to_value(&create).unwrap(),
                serde_json::to_value(&alice_join).unwrap(),
            ],
            "state": [
                serde_json::to_value(&create).unwrap(),
                serde_json::to_value(&alice_join).unwrap(),
                serde_json::to_value(&rules).unwrap(),
            ],
        });

        let event_id = absorb_join_response(&ingester, ROOM, &me, join, &response)
            .await
            .unwrap();

        // the join is the sole extremity, everything else is referenceable
        let extremities = db.forward_extremities(ROOM).await.unwrap();
        assert_eq!(extremities.len(), 1);
        assert!(extremities.contains(&event_id));
        assert!(db.get_pdu(ROOM, &create_id).await.unwrap().unwrap().outlier());

        // current state covers the resident slots plus our membership
        let current = db.current_state(ROOM).await.unwrap();
        assert_eq!(
            current.get(&("m.room.member".to_owned(), me.clone_inner())).unwrap(),
            &event_id,
        );
        assert_eq!(
            current.get(&("m.room.join_rules".to_owned(), String::new())).unwrap(),
            &rules_id,
        );

        // the room resolves through the recorded groups
        let state = resolver.resolve(ROOM, &[event_id]).await.unwrap();
        assert_eq!(state.get(("m.room.create", "")).unwrap(), create_id);
    }

    /// A response that fails to include the create event is refused outright.
    #[tokio::test]
    async fn join_response_without_create_is_refused() {
        let manager = MemStorageManager::new();
        let resolver = Arc::new(StateResolver::new(manager.get_handle().await.unwrap()));
        let local_key = SigningKey::from_seed(&[11u8; 32], "l");
        let keyring = Arc::new(Keyring::new("hq.test".to_owned(), Arc::new(local_key)));
        let ingester = Ingester::new(
            manager.get_handle().await.unwrap(),
            resolver,
            keyring,
            None,
            Arc::new(RoomLocks::new()),
            Arc::new(Notifier::new()),
        );

        let me = MatrixId::try_from("@carol:hq.test").unwrap();
        let mut join = VersionedPdu::V11(
            UnhashedPdu {
                room_id: ROOM.to_owned(),
                sender: me.clone(),
                origin_server_ts: 3,
                ty: "m.room.member".to_owned(),
                state_key: Some(me.clone_inner()),
                content: json!({"membership": "join"}),
                prev_events: vec!["$tip".to_owned()],
                depth: 3,
                auth_events: vec!["$create".to_owned()],
                unsigned: None,
            }
            .finalize()
            .unwrap(),
        );
        join.sign("hq.test", ingester.keyring().local_key()).unwrap();

        let response = json!({"auth_chain": [], "state": []});
        let err = absorb_join_response(&ingester, ROOM, &me, join, &response)
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::RemoteError(_)));
    }
}
