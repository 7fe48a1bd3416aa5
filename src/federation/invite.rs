use std::convert::TryFrom;

use serde_json::{json, Value as JsonValue};
use tracing::info;

use crate::{
    error::{Error, ErrorKind},
    events::{room::Member, room::Membership, StoredPdu, StrippedState, VersionedPdu},
    state,
    storage::Storage,
    util::{storage::build_pdu, storage::NewEvent, MatrixId},
    validate::auth::auth_check,
};

use super::ingest::{parse_pdu, Ingester};

/// The state slots stripped into an invite so the invited client can render
/// the room before joining.
const STRIPPED_TYPES: &[&str] = &[
    "m.room.create",
    "m.room.join_rules",
    "m.room.canonical_alias",
    "m.room.avatar",
    "m.room.name",
    "m.room.encryption",
    "m.room.topic",
];

pub fn strip_pdu(pdu: &StoredPdu) -> StrippedState {
    StrippedState {
        content: pdu.content().clone(),
        state_key: pdu.state_key().unwrap_or_default().to_owned(),
        ty: pdu.ty().to_owned(),
        sender: pdu.sender().clone(),
    }
}

/// The stripped view of the room's current state, signatures and DAG
/// bookkeeping removed.
pub async fn stripped_room_state(
    db: &dyn Storage,
    room_id: &str,
) -> Result<Vec<StrippedState>, Error> {
    let mut events = Vec::new();
    for ty in STRIPPED_TYPES {
        if let Some(pdu) = db.get_state_event(room_id, ty, "").await? {
            events.push(strip_pdu(&pdu));
        }
    }
    Ok(events)
}

/// Invites a remote user to a room we are resident in: author the membership
/// event, have the invitee's server countersign it, then commit the
/// countersigned event and advance state.
pub async fn invite_remote_user(
    ingester: &Ingester,
    client: &super::FederationClient,
    room_id: &str,
    inviter: &MatrixId,
    invitee: &MatrixId,
) -> Result<String, Error> {
    let db = ingester.db();
    let resolver = ingester.resolver();
    let keyring = ingester.keyring();

    // build and sign the invite without committing it; the remote signature
    // has to be on the event before it enters the DAG
    let new_event = NewEvent {
        ty: "m.room.member".to_owned(),
        content: serde_json::to_value(Member::new(Membership::Invite)).unwrap(),
        sender: inviter.clone(),
        state_key: Some(invitee.clone_inner()),
        unsigned: None,
    };
    let (pdu, current) = build_pdu(
        db,
        resolver,
        room_id,
        new_event,
        keyring.server_name(),
        keyring.local_key(),
    )
    .await?;
    auth_check(db, &pdu, &current).await?.or_reject()?;

    let event_id = pdu.event_id()?;
    let body = json!({
        "event": serde_json::to_value(&pdu).unwrap(),
        "invite_room_state": stripped_room_state(db, room_id).await?,
        "room_version": "11",
    });
    let response = client
        .send_invite(invitee.domain(), room_id, &event_id, &body)
        .await?;

    // the response carries the event back with the invitee server's
    // signature added; both signatures are retained
    let countersigned = response
        .get("event")
        .cloned()
        .ok_or_else(|| ErrorKind::RemoteError("invite response without event".to_owned()))?;
    let countersigned = parse_pdu(countersigned)?;
    if countersigned.event_id()? != event_id {
        return Err(
            ErrorKind::RemoteError("invitee returned a different event".to_owned()).into()
        );
    }
    keyring
        .verify_pdu_signature_by(Some(client), &countersigned, invitee.domain())
        .await?;

    let stored = StoredPdu::accepted(countersigned)?;
    state::commit_pdu(db, resolver, &stored).await?;
    ingester.notifier().publish(&stored.clone().to_client_format());
    info!(%invitee, %room_id, "invite federated and committed");
    Ok(event_id)
}

/// The receiving half of the invite handshake: verify the inviter's
/// signature, countersign, remember the stripped state for the invited
/// user's next sync, and hand the event back.
pub async fn handle_inbound_invite(
    ingester: &Ingester,
    origin: &str,
    room_id: &str,
    event_id: &str,
    body: &JsonValue,
) -> Result<JsonValue, Error> {
    let room_version = body.get("room_version").and_then(JsonValue::as_str).unwrap_or("11");
    if room_version != "11" {
        return Err(ErrorKind::UnsupportedRoomVersion.into());
    }
    let event_json = body
        .get("event")
        .cloned()
        .ok_or_else(|| ErrorKind::BadJson("invite without event".to_owned()))?;
    let mut pdu = parse_pdu(event_json)?;

    if pdu.room_id() != room_id {
        return Err(ErrorKind::InvalidEvent("invite for a different room".to_owned()).into());
    }
    if pdu.event_id()? != event_id {
        return Err(ErrorKind::InvalidEvent("invite under a different event id".to_owned()).into());
    }
    if pdu.sender().domain() != origin {
        return Err(ErrorKind::Forbidden.into());
    }
    if pdu.content_hash()? != pdu.declared_hash() {
        return Err(ErrorKind::HashMismatch.into());
    }

    let keyring = ingester.keyring();
    keyring.verify_pdu(ingester.client(), &pdu).await?;

    let invitee = match pdu.state_key() {
        Some(key) => MatrixId::try_from(key)?,
        None => return Err(ErrorKind::InvalidEvent("invite without target".to_owned()).into()),
    };
    if invitee.domain() != keyring.server_name() {
        return Err(ErrorKind::InvalidEvent("invited user is not ours".to_owned()).into());
    }

    pdu.sign(keyring.server_name(), keyring.local_key())?;

    // the room is usually unknown to us at this point; the event is kept as
    // an outlier until (if ever) we join
    let stored = StoredPdu::new(pdu.clone(), false, true)?;
    ingester.db().add_pdus(std::slice::from_ref(&stored)).await?;

    let mut invite_state: Vec<StrippedState> = body
        .get("invite_room_state")
        .and_then(JsonValue::as_array)
        .map(|events| {
            events
                .iter()
                .filter_map(|e| serde_json::from_value(e.clone()).ok())
                .collect()
        })
        .unwrap_or_default();
    invite_state.push(strip_pdu(&stored));
    ingester
        .db()
        .set_invite_state(&invitee, room_id, invite_state)
        .await?;

    Ok(json!({ "event": serde_json::to_value(&pdu).unwrap() }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

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

    const ROOM: &str = "!elsewhere:remote.test";

    async fn fixture() -> (MemStorageManager, Ingester, SigningKey) {
        let manager = MemStorageManager::new();
        let resolver = Arc::new(StateResolver::new(manager.get_handle().await.unwrap()));
        let local_key = SigningKey::from_seed(&[3u8; 32], "l");
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
            resolver,
            keyring,
            None,
            Arc::new(RoomLocks::new()),
            Arc::new(Notifier::new()),
        );
        (manager, ingester, remote)
    }

    /// An invite for one of our users to a room we know nothing about: the
    /// event is countersigned, kept as an outlier, and the stripped state
    /// lands in the user's invited-rooms view.
    #[tokio::test]
    async fn inbound_invite_reaches_the_next_sync() {
        let (_manager, ingester, remote) = fixture().await;

        let mut invite = VersionedPdu::V11(
            UnhashedPdu {
                room_id: ROOM.to_owned(),
                sender: MatrixId::try_from("@alice:remote.test").unwrap(),
                origin_server_ts: 10,
                ty: "m.room.member".to_owned(),
                state_key: Some("@bob:hq.test".to_owned()),
                content: json!({"membership": "invite"}),
                prev_events: vec!["$somewhere".to_owned()],
                depth: 7,
                auth_events: vec!["$create".to_owned(), "$power".to_owned()],
                unsigned: None,
            }
            .finalize()
            .unwrap(),
        );
        invite.sign("remote.test", &remote).unwrap();
        let event_id = invite.event_id().unwrap();

        let body = json!({
            "event": serde_json::to_value(&invite).unwrap(),
            "room_version": "11",
            "invite_room_state": [
                {
                    "type": "m.room.create",
                    "state_key": "",
                    "sender": "@alice:remote.test",
                    "content": {"room_version": "11"},
                },
                {
                    "type": "m.room.name",
                    "state_key": "",
                    "sender": "@alice:remote.test",
                    "content": {"name": "watercooler"},
                },
            ],
        });

        let response =
            handle_inbound_invite(&ingester, "remote.test", ROOM, &event_id, &body)
                .await
                .unwrap();

        // both signatures ride on the returned event
        let signatures = response["event"]["signatures"].as_object().unwrap();
        assert!(signatures.contains_key("remote.test"));
        assert!(signatures.contains_key("hq.test"));

        // stored, but only as a reference: not an extremity of anything
        let bob = MatrixId::try_from("@bob:hq.test").unwrap();
        let stored = ingester.db().get_pdu(ROOM, &event_id).await.unwrap().unwrap();
        assert!(stored.outlier());
        assert!(ingester.db().forward_extremities(ROOM).await.unwrap().is_empty());

        // S-style check: the invited-rooms view carries the stripped state
        // with at least the create and the invite itself
        let invited = crate::sync::invited_rooms(ingester.db(), &bob).await.unwrap();
        let room = invited.get(ROOM).expect("room missing from invite view");
        let types: Vec<&str> =
            room.invite_state.events.iter().map(|e| e.ty.as_str()).collect();
        assert!(types.contains(&"m.room.create"));
        assert!(types.contains(&"m.room.member"));
    }

    #[tokio::test]
    async fn inbound_invite_for_foreign_user_is_refused() {
        let (_manager, ingester, remote) = fixture().await;
        let mut invite = VersionedPdu::V11(
            UnhashedPdu {
                room_id: ROOM.to_owned(),
                sender: MatrixId::try_from("@alice:remote.test").unwrap(),
                origin_server_ts: 10,
                ty: "m.room.member".to_owned(),
                state_key: Some("@carol:third.test".to_owned()),
                content: json!({"membership": "invite"}),
                prev_events: vec!["$somewhere".to_owned()],
                depth: 7,
                auth_events: vec!["$create".to_owned()],
                unsigned: None,
            }
            .finalize()
            .unwrap(),
        );
        invite.sign("remote.test", &remote).unwrap();
        let event_id = invite.event_id().unwrap();
        let body = json!({"event": serde_json::to_value(&invite).unwrap(), "room_version": "11"});

        let err = handle_inbound_invite(&ingester, "remote.test", ROOM, &event_id, &body)
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidEvent(_)));
    }

    #[tokio::test]
    async fn stripped_state_covers_the_preview_slots() {
        let (_manager, ingester, _remote) = fixture().await;
        let db = ingester.db();

        let create = VersionedPdu::V11(
            UnhashedPdu {
                room_id: "!local:hq.test".to_owned(),
                sender: MatrixId::try_from("@admin:hq.test").unwrap(),
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
        crate::state::commit_pdu(db, ingester.resolver(), &create).await.unwrap();

        let stripped = stripped_room_state(db, "!local:hq.test").await.unwrap();
        assert_eq!(stripped.len(), 1);
        assert_eq!(stripped[0].ty, "m.room.create");
        assert!(stripped[0].content.get("room_version").is_some());
    }
}
