use std::{convert::TryFrom, sync::Arc};

use actix_web::{
    get, put,
    web::{Data, Json, Path},
    HttpRequest,
};
use serde_json::{json, Value as JsonValue};
use tracing::info;

use crate::{
    error::{Error, ErrorKind},
    events::{
        room::{JoinRule, JoinRules, Member, Membership, PowerLevels},
        room_version::SUPPORTED_ROOM_VERSIONS,
    },
    federation::{ingest::parse_pdu, invite as invite_flow},
    state::State,
    storage::Storage,
    util::{storage::calc_auth_events, storage::NewEvent, MatrixId},
    validate::auth::auth_check,
    ServerState,
};

use super::{authenticate, events::query_params};

/// Hands the requesting server a draft join event for one of its users.
#[get("/_matrix/federation/v1/make_join/{room_id}/{user_id}")]
pub async fn make_join(
    state: Data<Arc<ServerState>>,
    req: HttpRequest,
    path: Path<(String, String)>,
) -> Result<Json<JsonValue>, Error> {
    let (room_id, user_id) = path.into_inner();
    let origin = authenticate(&state, &req, None).await?;
    let user_id = MatrixId::try_from(user_id.as_str())?;

    if user_id.domain() != origin {
        return Err(ErrorKind::Forbidden.into());
    }
    let versions = query_params(&req, "ver");
    if !versions.iter().any(|v| SUPPORTED_ROOM_VERSIONS.contains(&v.as_str())) {
        return Err(ErrorKind::UnsupportedRoomVersion.into());
    }

    let db = state.db().await?;
    if db.get_state_event(&room_id, "m.room.create", "").await?.is_none() {
        return Err(ErrorKind::RoomNotFound(room_id).into());
    }

    let mut prev_events: Vec<String> =
        db.forward_extremities(&room_id).await?.into_iter().collect();
    prev_events.sort();
    let current = state.resolver.resolve(&room_id, &prev_events).await?;

    let mut member = Member::new(Membership::Join);
    if needs_join_authorisation(&*db, &current, &user_id).await? {
        member.join_authorised_via_users_server =
            Some(find_authorising_user(&state, &*db, &current).await?);
    }
    let content = serde_json::to_value(&member).unwrap();

    let draft_as_new = NewEvent {
        ty: "m.room.member".to_owned(),
        content: content.clone(),
        sender: user_id.clone(),
        state_key: Some(user_id.clone_inner()),
        unsigned: None,
    };
    let auth_events = calc_auth_events(&draft_as_new, &current);
    let mut depth: i64 = 0;
    for prev in prev_events.iter() {
        if let Some(parent) = db.get_pdu(&room_id, prev).await? {
            depth = depth.max(parent.depth());
        }
    }

    Ok(Json(json!({
        "room_version": "11",
        "event": {
            "type": "m.room.member",
            "room_id": room_id,
            "sender": user_id.as_str(),
            "state_key": user_id.as_str(),
            "content": content,
            "origin_server_ts": chrono::Utc::now().timestamp_millis(),
            "depth": depth.saturating_add(1),
            "prev_events": prev_events,
            "auth_events": auth_events,
        },
    })))
}

/// Accepts a signed join, commits it, and returns the room state and auth
/// chain the joining server needs to participate.
#[put("/_matrix/federation/v2/send_join/{room_id}/{event_id}")]
pub async fn send_join(
    state: Data<Arc<ServerState>>,
    req: HttpRequest,
    path: Path<(String, String)>,
    body: Json<JsonValue>,
) -> Result<Json<JsonValue>, Error> {
    let (room_id, event_id) = path.into_inner();
    let mut event_json = body.into_inner();
    let origin = authenticate(&state, &req, Some(&event_json)).await?;

    let pdu = parse_pdu(event_json.clone())?;
    if pdu.room_id() != room_id {
        return Err(ErrorKind::InvalidEvent("join for a different room".to_owned()).into());
    }
    if pdu.event_id()? != event_id {
        return Err(ErrorKind::InvalidEvent("event id does not match the path".to_owned()).into());
    }
    if pdu.sender().domain() != origin {
        return Err(ErrorKind::Forbidden.into());
    }
    if pdu.ty() != "m.room.member"
        || pdu.content().get("membership").and_then(JsonValue::as_str) != Some("join")
    {
        return Err(ErrorKind::InvalidEvent("send_join expects a join event".to_owned()).into());
    }

    let db = state.db().await?;
    if db.get_state_event(&room_id, "m.room.create", "").await?.is_none() {
        return Err(ErrorKind::RoomNotFound(room_id).into());
    }

    // joins that the room's current state does not admit are refused, not
    // soft-failed; the joiner must not believe it joined
    let current = State::from_state_map(&room_id, db.current_state(&room_id).await?);
    auth_check(&*db, &pdu, &current).await?.or_reject()?;

    // a restricted join vouched for by one of our users gets our signature
    let mut countersigned = None;
    if let Some(authorising) = pdu
        .content()
        .get("join_authorised_via_users_server")
        .and_then(JsonValue::as_str)
    {
        let authorising = MatrixId::try_from(authorising)?;
        if authorising.domain() == state.config.server_name {
            let mut signed = pdu.clone();
            signed.sign(&state.config.server_name, state.keyring.local_key())?;
            event_json = serde_json::to_value(&signed).unwrap();
            countersigned = Some(event_json.clone());
        }
    }

    // the prev_events snapshot is what the joiner builds on
    let state_before = state.resolver.resolve(&room_id, pdu.prev_events()).await?;

    state.ingester.ingest_pdu(&origin, event_json.clone()).await?;
    info!(%origin, %room_id, "absorbed remote join");

    let mut state_ids: Vec<String> = state_before.iter().map(|(_, id)| id.to_owned()).collect();
    state_ids.sort();
    let mut state_events = Vec::with_capacity(state_ids.len());
    for id in state_ids.iter() {
        let pdu = db.get_pdu(&room_id, id).await?.ok_or(ErrorKind::NotFound)?;
        state_events.push(serde_json::to_value(pdu.inner()).unwrap());
    }
    let mut chain_ids = db.auth_chain(&room_id, &state_ids).await?;
    chain_ids.extend(pdu.auth_events().iter().cloned());
    let mut auth_chain = Vec::with_capacity(chain_ids.len());
    for id in chain_ids {
        let pdu = db.get_pdu(&room_id, &id).await?.ok_or(ErrorKind::NotFound)?;
        auth_chain.push(serde_json::to_value(pdu.inner()).unwrap());
    }

    // everyone else in the room hears about the join from us
    let fan_out_state = state.clone();
    let fan_out_json = event_json.clone();
    let fan_out_room = room_id.clone();
    actix_rt::spawn(async move {
        if let Ok(db) = fan_out_state.db().await {
            fan_out_state
                .client
                .fan_out_pdu(&*db, fan_out_json, &fan_out_room)
                .await;
        }
    });

    let mut response = json!({
        "origin": state.config.server_name,
        "auth_chain": auth_chain,
        "state": state_events,
    });
    if let Some(countersigned) = countersigned {
        response
            .as_object_mut()
            .unwrap()
            .insert("event".to_owned(), countersigned);
    }
    Ok(Json(response))
}

/// The receiving half of the invite handshake.
#[put("/_matrix/federation/v2/invite/{room_id}/{event_id}")]
pub async fn invite(
    state: Data<Arc<ServerState>>,
    req: HttpRequest,
    path: Path<(String, String)>,
    body: Json<JsonValue>,
) -> Result<Json<JsonValue>, Error> {
    let (room_id, event_id) = path.into_inner();
    let body = body.into_inner();
    let origin = authenticate(&state, &req, Some(&body)).await?;

    let response =
        invite_flow::handle_inbound_invite(&state.ingester, &origin, &room_id, &event_id, &body)
            .await?;
    Ok(Json(response))
}

/// Whether a join in this room needs a resident's authorisation, i.e. the
/// join rule is restricted and the user has no invite to ride on.
async fn needs_join_authorisation(
    db: &dyn Storage,
    current: &State,
    user_id: &MatrixId,
) -> Result<bool, Error> {
    let join_rule = current
        .get_content::<JoinRules>(db, "")
        .await?
        .map(|c| c.join_rule);
    if !matches!(join_rule, Some(JoinRule::Restricted) | Some(JoinRule::KnockRestricted)) {
        return Ok(false);
    }
    let membership = current
        .get_content::<Member>(db, user_id.as_str())
        .await?
        .map(|c| c.membership);
    Ok(!matches!(membership, Some(Membership::Join) | Some(Membership::Invite)))
}

/// A local joined user with the power to invite, to vouch for a restricted
/// join.
async fn find_authorising_user(
    state: &ServerState,
    db: &dyn Storage,
    current: &State,
) -> Result<MatrixId, Error> {
    let creator = crate::validate::auth::room_creator(db, current).await?;
    let power_levels = current
        .get_content::<PowerLevels>(db, "")
        .await?
        .unwrap_or_else(|| PowerLevels::no_event_default_levels(&creator));

    for ((ty, state_key), event_id) in current.iter() {
        if ty != "m.room.member" {
            continue;
        }
        let user = match MatrixId::try_from(state_key) {
            Ok(user) => user,
            Err(_) => continue,
        };
        if user.domain() != state.config.server_name {
            continue;
        }
        let pdu = db.get_pdu(current.room_id(), event_id).await?.ok_or(ErrorKind::NotFound)?;
        if pdu.content().get("membership").and_then(JsonValue::as_str) != Some("join") {
            continue;
        }
        if power_levels.user_level(&user) >= power_levels.invite {
            return Ok(user);
        }
    }
    Err(ErrorKind::AuthFailed("no local user can authorise this join".to_owned()).into())
}
