use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};

use actix_web::{
    get, post,
    web::{Data, Json, Path},
    HttpRequest,
};
use serde_json::{json, Value as JsonValue};

use crate::{
    error::{Error, ErrorKind},
    events::StoredPdu,
    storage::Storage,
    ServerState,
};

use super::authenticate;

const BACKFILL_DEFAULT_LIMIT: usize = 10;
const BACKFILL_MAX_LIMIT: usize = 100;
const MISSING_EVENTS_DEFAULT_LIMIT: usize = 10;

/// Fetch a single event by id. Event ids are globally unique, so this scans
/// the rooms the store knows about.
#[get("/_matrix/federation/v1/event/{event_id}")]
pub async fn get_event(
    state: Data<Arc<ServerState>>,
    req: HttpRequest,
    event_id: Path<String>,
) -> Result<Json<JsonValue>, Error> {
    let origin = authenticate(&state, &req, None).await?;
    let db = state.db().await?;

    let pdu = find_event(&*db, &event_id).await?.ok_or(ErrorKind::NotFound)?;
    require_server_in_room(&*db, pdu.room_id(), &origin).await?;

    Ok(Json(json!({
        "origin": state.config.server_name,
        "origin_server_ts": chrono::Utc::now().timestamp_millis(),
        "pdus": [serde_json::to_value(pdu.inner()).unwrap()],
    })))
}

#[get("/_matrix/federation/v1/state/{room_id}")]
pub async fn get_state(
    state: Data<Arc<ServerState>>,
    req: HttpRequest,
    room_id: Path<String>,
) -> Result<Json<JsonValue>, Error> {
    let origin = authenticate(&state, &req, None).await?;
    let db = state.db().await?;
    require_server_in_room(&*db, &room_id, &origin).await?;

    let event_id = query_param(&req, "event_id")
        .ok_or_else(|| ErrorKind::MissingParam("event_id".to_owned()))?;
    let snapshot = state.resolver.resolve(&room_id, &[event_id]).await?;

    let mut pdus = Vec::new();
    let mut state_ids = Vec::new();
    for ((_, _), id) in snapshot.iter() {
        let pdu = db.get_pdu(&room_id, id).await?.ok_or(ErrorKind::NotFound)?;
        state_ids.push(id.to_owned());
        pdus.push(serde_json::to_value(pdu.inner()).unwrap());
    }
    let auth_chain = load_events(&*db, &room_id, db.auth_chain(&room_id, &state_ids).await?).await?;

    Ok(Json(json!({
        "pdus": pdus,
        "auth_chain": auth_chain,
    })))
}

#[get("/_matrix/federation/v1/state_ids/{room_id}")]
pub async fn get_state_ids(
    state: Data<Arc<ServerState>>,
    req: HttpRequest,
    room_id: Path<String>,
) -> Result<Json<JsonValue>, Error> {
    let origin = authenticate(&state, &req, None).await?;
    let db = state.db().await?;
    require_server_in_room(&*db, &room_id, &origin).await?;

    let event_id = query_param(&req, "event_id")
        .ok_or_else(|| ErrorKind::MissingParam("event_id".to_owned()))?;
    let snapshot = state.resolver.resolve(&room_id, &[event_id]).await?;

    let state_ids: Vec<String> = snapshot.iter().map(|(_, id)| id.to_owned()).collect();
    let auth_chain_ids: Vec<String> =
        db.auth_chain(&room_id, &state_ids).await?.into_iter().collect();

    Ok(Json(json!({
        "pdu_ids": state_ids,
        "auth_chain_ids": auth_chain_ids,
    })))
}

/// Historical events: walk prev_events backwards from the requested ids,
/// deepest first.
#[get("/_matrix/federation/v1/backfill/{room_id}")]
pub async fn backfill(
    state: Data<Arc<ServerState>>,
    req: HttpRequest,
    room_id: Path<String>,
) -> Result<Json<JsonValue>, Error> {
    let origin = authenticate(&state, &req, None).await?;
    let db = state.db().await?;
    require_server_in_room(&*db, &room_id, &origin).await?;

    let from: Vec<String> = query_params(&req, "v");
    if from.is_empty() {
        return Err(ErrorKind::MissingParam("v".to_owned()).into());
    }
    let limit = query_param(&req, "limit")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(BACKFILL_DEFAULT_LIMIT)
        .min(BACKFILL_MAX_LIMIT);

    let mut seen = HashSet::new();
    let mut queue: VecDeque<String> = from.into_iter().collect();
    let mut collected: Vec<StoredPdu> = Vec::new();
    while let Some(event_id) = queue.pop_front() {
        if collected.len() >= limit {
            break;
        }
        if !seen.insert(event_id.clone()) {
            continue;
        }
        if let Some(pdu) = db.get_pdu(&room_id, &event_id).await? {
            queue.extend(pdu.prev_events().iter().cloned());
            collected.push(pdu);
        }
    }
    collected.sort_by_key(|pdu| std::cmp::Reverse(pdu.depth()));

    Ok(Json(json!({
        "origin": state.config.server_name,
        "origin_server_ts": chrono::Utc::now().timestamp_millis(),
        "pdus": collected
            .into_iter()
            .map(|pdu| serde_json::to_value(pdu.inner()).unwrap())
            .collect::<Vec<_>>(),
    })))
}

/// Gap fill: breadth-first from the latest events back towards the earliest
/// ones the caller already has. Results are oldest-first so the caller can
/// ingest parents before children.
#[post("/_matrix/federation/v1/get_missing_events/{room_id}")]
pub async fn get_missing_events(
    state: Data<Arc<ServerState>>,
    req: HttpRequest,
    room_id: Path<String>,
    body: Json<JsonValue>,
) -> Result<Json<JsonValue>, Error> {
    let body = body.into_inner();
    let origin = authenticate(&state, &req, Some(&body)).await?;
    let db = state.db().await?;
    require_server_in_room(&*db, &room_id, &origin).await?;

    let earliest: HashSet<String> = string_array(body.get("earliest_events")).into_iter().collect();
    let latest = string_array(body.get("latest_events"));
    let limit = body
        .get("limit")
        .and_then(JsonValue::as_u64)
        .unwrap_or(MISSING_EVENTS_DEFAULT_LIMIT as u64) as usize;

    // the caller already holds the latest events; the gap starts at their
    // parents and ends where the earliest set begins
    let mut seen = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    for event_id in latest {
        if let Some(pdu) = db.get_pdu(&room_id, &event_id).await? {
            queue.extend(pdu.prev_events().iter().cloned());
        }
    }
    let mut collected = Vec::new();
    while let Some(event_id) = queue.pop_front() {
        if collected.len() >= limit {
            break;
        }
        if earliest.contains(&event_id) || !seen.insert(event_id.clone()) {
            continue;
        }
        if let Some(pdu) = db.get_pdu(&room_id, &event_id).await? {
            queue.extend(pdu.prev_events().iter().cloned());
            collected.push(pdu);
        }
    }
    collected.sort_by_key(StoredPdu::depth);

    Ok(Json(json!({
        "events": collected
            .into_iter()
            .map(|pdu| serde_json::to_value(pdu.inner()).unwrap())
            .collect::<Vec<_>>(),
    })))
}

#[get("/_matrix/federation/v1/event_auth/{room_id}/{event_id}")]
pub async fn event_auth(
    state: Data<Arc<ServerState>>,
    req: HttpRequest,
    path: Path<(String, String)>,
) -> Result<Json<JsonValue>, Error> {
    let (room_id, event_id) = path.into_inner();
    let origin = authenticate(&state, &req, None).await?;
    let db = state.db().await?;
    require_server_in_room(&*db, &room_id, &origin).await?;

    if !db.has_pdu(&room_id, &event_id).await? {
        return Err(ErrorKind::NotFound.into());
    }
    let chain = db.auth_chain(&room_id, &[event_id]).await?;
    Ok(Json(json!({ "auth_chain": load_events(&*db, &room_id, chain).await? })))
}

async fn find_event(db: &dyn Storage, event_id: &str) -> Result<Option<StoredPdu>, Error> {
    for room_id in db.get_rooms().await? {
        if let Some(pdu) = db.get_pdu(&room_id, event_id).await? {
            return Ok(Some(pdu));
        }
    }
    Ok(None)
}

async fn load_events(
    db: &dyn Storage,
    room_id: &str,
    ids: HashSet<String>,
) -> Result<Vec<JsonValue>, Error> {
    let mut events = Vec::with_capacity(ids.len());
    for id in ids {
        let pdu = db.get_pdu(room_id, &id).await?.ok_or(ErrorKind::NotFound)?;
        events.push(serde_json::to_value(pdu.inner()).unwrap());
    }
    Ok(events)
}

/// Only servers with users in the room may read its history.
async fn require_server_in_room(
    db: &dyn Storage,
    room_id: &str,
    server: &str,
) -> Result<(), Error> {
    if db.get_servers_in_room(room_id).await?.contains(server) {
        Ok(())
    } else {
        Err(ErrorKind::Forbidden.into())
    }
}

pub(super) fn query_param(req: &HttpRequest, name: &str) -> Option<String> {
    query_params(req, name).into_iter().next()
}

/// Parses repeated query parameters (`?v=a&v=b`) the way the federation API
/// uses them.
pub(super) fn query_params(req: &HttpRequest, name: &str) -> Vec<String> {
    req.query_string()
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .filter(|(key, _)| *key == name)
        .filter_map(|(_, value)| {
            percent_encoding::percent_decode_str(value)
                .decode_utf8()
                .ok()
                .map(|decoded| decoded.into_owned())
        })
        .collect()
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
