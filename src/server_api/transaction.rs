use std::{convert::TryFrom, sync::Arc};

use actix_web::{
    put,
    web::{Data, Json, Path},
    HttpRequest,
};
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use tracing::{debug, warn};

use crate::{
    error::{Error, ErrorKind},
    util::MatrixId,
    validate::acl,
    ServerState,
};

use super::authenticate;

const PDU_LIMIT: usize = 50;
const EDU_LIMIT: usize = 100;

/// Transaction ingress: up to 50 PDUs and 100 EDUs per request, with a
/// per-PDU result map. One bad PDU never poisons the rest.
#[put("/_matrix/federation/v1/send/{txn_id}")]
pub async fn send_transaction(
    state: Data<Arc<ServerState>>,
    req: HttpRequest,
    txn_id: Path<String>,
    body: Json<JsonValue>,
) -> Result<Json<JsonValue>, Error> {
    let body = body.into_inner();
    let origin = authenticate(&state, &req, Some(&body)).await?;

    if let Some(claimed) = body.get("origin").and_then(JsonValue::as_str) {
        if claimed != origin {
            return Err(ErrorKind::Forbidden.into());
        }
    }

    let db = state.db().await?;
    // replays must observe the original outcome
    if let Some(previous) = db.get_txn(&origin, &txn_id).await? {
        debug!(%origin, %txn_id, "replaying recorded transaction result");
        return Ok(Json(previous));
    }

    let pdus = body.get("pdus").and_then(JsonValue::as_array).cloned().unwrap_or_default();
    let edus = body.get("edus").and_then(JsonValue::as_array).cloned().unwrap_or_default();
    if pdus.len() > PDU_LIMIT {
        return Err(ErrorKind::TooLarge(format!("over {} pdus", PDU_LIMIT)).into());
    }
    if edus.len() > EDU_LIMIT {
        return Err(ErrorKind::TooLarge(format!("over {} edus", EDU_LIMIT)).into());
    }

    let mut results = JsonMap::new();
    for pdu_json in pdus {
        let room_id = pdu_json
            .get("room_id")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_owned();

        // server ACLs gate each PDU individually
        if !room_id.is_empty() && !acl::server_allowed(&*db, &room_id, &origin).await? {
            if let Some(event_id) = event_id_of(&pdu_json) {
                results.insert(event_id, json!({"error": "M_FORBIDDEN: server access denied"}));
            }
            continue;
        }

        let event_id = event_id_of(&pdu_json);
        match state.ingester.ingest_pdu(&origin, pdu_json).await {
            Ok(event_id) => {
                results.insert(event_id, json!({}));
            },
            Err(e) => {
                warn!(error = %e, "incoming pdu failed");
                if let Some(event_id) = event_id {
                    results.insert(event_id, json!({"error": format!("{}", e.kind())}));
                }
            },
        }
    }

    for edu in edus {
        if let Err(e) = process_edu(&*db, &origin, &edu).await {
            debug!(error = %e, "dropping bad edu");
        }
    }

    let response = json!({ "pdus": results });
    db.record_txn(&origin, &txn_id, response.clone()).await?;
    Ok(Json(response))
}

/// The id a result-map entry is keyed by, derived without trusting the
/// sender further than parsing.
fn event_id_of(pdu_json: &JsonValue) -> Option<String> {
    crate::federation::ingest::parse_pdu(pdu_json.clone())
        .ok()
        .and_then(|pdu| pdu.event_id().ok())
}

/// EDU dispatch by type. Unknown types are ignored on purpose.
async fn process_edu(
    db: &dyn crate::storage::Storage,
    origin: &str,
    edu: &JsonValue,
) -> Result<(), Error> {
    let edu_type = edu.get("edu_type").and_then(JsonValue::as_str).unwrap_or_default();
    let content = edu.get("content").cloned().unwrap_or_else(|| json!({}));
    match edu_type {
        "m.typing" => {
            let room_id = require_str(&content, "room_id")?;
            let user_id = MatrixId::try_from(require_str(&content, "user_id")?)?;
            if user_id.domain() != origin {
                return Err(ErrorKind::Forbidden.into());
            }
            let typing = content.get("typing").and_then(JsonValue::as_bool).unwrap_or(false);
            db.set_typing(room_id, &user_id, typing, 30_000).await?;
        },
        "m.receipt" => {
            // content is {room_id: {"m.read": {user: {...}}}}
            if let Some(rooms) = content.as_object() {
                for (room_id, receipts) in rooms {
                    db.set_ephemeral(room_id, "m.receipt", Some(receipts.clone())).await?;
                }
            }
        },
        "m.presence" => {
            for update in content
                .get("push")
                .and_then(JsonValue::as_array)
                .cloned()
                .unwrap_or_default()
            {
                let user_id = MatrixId::try_from(require_str(&update, "user_id")?)?;
                if user_id.domain() != origin {
                    continue;
                }
                db.set_presence(&user_id, update).await?;
            }
        },
        "m.device_list_update" | "m.signing_key_update" | "m.direct_to_device" => {
            // consumers of these live outside the core; acknowledge and move on
            debug!(%edu_type, %origin, "edu acknowledged");
        },
        _ => {
            debug!(%edu_type, "ignoring unknown edu type");
        },
    }
    Ok(())
}

fn require_str<'a>(value: &'a JsonValue, field: &str) -> Result<&'a str, Error> {
    value
        .get(field)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| ErrorKind::BadJson(format!("edu missing {}", field)).into())
}
