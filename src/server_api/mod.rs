use std::sync::Arc;

use actix_web::{
    get,
    web::{self, Data, Json},
    HttpRequest,
};
use serde_json::{json, Value as JsonValue};

use crate::{
    canonical::{CanonicalObject, CanonicalValue},
    error::{Error, ErrorKind},
    federation::{request_signing_object, XMatrix},
    ServerState,
};

mod events;
mod keys;
mod membership;
mod query;
mod transaction;

pub fn configure_endpoints(cfg: &mut web::ServiceConfig) {
    cfg.service(version)
        .service(well_known_server)
        .service(well_known_client)
        .service(keys::get_server_keys)
        .service(keys::get_server_keys_deprecated)
        .service(transaction::send_transaction)
        .service(events::get_event)
        .service(events::get_state)
        .service(events::get_state_ids)
        .service(events::backfill)
        .service(events::get_missing_events)
        .service(events::event_auth)
        .service(membership::make_join)
        .service(membership::send_join)
        .service(membership::invite)
        .service(query::profile);
}

/// Verifies the X-Matrix authorization on an inbound federation request and
/// returns the origin server name. Failure means 401 and no state change.
pub async fn authenticate(
    state: &ServerState,
    req: &HttpRequest,
    content: Option<&JsonValue>,
) -> Result<String, Error> {
    let header = req
        .headers()
        .get(actix_web::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ErrorKind::Unauthorized("missing Authorization header".to_owned()))?;
    let auth = XMatrix::parse(header)?;

    if let Some(destination) = &auth.destination {
        if destination != &state.config.server_name {
            return Err(
                ErrorKind::Unauthorized("request signed for another destination".to_owned()).into()
            );
        }
    }

    let uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| req.uri().path());
    let mut object = request_signing_object(
        req.method().as_str(),
        uri,
        &auth.origin,
        &state.config.server_name,
        content,
    )?;

    // graft the claimed signature on so verify_object sees the wire shape
    let mut by_key = CanonicalObject::new();
    by_key.insert(auth.key.clone(), CanonicalValue::String(auth.sig.clone()));
    let mut signatures = CanonicalObject::new();
    signatures.insert(auth.origin.clone(), CanonicalValue::Object(by_key));
    object.insert("signatures".to_owned(), CanonicalValue::Object(signatures));

    state
        .keyring
        .verify_object(Some(&state.client), &auth.origin, &auth.key, &object)
        .await?;
    Ok(auth.origin)
}

#[get("/_matrix/federation/v1/version")]
async fn version() -> Json<JsonValue> {
    Json(json!({
        "server": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        }
    }))
}

#[get("/.well-known/matrix/server")]
async fn well_known_server(state: Data<Arc<ServerState>>) -> Json<JsonValue> {
    Json(json!({
        "m.server": format!("{}:{}", state.config.server_name, state.config.federation_port),
    }))
}

#[get("/.well-known/matrix/client")]
async fn well_known_client(state: Data<Arc<ServerState>>) -> Json<JsonValue> {
    Json(json!({
        "m.homeserver": {
            "base_url": format!("https://{}", state.config.server_name),
        }
    }))
}
