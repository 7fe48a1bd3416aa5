use std::sync::Arc;

use actix_web::{
    get,
    web::{Data, Json, Path},
};
use serde_json::Value as JsonValue;

use crate::ServerState;

/// Key publication is self-signed and unauthenticated; peers bootstrap trust
/// from it.
#[get("/_matrix/key/v2/server")]
pub async fn get_server_keys(state: Data<Arc<ServerState>>) -> Json<JsonValue> {
    Json(state.keyring.publish_keys())
}

/// Deprecated form with the key id in the path; the response is the same
/// full key set.
#[get("/_matrix/key/v2/server/{key_id}")]
pub async fn get_server_keys_deprecated(
    state: Data<Arc<ServerState>>,
    _key_id: Path<String>,
) -> Json<JsonValue> {
    Json(state.keyring.publish_keys())
}
