use std::{convert::TryFrom, sync::Arc};

use actix_web::{
    get,
    web::{Data, Json},
    HttpRequest,
};
use serde_json::{json, Value as JsonValue};

use crate::{
    error::{Error, ErrorKind},
    util::MatrixId,
    ServerState,
};

use super::{authenticate, events::query_param};

/// Profile lookup over federation. The response always carries both keys,
/// null when unset.
#[get("/_matrix/federation/v1/query/profile")]
pub async fn profile(
    state: Data<Arc<ServerState>>,
    req: HttpRequest,
) -> Result<Json<JsonValue>, Error> {
    authenticate(&state, &req, None).await?;

    let user_id = query_param(&req, "user_id")
        .ok_or_else(|| ErrorKind::MissingParam("user_id".to_owned()))?;
    let user_id = MatrixId::try_from(user_id.as_str())?;
    if user_id.domain() != state.config.server_name {
        return Err(ErrorKind::NotFound.into());
    }

    let db = state.db().await?;
    let profile = db.get_profile(user_id.localpart()).await?.unwrap_or_default();

    let response = match query_param(&req, "field").as_deref() {
        Some("displayname") => json!({ "displayname": profile.displayname }),
        Some("avatar_url") => json!({ "avatar_url": profile.avatar_url }),
        _ => json!({
            "displayname": profile.displayname,
            "avatar_url": profile.avatar_url,
        }),
    };
    Ok(Json(response))
}
