use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{error::Error, util::MatrixId};

use super::{room_version::VersionedPdu, Event, EventContent};

/// A PDU as the store keeps it: the wire event plus the derived event id and
/// the acceptance flags the ingress pipeline decided on.
///
/// `soft_failed` events stay in the DAG and in state resolution inputs but are
/// withheld from clients and never become forward extremities. `outlier`
/// events exist only as reference targets for other events' auth_events.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StoredPdu {
    inner: VersionedPdu,
    event_id: String,
    soft_failed: bool,
    outlier: bool,
}

impl StoredPdu {
    pub fn new(inner: VersionedPdu, soft_failed: bool, outlier: bool) -> Result<Self, Error> {
        let event_id = inner.event_id()?;
        Ok(StoredPdu { inner, event_id, soft_failed, outlier })
    }

    pub fn accepted(inner: VersionedPdu) -> Result<Self, Error> {
        StoredPdu::new(inner, false, false)
    }

    pub fn inner(&self) -> &VersionedPdu {
        &self.inner
    }

    pub fn into_inner(self) -> VersionedPdu {
        self.inner
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn soft_failed(&self) -> bool {
        self.soft_failed
    }

    pub fn outlier(&self) -> bool {
        self.outlier
    }

    /// Promotes an outlier to a regular DAG participant. Used when a later
    /// event integrates history that was first seen as loose references.
    pub fn clear_outlier(&mut self) {
        self.outlier = false;
    }

    /// Rewrites the stored copy through the redaction algorithm. The event id
    /// is unchanged; reference hashes cover only what redaction keeps.
    pub fn apply_redaction(&mut self) {
        let inner = self.inner.clone();
        self.inner = inner.redact();
    }

    pub fn to_client_format(self) -> Event {
        self.inner.to_client_format(self.event_id)
    }

    pub fn event_content(&self) -> Result<EventContent, Error> {
        self.inner.event_content()
    }

    pub fn ty(&self) -> &str {
        self.inner.ty()
    }

    pub fn content(&self) -> &JsonValue {
        self.inner.content()
    }

    pub fn room_id(&self) -> &str {
        self.inner.room_id()
    }

    pub fn sender(&self) -> &MatrixId {
        self.inner.sender()
    }

    pub fn state_key(&self) -> Option<&str> {
        self.inner.state_key()
    }

    pub fn unsigned(&self) -> Option<&JsonValue> {
        self.inner.unsigned()
    }

    pub fn origin(&self) -> &str {
        self.inner.origin()
    }

    pub fn origin_server_ts(&self) -> i64 {
        self.inner.origin_server_ts()
    }

    pub fn prev_events(&self) -> &[String] {
        self.inner.prev_events()
    }

    pub fn auth_events(&self) -> &[String] {
        self.inner.auth_events()
    }

    pub fn depth(&self) -> i64 {
        self.inner.depth()
    }
}
