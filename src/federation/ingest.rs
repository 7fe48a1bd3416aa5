use std::{convert::TryFrom, sync::Arc};

use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::{
    error::{Error, ErrorKind},
    events::{room::Membership, room_version::PduV11, EventContent, StoredPdu, VersionedPdu},
    keyring::Keyring,
    state::{self, State, StateResolver},
    storage::Storage,
    sync::Notifier,
    util::{locks::RoomLocks, MatrixId},
    validate::auth::auth_check,
};

use super::FederationClient;

/// How deep we chase unknown auth/prev events before giving up on a PDU.
const FETCH_BUDGET: u32 = 50;
const MISSING_EVENTS_LIMIT: u32 = 10;

/// The ingress pipeline: every inbound PDU runs shape, hash, signature and
/// two authorization checks before it is committed, soft-failed, or
/// rejected. The only writer of room state.
pub struct Ingester {
    db: Box<dyn Storage>,
    resolver: Arc<StateResolver>,
    keyring: Arc<Keyring>,
    client: Option<Arc<FederationClient>>,
    locks: Arc<RoomLocks>,
    notifier: Arc<Notifier>,
}

impl Ingester {
    pub fn new(
        db: Box<dyn Storage>,
        resolver: Arc<StateResolver>,
        keyring: Arc<Keyring>,
        client: Option<Arc<FederationClient>>,
        locks: Arc<RoomLocks>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Ingester { db, resolver, keyring, client, locks, notifier }
    }

    pub fn db(&self) -> &dyn Storage {
        &*self.db
    }

    pub fn resolver(&self) -> &StateResolver {
        &self.resolver
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn client(&self) -> Option<&FederationClient> {
        self.client.as_deref()
    }

    /// Runs one inbound PDU through the full pipeline. Returns the event id
    /// on acceptance (soft-failed acceptance included).
    pub async fn ingest_pdu(&self, origin: &str, pdu_json: JsonValue) -> Result<String, Error> {
        self.ingest_inner(origin, pdu_json, true).await
    }

    #[async_recursion::async_recursion(?Send)]
    async fn ingest_inner(
        &self,
        origin: &str,
        pdu_json: JsonValue,
        allow_fetch: bool,
    ) -> Result<String, Error> {
        // step 1: shape
        let pdu = parse_pdu(pdu_json)?;
        let room_id = pdu.room_id().to_owned();

        if self.db.get_state_event(&room_id, "m.room.create", "").await?.is_none() {
            return Err(ErrorKind::RoomNotFound(room_id).into());
        }
        match self.db.room_version(&room_id).await? {
            Some(version) if version == "11" => {},
            _ => return Err(ErrorKind::UnsupportedRoomVersion.into()),
        }

        if self.db.has_pdu(&room_id, &pdu.event_id()?).await? {
            // duplicates are settled; nothing to do
            return pdu.event_id();
        }

        // steps 2 and 3: hashes and signatures
        self.check_hash_and_signatures(&pdu).await?;

        // network gap-fill happens before the critical section: fetching a
        // referenced event recursively re-enters this pipeline, and the room
        // lock is not reentrant
        if allow_fetch {
            for auth_event_id in pdu.auth_events().to_vec() {
                self.ensure_event(origin, &room_id, &auth_event_id, FETCH_BUDGET).await?;
            }
            self.fetch_missing_prevs(origin, &pdu).await?;
        }

        // steps 4 through 6 run under the room write lock, against a stable
        // snapshot
        let _guard = self.locks.lock(&room_id).await;

        // step 4: the event must be allowed by the state its auth_events name
        let auth_state = self.state_from_auth_events(&room_id, pdu.auth_events()).await?;
        auth_check(&*self.db, &pdu, &auth_state).await?.or_reject()?;

        for prev in pdu.prev_events() {
            if !self.db.has_pdu(&room_id, prev).await? {
                return Err(ErrorKind::InvalidEvent(format!(
                    "prev_event {} could not be obtained",
                    prev
                ))
                .into());
            }
        }

        // step 5: the same predicate against the room's current state
        let current = State::from_state_map(&room_id, self.db.current_state(&room_id).await?);
        let current_outcome = auth_check(&*self.db, &pdu, &current).await?;
        let soft_failed = !current_outcome.allowed();
        if soft_failed {
            info!(
                reason = ?current_outcome,
                "event allowed by its auth_events but not by current state; soft-failing"
            );
        }

        // step 6: store, advance extremities and current state
        let stored = StoredPdu::new(pdu, soft_failed, false)?;
        state::commit_pdu(&*self.db, &self.resolver, &stored).await?;
        self.after_accept(&stored).await?;

        // step 7: fan out to local subscribers
        if !stored.soft_failed() {
            self.notifier.publish(&stored.clone().to_client_format());
        }

        Ok(stored.event_id().to_owned())
    }

    /// Verifies and persists an event as an outlier: a reference target that
    /// is not part of the room's forward DAG. Used for join/invite absorption
    /// and auth-chain fetches. Auth events must already be present.
    pub async fn ingest_outlier(&self, pdu: VersionedPdu) -> Result<String, Error> {
        let room_id = pdu.room_id().to_owned();
        let event_id = pdu.event_id()?;
        if self.db.has_pdu(&room_id, &event_id).await? {
            return Ok(event_id);
        }

        self.check_hash_and_signatures(&pdu).await?;

        let auth_state = self.state_from_auth_events(&room_id, pdu.auth_events()).await?;
        auth_check(&*self.db, &pdu, &auth_state).await?.or_reject()?;

        let stored = StoredPdu::new(pdu, false, true)?;
        self.db.add_pdus(std::slice::from_ref(&stored)).await?;
        Ok(event_id)
    }

    async fn check_hash_and_signatures(&self, pdu: &VersionedPdu) -> Result<(), Error> {
        if pdu.content_hash()? != pdu.declared_hash() {
            return Err(ErrorKind::HashMismatch.into());
        }

        self.keyring.verify_pdu(self.client(), pdu).await?;

        // restricted joins additionally carry the authorising server's
        // signature
        if pdu.ty() == "m.room.member" {
            if let Some(authorising) = pdu
                .content()
                .get("join_authorised_via_users_server")
                .and_then(JsonValue::as_str)
            {
                let authorising = MatrixId::try_from(authorising)?;
                self.keyring
                    .verify_pdu_signature_by(self.client(), pdu, authorising.domain())
                    .await?;
            }
        }
        Ok(())
    }

    /// The snapshot named by an event's auth_events.
    async fn state_from_auth_events(
        &self,
        room_id: &str,
        auth_events: &[String],
    ) -> Result<State, Error> {
        let mut state = State::new(room_id);
        for event_id in auth_events {
            let pdu = self.db.get_pdu(room_id, event_id).await?.ok_or_else(|| {
                ErrorKind::InvalidEvent(format!("auth event {} unknown", event_id))
            })?;
            if pdu.state_key().is_some() {
                state.insert_event(&pdu);
            }
        }
        Ok(state)
    }

    /// Makes sure an event exists locally, fetching it from the origin and
    /// persisting it as an outlier after full verification.
    #[async_recursion::async_recursion(?Send)]
    async fn ensure_event(
        &self,
        origin: &str,
        room_id: &str,
        event_id: &str,
        budget: u32,
    ) -> Result<(), Error> {
        if self.db.has_pdu(room_id, event_id).await? {
            return Ok(());
        }
        if budget == 0 {
            return Err(ErrorKind::InvalidEvent("auth chain too deep to fetch".to_owned()).into());
        }
        let client = match self.client() {
            Some(client) => client,
            None => {
                return Err(ErrorKind::InvalidEvent(format!(
                    "referenced event {} unknown",
                    event_id
                ))
                .into())
            },
        };

        debug!(%event_id, %origin, "fetching referenced event");
        let response = client.get_event(origin, event_id).await?;
        let pdu_json = response
            .get("pdus")
            .and_then(JsonValue::as_array)
            .and_then(|pdus| pdus.first())
            .cloned()
            .ok_or_else(|| ErrorKind::RemoteError("event response without pdus".to_owned()))?;
        let pdu = parse_pdu(pdu_json)?;

        if pdu.event_id()? != event_id {
            return Err(
                ErrorKind::RemoteError("peer answered with a different event".to_owned()).into()
            );
        }
        if pdu.room_id() != room_id {
            return Err(
                ErrorKind::RemoteError("peer answered with another room's event".to_owned()).into()
            );
        }

        for auth_event_id in pdu.auth_events().to_vec() {
            self.ensure_event(origin, room_id, &auth_event_id, budget - 1).await?;
        }

        self.ingest_outlier(pdu).await?;
        Ok(())
    }

    /// Walks back from unknown prev_events via get_missing_events, ingesting
    /// whatever the origin hands back, oldest first.
    async fn fetch_missing_prevs(&self, origin: &str, pdu: &VersionedPdu) -> Result<(), Error> {
        let room_id = pdu.room_id();
        let mut missing = Vec::new();
        for prev in pdu.prev_events() {
            if !self.db.has_pdu(room_id, prev).await? {
                missing.push(prev.clone());
            }
        }
        if missing.is_empty() {
            return Ok(());
        }
        let client = match self.client() {
            Some(client) => client,
            None => return Ok(()),
        };

        let earliest: Vec<String> =
            self.db.forward_extremities(room_id).await?.into_iter().collect();
        let response = client
            .get_missing_events(origin, room_id, &earliest, &missing, MISSING_EVENTS_LIMIT)
            .await?;
        let events = response
            .get("events")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();
        for event_json in events {
            // recursion without further fetching; peers return these oldest
            // first, so parents land before children
            if let Err(e) = self.ingest_inner(origin, event_json, false).await {
                warn!(error = %e, "could not absorb gap event");
            }
        }
        Ok(())
    }

    /// Post-commit bookkeeping: redaction application and invite-list
    /// maintenance for local users.
    async fn after_accept(&self, stored: &StoredPdu) -> Result<(), Error> {
        if stored.soft_failed() {
            return Ok(());
        }
        let room_id = stored.room_id();

        match stored.event_content()? {
            EventContent::Redaction(redaction) => {
                if let Some(target) = redaction.redacts {
                    if self.db.has_pdu(room_id, &target).await? {
                        self.db.redact_pdu(room_id, &target).await?;
                    }
                }
            },
            EventContent::Member(member) => {
                let target = match stored.state_key() {
                    Some(key) => MatrixId::try_from(key)?,
                    None => return Ok(()),
                };
                if target.domain() != self.keyring.server_name() {
                    return Ok(());
                }
                match member.membership {
                    Membership::Invite => {
                        let mut events =
                            super::invite::stripped_room_state(&*self.db, room_id).await?;
                        events.push(super::invite::strip_pdu(stored));
                        self.db.set_invite_state(&target, room_id, events).await?;
                    },
                    _ => self.db.remove_invite(&target, room_id).await?,
                }
            },
            _ => {},
        }
        Ok(())
    }
}

/// Step-1 shape validation: parse and check the identifier grammars before
/// touching any state.
pub fn parse_pdu(pdu_json: JsonValue) -> Result<VersionedPdu, Error> {
    let pdu: PduV11 = serde_json::from_value(pdu_json)
        .map_err(|e| ErrorKind::InvalidEvent(format!("malformed pdu: {}", e)))?;

    if !pdu.room_id.starts_with('!') || !pdu.room_id.contains(':') {
        return Err(ErrorKind::InvalidEvent("room_id is not a room id".to_owned()).into());
    }
    if pdu.ty.is_empty() {
        return Err(ErrorKind::InvalidEvent("missing event type".to_owned()).into());
    }
    if pdu.depth < 0 {
        return Err(ErrorKind::InvalidEvent("negative depth".to_owned()).into());
    }
    if pdu.origin_server_ts < 0 {
        return Err(ErrorKind::InvalidEvent("negative origin_server_ts".to_owned()).into());
    }
    for event_id in pdu.prev_events.iter().chain(pdu.auth_events.iter()) {
        if !event_id.starts_with('$') {
            return Err(ErrorKind::InvalidEvent("malformed event reference".to_owned()).into());
        }
    }

    Ok(VersionedPdu::V11(pdu))
}
