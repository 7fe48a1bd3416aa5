use std::{collections::HashSet, convert::TryFrom};

use crate::{
    error::{Error, ErrorKind},
    events::{
        room::{JoinRule, JoinRules, Member, Membership, PowerLevels},
        EventContent, VersionedPdu,
    },
    state::State,
    storage::Storage,
    util::MatrixId,
};

/// The verdict of the authorization rules. Denial carries the failing rule so
/// callers can log it and decide between rejection and soft-failure.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AuthOutcome {
    Allowed,
    Denied(String),
}

impl AuthOutcome {
    pub fn allowed(&self) -> bool {
        *self == AuthOutcome::Allowed
    }

    pub fn or_reject(self) -> Result<(), Error> {
        match self {
            AuthOutcome::Allowed => Ok(()),
            AuthOutcome::Denied(reason) => Err(ErrorKind::AuthFailed(reason).into()),
        }
    }
}

fn denied(reason: impl Into<String>) -> Result<AuthOutcome, Error> {
    Ok(AuthOutcome::Denied(reason.into()))
}

/// Evaluates a candidate event against an authorizing state snapshot.
///
/// This is a pure predicate over (event, state): the db handle is only used
/// to load the events the snapshot names. Callers evaluate it twice per
/// inbound event, once against the snapshot named by the event's own
/// auth_events (failure means rejection) and once against the room's current
/// state (failure means soft-fail).
pub async fn auth_check(
    db: &dyn Storage,
    pdu: &VersionedPdu,
    state: &State,
) -> Result<AuthOutcome, Error> {
    let content = pdu.event_content()?;

    if let EventContent::Create(_) = content {
        if !pdu.prev_events().is_empty() {
            return denied("create event with prev_events");
        }
        if !pdu.auth_events().is_empty() {
            return denied("create event with auth_events");
        }
        let room_id_domain = match pdu.room_id().split_once(':') {
            Some((_, domain)) => domain,
            None => return denied("malformed room id"),
        };
        if pdu.sender().domain() != room_id_domain {
            return denied("create sender's domain does not own the room id");
        }
        return Ok(AuthOutcome::Allowed);
    }

    if state.get(("m.room.create", "")).is_none() {
        return denied("no create event in authorizing state");
    }

    // a dead room accepts nothing but another tombstone
    if state.get(("m.room.tombstone", "")).is_some() && pdu.ty() != "m.room.tombstone" {
        return denied("room has been tombstoned");
    }

    let creator = room_creator(db, state).await?;
    let power_levels = state
        .get_content::<PowerLevels>(db, "")
        .await?
        .unwrap_or_else(|| PowerLevels::no_event_default_levels(&creator));

    if let EventContent::Member(member) = &content {
        return member_check(db, pdu, member, state, &creator, &power_levels).await;
    }

    let sender_membership = state
        .get_content::<Member>(db, pdu.sender().as_str())
        .await?
        .map(|c| c.membership);

    if sender_membership != Some(Membership::Join) {
        return denied("sender is not in the room");
    }

    let sender_level = power_levels.user_level(pdu.sender());

    if let EventContent::PowerLevels(new_power_levels) = &content {
        return power_levels_check(pdu, state, &power_levels, new_power_levels, sender_level);
    }

    if sender_level < power_levels.event_level(pdu.ty(), pdu.state_key().is_some()) {
        return denied("sender's power level cannot send this event type");
    }

    // state keys that name a user are reserved for that user
    if let Some(state_key) = pdu.state_key() {
        if state_key.starts_with('@') && state_key != pdu.sender().as_str() {
            return denied("user-scoped state key owned by someone else");
        }
    }

    if let EventContent::Redaction(redaction) = &content {
        if sender_level >= power_levels.redact {
            return Ok(AuthOutcome::Allowed);
        }
        // senders may redact their own events in the same room
        if let Some(target_id) = &redaction.redacts {
            if let Some(target) = db.get_pdu(pdu.room_id(), target_id).await? {
                if target.sender() == pdu.sender() {
                    return Ok(AuthOutcome::Allowed);
                }
            }
        }
        return denied("sender may not redact others' events");
    }

    Ok(AuthOutcome::Allowed)
}

async fn member_check(
    db: &dyn Storage,
    pdu: &VersionedPdu,
    member: &Member,
    state: &State,
    creator: &MatrixId,
    power_levels: &PowerLevels,
) -> Result<AuthOutcome, Error> {
    let target = match pdu.state_key() {
        Some(key) => match MatrixId::try_from(key) {
            Ok(id) => id,
            Err(_) => return denied("membership event's state key is not a user id"),
        },
        None => return denied("membership event without a state key"),
    };

    let sender_membership = state
        .get_content::<Member>(db, pdu.sender().as_str())
        .await?
        .map(|c| c.membership);
    let target_membership = state
        .get_content::<Member>(db, target.as_str())
        .await?
        .map(|c| c.membership);
    let sender_level = power_levels.user_level(pdu.sender());

    match member.membership {
        Membership::Join => {
            // users can't set other users' membership to join
            if target != *pdu.sender() {
                return denied("sender tried to join on someone else's behalf");
            }

            // the creator's first join, right after creation
            if pdu.prev_events().len() == 1 {
                if let Some(prev) = db.get_pdu(pdu.room_id(), &pdu.prev_events()[0]).await? {
                    if prev.ty() == "m.room.create" && pdu.sender() == creator {
                        return Ok(AuthOutcome::Allowed);
                    }
                }
            }

            if target_membership == Some(Membership::Ban) {
                return denied("user is banned from the room");
            }

            let join_rules = state.get_content::<JoinRules>(db, "").await?;
            let join_rule = join_rules.as_ref().map(|c| c.join_rule);

            if join_rule == Some(JoinRule::Public) {
                return Ok(AuthOutcome::Allowed);
            }
            if matches!(target_membership, Some(Membership::Join) | Some(Membership::Invite)) {
                return Ok(AuthOutcome::Allowed);
            }
            if matches!(join_rule, Some(JoinRule::Restricted) | Some(JoinRule::KnockRestricted)) {
                return restricted_join_check(db, member, state, power_levels).await;
            }
            denied("room is not public and user was not invited")
        },
        Membership::Invite => {
            if sender_membership != Some(Membership::Join) {
                return denied("inviter is not in the room");
            }
            match target_membership {
                Some(Membership::Join) => denied("invitee is already in the room"),
                Some(Membership::Ban) => denied("invitee is banned from the room"),
                _ if sender_level >= power_levels.invite => Ok(AuthOutcome::Allowed),
                _ => denied("sender's power level cannot invite"),
            }
        },
        Membership::Leave => {
            // leaving of one's own accord, including declining an invite or
            // retracting a knock
            if target == *pdu.sender() {
                return match sender_membership {
                    Some(Membership::Join) | Some(Membership::Invite)
                    | Some(Membership::Knock) => Ok(AuthOutcome::Allowed),
                    _ => denied("cannot leave a room one is not in"),
                };
            }

            if sender_membership != Some(Membership::Join) {
                return denied("kicker is not in the room");
            }
            if target_membership == Some(Membership::Ban) && sender_level < power_levels.ban {
                return denied("cannot lift a ban without ban power");
            }
            let target_level = power_levels.user_level(&target);
            if sender_level >= power_levels.kick && sender_level > target_level {
                Ok(AuthOutcome::Allowed)
            } else {
                denied("sender's power level cannot kick this user")
            }
        },
        Membership::Ban => {
            if sender_membership != Some(Membership::Join) {
                return denied("banner is not in the room");
            }
            let target_level = power_levels.user_level(&target);
            if sender_level >= power_levels.ban && sender_level > target_level {
                Ok(AuthOutcome::Allowed)
            } else {
                denied("sender's power level cannot ban this user")
            }
        },
        Membership::Knock => {
            let join_rules = state.get_content::<JoinRules>(db, "").await?;
            let join_rule = join_rules.as_ref().map(|c| c.join_rule);
            if !matches!(join_rule, Some(JoinRule::Knock) | Some(JoinRule::KnockRestricted)) {
                return denied("room does not accept knocks");
            }
            if target != *pdu.sender() {
                return denied("sender tried to knock on someone else's behalf");
            }
            match sender_membership {
                Some(Membership::Ban) => denied("banned users cannot knock"),
                Some(Membership::Join) => denied("joined users cannot knock"),
                Some(Membership::Invite) => denied("invited users need not knock"),
                _ => Ok(AuthOutcome::Allowed),
            }
        },
    }
}

/// Restricted rooms admit a join when a resident user with invite power
/// vouches for it via `join_authorised_via_users_server`.
async fn restricted_join_check(
    db: &dyn Storage,
    member: &Member,
    state: &State,
    power_levels: &PowerLevels,
) -> Result<AuthOutcome, Error> {
    let authorising = match &member.join_authorised_via_users_server {
        Some(user) => user,
        None => return denied("restricted join carries no authorising user"),
    };
    // the event must additionally be signed by the authorising user's server;
    // the ingress pipeline enforces that signature
    let authorising_membership = state
        .get_content::<Member>(db, authorising.as_str())
        .await?
        .map(|c| c.membership);
    if authorising_membership != Some(Membership::Join) {
        return denied("authorising user is not in the room");
    }
    if power_levels.user_level(authorising) < power_levels.invite {
        return denied("authorising user cannot invite");
    }
    Ok(AuthOutcome::Allowed)
}

fn power_levels_check(
    pdu: &VersionedPdu,
    state: &State,
    old: &PowerLevels,
    new: &PowerLevels,
    sender_level: i64,
) -> Result<AuthOutcome, Error> {
    // the first power_levels event in a room is unconstrained
    if state.get(("m.room.power_levels", "")).is_none() {
        return Ok(AuthOutcome::Allowed);
    }

    let fixed = [
        ("ban", old.ban, new.ban),
        ("invite", old.invite, new.invite),
        ("kick", old.kick, new.kick),
        ("redact", old.redact, new.redact),
        ("events_default", old.events_default, new.events_default),
        ("state_default", old.state_default, new.state_default),
        ("users_default", old.users_default, new.users_default),
    ];
    for (name, old_value, new_value) in fixed {
        if old_value != new_value && (old_value > sender_level || new_value > sender_level) {
            return denied(format!("cannot move the {} level past one's own", name));
        }
    }

    for (key, new_value) in new.events.iter() {
        let old_value = old.events.get(key);
        if old_value != Some(new_value) {
            if *new_value > sender_level {
                return denied("cannot raise an event level above one's own");
            }
            if old_value.map(|v| *v > sender_level) == Some(true) {
                return denied("cannot change an event level set above one's own");
            }
        }
    }
    for (key, old_value) in old.events.iter() {
        if new.events.get(key).is_none() && *old_value > sender_level {
            return denied("cannot remove an event level set above one's own");
        }
    }

    for (key, new_value) in new.users.iter() {
        let old_value = old.users.get(key);
        if old_value != Some(new_value) {
            if *new_value > sender_level {
                return denied("cannot promote a user above one's own level");
            }
            if old_value.map(|v| *v > sender_level) == Some(true) {
                return denied("cannot demote a user from above one's own level");
            }
            // demoting an equal requires it to be oneself
            if old_value == Some(&sender_level) && key.as_str() != pdu.sender().as_str() {
                return denied("cannot change the level of a user at one's own level");
            }
        }
    }
    for (key, old_value) in old.users.iter() {
        if new.users.get(key).is_none() && *old_value > sender_level {
            return denied("cannot drop a user entry set above one's own level");
        }
    }

    Ok(AuthOutcome::Allowed)
}

/// The creator of the room named by the snapshot's create event. Current room
/// versions treat the create event's sender as the creator; the deprecated
/// content field is honoured when present.
pub async fn room_creator(db: &dyn Storage, state: &State) -> Result<MatrixId, Error> {
    let create_id = state
        .get(("m.room.create", ""))
        .ok_or_else(|| ErrorKind::InvalidEvent("state has no create event".to_owned()))?;
    let create = db
        .get_pdu(state.room_id(), create_id)
        .await?
        .ok_or(ErrorKind::NotFound)?;
    let content = create.event_content()?;
    if let EventContent::Create(create_content) = content {
        if let Some(creator) = create_content.creator {
            return Ok(creator);
        }
    }
    Ok(create.sender().clone())
}

/// The state slots an event's authorization depends on; its auth_events must
/// name the events occupying them.
pub fn auth_types_for_event(pdu: &VersionedPdu) -> HashSet<(String, String)> {
    auth_types(pdu.ty(), pdu.state_key(), pdu.content(), pdu.sender())
}

pub fn auth_types(
    ty: &str,
    state_key: Option<&str>,
    content: &serde_json::Value,
    sender: &MatrixId,
) -> HashSet<(String, String)> {
    let mut ret = HashSet::new();
    if ty == "m.room.create" {
        return ret;
    }

    ret.insert(("m.room.create".to_owned(), String::new()));
    ret.insert(("m.room.member".to_owned(), sender.clone_inner()));
    ret.insert(("m.room.power_levels".to_owned(), String::new()));

    if ty == "m.room.member" {
        if let Some(state_key) = state_key {
            ret.insert(("m.room.member".to_owned(), state_key.to_owned()));
        }
        let membership = content.get("membership").and_then(|m| m.as_str());
        if matches!(membership, Some("join") | Some("invite") | Some("knock")) {
            ret.insert(("m.room.join_rules".to_owned(), String::new()));
        }
        if let Some(authorising) = content
            .get("join_authorised_via_users_server")
            .and_then(|v| v.as_str())
        {
            ret.insert(("m.room.member".to_owned(), authorising.to_owned()));
        }
    }

    ret
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value as JsonValue};

    use super::*;
    use crate::{
        events::{room_version::UnhashedPdu, StoredPdu},
        storage::{mem::MemStorageManager, StorageManager},
    };

    const ROOM: &str = "!auth:example.org";

    fn mxid(s: &str) -> MatrixId {
        MatrixId::try_from(s).unwrap()
    }

    fn event(
        sender: &str,
        ty: &str,
        state_key: Option<&str>,
        content: JsonValue,
        prev_events: Vec<String>,
        depth: i64,
    ) -> VersionedPdu {
        VersionedPdu::V11(
            UnhashedPdu {
                room_id: ROOM.to_owned(),
                sender: mxid(sender),
                origin_server_ts: depth,
                ty: ty.to_owned(),
                state_key: state_key.map(String::from),
                content,
                prev_events,
                depth,
                auth_events: vec![],
                unsigned: None,
            }
            .finalize()
            .unwrap(),
        )
    }

    struct Fixture {
        db: Box<dyn Storage>,
        state: State,
        tip: String,
    }

    impl Fixture {
        async fn apply(&mut self, pdu: VersionedPdu) -> String {
            let stored = StoredPdu::accepted(pdu).unwrap();
            self.db.add_pdus(&[stored.clone()]).await.unwrap();
            if stored.state_key().is_some() {
                self.state.insert_event(&stored);
            }
            self.tip = stored.event_id().to_owned();
            stored.event_id().to_owned()
        }
    }

    /// alice owns the room at level 100, bob is joined at 50, invites need
    /// 60, everything else is at the usual defaults.
    async fn fixture() -> Fixture {
        let manager = MemStorageManager::new();
        let db = manager.get_handle().await.unwrap();
        let mut f = Fixture { db, state: State::new(ROOM), tip: String::new() };

        let create = event(
            "@alice:example.org",
            "m.room.create",
            Some(""),
            json!({"room_version": "11"}),
            vec![],
            0,
        );
        let create_id = f.apply(create).await;
        let join = event(
            "@alice:example.org",
            "m.room.member",
            Some("@alice:example.org"),
            json!({"membership": "join"}),
            vec![create_id],
            1,
        );
        let join_id = f.apply(join).await;
        let levels = event(
            "@alice:example.org",
            "m.room.power_levels",
            Some(""),
            json!({
                "users": {"@alice:example.org": 100, "@bob:example.org": 50},
                "users_default": 0,
                "events_default": 0,
                "state_default": 50,
                "invite": 60,
                "kick": 50,
                "ban": 50,
                "redact": 50,
            }),
            vec![join_id],
            2,
        );
        let levels_id = f.apply(levels).await;
        let rules = event(
            "@alice:example.org",
            "m.room.join_rules",
            Some(""),
            json!({"join_rule": "public"}),
            vec![levels_id],
            3,
        );
        let rules_id = f.apply(rules).await;
        let bob = event(
            "@bob:example.org",
            "m.room.member",
            Some("@bob:example.org"),
            json!({"membership": "join"}),
            vec![rules_id],
            4,
        );
        f.apply(bob).await;
        f
    }

    async fn check(f: &Fixture, pdu: &VersionedPdu) -> AuthOutcome {
        auth_check(&*f.db, pdu, &f.state).await.unwrap()
    }

    #[tokio::test]
    async fn create_rules() {
        let f = fixture().await;
        let empty = State::new(ROOM);

        let good = event(
            "@alice:example.org",
            "m.room.create",
            Some(""),
            json!({"room_version": "11"}),
            vec![],
            0,
        );
        assert!(auth_check(&*f.db, &good, &empty).await.unwrap().allowed());

        let with_prev = event(
            "@alice:example.org",
            "m.room.create",
            Some(""),
            json!({"room_version": "11"}),
            vec!["$parent".to_owned()],
            1,
        );
        assert!(!auth_check(&*f.db, &with_prev, &empty).await.unwrap().allowed());

        let foreign = event(
            "@alice:elsewhere.test",
            "m.room.create",
            Some(""),
            json!({"room_version": "11"}),
            vec![],
            0,
        );
        assert!(!auth_check(&*f.db, &foreign, &empty).await.unwrap().allowed());
    }

    #[tokio::test]
    async fn membership_gates_messages() {
        let f = fixture().await;
        let from_bob = event(
            "@bob:example.org",
            "m.room.message",
            None,
            json!({"body": "hi"}),
            vec![f.tip.clone()],
            5,
        );
        assert!(check(&f, &from_bob).await.allowed());

        let from_stranger = event(
            "@carol:example.org",
            "m.room.message",
            None,
            json!({"body": "hi"}),
            vec![f.tip.clone()],
            5,
        );
        assert!(!check(&f, &from_stranger).await.allowed());
    }

    #[tokio::test]
    async fn invite_needs_the_invite_level() {
        let f = fixture().await;
        // bob sits at 50, invites need 60
        let from_bob = event(
            "@bob:example.org",
            "m.room.member",
            Some("@carol:example.org"),
            json!({"membership": "invite"}),
            vec![f.tip.clone()],
            5,
        );
        assert!(!check(&f, &from_bob).await.allowed());

        let from_alice = event(
            "@alice:example.org",
            "m.room.member",
            Some("@carol:example.org"),
            json!({"membership": "invite"}),
            vec![f.tip.clone()],
            5,
        );
        assert!(check(&f, &from_alice).await.allowed());
    }

    #[tokio::test]
    async fn bans_respect_the_ladder() {
        let f = fixture().await;
        let bob_bans_alice = event(
            "@bob:example.org",
            "m.room.member",
            Some("@alice:example.org"),
            json!({"membership": "ban"}),
            vec![f.tip.clone()],
            5,
        );
        assert!(!check(&f, &bob_bans_alice).await.allowed());

        let alice_bans_bob = event(
            "@alice:example.org",
            "m.room.member",
            Some("@bob:example.org"),
            json!({"membership": "ban"}),
            vec![f.tip.clone()],
            5,
        );
        assert!(check(&f, &alice_bans_bob).await.allowed());
    }

    #[tokio::test]
    async fn self_leave_and_kicks() {
        let f = fixture().await;
        let bob_leaves = event(
            "@bob:example.org",
            "m.room.member",
            Some("@bob:example.org"),
            json!({"membership": "leave"}),
            vec![f.tip.clone()],
            5,
        );
        assert!(check(&f, &bob_leaves).await.allowed());

        // kicking upwards is refused
        let bob_kicks_alice = event(
            "@bob:example.org",
            "m.room.member",
            Some("@alice:example.org"),
            json!({"membership": "leave"}),
            vec![f.tip.clone()],
            5,
        );
        assert!(!check(&f, &bob_kicks_alice).await.allowed());
    }

    #[tokio::test]
    async fn power_level_changes_are_bounded_by_ones_own() {
        let f = fixture().await;
        // bob promoting himself past alice
        let self_promotion = event(
            "@bob:example.org",
            "m.room.power_levels",
            Some(""),
            json!({
                "users": {"@alice:example.org": 100, "@bob:example.org": 99},
                "invite": 60,
            }),
            vec![f.tip.clone()],
            5,
        );
        assert!(!check(&f, &self_promotion).await.allowed());

        // bob moving a fixed level above himself
        let ban_raise = event(
            "@bob:example.org",
            "m.room.power_levels",
            Some(""),
            json!({
                "users": {"@alice:example.org": 100, "@bob:example.org": 50},
                "invite": 60,
                "ban": 100,
            }),
            vec![f.tip.clone()],
            5,
        );
        assert!(!check(&f, &ban_raise).await.allowed());

        // alice demoting bob is fine
        let demotion = event(
            "@alice:example.org",
            "m.room.power_levels",
            Some(""),
            json!({
                "users": {"@alice:example.org": 100, "@bob:example.org": 0},
                "invite": 60,
            }),
            vec![f.tip.clone()],
            5,
        );
        assert!(check(&f, &demotion).await.allowed());
    }

    #[tokio::test]
    async fn user_scoped_state_keys_are_reserved() {
        let f = fixture().await;
        let impersonation = event(
            "@bob:example.org",
            "m.widget",
            Some("@alice:example.org"),
            json!({}),
            vec![f.tip.clone()],
            5,
        );
        assert!(!check(&f, &impersonation).await.allowed());
    }

    #[tokio::test]
    async fn tombstones_seal_the_room() {
        let mut f = fixture().await;
        let tombstone = event(
            "@alice:example.org",
            "m.room.tombstone",
            Some(""),
            json!({"replacement_room": "!next:example.org"}),
            vec![f.tip.clone()],
            5,
        );
        assert!(check(&f, &tombstone).await.allowed());
        f.apply(tombstone).await;

        let after = event(
            "@alice:example.org",
            "m.room.name",
            Some(""),
            json!({"name": "too late"}),
            vec![f.tip.clone()],
            6,
        );
        assert!(!check(&f, &after).await.allowed());
    }
}
