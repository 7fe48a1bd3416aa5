use std::collections::HashMap;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::util::MatrixId;

/// Typed view of a state event's content. The wire keeps content as opaque
/// JSON; these are parsed on demand where the auth rules or the resolver need
/// to look inside.
pub trait EventType: DeserializeOwned {
    const EVENT_TYPE: &'static str;
}

macro_rules! event_type {
    ($ty:ty, $name:literal) => {
        impl EventType for $ty {
            const EVENT_TYPE: &'static str = $name;
        }
    };
}

/// m.room.create
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Create {
    /// Deprecated in current room versions; the creator is the event sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<MatrixId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predecessor: Option<PreviousRoom>,
    #[serde(flatten)]
    pub extra: HashMap<String, JsonValue>,
}

event_type!(Create, "m.room.create");

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PreviousRoom {
    pub room_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

/// m.room.join_rules
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct JoinRules {
    pub join_rule: JoinRule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow: Option<Vec<AllowRule>>,
}

event_type!(JoinRules, "m.room.join_rules");

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinRule {
    Public,
    Knock,
    Invite,
    Private,
    Restricted,
    KnockRestricted,
}

/// An entry in a restricted room's `allow` list.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AllowRule {
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
}

/// m.room.member
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Member {
    pub membership: Membership,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displayname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_direct: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// For restricted joins: the resident user vouching for this join.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_authorised_via_users_server: Option<MatrixId>,
}

event_type!(Member, "m.room.member");

impl Member {
    pub fn new(membership: Membership) -> Self {
        Member {
            membership,
            avatar_url: None,
            displayname: None,
            is_direct: None,
            reason: None,
            join_authorised_via_users_server: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Membership {
    Invite,
    Join,
    Knock,
    Leave,
    Ban,
}

/// m.room.power_levels. All levels default per the current room version when
/// the field is absent from the event.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PowerLevels {
    pub ban: i64,
    pub events: HashMap<String, i64>,
    pub events_default: i64,
    pub invite: i64,
    pub kick: i64,
    pub redact: i64,
    pub state_default: i64,
    pub users: HashMap<String, i64>,
    pub users_default: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notifications: Option<Notifications>,
}

event_type!(PowerLevels, "m.room.power_levels");

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Notifications {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<i64>,
}

impl Default for PowerLevels {
    fn default() -> Self {
        PowerLevels {
            ban: 50,
            events: HashMap::new(),
            events_default: 0,
            invite: 0,
            kick: 50,
            redact: 50,
            state_default: 50,
            users: HashMap::new(),
            users_default: 0,
            notifications: None,
        }
    }
}

impl PowerLevels {
    /// The levels in effect when the room has no power_levels event at all:
    /// the creator is at 100, everyone else at 0, and any member may send
    /// state.
    pub fn no_event_default_levels(creator: &MatrixId) -> Self {
        let mut users = HashMap::new();
        users.insert(creator.clone_inner(), 100);
        PowerLevels {
            ban: 50,
            events: HashMap::new(),
            events_default: 0,
            invite: 0,
            kick: 50,
            redact: 50,
            state_default: 0,
            users,
            users_default: 0,
            notifications: None,
        }
    }

    pub fn user_level(&self, user: &MatrixId) -> i64 {
        self.users.get(user.as_str()).copied().unwrap_or(self.users_default)
    }

    pub fn event_level(&self, event_type: &str, is_state: bool) -> i64 {
        match self.events.get(event_type) {
            Some(&level) => level,
            None if is_state => self.state_default,
            None => self.events_default,
        }
    }
}

/// m.room.history_visibility
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HistoryVisibility {
    pub history_visibility: HistoryVisibilityType,
}

event_type!(HistoryVisibility, "m.room.history_visibility");

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryVisibilityType {
    Invited,
    Joined,
    Shared,
    WorldReadable,
}

/// m.room.guest_access
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GuestAccess {
    pub guest_access: GuestAccessType,
}

event_type!(GuestAccess, "m.room.guest_access");

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuestAccessType {
    CanJoin,
    Forbidden,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Name {
    pub name: String,
}

event_type!(Name, "m.room.name");

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Topic {
    pub topic: String,
}

event_type!(Topic, "m.room.topic");

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CanonicalAlias {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alt_aliases: Vec<String>,
}

event_type!(CanonicalAlias, "m.room.canonical_alias");

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Avatar {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

event_type!(Avatar, "m.room.avatar");

/// m.room.redaction. In current room versions the target lives in content.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Redaction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

event_type!(Redaction, "m.room.redaction");

/// m.room.tombstone
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Tombstone {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub replacement_room: String,
}

event_type!(Tombstone, "m.room.tombstone");

/// m.room.server_acl
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServerAcl {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default = "default_true")]
    pub allow_ip_literals: bool,
}

event_type!(ServerAcl, "m.room.server_acl");

fn default_true() -> bool {
    true
}
