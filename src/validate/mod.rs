pub mod acl;
pub mod auth;

pub use auth::{auth_check, auth_types_for_event, AuthOutcome};
