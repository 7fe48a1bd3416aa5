use regex::Regex;

use crate::{
    error::Error,
    events::{room::ServerAcl, EventContent},
    storage::Storage,
};

/// Whether the room's `m.room.server_acl` state admits PDUs from the given
/// server. Rooms without an ACL admit everyone. A malformed ACL (no usable
/// allow rule) denies everyone but is left to stand, matching how the rest
/// of the room's state treats it.
pub async fn server_allowed(db: &dyn Storage, room_id: &str, server: &str) -> Result<bool, Error> {
    let acl = match db.get_state_event(room_id, "m.room.server_acl", "").await? {
        Some(pdu) => match pdu.event_content()? {
            EventContent::ServerAcl(acl) => acl,
            _ => return Ok(true),
        },
        None => return Ok(true),
    };
    Ok(acl_allows(&acl, server))
}

fn acl_allows(acl: &ServerAcl, server: &str) -> bool {
    // strip an explicit port; bracketed IPv6 literals keep their brackets
    let hostname = if server.starts_with('[') {
        match server.find(']') {
            Some(i) => &server[..=i],
            None => server,
        }
    } else {
        server.split(':').next().unwrap_or(server)
    };

    if !acl.allow_ip_literals && is_ip_literal(hostname) {
        return false;
    }
    if acl.deny.iter().any(|pattern| glob_matches(pattern, hostname)) {
        return false;
    }
    acl.allow.iter().any(|pattern| glob_matches(pattern, hostname))
}

/// ACL patterns know `*` (any run of characters) and `?` (any one character).
fn glob_matches(pattern: &str, value: &str) -> bool {
    let mut regex = String::with_capacity(pattern.len() + 2);
    regex.push('^');
    for c in pattern.chars() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
    }
    regex.push('$');
    match Regex::new(&regex) {
        Ok(re) => re.is_match(value),
        Err(_) => false,
    }
}

fn is_ip_literal(hostname: &str) -> bool {
    hostname.parse::<std::net::IpAddr>().is_ok()
        || (hostname.starts_with('[') && hostname.ends_with(']'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::room::ServerAcl;

    fn acl(allow: &[&str], deny: &[&str], allow_ip_literals: bool) -> ServerAcl {
        ServerAcl {
            allow: allow.iter().map(|s| s.to_string()).collect(),
            deny: deny.iter().map(|s| s.to_string()).collect(),
            allow_ip_literals,
        }
    }

    #[test]
    fn deny_wins_over_allow() {
        let acl = acl(&["*"], &["evil.example.org"], true);
        assert!(acl_allows(&acl, "good.example.org"));
        assert!(!acl_allows(&acl, "evil.example.org"));
    }

    #[test]
    fn globs_and_ports() {
        let acl = acl(&["*.example.org"], &[], true);
        assert!(acl_allows(&acl, "matrix.example.org"));
        assert!(acl_allows(&acl, "matrix.example.org:8448"));
        assert!(!acl_allows(&acl, "example.com"));
        // dots in patterns are literal dots
        assert!(!acl_allows(&acl, "matrixXexampleYorg"));
    }

    #[test]
    fn empty_allow_denies_everyone() {
        let acl = acl(&[], &[], true);
        assert!(!acl_allows(&acl, "example.org"));
    }

    #[test]
    fn ip_literals() {
        let acl = acl(&["*"], &[], false);
        assert!(!acl_allows(&acl, "192.168.1.1"));
        assert!(!acl_allows(&acl, "[::1]:8448"));
        assert!(acl_allows(&acl, "example.org"));
    }
}
