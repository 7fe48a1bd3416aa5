use std::{collections::HashMap, sync::Arc, time::Duration};

use actix_web::http::Method;
use hickory_resolver::{
    config::{ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};
use itertools::Itertools;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde_json::{json, Value as JsonValue};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::{
    error::{Error, ErrorKind},
    sign::{sign_json, SigningKey},
    storage::Storage,
    util::MatrixId,
};

use super::{request_signing_object, XMatrix};

const FALLBACK_PORT: u16 = 8448;
const REQUEST_DEADLINE: Duration = Duration::from_secs(30);
const RETRIES: u32 = 2;
const BACKOFF_BASE_MS: u64 = 500;

const WELL_KNOWN_TTL_MS: i64 = 24 * 60 * 60 * 1000;
const DNS_TTL_MS: i64 = 60 * 60 * 1000;

/// Where a server name actually lives: the URL to connect to and the Host
/// header to present.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolvedDestination {
    pub base_url: String,
    pub host_header: String,
}

#[derive(Clone)]
struct CachedDestination {
    destination: ResolvedDestination,
    expires_at: i64,
}

pub struct FederationClient {
    http: awc::Client,
    server_name: String,
    key: Arc<SigningKey>,
    dns: TokioAsyncResolver,
    destinations: RwLock<HashMap<String, CachedDestination>>,
}

impl FederationClient {
    pub fn new(server_name: String, key: Arc<SigningKey>) -> Self {
        FederationClient {
            http: awc::Client::builder().timeout(REQUEST_DEADLINE).finish(),
            server_name,
            key,
            dns: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
            destinations: RwLock::new(HashMap::new()),
        }
    }

    /// Resolves a server name per the federation discovery order: IP literals
    /// and explicit ports as given, then `.well-known` delegation, then SRV,
    /// then the well-known port on the name itself.
    pub async fn resolve_destination(&self, server: &str) -> Result<ResolvedDestination, Error> {
        let now = chrono::Utc::now().timestamp_millis();
        if let Some(cached) = self.destinations.read().await.get(server) {
            if cached.expires_at > now {
                return Ok(cached.destination.clone());
            }
        }

        let (destination, ttl) = self.resolve_uncached(server).await;
        self.destinations.write().await.insert(
            server.to_owned(),
            CachedDestination { destination: destination.clone(), expires_at: now + ttl },
        );
        Ok(destination)
    }

    async fn resolve_uncached(&self, server: &str) -> (ResolvedDestination, i64) {
        // IP literal or explicit port: connect as given
        if server_has_explicit_target(server) {
            let destination = ResolvedDestination {
                base_url: format!("https://{}", server),
                host_header: server.to_owned(),
            };
            return (destination, DNS_TTL_MS);
        }

        if let Some(delegated) = self.fetch_well_known(server).await {
            // delegated names with a port are final; bare ones go through SRV
            let destination = if server_has_explicit_target(&delegated) {
                ResolvedDestination {
                    base_url: format!("https://{}", delegated),
                    host_header: delegated.clone(),
                }
            } else if let Some((target, port)) = self.lookup_srv(&delegated).await {
                ResolvedDestination {
                    base_url: format!("https://{}:{}", target, port),
                    host_header: delegated.clone(),
                }
            } else {
                ResolvedDestination {
                    base_url: format!("https://{}:{}", delegated, FALLBACK_PORT),
                    host_header: delegated.clone(),
                }
            };
            return (destination, WELL_KNOWN_TTL_MS);
        }

        if let Some((target, port)) = self.lookup_srv(server).await {
            let destination = ResolvedDestination {
                base_url: format!("https://{}:{}", target, port),
                host_header: server.to_owned(),
            };
            return (destination, DNS_TTL_MS);
        }

        let destination = ResolvedDestination {
            base_url: format!("https://{}:{}", server, FALLBACK_PORT),
            host_header: server.to_owned(),
        };
        (destination, DNS_TTL_MS)
    }

    async fn fetch_well_known(&self, server: &str) -> Option<String> {
        let url = format!("https://{}/.well-known/matrix/server", server);
        let mut response = self
            .http
            .get(url.as_str())
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body: JsonValue = response.json().await.ok()?;
        let delegated = body.get("m.server")?.as_str()?.to_owned();
        debug!(%server, %delegated, "well-known delegation");
        Some(delegated)
    }

    async fn lookup_srv(&self, server: &str) -> Option<(String, u16)> {
        for service in ["_matrix-fed._tcp", "_matrix._tcp"] {
            let name = format!("{}.{}.", service, server);
            if let Ok(lookup) = self.dns.srv_lookup(name).await {
                let mut records: Vec<_> = lookup.iter().collect();
                records.sort_by_key(|srv| (srv.priority(), std::cmp::Reverse(srv.weight())));
                if let Some(srv) = records.first() {
                    let target = srv.target().to_utf8();
                    return Some((target.trim_end_matches('.').to_owned(), srv.port()));
                }
            }
        }
        None
    }

    /// Sends a signed federation request, retrying transient failures with
    /// exponential backoff. The X-Matrix signature covers method, uri,
    /// origin, destination and the parsed body.
    pub async fn send_request(
        &self,
        method: Method,
        destination: &str,
        path_and_query: &str,
        content: Option<&JsonValue>,
    ) -> Result<JsonValue, Error> {
        let resolved = self.resolve_destination(destination).await?;

        let mut signing_object = request_signing_object(
            method.as_str(),
            path_and_query,
            &self.server_name,
            destination,
            content,
        )?;
        sign_json(&self.server_name, &self.key, &mut signing_object);
        let sig = signing_object["signatures"].as_object().unwrap()[&self.server_name]
            .as_object()
            .unwrap()[self.key.key_id()]
            .as_str()
            .unwrap()
            .to_owned();
        let auth = XMatrix {
            origin: self.server_name.clone(),
            destination: Some(destination.to_owned()),
            key: self.key.key_id().to_owned(),
            sig,
        };

        let url = format!("{}{}", resolved.base_url, path_and_query);
        let mut last_error: Error = ErrorKind::Unreachable(destination.to_owned()).into();
        for attempt in 0..=RETRIES {
            if attempt > 0 {
                let backoff = BACKOFF_BASE_MS * (1 << (attempt - 1));
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }

            let request = self
                .http
                .request(method.clone(), url.as_str())
                .insert_header(("Host", resolved.host_header.as_str()))
                .insert_header(("Authorization", auth.to_header_value()));
            let result = match content {
                Some(body) => request.send_json(body).await,
                None => request.send().await,
            };

            let mut response = match result {
                Ok(response) => response,
                Err(e) => {
                    debug!(%destination, %url, error = %e, "federation request failed");
                    last_error = ErrorKind::Unreachable(format!("{}: {}", destination, e)).into();
                    continue;
                },
            };

            if response.status().is_server_error() {
                last_error =
                    ErrorKind::RemoteError(format!("{} from {}", response.status(), destination))
                        .into();
                continue;
            }

            let body: JsonValue = response
                .json()
                .limit(50 * 1024 * 1024)
                .await
                .map_err(|e| ErrorKind::RemoteError(format!("bad json from peer: {}", e)))?;

            if !response.status().is_success() {
                let errcode = body
                    .get("errcode")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("M_UNKNOWN");
                return match response.status().as_u16() {
                    404 => Err(ErrorKind::NotFound.into()),
                    403 => Err(ErrorKind::Forbidden.into()),
                    _ => Err(ErrorKind::RemoteError(format!(
                        "{} {} from {}",
                        response.status(),
                        errcode,
                        destination
                    ))
                    .into()),
                };
            }

            return Ok(body);
        }

        Err(last_error)
    }

    /// Unauthenticated GET; the key publication endpoint needs no signature.
    pub async fn get_unsigned(
        &self,
        destination: &str,
        path: &str,
    ) -> Result<JsonValue, Error> {
        let resolved = self.resolve_destination(destination).await?;
        let url = format!("{}{}", resolved.base_url, path);
        let mut response = self
            .http
            .get(url.as_str())
            .insert_header(("Host", resolved.host_header.as_str()))
            .send()
            .await
            .map_err(|e| ErrorKind::Unreachable(format!("{}: {}", destination, e)))?;
        if !response.status().is_success() {
            return Err(ErrorKind::RemoteError(format!(
                "{} from {}",
                response.status(),
                destination
            ))
            .into());
        }
        response
            .json()
            .limit(1024 * 1024)
            .await
            .map_err(|e| ErrorKind::RemoteError(format!("bad json from peer: {}", e)).into())
    }

    pub async fn get_server_keys(&self, destination: &str) -> Result<JsonValue, Error> {
        self.get_unsigned(destination, "/_matrix/key/v2/server").await
    }

    pub async fn make_join(
        &self,
        destination: &str,
        room_id: &str,
        user_id: &MatrixId,
        versions: &[&str],
    ) -> Result<JsonValue, Error> {
        let ver = versions.iter().map(|v| format!("ver={}", v)).join("&");
        let path = format!(
            "/_matrix/federation/v1/make_join/{}/{}?{}",
            escape(room_id),
            escape(user_id.as_str()),
            ver,
        );
        self.send_request(Method::GET, destination, &path, None).await
    }

    pub async fn send_join(
        &self,
        destination: &str,
        room_id: &str,
        event_id: &str,
        event: &JsonValue,
    ) -> Result<JsonValue, Error> {
        let path = format!(
            "/_matrix/federation/v2/send_join/{}/{}",
            escape(room_id),
            escape(event_id),
        );
        self.send_request(Method::PUT, destination, &path, Some(event)).await
    }

    pub async fn send_invite(
        &self,
        destination: &str,
        room_id: &str,
        event_id: &str,
        body: &JsonValue,
    ) -> Result<JsonValue, Error> {
        let path = format!(
            "/_matrix/federation/v2/invite/{}/{}",
            escape(room_id),
            escape(event_id),
        );
        self.send_request(Method::PUT, destination, &path, Some(body)).await
    }

    pub async fn get_event(&self, destination: &str, event_id: &str) -> Result<JsonValue, Error> {
        let path = format!("/_matrix/federation/v1/event/{}", escape(event_id));
        self.send_request(Method::GET, destination, &path, None).await
    }

    pub async fn get_missing_events(
        &self,
        destination: &str,
        room_id: &str,
        earliest: &[String],
        latest: &[String],
        limit: u32,
    ) -> Result<JsonValue, Error> {
        let path =
            format!("/_matrix/federation/v1/get_missing_events/{}", escape(room_id));
        let body = json!({
            "earliest_events": earliest,
            "latest_events": latest,
            "limit": limit,
        });
        self.send_request(Method::POST, destination, &path, Some(&body)).await
    }

    /// Pushes a locally authored PDU to every other server in the room.
    /// Failures are logged and dropped; remote servers catch up via
    /// get_missing_events.
    pub async fn fan_out_pdu(&self, db: &dyn Storage, pdu_json: JsonValue, room_id: &str) {
        let servers = match db.get_servers_in_room(room_id).await {
            Ok(servers) => servers,
            Err(e) => {
                warn!(error = %e, "could not list servers for fan-out");
                return;
            },
        };
        let txn = json!({
            "origin": self.server_name,
            "origin_server_ts": chrono::Utc::now().timestamp_millis(),
            "pdus": [pdu_json],
            "edus": [],
        });
        let sends = servers
            .into_iter()
            .filter(|server| *server != self.server_name)
            .map(|server| {
                let txn = &txn;
                async move {
                    let path =
                        format!("/_matrix/federation/v1/send/{}", uuid::Uuid::new_v4());
                    if let Err(e) =
                        self.send_request(Method::PUT, &server, &path, Some(txn)).await
                    {
                        warn!(%server, error = %e, "pdu fan-out failed");
                    }
                }
            });
        futures::future::join_all(sends).await;
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }
}

fn server_has_explicit_target(server: &str) -> bool {
    if server.parse::<std::net::IpAddr>().is_ok() {
        return true;
    }
    if server.starts_with('[') {
        // IPv6 literal, with or without port
        return true;
    }
    match server.rsplit_once(':') {
        Some((_, port)) => port.parse::<u16>().is_ok(),
        None => false,
    }
}

fn escape(value: &str) -> String {
    utf8_percent_encode(value, NON_ALPHANUMERIC).to_string()
}
