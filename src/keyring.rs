use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::{
    canonical::{CanonicalObject, CanonicalValue},
    error::{Error, ErrorKind},
    events::VersionedPdu,
    federation::FederationClient,
    sign::{self, SigningKey},
};

/// How long our own published keys are advertised as valid.
const PUBLISH_VALIDITY_MS: i64 = 7 * 24 * 60 * 60 * 1000;
/// Cap on how long a remote key is trusted, regardless of what it publishes.
const REMOTE_VALIDITY_CAP_MS: i64 = 24 * 60 * 60 * 1000;
/// Negative-cache lifetime for keys a server turned out not to have.
const MISS_TTL_MS: i64 = 5 * 60 * 1000;

/// The signed key publication at `/_matrix/key/v2/server`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServerKeys {
    pub server_name: String,
    #[serde(default)]
    pub verify_keys: BTreeMap<String, VerifyKey>,
    #[serde(default)]
    pub old_verify_keys: BTreeMap<String, OldVerifyKey>,
    #[serde(default)]
    pub signatures: BTreeMap<String, BTreeMap<String, String>>,
    pub valid_until_ts: i64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct VerifyKey {
    /// Unpadded base64.
    pub key: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OldVerifyKey {
    pub expired_ts: i64,
    pub key: String,
}

#[derive(Clone, Debug)]
enum CacheEntry {
    Valid { key: Vec<u8>, expires_at: i64 },
    Missing { until: i64 },
}

/// Local signing plus a cache of other servers' verify keys. A lookup that
/// cannot produce a verifying key makes the dependent signature check fail;
/// it is never an exception.
pub struct Keyring {
    server_name: String,
    local: Arc<SigningKey>,
    cache: RwLock<HashMap<(String, String), CacheEntry>>,
    /// Per-server fetch coalescing: many PDUs from one peer should cost at
    /// most one outstanding key request.
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Keyring {
    pub fn new(server_name: String, local: Arc<SigningKey>) -> Self {
        Keyring {
            server_name,
            local,
            cache: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_key(&self) -> &SigningKey {
        &self.local
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// The self-signed body for our own key publication endpoint.
    pub fn publish_keys(&self) -> JsonValue {
        let mut object = CanonicalObject::new();
        object.insert(
            "server_name".to_owned(),
            CanonicalValue::String(self.server_name.clone()),
        );
        let mut verify_keys = CanonicalObject::new();
        let mut key_object = CanonicalObject::new();
        key_object.insert("key".to_owned(), CanonicalValue::String(self.local.public_key_b64()));
        verify_keys.insert(self.local.key_id().to_owned(), CanonicalValue::Object(key_object));
        object.insert("verify_keys".to_owned(), CanonicalValue::Object(verify_keys));
        object.insert(
            "old_verify_keys".to_owned(),
            CanonicalValue::Object(CanonicalObject::new()),
        );
        object.insert(
            "valid_until_ts".to_owned(),
            CanonicalValue::Integer(chrono::Utc::now().timestamp_millis() + PUBLISH_VALIDITY_MS),
        );
        sign::sign_json(&self.server_name, &self.local, &mut object);
        CanonicalValue::Object(object).into()
    }

    /// Seeds the cache directly; the fetch path uses this, and so do callers
    /// that learn keys out of band.
    pub async fn cache_key(&self, server: &str, key_id: &str, key: Vec<u8>, valid_until_ts: i64) {
        let expires_at =
            valid_until_ts.min(chrono::Utc::now().timestamp_millis() + REMOTE_VALIDITY_CAP_MS);
        self.cache
            .write()
            .await
            .insert((server.to_owned(), key_id.to_owned()), CacheEntry::Valid { key, expires_at });
    }

    /// Produces the verify key for `(server, key_id)`, fetching over
    /// federation if the cache can't answer. `None` means no key could be
    /// obtained and the caller's signature check must fail.
    pub async fn get_key(
        &self,
        client: Option<&FederationClient>,
        server: &str,
        key_id: &str,
    ) -> Result<Option<Vec<u8>>, Error> {
        if server == self.server_name && key_id == self.local.key_id() {
            return Ok(Some(sign::decode_b64(&self.local.public_key_b64()).unwrap()));
        }

        let now = chrono::Utc::now().timestamp_millis();
        if let Some(entry) = self.cache.read().await.get(&(server.to_owned(), key_id.to_owned()))
        {
            match entry {
                CacheEntry::Valid { key, expires_at } if *expires_at > now => {
                    return Ok(Some(key.clone()));
                },
                CacheEntry::Missing { until } if *until > now => return Ok(None),
                _ => {},
            }
        }

        let client = match client {
            Some(client) => client,
            None => return Ok(None),
        };

        let fetch_lock = {
            let mut inflight = self.inflight.lock().await;
            Arc::clone(inflight.entry(server.to_owned()).or_default())
        };
        let _guard = fetch_lock.lock().await;

        // someone else may have fetched while we queued
        if let Some(CacheEntry::Valid { key, expires_at }) =
            self.cache.read().await.get(&(server.to_owned(), key_id.to_owned()))
        {
            if *expires_at > now {
                return Ok(Some(key.clone()));
            }
        }

        match self.fetch_keys(client, server).await {
            Ok(()) => {},
            Err(e) => {
                debug!(%server, error = %e, "key fetch failed");
                self.cache.write().await.insert(
                    (server.to_owned(), key_id.to_owned()),
                    CacheEntry::Missing { until: now + MISS_TTL_MS },
                );
                return Ok(None);
            },
        }

        if let Some(CacheEntry::Valid { key, expires_at }) =
            self.cache.read().await.get(&(server.to_owned(), key_id.to_owned()))
        {
            if *expires_at > now {
                return Ok(Some(key.clone()));
            }
        }
        self.cache.write().await.insert(
            (server.to_owned(), key_id.to_owned()),
            CacheEntry::Missing { until: now + MISS_TTL_MS },
        );
        Ok(None)
    }

    /// Fetches a server's key publication and absorbs every key in it. The
    /// response must verify against one of the keys it itself announces (or
    /// a key of that server we already trust).
    async fn fetch_keys(&self, client: &FederationClient, server: &str) -> Result<(), Error> {
        let body = client.get_server_keys(server).await?;
        let object = match body.clone() {
            JsonValue::Object(map) => crate::canonical::object_from_json(map)
                .map_err(ErrorKind::NotCanonical)?,
            _ => return Err(ErrorKind::RemoteError("key response is not an object".into()).into()),
        };
        let keys: ServerKeys = serde_json::from_value(body)
            .map_err(|e| ErrorKind::RemoteError(format!("bad key response: {}", e)))?;

        if keys.server_name != server {
            return Err(ErrorKind::RemoteError("key response for the wrong server".into()).into());
        }

        let mut verified = false;
        for (key_id, verify_key) in keys.verify_keys.iter() {
            // prefer a previously known key, fall back to first-contact trust
            // in the announced key itself
            let known = self
                .cache
                .read()
                .await
                .get(&(server.to_owned(), key_id.to_owned()))
                .and_then(|entry| match entry {
                    CacheEntry::Valid { key, .. } => Some(key.clone()),
                    CacheEntry::Missing { .. } => None,
                });
            let candidate = match known {
                Some(key) => key,
                None => match sign::decode_b64(&verify_key.key) {
                    Ok(key) => key,
                    Err(_) => continue,
                },
            };
            if sign::verify_json(&object, server, key_id, &candidate).is_ok() {
                verified = true;
                break;
            }
        }
        if !verified {
            return Err(ErrorKind::SignatureInvalid(server.to_owned()).into());
        }

        for (key_id, verify_key) in keys.verify_keys {
            match sign::decode_b64(&verify_key.key) {
                Ok(key) => {
                    self.cache_key(server, &key_id, key, keys.valid_until_ts).await;
                },
                Err(_) => warn!(%server, %key_id, "unparseable published key"),
            }
        }
        Ok(())
    }

    /// Verifies that at least one of the origin server's signatures on the
    /// event checks out against a currently valid key.
    pub async fn verify_pdu(
        &self,
        client: Option<&FederationClient>,
        pdu: &VersionedPdu,
    ) -> Result<(), Error> {
        self.verify_pdu_signature_by(client, pdu, pdu.origin()).await
    }

    /// As `verify_pdu`, for a specific signing server (restricted joins are
    /// countersigned by the authorising user's server).
    pub async fn verify_pdu_signature_by(
        &self,
        client: Option<&FederationClient>,
        pdu: &VersionedPdu,
        server: &str,
    ) -> Result<(), Error> {
        for key_id in pdu.signature_key_ids(server) {
            if let Some(key) = self.get_key(client, server, &key_id).await? {
                if pdu.verify_signature(server, &key_id, &key).is_ok() {
                    return Ok(());
                }
            }
        }
        Err(ErrorKind::SignatureInvalid(server.to_owned()).into())
    }

    /// Verifies a signed JSON object (an X-Matrix request or an invite) by
    /// the given server and key id.
    pub async fn verify_object(
        &self,
        client: Option<&FederationClient>,
        server: &str,
        key_id: &str,
        object: &CanonicalObject,
    ) -> Result<(), Error> {
        match self.get_key(client, server, key_id).await? {
            Some(key) => sign::verify_json(object, server, key_id, &key),
            None => Err(ErrorKind::SignatureInvalid(server.to_owned()).into()),
        }
    }
}
