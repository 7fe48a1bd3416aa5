use std::path::Path;

use rand::Rng;
use ring::{
    rand::SystemRandom,
    signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519},
};
use tokio::fs;

use crate::{
    canonical::CanonicalObject,
    error::{Error, ErrorKind},
};

/// The server's signing key. There is exactly one live key; rotation produces
/// a new key id and moves the old one to `old_verify_keys`.
pub struct SigningKey {
    key_id: String,
    inner: Ed25519KeyPair,
}

impl SigningKey {
    /// `ed25519:<version>`
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn public_key_b64(&self) -> String {
        encode_standard(self.inner.public_key().as_ref())
    }

    pub fn sign(&self, message: &[u8]) -> String {
        encode_standard(self.inner.sign(message).as_ref())
    }

    #[cfg(test)]
    pub fn from_seed(seed: &[u8], version: &str) -> Self {
        SigningKey {
            key_id: format!("ed25519:{}", version),
            inner: Ed25519KeyPair::from_seed_unchecked(seed).unwrap(),
        }
    }
}

/// Loads the persisted keypair, generating and persisting one on first start.
pub async fn load_or_generate_key(data_dir: &Path) -> Result<SigningKey, Error> {
    let key_dir = data_dir.join("keys");
    fs::create_dir_all(&key_dir).await.map_err(io_err)?;

    let mut entries = fs::read_dir(&key_dir).await.map_err(io_err)?;
    while let Some(key_file) = entries.next_entry().await.map_err(io_err)? {
        let file_name = key_file.file_name();
        let key_id = match file_name.to_str() {
            Some(name) if name.starts_with("ed25519:") => name.to_owned(),
            _ => continue,
        };
        let contents = fs::read(key_file.path()).await.map_err(io_err)?;
        let inner = Ed25519KeyPair::from_pkcs8(&contents)
            .map_err(|_| ErrorKind::Unknown(format!("corrupt signing key {}", key_id)))?;
        tracing::info!(%key_id, "loaded signing key");
        return Ok(SigningKey { key_id, inner });
    }

    let version: String = rand::thread_rng()
        .sample_iter(rand::distributions::Alphanumeric)
        .map(char::from)
        .take(8)
        .collect();
    let key_id = format!("ed25519:{}", version);
    let document = Ed25519KeyPair::generate_pkcs8(&SystemRandom::new())
        .map_err(|_| ErrorKind::Unknown("key generation failed".to_owned()))?;
    fs::write(key_dir.join(&key_id), document.as_ref()).await.map_err(io_err)?;
    let inner = Ed25519KeyPair::from_pkcs8(document.as_ref())
        .map_err(|_| ErrorKind::Unknown("freshly generated key unreadable".to_owned()))?;
    tracing::info!(%key_id, "generated new signing key");
    Ok(SigningKey { key_id, inner })
}

fn io_err(e: std::io::Error) -> Error {
    ErrorKind::Unknown(format!("key storage io error: {}", e)).into()
}

/// The byte string a signature over a JSON object covers: the canonical form
/// of the object with `signatures` and `unsigned` removed.
pub fn signing_bytes(object: &CanonicalObject) -> String {
    let mut scratch = object.clone();
    scratch.remove("signatures");
    scratch.remove("unsigned");
    crate::canonical::CanonicalValue::Object(scratch).to_string()
}

/// Signs a JSON object in place, inserting the signature under
/// `signatures[server_name][key_id]`.
pub fn sign_json(server_name: &str, key: &SigningKey, object: &mut CanonicalObject) {
    use crate::canonical::CanonicalValue;

    let signature = key.sign(signing_bytes(object).as_bytes());
    let signatures = object
        .entry("signatures".to_owned())
        .or_insert_with(|| CanonicalValue::Object(CanonicalObject::new()));
    let by_server = signatures
        .as_object_mut()
        .expect("signatures is not an object")
        .entry(server_name.to_owned())
        .or_insert_with(|| CanonicalValue::Object(CanonicalObject::new()));
    by_server
        .as_object_mut()
        .expect("signature block is not an object")
        .insert(key.key_id().to_owned(), CanonicalValue::String(signature));
}

/// Verifies `signatures[server_name][key_id]` over the object against the
/// given public key.
pub fn verify_json(
    object: &CanonicalObject,
    server_name: &str,
    key_id: &str,
    public_key: &[u8],
) -> Result<(), Error> {
    let signature = object
        .get("signatures")
        .and_then(|v| v.as_object())
        .and_then(|m| m.get(server_name))
        .and_then(|v| v.as_object())
        .and_then(|m| m.get(key_id))
        .and_then(|v| v.as_str())
        .ok_or_else(|| ErrorKind::SignatureInvalid(server_name.to_owned()))?;
    let signature = decode_b64(signature)
        .map_err(|_| ErrorKind::SignatureInvalid(server_name.to_owned()))?;
    verify_raw(public_key, signing_bytes(object).as_bytes(), &signature)
        .then(|| ())
        .ok_or_else(|| ErrorKind::SignatureInvalid(server_name.to_owned()).into())
}

pub fn verify_raw(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    UnparsedPublicKey::new(&ED25519, public_key).verify(message, signature).is_ok()
}

/// Unpadded base64, standard alphabet: keys and signatures on the wire.
pub fn encode_standard(bytes: &[u8]) -> String {
    base64::encode_config(bytes, base64::STANDARD_NO_PAD)
}

/// Unpadded base64, URL-safe alphabet: content hashes and event ids.
pub fn encode_url_safe(bytes: &[u8]) -> String {
    base64::encode_config(bytes, base64::URL_SAFE_NO_PAD)
}

/// Accepts padded and unpadded input in either alphabet.
pub fn decode_b64(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let trimmed = s.trim_end_matches('=');
    base64::decode_config(trimmed, base64::STANDARD_NO_PAD)
        .or_else(|_| base64::decode_config(trimmed, base64::URL_SAFE_NO_PAD))
}

#[cfg(test)]
mod tests {
    use std::convert::TryFrom;

    use serde_json::json;

    use super::*;
    use crate::canonical::CanonicalValue;

    // seed from the signing appendix of the server-server spec
    const SEED_B64: &str = "YJDBA9Xnr2sVqXD9Vj7XVUnmFZcZrlw8Md7kMW+3XA1";

    fn test_key() -> SigningKey {
        SigningKey::from_seed(&decode_b64(SEED_B64).unwrap(), "1")
    }

    fn as_object(value: serde_json::Value) -> CanonicalObject {
        match CanonicalValue::try_from(value).unwrap() {
            CanonicalValue::Object(map) => map,
            _ => panic!("fixture is not an object"),
        }
    }

    #[test]
    fn known_answer_empty_object() {
        let mut object = as_object(json!({}));
        sign_json("domain", &test_key(), &mut object);
        let sig = object["signatures"].as_object().unwrap()["domain"]
            .as_object()
            .unwrap()["ed25519:1"]
            .as_str()
            .unwrap();
        assert_eq!(
            sig,
            "K8280/U9SSy9IVtjBuVeLr+HpOB4BQFWbg+UZaADMtTdGYI7Geitb76LTrr5QV/7Xg4ahLwYGYZzuHGZKM5ZAQ",
        );
    }

    #[test]
    fn known_answer_simple_object() {
        let mut object = as_object(json!({"one": 1, "two": "Two"}));
        sign_json("domain", &test_key(), &mut object);
        let sig = object["signatures"].as_object().unwrap()["domain"]
            .as_object()
            .unwrap()["ed25519:1"]
            .as_str()
            .unwrap();
        assert_eq!(
            sig,
            "KqmLSbO39/Bzb0QIYE82zqLwsA+PDzYIpIRA2sRQ4sL53+sN6/fpNSoqE7BP7vBZhG6kYdD13EIMJpvhJI+6Bw",
        );
    }

    #[test]
    fn signatures_and_unsigned_excluded_from_coverage() {
        let key = test_key();
        let mut object = as_object(json!({"a": 1, "unsigned": {"age_ts": 1000}}));
        sign_json("domain", &key, &mut object);
        let public_key = decode_b64(&key.public_key_b64()).unwrap();

        // stripping unsigned after the fact must not invalidate the signature
        object.remove("unsigned");
        verify_json(&object, "domain", "ed25519:1", &public_key).unwrap();
    }

    #[test]
    fn verify_rejects_tampering() {
        let key = test_key();
        let mut object = as_object(json!({"a": 1}));
        sign_json("domain", &key, &mut object);
        object.insert("a".to_owned(), CanonicalValue::Integer(2));
        let public_key = decode_b64(&key.public_key_b64()).unwrap();
        assert!(verify_json(&object, "domain", "ed25519:1", &public_key).is_err());
    }

    #[test]
    fn decode_accepts_padded_and_unpadded() {
        assert_eq!(decode_b64("aGk").unwrap(), b"hi");
        assert_eq!(decode_b64("aGk=").unwrap(), b"hi");
    }
}
