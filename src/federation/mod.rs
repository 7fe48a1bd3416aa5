use std::convert::TryFrom;

use serde_json::Value as JsonValue;

use crate::{
    canonical::{CanonicalObject, CanonicalValue},
    error::{Error, ErrorKind},
};

pub mod client;
pub mod ingest;
pub mod invite;
pub mod join;

pub use client::FederationClient;

/// The parsed parameters of an `Authorization: X-Matrix ...` header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct XMatrix {
    pub origin: String,
    pub destination: Option<String>,
    pub key: String,
    pub sig: String,
}

impl XMatrix {
    pub fn to_header_value(&self) -> String {
        let mut value = format!("X-Matrix origin=\"{}\"", self.origin);
        if let Some(destination) = &self.destination {
            value.push_str(&format!(",destination=\"{}\"", destination));
        }
        value.push_str(&format!(",key=\"{}\",sig=\"{}\"", self.key, self.sig));
        value
    }

    /// Accepts both quoted and legacy unquoted parameter values.
    pub fn parse(header: &str) -> Result<XMatrix, Error> {
        let rest = header
            .strip_prefix("X-Matrix ")
            .ok_or_else(|| ErrorKind::Unauthorized("not an X-Matrix header".to_owned()))?;

        let mut origin = None;
        let mut destination = None;
        let mut key = None;
        let mut sig = None;
        for param in rest.split(',') {
            let (name, value) = param
                .trim()
                .split_once('=')
                .ok_or_else(|| ErrorKind::Unauthorized("malformed X-Matrix param".to_owned()))?;
            let value = value.trim_matches('"').to_owned();
            match name {
                "origin" => origin = Some(value),
                "destination" => destination = Some(value),
                "key" => key = Some(value),
                "sig" => sig = Some(value),
                // future-proofing: unknown params are ignored
                _ => {},
            }
        }

        Ok(XMatrix {
            origin: origin
                .ok_or_else(|| ErrorKind::Unauthorized("X-Matrix without origin".to_owned()))?,
            destination,
            key: key.ok_or_else(|| ErrorKind::Unauthorized("X-Matrix without key".to_owned()))?,
            sig: sig.ok_or_else(|| ErrorKind::Unauthorized("X-Matrix without sig".to_owned()))?,
        })
    }
}

/// The object an X-Matrix signature covers. Content is embedded as parsed
/// JSON, never as an escaped string.
pub fn request_signing_object(
    method: &str,
    uri: &str,
    origin: &str,
    destination: &str,
    content: Option<&JsonValue>,
) -> Result<CanonicalObject, Error> {
    let mut object = CanonicalObject::new();
    object.insert("method".to_owned(), CanonicalValue::String(method.to_owned()));
    object.insert("uri".to_owned(), CanonicalValue::String(uri.to_owned()));
    object.insert("origin".to_owned(), CanonicalValue::String(origin.to_owned()));
    object.insert("destination".to_owned(), CanonicalValue::String(destination.to_owned()));
    if let Some(content) = content {
        let content =
            CanonicalValue::try_from(content.clone()).map_err(ErrorKind::NotCanonical)?;
        object.insert("content".to_owned(), content);
    }
    Ok(object)
}

#[cfg(test)]
mod tests {
    use super::XMatrix;

    #[test]
    fn header_round_trip() {
        let auth = XMatrix {
            origin: "origin.example.org".to_owned(),
            destination: Some("destination.example.org".to_owned()),
            key: "ed25519:key1".to_owned(),
            sig: "ABCDEF".to_owned(),
        };
        let parsed = XMatrix::parse(&auth.to_header_value()).unwrap();
        assert_eq!(parsed, auth);
    }

    #[test]
    fn parses_legacy_unquoted_params() {
        let parsed =
            XMatrix::parse("X-Matrix origin=origin.example.org,key=ed25519:1,sig=QUJD").unwrap();
        assert_eq!(parsed.origin, "origin.example.org");
        assert_eq!(parsed.destination, None);
        assert_eq!(parsed.key, "ed25519:1");
        assert_eq!(parsed.sig, "QUJD");
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(XMatrix::parse("Bearer abc").is_err());
        assert!(XMatrix::parse("X-Matrix origin=a,sig=b").is_err());
    }
}
