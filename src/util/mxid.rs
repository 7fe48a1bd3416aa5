use std::{convert::TryFrom, fmt};

use displaydoc::Display;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

lazy_static! {
    static ref LOCALPART_RE: Regex = Regex::new("^[a-z0-9._=/-]+$").unwrap();
}

/// A user id of the form `@localpart:domain`.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MatrixId(String);

#[derive(Debug, Display)]
pub enum MxidError {
    /// Matrix ids cannot exceed 255 bytes.
    TooLong,
    /// The id did not have the right sigil or shape: {0}
    InvalidFormat(String),
}

impl std::error::Error for MxidError {}

impl MatrixId {
    pub fn new(localpart: &str, domain: &str) -> Result<Self, MxidError> {
        let id = format!("@{}:{}", localpart, domain);
        MatrixId::validate(&id)?;
        Ok(MatrixId(id))
    }

    pub fn validate(id: &str) -> Result<(), MxidError> {
        if id.len() > 255 {
            return Err(MxidError::TooLong);
        }
        let rest = id
            .strip_prefix('@')
            .ok_or_else(|| MxidError::InvalidFormat(id.to_owned()))?;
        let (localpart, domain) = rest
            .split_once(':')
            .ok_or_else(|| MxidError::InvalidFormat(id.to_owned()))?;
        if localpart.is_empty() || domain.is_empty() || !LOCALPART_RE.is_match(localpart) {
            return Err(MxidError::InvalidFormat(id.to_owned()));
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn clone_inner(&self) -> String {
        self.0.clone()
    }

    pub fn localpart(&self) -> &str {
        self.0[1..].split(':').next().unwrap()
    }

    pub fn domain(&self) -> &str {
        self.0.split_once(':').unwrap().1
    }
}

impl TryFrom<String> for MatrixId {
    type Error = MxidError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        MatrixId::validate(&value)?;
        Ok(MatrixId(value))
    }
}

impl TryFrom<&str> for MatrixId {
    type Error = MxidError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        MatrixId::validate(value)?;
        Ok(MatrixId(value.to_owned()))
    }
}

impl fmt::Display for MatrixId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for MatrixId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl Serialize for MatrixId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for MatrixId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        MatrixId::try_from(s).map_err(serde::de::Error::custom)
    }
}
