use std::{collections::BTreeMap, convert::TryFrom, fmt};

use displaydoc::Display;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map as JsonMap, Value as JsonValue};

/// The inner type of `CanonicalValue::Object`. BTreeMap gives us key ordering
/// by Unicode codepoint for free.
pub type CanonicalObject = BTreeMap<String, CanonicalValue>;

/// A JSON value that has a canonical byte representation: no floats, object
/// keys sorted, no insignificant whitespace.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CanonicalValue {
    Null,
    Bool(bool),
    /// Signed 64-bit only. Wire values should stay within 53 bits but larger
    /// timestamps and depths are tolerated on ingress.
    Integer(i64),
    String(String),
    Array(Vec<CanonicalValue>),
    Object(CanonicalObject),
}

#[derive(Debug, Display)]
pub enum NonCanonicalizable {
    /// JSON numbers with a fractional or exponent part cannot be canonicalized
    Float,
    /// integer out of the signed 64-bit range
    IntRange,
    /// serialization failed: {0}
    Serde(serde_json::Error),
}

impl std::error::Error for NonCanonicalizable {}

impl CanonicalValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            CanonicalValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&CanonicalObject> {
        match self {
            CanonicalValue::Object(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut CanonicalObject> {
        match self {
            CanonicalValue::Object(m) => Some(m),
            _ => None,
        }
    }
}

impl TryFrom<JsonValue> for CanonicalValue {
    type Error = NonCanonicalizable;

    fn try_from(value: JsonValue) -> Result<Self, Self::Error> {
        Ok(match value {
            JsonValue::Null => CanonicalValue::Null,
            JsonValue::Bool(b) => CanonicalValue::Bool(b),
            JsonValue::Number(n) => {
                if !n.is_i64() {
                    // u64 values above i64::MAX get IntRange, everything with
                    // a decimal point or exponent is a float
                    if n.is_u64() {
                        return Err(NonCanonicalizable::IntRange);
                    }
                    return Err(NonCanonicalizable::Float);
                }
                CanonicalValue::Integer(n.as_i64().unwrap())
            },
            JsonValue::String(s) => CanonicalValue::String(s),
            JsonValue::Array(values) => CanonicalValue::Array(
                values.into_iter().map(TryFrom::try_from).collect::<Result<_, _>>()?,
            ),
            JsonValue::Object(map) => CanonicalValue::Object(object_from_json(map)?),
        })
    }
}

impl From<CanonicalValue> for JsonValue {
    fn from(value: CanonicalValue) -> Self {
        match value {
            CanonicalValue::Null => JsonValue::Null,
            CanonicalValue::Bool(b) => JsonValue::Bool(b),
            CanonicalValue::Integer(i) => JsonValue::Number(i.into()),
            CanonicalValue::String(s) => JsonValue::String(s),
            CanonicalValue::Array(values) => {
                JsonValue::Array(values.into_iter().map(Into::into).collect())
            },
            CanonicalValue::Object(map) => {
                JsonValue::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            },
        }
    }
}

impl Serialize for CanonicalValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CanonicalValue::Null => serializer.serialize_unit(),
            CanonicalValue::Bool(b) => serializer.serialize_bool(*b),
            CanonicalValue::Integer(i) => serializer.serialize_i64(*i),
            CanonicalValue::String(s) => serializer.serialize_str(s),
            CanonicalValue::Array(values) => values.serialize(serializer),
            CanonicalValue::Object(map) => {
                use serde::ser::SerializeMap;
                let mut ser = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map {
                    ser.serialize_entry(k, v)?;
                }
                ser.end()
            },
        }
    }
}

impl<'de> Deserialize<'de> for CanonicalValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = JsonValue::deserialize(deserializer)?;
        CanonicalValue::try_from(value).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for CanonicalValue {
    /// The canonical form itself. Not affected by formatting parameters;
    /// adding whitespace would defeat the point.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", serde_json::to_string(self).map_err(|_| fmt::Error)?)
    }
}

pub fn object_from_json(map: JsonMap<String, JsonValue>) -> Result<CanonicalObject, NonCanonicalizable> {
    map.into_iter().map(|(k, v)| Ok((k, CanonicalValue::try_from(v)?))).collect()
}

/// Serializes any value to its canonical JSON byte form, failing if it
/// contains anything a canonical document can't represent.
pub fn to_canonical_string<T: Serialize>(value: &T) -> Result<String, NonCanonicalizable> {
    let json = serde_json::to_value(value).map_err(NonCanonicalizable::Serde)?;
    let canonical = CanonicalValue::try_from(json)?;
    Ok(canonical.to_string())
}

#[cfg(test)]
mod tests {
    use std::convert::TryFrom;

    use serde_json::json;

    use super::{to_canonical_string, CanonicalValue, NonCanonicalizable};

    fn canon(value: serde_json::Value) -> String {
        CanonicalValue::try_from(value).unwrap().to_string()
    }

    #[test]
    fn keys_sorted() {
        assert_eq!(canon(json!({"one": 1, "two": "Two"})), r#"{"one":1,"two":"Two"}"#);
        assert_eq!(canon(json!({"b": 2, "a": 1})), r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn nested_sorting_and_array_order() {
        assert_eq!(
            canon(json!({"z": {"d": 4, "c": 3}, "a": [3, 1, 2]})),
            r#"{"a":[3,1,2],"z":{"c":3,"d":4}}"#,
        );
    }

    #[test]
    fn round_trip_is_stable() {
        let value = json!({
            "auth": {
                "mxid": "@john.doe:example.com",
                "success": true,
                "profile": { "display_name": "John Doe", "pids": [1, 2] },
            },
            "big": 9_007_199_254_740_993_i64,
        });
        let first = canon(value);
        let reparsed: serde_json::Value = serde_json::from_str(&first).unwrap();
        assert_eq!(canon(reparsed), first);
    }

    #[test]
    fn sixty_three_bit_integers_survive() {
        // beyond the 53-bit float-safe range; must not round-trip through f64
        assert_eq!(canon(json!({"ts": 9_007_199_254_740_993_i64})), r#"{"ts":9007199254740993}"#);
        assert_eq!(canon(json!(i64::MAX)), "9223372036854775807");
    }

    #[test]
    fn floats_rejected() {
        assert!(matches!(
            CanonicalValue::try_from(json!(1.5)),
            Err(NonCanonicalizable::Float)
        ));
        assert!(matches!(
            CanonicalValue::try_from(json!({"nested": [1.0]})),
            Err(NonCanonicalizable::Float)
        ));
        assert!(matches!(
            CanonicalValue::try_from(json!(u64::MAX)),
            Err(NonCanonicalizable::IntRange)
        ));
    }

    #[test]
    fn string_escapes() {
        assert_eq!(canon(json!({"s": "a\"b\\c\nd\re\tf"})), r#"{"s":"a\"b\\c\nd\re\tf"}"#);
        // non-ASCII is emitted literally, not \u-escaped
        assert_eq!(canon(json!({"s": "日本"})), "{\"s\":\"日本\"}");
        // other control characters use \u00XX
        assert_eq!(canon(json!({"s": "\u{1}"})), "{\"s\":\"\\u0001\"}");
    }

    #[test]
    fn serialize_helper_matches_value_path() {
        #[derive(serde::Serialize)]
        struct Thing {
            two: String,
            one: i64,
        }
        let t = Thing { two: "Two".to_owned(), one: 1 };
        assert_eq!(to_canonical_string(&t).unwrap(), r#"{"one":1,"two":"Two"}"#);
    }
}
