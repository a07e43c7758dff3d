//! Serialization helpers for records written by older versions of the
//! agenda, which stored ids as integers and timestamps without an offset.

use serde::{Deserialize, Deserializer, Serializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum IdValue {
    String(String),
    Number(serde_json::Number),
}

impl From<IdValue> for String {
    fn from(value: IdValue) -> Self {
        match value {
            IdValue::String(s) => s,
            IdValue::Number(n) => n.to_string(),
        }
    }
}

/// Ids stored either as `"42"` or `42`; always read back as a string.
pub mod lenient_id {
    use super::*;

    pub fn serialize<S>(id: &str, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(id)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(IdValue::deserialize(deserializer)?.into())
    }
}

/// Optional variant of [`lenient_id`].
pub mod opt_lenient_id {
    use super::*;

    pub fn serialize<S>(id: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match id {
            Some(id) => serializer.serialize_some(id),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: Option<IdValue> = Option::deserialize(deserializer)?;
        Ok(value.map(String::from).filter(|s| !s.is_empty()))
    }
}

/// RFC 3339 on the way out; RFC 3339 or a naive `YYYY-MM-DDTHH:MM[:SS]`
/// (read as UTC) on the way in.
pub mod flexible_datetime {
    use super::*;
    use chrono::{DateTime, NaiveDateTime, Utc};

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(value))
    }

    pub(crate) fn format(value: &DateTime<Utc>) -> String {
        value.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{}'", raw)))
    }

    pub(crate) fn parse(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
            .map(|naive| naive.and_utc())
    }
}

/// Optional variant of [`flexible_datetime`]; unreadable values become `None`.
pub mod opt_flexible_datetime {
    use super::*;
    use chrono::{DateTime, Utc};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(dt) => flexible_datetime::serialize(dt, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        Ok(raw.as_deref().and_then(flexible_datetime::parse))
    }
}
