//! Purpose: Record model plus audit stamping shared by every write path.
//! Exports: `Fields`, `Record`, `Filter`, `StampClock`, stamping helpers, audit field names.
//! Role: Pure data helpers; no I/O and no reactive state.
//! Invariants: Stamps always win over caller-supplied audit fields.
//! Invariants: `StampClock` never issues a timestamp below one it already issued.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::error::{Error, ErrorKind};

pub type Fields = Map<String, Value>;

pub const CREATED_AT: &str = "createdAt";
pub const UPDATED_AT: &str = "updatedAt";
pub const CREATED_BY: &str = "createdBy";
pub const UPDATED_BY: &str = "updatedBy";
pub const SLUG: &str = "slug";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub fields: Fields,
}

impl Record {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn created_by(&self) -> Option<&str> {
        created_by(&self.fields)
    }
}

/// Equality filter used by one-shot queries and query subscriptions.
#[derive(Clone, Debug, PartialEq)]
pub struct Filter {
    pub field: String,
    pub value: Value,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        fields.get(&self.field) == Some(&self.value)
    }
}

pub fn created_by(fields: &Fields) -> Option<&str> {
    fields.get(CREATED_BY).and_then(Value::as_str)
}

pub fn slug(fields: &Fields) -> Option<String> {
    match fields.get(SLUG) {
        Some(Value::String(slug)) => Some(slug.clone()),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    }
}

/// Adds creation and update stamps to a new record.
pub fn stamp_create(mut fields: Fields, actor: &str, now_ms: u64) -> Fields {
    fields.insert(CREATED_AT.to_string(), Value::from(now_ms));
    fields.insert(CREATED_BY.to_string(), Value::from(actor));
    stamp_update(fields, actor, now_ms)
}

pub fn stamp_update(mut fields: Fields, actor: &str, now_ms: u64) -> Fields {
    fields.insert(UPDATED_AT.to_string(), Value::from(now_ms));
    fields.insert(UPDATED_BY.to_string(), Value::from(actor));
    fields
}

#[derive(Debug, Default)]
pub struct StampClock {
    last_ms: AtomicU64,
}

impl StampClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_ms(&self) -> Result<u64, Error> {
        let wall = wall_ms()?;
        let previous = self.last_ms.fetch_max(wall, Ordering::SeqCst);
        Ok(previous.max(wall))
    }
}

fn wall_ms() -> Result<u64, Error> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("time went backwards")
                .with_source(err)
        })?;
    Ok(duration.as_millis() as u64)
}

/// Converts a JSON value into a field mapping, rejecting non-objects.
pub fn fields_from_value(value: Value) -> Result<Fields, Error> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::new(ErrorKind::Usage)
            .with_message("record fields must be a JSON object")
            .with_hint(format!("Got `{other}`; wrap values in an object like {{\"title\": ...}}."))),
    }
}
