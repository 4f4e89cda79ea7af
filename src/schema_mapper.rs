//! Field-name and value-shape mapping between the two storage backends and the
//! canonical record shape returned to callers.
//!
//! PostgreSQL tables use `snake_case` columns with native booleans, TIMESTAMPTZ
//! and JSONB. The SQLite tables keep the legacy `camelCase` layout with `0/1`
//! flags and JSON stored as TEXT. Canonical records always use the `camelCase`
//! wire names.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

use crate::{error::StoreError, models::SessionPatch};

/// A row as read from or written to a backend, keyed by backend column names.
pub type RawRow = Map<String, Value>;

/// A record keyed by canonical field names.
pub type CanonicalRecord = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Postgres,
    Sqlite,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Session,
    History,
    Proposal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Boolean,
    Timestamp,
    JsonList,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub canonical: &'static str,
    pub postgres: &'static str,
    pub sqlite: &'static str,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn column(&self, backend: BackendKind) -> &'static str {
        match backend {
            BackendKind::Postgres => self.postgres,
            BackendKind::Sqlite => self.sqlite,
        }
    }
}

const fn field(
    canonical: &'static str,
    postgres: &'static str,
    sqlite: &'static str,
    kind: FieldKind,
) -> FieldSpec {
    FieldSpec {
        canonical,
        postgres,
        sqlite,
        kind,
    }
}

// The first entry of each table is the primary key.
const SESSION_FIELDS: &[FieldSpec] = &[
    field("sessionId", "session_id", "sessionId", FieldKind::Text),
    field("createdAt", "created_at", "createdAt", FieldKind::Timestamp),
    field("updatedAt", "updated_at", "updatedAt", FieldKind::Timestamp),
    field("name", "name", "name", FieldKind::Text),
    field(
        "correctionCount",
        "correction_count",
        "correctionCount",
        FieldKind::Integer,
    ),
    field("isOpen", "is_open", "isOpen", FieldKind::Boolean),
];

const HISTORY_FIELDS: &[FieldSpec] = &[
    field("historyId", "history_id", "historyId", FieldKind::Text),
    field("sessionId", "session_id", "sessionId", FieldKind::Text),
    field("timestamp", "timestamp", "timestamp", FieldKind::Timestamp),
    field("originalText", "original_text", "originalText", FieldKind::Text),
    field(
        "instructionPrompt",
        "instruction_prompt",
        "instructionPrompt",
        FieldKind::Text,
    ),
    field("targetText", "target_text", "targetText", FieldKind::Text),
    field(
        "combinedComment",
        "combined_comment",
        "combinedComment",
        FieldKind::Text,
    ),
    field(
        "selectedProposalIds",
        "selected_proposal_ids",
        "selectedProposalIds",
        FieldKind::JsonList,
    ),
    field(
        "customProposals",
        "custom_proposals",
        "customProposals",
        FieldKind::JsonList,
    ),
];

const PROPOSAL_FIELDS: &[FieldSpec] = &[
    field("proposalId", "proposal_id", "proposalId", FieldKind::Text),
    field("historyId", "history_id", "historyId", FieldKind::Text),
    field("type", "type", "type", FieldKind::Text),
    field(
        "originalAfterText",
        "original_after_text",
        "originalAfterText",
        FieldKind::Text,
    ),
    field(
        "originalReason",
        "original_reason",
        "originalReason",
        FieldKind::Text,
    ),
    field(
        "modifiedAfterText",
        "modified_after_text",
        "modifiedAfterText",
        FieldKind::Text,
    ),
    field(
        "modifiedReason",
        "modified_reason",
        "modifiedReason",
        FieldKind::Text,
    ),
    field("isSelected", "is_selected", "isSelected", FieldKind::Boolean),
    field("isModified", "is_modified", "isModified", FieldKind::Boolean),
    field("isCustom", "is_custom", "isCustom", FieldKind::Boolean),
    field(
        "selectedOrder",
        "selected_order",
        "selectedOrder",
        FieldKind::Integer,
    ),
];

/// Session fields a partial update may touch.
pub const SESSION_UPDATE_ALLOW_LIST: &[&str] =
    &["name", "correctionCount", "isOpen", "updatedAt"];

pub fn fields(entity: Entity) -> &'static [FieldSpec] {
    match entity {
        Entity::Session => SESSION_FIELDS,
        Entity::History => HISTORY_FIELDS,
        Entity::Proposal => PROPOSAL_FIELDS,
    }
}

pub fn key_field(entity: Entity) -> &'static FieldSpec {
    &fields(entity)[0]
}

pub fn field_spec(entity: Entity, canonical: &str) -> Option<&'static FieldSpec> {
    fields(entity).iter().find(|spec| spec.canonical == canonical)
}

pub fn table_name(backend: BackendKind, entity: Entity) -> &'static str {
    match (backend, entity) {
        (BackendKind::Postgres, Entity::Session) => "sessions",
        (BackendKind::Postgres, Entity::History) => "correction_histories",
        (BackendKind::Postgres, Entity::Proposal) => "ai_proposals",
        (BackendKind::Sqlite, Entity::Session) => "Sessions",
        (BackendKind::Sqlite, Entity::History) => "CorrectionHistories",
        (BackendKind::Sqlite, Entity::Proposal) => "AIProposals",
    }
}

pub fn column_name(backend: BackendKind, entity: Entity, canonical: &str) -> Option<&'static str> {
    field_spec(entity, canonical).map(|spec| spec.column(backend))
}

/// Backend column names of an entity, in field-table order.
pub fn columns(backend: BackendKind, entity: Entity) -> Vec<&'static str> {
    fields(entity)
        .iter()
        .map(|spec| spec.column(backend))
        .collect()
}

/// Converts a backend row into a canonical record. Every field of the entity is
/// present in the output; columns missing from the row become `null`.
pub fn to_canonical(backend: BackendKind, entity: Entity, row: &RawRow) -> CanonicalRecord {
    let mut record = CanonicalRecord::new();
    for spec in fields(entity) {
        let raw = row.get(spec.column(backend)).cloned().unwrap_or(Value::Null);
        record.insert(
            spec.canonical.to_string(),
            canonical_value(spec.kind, raw),
        );
    }
    record
}

/// Converts a canonical record into a backend row. Fields missing from the
/// record are written as `null`.
pub fn to_backend_row(backend: BackendKind, entity: Entity, record: &CanonicalRecord) -> RawRow {
    let mut row = RawRow::new();
    for spec in fields(entity) {
        let value = record.get(spec.canonical).cloned().unwrap_or(Value::Null);
        row.insert(
            spec.column(backend).to_string(),
            backend_value(backend, spec.kind, value),
        );
    }
    row
}

/// Decodes a backend row straight into a typed canonical record.
pub fn decode<T: DeserializeOwned>(
    backend: BackendKind,
    entity: Entity,
    row: &RawRow,
) -> Result<T, StoreError> {
    let record = to_canonical(backend, entity, row);
    serde_json::from_value(Value::Object(record))
        .map_err(|err| StoreError::decode(backend, format!("{entity:?}: {err}")))
}

/// Encodes a typed canonical record into a backend row.
pub fn encode<T: Serialize>(
    backend: BackendKind,
    entity: Entity,
    record: &T,
) -> Result<RawRow, StoreError> {
    match serde_json::to_value(record) {
        Ok(Value::Object(map)) => Ok(to_backend_row(backend, entity, &map)),
        Ok(other) => Err(StoreError::decode(
            backend,
            format!("{entity:?} did not serialize to an object: {other}"),
        )),
        Err(err) => Err(StoreError::decode(backend, format!("{entity:?}: {err}"))),
    }
}

fn canonical_value(kind: FieldKind, raw: Value) -> Value {
    if raw.is_null() {
        return Value::Null;
    }
    match kind {
        FieldKind::Boolean => value_as_bool(&raw).map(Value::Bool).unwrap_or(Value::Null),
        FieldKind::Integer => match &raw {
            Value::Number(n) => n.as_i64().map(Value::from).unwrap_or(Value::Null),
            Value::Bool(b) => Value::from(i64::from(*b)),
            Value::String(s) => s.trim().parse::<i64>().map(Value::from).unwrap_or(Value::Null),
            _ => Value::Null,
        },
        FieldKind::Timestamp => match parse_timestamp(&raw) {
            Some(ts) => Value::String(ts.to_rfc3339_opts(SecondsFormat::Micros, true)),
            None => raw,
        },
        FieldKind::JsonList => match raw {
            Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::Null),
            other => other,
        },
        FieldKind::Text => raw,
    }
}

fn backend_value(backend: BackendKind, kind: FieldKind, value: Value) -> Value {
    if value.is_null() {
        return Value::Null;
    }
    match (backend, kind) {
        (BackendKind::Sqlite, FieldKind::Boolean) => match value_as_bool(&value) {
            Some(flag) => Value::from(i64::from(flag)),
            None => Value::Null,
        },
        (BackendKind::Postgres, FieldKind::Boolean) => {
            value_as_bool(&value).map(Value::Bool).unwrap_or(Value::Null)
        }
        // Fixed-width UTC text keeps SQLite's lexical ORDER BY chronological.
        (BackendKind::Sqlite, FieldKind::Timestamp) => match parse_timestamp(&value) {
            Some(ts) => Value::String(ts.to_rfc3339_opts(SecondsFormat::Micros, true)),
            None => value,
        },
        (BackendKind::Sqlite, FieldKind::JsonList) => match value {
            Value::String(text) => Value::String(text),
            other => Value::String(other.to_string()),
        },
        _ => value,
    }
}

/// Encodes a timestamp the way `backend` stores it.
pub fn encode_timestamp(backend: BackendKind, ts: DateTime<Utc>) -> Value {
    backend_value(
        backend,
        FieldKind::Timestamp,
        Value::String(ts.to_rfc3339_opts(SecondsFormat::Micros, true)),
    )
}

/// Interprets `0/1`, booleans and common truthy strings as a flag.
pub fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let text = value.as_str()?;
    DateTime::parse_from_rfc3339(text.trim())
        .map(|ts| ts.with_timezone(&Utc))
        .ok()
}

/// Builds a session patch from an arbitrary update payload. Keys outside
/// [`SESSION_UPDATE_ALLOW_LIST`] and values of the wrong shape are ignored.
/// Both canonical and PostgreSQL spellings of allowed keys are accepted.
pub fn session_patch(update: &Map<String, Value>) -> SessionPatch {
    let mut patch = SessionPatch::default();
    for (key, value) in update {
        let Some(canonical) = SESSION_FIELDS
            .iter()
            .find(|spec| spec.canonical == key || spec.postgres == key)
            .map(|spec| spec.canonical)
        else {
            continue;
        };
        if !SESSION_UPDATE_ALLOW_LIST.contains(&canonical) {
            continue;
        }
        match canonical {
            "name" => {
                if let Some(name) = value.as_str() {
                    patch.name = Some(name.to_string());
                }
            }
            "correctionCount" => {
                if let Some(count) = value.as_i64() {
                    patch.correction_count = Some(count.max(0));
                }
            }
            "isOpen" => {
                if let Some(flag) = value_as_bool(value) {
                    patch.is_open = Some(flag);
                }
            }
            "updatedAt" => {
                if let Some(ts) = parse_timestamp(value) {
                    patch.updated_at = Some(ts);
                }
            }
            _ => {}
        }
    }
    patch
}

/// Backend column/value pairs for the fields a patch sets, in field-table order.
pub fn patch_assignments(backend: BackendKind, patch: &SessionPatch) -> Vec<(&'static str, Value)> {
    let mut record = CanonicalRecord::new();
    if let Some(name) = &patch.name {
        record.insert("name".into(), Value::String(name.clone()));
    }
    if let Some(count) = patch.correction_count {
        record.insert("correctionCount".into(), Value::from(count));
    }
    if let Some(flag) = patch.is_open {
        record.insert("isOpen".into(), Value::Bool(flag));
    }
    if let Some(ts) = patch.updated_at {
        record.insert(
            "updatedAt".into(),
            Value::String(ts.to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
    }

    SESSION_FIELDS
        .iter()
        .filter_map(|spec| {
            let value = record.get(spec.canonical)?.clone();
            Some((spec.column(backend), backend_value(backend, spec.kind, value)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::models::{Proposal, Session};

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn sqlite_flags_normalize_to_booleans() {
        let row = object(json!({
            "proposalId": "p1",
            "historyId": "h1",
            "type": "grammar",
            "originalAfterText": "after",
            "originalReason": null,
            "modifiedAfterText": null,
            "modifiedReason": null,
            "isSelected": 1,
            "isModified": 0,
            "isCustom": 0,
            "selectedOrder": 2
        }));
        let proposal: Proposal = decode(BackendKind::Sqlite, Entity::Proposal, &row).unwrap();
        assert!(proposal.is_selected);
        assert!(!proposal.is_modified);
        assert_eq!(proposal.selected_order, Some(2));
    }

    #[test]
    fn postgres_rows_map_snake_case_columns() {
        let row = object(json!({
            "session_id": "s1",
            "created_at": "2026-01-02T03:04:05Z",
            "updated_at": "2026-01-02T03:04:06Z",
            "name": "first",
            "correction_count": 3,
            "is_open": true
        }));
        let record = to_canonical(BackendKind::Postgres, Entity::Session, &row);
        assert_eq!(record["sessionId"], json!("s1"));
        assert_eq!(record["correctionCount"], json!(3));
        assert_eq!(record["isOpen"], json!(true));

        let session: Session = decode(BackendKind::Postgres, Entity::Session, &row).unwrap();
        assert_eq!(session.name.as_deref(), Some("first"));
    }

    #[test]
    fn backend_rows_carry_every_field() {
        let record = object(json!({ "sessionId": "s1", "isOpen": true }));
        let row = to_backend_row(BackendKind::Sqlite, Entity::Session, &record);
        assert_eq!(row.len(), SESSION_FIELDS.len());
        assert_eq!(row["isOpen"], json!(1));
        assert_eq!(row["name"], Value::Null);

        let pg_row = to_backend_row(BackendKind::Postgres, Entity::Session, &record);
        assert_eq!(pg_row["is_open"], json!(true));
        assert!(pg_row.contains_key("correction_count"));
    }

    #[test]
    fn json_lists_are_text_on_sqlite() {
        let record = object(json!({
            "historyId": "h1",
            "selectedProposalIds": ["a", "b"]
        }));
        let row = to_backend_row(BackendKind::Sqlite, Entity::History, &record);
        assert_eq!(row["selectedProposalIds"], json!("[\"a\",\"b\"]"));

        let back = to_canonical(BackendKind::Sqlite, Entity::History, &row);
        assert_eq!(back["selectedProposalIds"], json!(["a", "b"]));
    }

    #[test]
    fn sqlite_timestamps_are_fixed_width() {
        let record = object(json!({ "createdAt": "2026-01-02T03:04:05Z" }));
        let row = to_backend_row(BackendKind::Sqlite, Entity::Session, &record);
        assert_eq!(row["createdAt"], json!("2026-01-02T03:04:05.000000Z"));
    }

    #[test]
    fn session_patch_ignores_fields_outside_allow_list() {
        let update = object(json!({
            "name": "renamed",
            "is_open": 0,
            "sessionId": "hijack",
            "createdAt": "2020-01-01T00:00:00Z",
            "correctionCount": "not a number",
            "color": "blue"
        }));
        let patch = session_patch(&update);
        assert_eq!(patch.name.as_deref(), Some("renamed"));
        assert_eq!(patch.is_open, Some(false));
        assert_eq!(patch.correction_count, None);
        assert_eq!(patch.updated_at, None);

        let assignments = patch_assignments(BackendKind::Sqlite, &patch);
        assert_eq!(
            assignments,
            vec![("name", json!("renamed")), ("isOpen", json!(0))]
        );
    }

    #[test]
    fn fractional_integer_columns_become_null() {
        let row = object(json!({
            "session_id": "s1",
            "created_at": "2026-01-02T03:04:05Z",
            "updated_at": "2026-01-02T03:04:05Z",
            "correction_count": 2.5,
            "is_open": true
        }));
        let record = to_canonical(BackendKind::Postgres, Entity::Session, &row);
        assert_eq!(record["correctionCount"], Value::Null);

        let row = object(json!({ "correction_count": 7 }));
        let record = to_canonical(BackendKind::Postgres, Entity::Session, &row);
        assert_eq!(record["correctionCount"], json!(7));
    }

    #[test]
    fn unknown_update_yields_empty_patch() {
        let patch = session_patch(&object(json!({ "foo": 1 })));
        assert!(patch.is_empty());
    }
}
