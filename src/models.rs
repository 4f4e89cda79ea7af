use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{error::StoreError, schema_mapper::value_as_bool};

/// Current time at millisecond precision, so records survive a round trip
/// through either backend unchanged.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

fn default_open() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: Option<String>,
    #[serde(default)]
    pub correction_count: i64,
    #[serde(default = "default_open")]
    pub is_open: bool,
}

impl Session {
    pub fn new(name: Option<String>) -> Self {
        let ts = now();
        Self {
            session_id: Uuid::new_v4().to_string(),
            created_at: ts,
            updated_at: ts,
            name,
            correction_count: 0,
            is_open: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct History {
    pub history_id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub original_text: String,
    pub instruction_prompt: Option<String>,
    pub target_text: String,
    pub combined_comment: Option<String>,
    pub selected_proposal_ids: Option<Vec<String>>,
    pub custom_proposals: Option<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub proposal_id: String,
    pub history_id: String,
    #[serde(rename = "type")]
    pub proposal_type: String,
    pub original_after_text: String,
    pub original_reason: Option<String>,
    pub modified_after_text: Option<String>,
    pub modified_reason: Option<String>,
    #[serde(default)]
    pub is_selected: bool,
    #[serde(default)]
    pub is_modified: bool,
    #[serde(default)]
    pub is_custom: bool,
    pub selected_order: Option<i64>,
}

/// Partial session update. Built from a raw payload by
/// [`crate::schema_mapper::session_patch`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPatch {
    pub name: Option<String>,
    pub correction_count: Option<i64>,
    pub is_open: Option<bool>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SessionPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.correction_count.is_none()
            && self.is_open.is_none()
            && self.updated_at.is_none()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSession {
    pub name: Option<String>,
}

/// History creation payload. Accepts both camelCase and snake_case keys.
/// List fields may arrive as arrays or as JSON-encoded strings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewHistory {
    #[serde(alias = "history_id")]
    pub history_id: Option<String>,
    #[serde(alias = "session_id")]
    pub session_id: Option<String>,
    #[serde(alias = "original_text")]
    pub original_text: Option<String>,
    #[serde(alias = "instruction_prompt")]
    pub instruction_prompt: Option<String>,
    #[serde(alias = "target_text")]
    pub target_text: Option<String>,
    #[serde(alias = "combined_comment")]
    pub combined_comment: Option<String>,
    #[serde(alias = "selected_proposal_ids", default, deserialize_with = "id_list")]
    pub selected_proposal_ids: Option<Vec<String>>,
    #[serde(alias = "custom_proposals", default, deserialize_with = "value_list")]
    pub custom_proposals: Option<Vec<Value>>,
}

impl NewHistory {
    pub fn into_history(self, timestamp: DateTime<Utc>) -> Result<History, StoreError> {
        let session_id = required(self.session_id, "sessionId")?;
        let original_text = required(self.original_text, "originalText")?;
        let target_text = required(self.target_text, "targetText")?;
        Ok(History {
            history_id: non_blank(self.history_id).unwrap_or_else(|| Uuid::new_v4().to_string()),
            session_id,
            timestamp,
            original_text,
            instruction_prompt: self.instruction_prompt,
            target_text,
            combined_comment: self.combined_comment,
            selected_proposal_ids: self.selected_proposal_ids,
            custom_proposals: self.custom_proposals,
        })
    }
}

/// Proposal creation payload. Flags may arrive as booleans or `0/1`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProposal {
    pub proposal_id: Option<String>,
    pub history_id: Option<String>,
    #[serde(rename = "type")]
    pub proposal_type: Option<String>,
    pub original_after_text: Option<String>,
    pub original_reason: Option<String>,
    pub modified_after_text: Option<String>,
    pub modified_reason: Option<String>,
    #[serde(default, deserialize_with = "flag")]
    pub is_selected: bool,
    #[serde(default, deserialize_with = "flag")]
    pub is_modified: bool,
    #[serde(default, deserialize_with = "flag")]
    pub is_custom: bool,
    pub selected_order: Option<i64>,
}

impl NewProposal {
    pub fn into_proposal(self) -> Result<Proposal, StoreError> {
        let history_id = required(self.history_id, "historyId")?;
        let proposal_type = present(self.proposal_type, "type")?;
        let original_after_text = present(self.original_after_text, "originalAfterText")?;
        Ok(Proposal {
            proposal_id: non_blank(self.proposal_id).unwrap_or_else(|| Uuid::new_v4().to_string()),
            history_id,
            proposal_type,
            original_after_text,
            original_reason: self.original_reason,
            modified_after_text: self.modified_after_text,
            modified_reason: self.modified_reason,
            is_selected: self.is_selected,
            is_modified: self.is_modified,
            is_custom: self.is_custom,
            selected_order: self.selected_order,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn missing(field: &str) -> StoreError {
    StoreError::validation(format!("missing required field `{field}`"))
}

fn required(value: Option<String>, field: &str) -> Result<String, StoreError> {
    non_blank(value).ok_or_else(|| missing(field))
}

/// Like [`required`], but an empty string is a valid value.
fn present(value: Option<String>, field: &str) -> Result<String, StoreError> {
    value.ok_or_else(|| missing(field))
}

fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value_as_bool(&value).unwrap_or(false))
}

fn json_list<E: serde::de::Error>(value: Value) -> Result<Option<Vec<Value>>, E> {
    match value {
        Value::Null => Ok(None),
        Value::Array(items) => Ok(Some(items)),
        Value::String(text) if text.trim().is_empty() => Ok(None),
        Value::String(text) => match serde_json::from_str::<Value>(&text) {
            Ok(Value::Array(items)) => Ok(Some(items)),
            Ok(Value::Null) => Ok(None),
            _ => Err(E::custom(format!("expected a JSON array, got {text:?}"))),
        },
        other => Err(E::custom(format!("expected a JSON array, got {other}"))),
    }
}

fn value_list<'de, D>(deserializer: D) -> Result<Option<Vec<Value>>, D::Error>
where
    D: Deserializer<'de>,
{
    json_list(Value::deserialize(deserializer)?)
}

fn id_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let items = json_list(Value::deserialize(deserializer)?)?;
    Ok(items.map(|items| {
        items
            .into_iter()
            .map(|item| match item {
                Value::String(id) => id,
                other => other.to_string(),
            })
            .collect()
    }))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub id: String,
    pub original: String,
    pub reason: String,
}

impl Suggestion {
    pub fn placeholder(position: usize) -> Self {
        Self {
            id: position.to_string(),
            original: String::new(),
            reason: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionRequest {
    pub original_text: String,
    pub target_text: String,
    pub instruction_prompt: Option<String>,
    #[serde(alias = "sessionId")]
    pub conversation_id: Option<String>,
    /// Generator name, e.g. `gemini` or `mock`. Unset uses the configured default.
    #[serde(default)]
    pub engine: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionResponse {
    pub suggestions: Vec<Suggestion>,
    pub overall_comment: String,
    pub conversation_id: String,
}
