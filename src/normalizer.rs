//! Turns free-form generated text into a fixed-size list of suggestions.
//!
//! Model replies usually wrap the JSON object in prose or code fences and use
//! either English or Japanese keys. Extraction never fails: anything that
//! cannot be understood yields an empty result.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::models::Suggestion;

/// Number of suggestions every normalized result carries.
pub const SUGGESTION_COUNT: usize = 5;

const LIST_KEYS: &[&str] = &["suggestions", "indications", "指摘"];
const ORIGINAL_KEYS: &[&str] = &["original", "location", "箇所"];
const REASON_KEYS: &[&str] = &["reason", "comment", "コメント"];
const COMMENT_KEYS: &[&str] = &["overallComment", "overall_comment", "全体講評"];

static LIST_ANCHOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""(?:suggestions|indications|指摘)"\s*:\s*\["#).expect("Invalid anchor regex")
});

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedSuggestions {
    pub suggestions: Vec<Suggestion>,
    pub overall_comment: String,
}

impl NormalizedSuggestions {
    pub fn is_empty(&self) -> bool {
        self.suggestions.is_empty()
    }
}

/// Extracts at most `count` suggestions from `text`, padding short lists.
pub fn normalize(text: &str, count: usize) -> NormalizedSuggestions {
    let Some(object) = extract_anchored_object(text) else {
        return NormalizedSuggestions::default();
    };

    let entries = LIST_KEYS
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_array))
        .map(Vec::as_slice)
        .unwrap_or_default();

    let suggestions = entries
        .iter()
        .enumerate()
        .map(|(index, entry)| Suggestion {
            id: (index + 1).to_string(),
            original: first_text(entry, ORIGINAL_KEYS),
            reason: first_text(entry, REASON_KEYS),
        })
        .collect();

    NormalizedSuggestions {
        suggestions: fit_to_count(suggestions, count),
        overall_comment: first_text(&Value::Object(object), COMMENT_KEYS),
    }
}

/// Truncates to `count` entries, then pads with placeholders whose ids
/// continue the sequence.
pub fn fit_to_count(mut suggestions: Vec<Suggestion>, count: usize) -> Vec<Suggestion> {
    suggestions.truncate(count);
    for position in suggestions.len() + 1..=count {
        suggestions.push(Suggestion::placeholder(position));
    }
    suggestions
}

/// Locates the first JSON object in `text` that holds one of the list keys
/// at its top level.
pub fn extract_anchored_object(text: &str) -> Option<Map<String, Value>> {
    let anchor = LIST_ANCHOR.find(text)?.start();

    text[..anchor]
        .char_indices()
        .filter(|(_, c)| *c == '{')
        .find_map(|(start, _)| {
            let candidate = &text[start..];
            let end = find_matching_brace(candidate)?;
            if start + end <= anchor {
                return None;
            }
            match serde_json::from_str::<Value>(&candidate[..end]) {
                Ok(Value::Object(object)) if LIST_KEYS.iter().any(|k| object.contains_key(*k)) => {
                    Some(object)
                }
                _ => None,
            }
        })
}

/// Byte offset just past the brace that closes the one `s` starts with.
/// Braces inside JSON strings are ignored.
fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;

    for (i, c) in s.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        if in_string {
            match c {
                '\\' => escape = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn first_text(entry: &Value, keys: &[&str]) -> String {
    let Some(object) = entry.as_object() else {
        return String::new();
    };
    keys.iter()
        .filter_map(|key| object.get(*key))
        .find(|value| !value.is_null())
        .map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize_default(text: &str) -> NormalizedSuggestions {
        normalize(text, SUGGESTION_COUNT)
    }

    fn reply(entries: usize) -> String {
        let items = (1..=entries)
            .map(|i| format!(r#"{{"original": "o{i}", "reason": "r{i}"}}"#))
            .collect::<Vec<_>>()
            .join(", ");
        format!(r#"{{"suggestions": [{items}], "overallComment": "good"}}"#)
    }

    #[test]
    fn short_lists_are_padded_with_placeholders() {
        let result = normalize_default(&reply(3));
        assert_eq!(result.suggestions.len(), 5);
        assert_eq!(result.suggestions[2].original, "o3");
        assert_eq!(result.suggestions[3], Suggestion::placeholder(4));
        assert_eq!(result.suggestions[4].id, "5");
        assert!(result.suggestions[4].original.is_empty());
        assert!(result.suggestions[4].reason.is_empty());
        assert_eq!(result.overall_comment, "good");
    }

    #[test]
    fn long_lists_are_truncated_in_order() {
        let result = normalize_default(&reply(7));
        let originals = result
            .suggestions
            .iter()
            .map(|s| s.original.as_str())
            .collect::<Vec<_>>();
        assert_eq!(originals, ["o1", "o2", "o3", "o4", "o5"]);
        let ids = result.suggestions.iter().map(|s| s.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, ["1", "2", "3", "4", "5"]);
    }

    #[test]
    fn text_without_json_is_empty() {
        assert_eq!(
            normalize_default("Sorry, I cannot help with that."),
            NormalizedSuggestions::default()
        );
        assert!(normalize_default("").is_empty());
        assert!(normalize_default(r#"{"other": 1}"#).is_empty());
    }

    #[test]
    fn malformed_json_is_empty() {
        let result = normalize_default(r#"{"suggestions": [{"original": "x", }"#);
        assert!(result.is_empty());
        assert!(result.overall_comment.is_empty());
    }

    #[test]
    fn object_is_found_inside_prose_and_fences() {
        let text = format!(
            "Here is my review {{of sorts}}:\n```json\n{}\n```\nThanks!",
            reply(2)
        );
        let result = normalize_default(&text);
        assert_eq!(result.suggestions[0].reason, "r1");
        assert_eq!(result.suggestions[1].reason, "r2");
        assert_eq!(result.suggestions[2], Suggestion::placeholder(3));
    }

    #[test]
    fn braces_inside_strings_are_ignored() {
        let text = r#"{"suggestions": [{"original": "use {x}", "reason": "a \"}\" slipped"}]}"#;
        let result = normalize_default(text);
        assert_eq!(result.suggestions[0].original, "use {x}");
        assert_eq!(result.suggestions[0].reason, "a \"}\" slipped");
    }

    #[test]
    fn japanese_keys_are_understood() {
        let text = r#"回答:
{
  "指摘": [
    {"番号": 1, "箇所": "我并不想回复", "コメント": "ようがない"},
    {"番号": 2, "箇所": "担任", "コメント": "老师"}
  ],
  "全体講評": "加油～"
}"#;
        let result = normalize_default(text);
        assert_eq!(result.suggestions[0].original, "我并不想回复");
        assert_eq!(result.suggestions[1].reason, "老师");
        assert_eq!(result.overall_comment, "加油～");
        assert_eq!(result.suggestions.len(), 5);
    }

    #[test]
    fn alternate_english_keys_and_missing_fields() {
        let text = r#"{"indications": [{"location": "here"}, {"comment": 3}, "bare"], "overall_comment": "ok"}"#;
        let result = normalize_default(text);
        assert_eq!(result.suggestions[0].original, "here");
        assert_eq!(result.suggestions[0].reason, "");
        assert_eq!(result.suggestions[1].reason, "3");
        assert_eq!(result.suggestions[2].original, "");
        assert_eq!(result.overall_comment, "ok");
    }

    #[test]
    fn missing_overall_comment_defaults_to_empty() {
        let result = normalize_default(r#"{"suggestions": []}"#);
        assert_eq!(result.overall_comment, "");
        assert_eq!(result.suggestions, fit_to_count(Vec::new(), 5));
    }

    #[test]
    fn outer_object_without_list_key_falls_through_to_inner() {
        let text = r#"{"meta": {"suggestions": [{"original": "inner"}]}}"#;
        let result = normalize_default(text);
        assert_eq!(result.suggestions[0].original, "inner");
        assert_eq!(result.suggestions.len(), 5);
    }

    #[test]
    fn count_is_configurable() {
        let result = normalize(&reply(1), 2);
        assert_eq!(result.suggestions.len(), 2);
        assert_eq!(result.suggestions[1].id, "2");
    }
}
