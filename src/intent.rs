use crate::extract::extract_json;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Write;

lazy_static! {
    static ref LIMIT_HINT: Regex =
        Regex::new(r"(?i)\b(?:top|first|best|largest|highest|biggest|bottom|lowest|smallest)\s+(\d{1,5})\b").unwrap();
    static ref GROUP_HINT: Regex = Regex::new(r"(?i)\b(?:by|per|for each)\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap();
}

/// Structured reading of a business question.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Intent {
    pub question: String,
    pub intent: String,
    pub entities: Vec<String>,
    pub measures: Vec<String>,
    pub filters: Vec<String>,
    pub group_by: Vec<String>,
    pub order_by: Option<String>,
    pub limit: Option<u32>,
    pub time_context: Option<String>,
    /// Model reply the intent was read from.
    #[serde(skip)]
    pub raw: String,
}

fn strings(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(text).collect(),
        Some(v) => text(v).into_iter().collect(),
        None => Vec::new(),
    }
}

/// Text form of a scalar, or the `name`/`value` field of an object.
fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(map) => ["name", "value", "entity", "column"]
            .iter()
            .find_map(|k| map.get(*k).and_then(text))
            .or_else(|| Some(Value::Object(map.clone()).to_string())),
        _ => None,
    }
}

fn limit_value(value: Option<&Value>) -> Option<u32> {
    let limit: Option<u32> = match value? {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    limit.filter(|n| *n > 0)
}

impl Intent {
    /// Read the model's reply; non-JSON replies fall back to heuristics over the question.
    pub fn parse(question: &str, raw: &str) -> Self {
        let mut intent = match serde_json::from_str::<Value>(&extract_json(raw)) {
            Ok(Value::Object(map)) => {
                let get = |keys: &[&str]| keys.iter().find_map(|k| map.get(*k));
                Intent {
                    question: question.to_string(),
                    intent: get(&["intent", "query_intent", "description"])
                        .and_then(text)
                        .unwrap_or_default(),
                    entities: strings(get(&["entities", "tables"])),
                    measures: strings(get(&["measures", "metrics", "aggregations"])),
                    filters: strings(get(&["filters", "conditions"])),
                    group_by: strings(get(&["group_by", "grouping", "dimensions"])),
                    order_by: get(&["order_by", "sort", "ordering"]).and_then(text),
                    limit: limit_value(get(&["limit", "top_n", "top"])),
                    time_context: get(&["time_context", "time_period", "time_range"]).and_then(text),
                    raw: raw.to_string(),
                }
            }
            _ => Intent {
                question: question.to_string(),
                intent: raw.trim().chars().take(500).collect(),
                raw: raw.to_string(),
                ..Default::default()
            },
        };

        if intent.limit.is_none() {
            intent.limit = LIMIT_HINT
                .captures(question)
                .and_then(|c| c[1].parse().ok())
                .filter(|n| *n > 0);
        }
        if intent.group_by.is_empty() {
            intent.group_by = GROUP_HINT
                .captures_iter(question)
                .map(|c| c[1].to_string())
                .collect();
        }
        if intent.intent.is_empty() {
            intent.intent = question.to_string();
        }
        intent
    }

    /// Heuristic-only intent for when no model reply is available.
    pub fn from_question(question: &str) -> Self {
        Self::parse(question, "")
    }

    /// Case-insensitive test against the question, intent text and entities.
    pub fn mentions(&self, words: &[&str]) -> bool {
        let haystack = format!("{} {} {}", self.question, self.intent, self.entities.join(" ")).to_lowercase();
        words.iter().any(|w| haystack.contains(&w.to_lowercase()))
    }

    /// Block injected into the query-generation prompts.
    pub fn prompt_block(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Intent: {}", self.intent);
        let lists = [
            ("Entities", &self.entities),
            ("Measures", &self.measures),
            ("Filters", &self.filters),
            ("Group by", &self.group_by),
        ];
        for (label, values) in lists {
            if !values.is_empty() {
                let _ = writeln!(out, "{}: {}", label, values.join(", "));
            }
        }
        if let Some(order) = &self.order_by {
            let _ = writeln!(out, "Order by: {}", order);
        }
        if let Some(limit) = self.limit {
            let _ = writeln!(out, "Limit: {}", limit);
        }
        if let Some(time) = &self.time_context {
            let _ = writeln!(out, "Time context: {}", time);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_reply() {
        let raw = "```json\n{\"intent\": \"rank customers by exposure\", \"entities\": [\"customer\", {\"name\": \"loan\"}], \"measures\": \"exposure\", \"limit\": \"10\"}\n```";
        let intent = Intent::parse("top customers by exposure", raw);
        assert_eq!(intent.intent, "rank customers by exposure");
        assert_eq!(intent.entities, vec!["customer", "loan"]);
        assert_eq!(intent.measures, vec!["exposure"]);
        assert_eq!(intent.limit, Some(10));
        assert_eq!(intent.group_by, vec!["exposure"]);
    }

    #[test]
    fn test_fallback_heuristics() {
        let intent = Intent::parse("Show the top 7 branches by revenue", "I think the user wants branch revenue.");
        assert_eq!(intent.intent, "I think the user wants branch revenue.");
        assert_eq!(intent.limit, Some(7));
        assert_eq!(intent.group_by, vec!["revenue"]);
    }

    #[test]
    fn test_from_question_and_mentions() {
        let intent = Intent::from_question("Which Customers have the highest exposure?");
        assert_eq!(intent.intent, "Which Customers have the highest exposure?");
        assert!(intent.limit.is_none());
        assert!(intent.mentions(&["customer"]));
        assert!(!intent.mentions(&["product"]));
    }

    #[test]
    fn test_prompt_block() {
        let intent = Intent {
            intent: "totals".to_string(),
            measures: vec!["amount".to_string()],
            limit: Some(5),
            ..Default::default()
        };
        assert_eq!(intent.prompt_block(), "Intent: totals\nMeasures: amount\nLimit: 5\n");
    }
}
