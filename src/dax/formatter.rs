//! DAX layout, locally or through DAXFormatter.com.

use crate::dax::mask_literals;
use crate::error::{PipelineError, Result};
use crate::extract::sanitize_quotes;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

pub const DAX_FORMATTER_URL: &str = "https://www.daxformatter.com/api/daxformatter/";

lazy_static! {
    static ref ORDER_BY: Regex = Regex::new(r"(?i)\bORDER\s+BY\b").unwrap();
}

/// Calls whose arguments are laid out one per line.
const BROKEN_CALLS: &[&str] = &[
    "TOPN",
    "SELECTCOLUMNS",
    "SUMMARIZE",
    "SUMMARIZECOLUMNS",
    "ADDCOLUMNS",
    "FILTER",
    "GENERATE",
];

#[derive(PartialEq)]
enum Gap {
    None,
    Space,
    Newline,
}

fn newline(out: &mut String, depth: usize) {
    let trimmed = out.trim_end_matches(' ').len();
    out.truncate(trimmed);
    out.push('\n');
    out.push_str(&"    ".repeat(depth));
}

fn depth(stack: &[bool]) -> usize {
    stack.iter().filter(|b| **b).count()
}

fn layout(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 2);
    let mut stack: Vec<bool> = Vec::new();
    let mut quote: Option<char> = None;
    let mut word = String::new();
    let mut gap = Gap::None;

    for c in text.chars() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }

        if c.is_whitespace() {
            let keyword = word.to_uppercase();
            if depth(&stack) == 0 && (keyword == "EVALUATE" || keyword == "DEFINE" || c == '\n') {
                gap = Gap::Newline;
            } else if gap == Gap::None {
                gap = Gap::Space;
            }
            word.clear();
            continue;
        }

        match c {
            '(' => {
                let broken = BROKEN_CALLS.iter().any(|f| f.eq_ignore_ascii_case(&word));
                if gap == Gap::Newline {
                    newline(&mut out, depth(&stack));
                }
                out.push('(');
                stack.push(broken);
                if broken {
                    newline(&mut out, depth(&stack));
                }
                word.clear();
            }
            ')' => {
                let broken = stack.pop().unwrap_or(false);
                if broken {
                    newline(&mut out, depth(&stack));
                }
                out.push(')');
                word.clear();
            }
            ',' => {
                out.push(',');
                if stack.last() == Some(&true) {
                    newline(&mut out, depth(&stack));
                    gap = Gap::None;
                } else {
                    gap = Gap::Space;
                }
                word.clear();
                continue;
            }
            _ => {
                match gap {
                    Gap::Newline => newline(&mut out, depth(&stack)),
                    Gap::Space if !out.is_empty() && !out.ends_with(['\n', ' ', '(']) => out.push(' '),
                    _ => {}
                }
                out.push(c);
                match c {
                    '\'' | '"' => quote = Some(c),
                    '[' => quote = Some(']'),
                    _ => {}
                }
                if c.is_alphanumeric() || c == '_' || c == '.' {
                    word.push(c);
                } else {
                    word.clear();
                }
            }
        }
        gap = Gap::None;
    }

    out.lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Lay out a DAX query without network access.
///
/// Returns the formatted text and any syntax problems spotted on the way.
pub fn format_local(query: &str) -> (String, Vec<String>) {
    let text = sanitize_quotes(query.trim());
    if text.is_empty() {
        return (String::new(), vec!["DAX code is empty".to_string()]);
    }

    let mut errors = Vec::new();
    let masked = mask_literals(&text);
    if ORDER_BY.is_match(&masked) {
        errors.push("Invalid DAX syntax: 'ORDER BY' is not valid in DAX. Use TOPN for sorting.".to_string());
    }
    let upper = text.to_uppercase();
    if !(upper.starts_with("EVALUATE") || upper.starts_with("DEFINE")) {
        errors.push("DAX query should start with EVALUATE".to_string());
    }
    let open = masked.matches('(').count();
    let close = masked.matches(')').count();
    if open != close {
        errors.push(format!("Unbalanced parentheses: {} opening, {} closing", open, close));
    }

    (layout(&text), errors)
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct FormatRequest<'a> {
    dax: &'a str,
    separator: &'a str,
    annotations: bool,
    shorten_names: bool,
    add_line_breaks: bool,
    include_errors: bool,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct FormatResponse {
    #[serde(default)]
    formatted_dax: Option<String>,
    #[serde(default)]
    errors: Vec<Value>,
}

fn error_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .or_else(|| map.get("Message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

/// Client for the DAXFormatter.com service.
pub struct DaxFormatterClient {
    client: Client,
    url: String,
}

impl DaxFormatterClient {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PipelineError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: DAX_FORMATTER_URL.to_string(),
        })
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Format through the service. Failures come back as the unchanged query plus one error.
    pub async fn format(&self, query: &str) -> (String, Vec<String>) {
        let request = FormatRequest {
            dax: query,
            separator: ",",
            annotations: false,
            shorten_names: false,
            add_line_breaks: true,
            include_errors: true,
        };

        let response = match self.client.post(&self.url).json(&request).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("DAX Formatter request failed: {}", e);
                return (query.to_string(), vec![format!("DAX Formatter request failed: {}", e)]);
            }
        };
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() || body.trim().is_empty() {
            return (
                query.to_string(),
                vec![format!("DAX Formatter API error: HTTP {} - {}", status.as_u16(), body.trim())],
            );
        }

        let parsed: FormatResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(e) => {
                return (
                    query.to_string(),
                    vec![format!("DAX Formatter API returned invalid JSON: {}", e)],
                )
            }
        };
        let errors: Vec<String> = parsed.errors.iter().map(error_text).collect();
        debug!("DAX Formatter returned {} errors", errors.len());

        match parsed.formatted_dax.filter(|f| !f.trim().is_empty()) {
            Some(formatted) => (formatted, errors),
            None if errors.is_empty() => (
                query.to_string(),
                vec!["DAX Formatter API returned no formatted DAX and no errors.".to_string()],
            ),
            None => (query.to_string(), errors),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_format_local_layout() {
        let (formatted, errors) = format_local("EVALUATE TOPN(5,'Table','Table'[Column],DESC)");
        assert!(errors.is_empty());
        assert_eq!(formatted, "EVALUATE\nTOPN(\n    5,\n    'Table',\n    'Table'[Column],\n    DESC\n)");
    }

    #[test]
    fn test_format_local_nested_calls() {
        let (formatted, _) = format_local(
            "EVALUATE ADDCOLUMNS(SUMMARIZE('F', 'F'[Key]),  \"Total\", CALCULATE(SUM('F'[Amount, USD])))",
        );
        assert_eq!(
            formatted,
            "EVALUATE\nADDCOLUMNS(\n    SUMMARIZE(\n        'F',\n        'F'[Key]\n    ),\n    \"Total\",\n    CALCULATE(SUM('F'[Amount, USD]))\n)"
        );
    }

    #[test]
    fn test_format_local_errors() {
        assert_eq!(format_local("  "), (String::new(), vec!["DAX code is empty".to_string()]));

        let (_, errors) = format_local("SUMMARIZE('T', 'T'[a]\nORDER BY 'T'[a]");
        assert_eq!(errors.len(), 3);
        assert!(errors[0].contains("ORDER BY"));
        assert_eq!(errors[2], "Unbalanced parentheses: 1 opening, 0 closing");
    }

    #[tokio::test]
    async fn test_remote_format() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"Separator": ",", "IncludeErrors": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "FormattedDax": "EVALUATE\n    'T'",
                "Errors": []
            })))
            .mount(&server)
            .await;

        let client = DaxFormatterClient::new().unwrap().with_url(server.uri());
        let (formatted, errors) = client.format("EVALUATE 'T'").await;
        assert_eq!(formatted, "EVALUATE\n    'T'");
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn test_remote_failures_fall_back_to_input() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;
        let client = DaxFormatterClient::new().unwrap().with_url(server.uri());
        let (formatted, errors) = client.format("EVALUATE 'T'").await;
        assert_eq!(formatted, "EVALUATE 'T'");
        assert_eq!(errors, vec!["DAX Formatter API error: HTTP 503 - busy"]);

        let empty = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"FormattedDax": ""})))
            .mount(&empty)
            .await;
        let client = DaxFormatterClient::new().unwrap().with_url(empty.uri());
        let (formatted, errors) = client.format("EVALUATE 'T'").await;
        assert_eq!(formatted, "EVALUATE 'T'");
        assert!(errors[0].contains("no formatted DAX and no errors"));
    }
}
