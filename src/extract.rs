//! Pull executable query text out of free-form LLM replies.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref SQL_FENCE: Regex = Regex::new(r"(?is)```\s*sql\s*\n(.*?)```").unwrap();
    static ref DAX_FENCE: Regex = Regex::new(r"(?is)```\s*dax\s*\n(.*?)```").unwrap();
    static ref ANY_FENCE: Regex = Regex::new(r"(?s)```[A-Za-z]*\s*\n?(.*?)```").unwrap();
    static ref JSON_FENCE: Regex = Regex::new(r"(?is)```\s*json\s*\n?(.*?)```").unwrap();
    static ref SQL_START: Regex = Regex::new(r"(?s)\b(SELECT|WITH)\b.*").unwrap();
    static ref DAX_START: Regex = Regex::new(r"(?s)\b(EVALUATE|DEFINE)\b.*").unwrap();
    static ref FENCE_LINE: Regex = Regex::new(r"(?m)^\s*```.*$").unwrap();
}

const SQL_KEYWORDS: &[&str] = &["SELECT", "WITH", "INSERT", "UPDATE", "DELETE"];
const DAX_KEYWORDS: &[&str] = &["EVALUATE", "DEFINE", "MEASURE", "VAR"];

/// Replace typographic quotes with their ASCII forms.
pub fn sanitize_quotes(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{2032}' => '\'',
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{2033}' => '"',
            other => other,
        })
        .collect()
}

fn fenced(re: &Regex, raw: &str) -> Option<String> {
    re.captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// `sql` fence, then any fence, then everything from the first SELECT/WITH.
pub fn extract_sql(raw: &str) -> String {
    let text = fenced(&SQL_FENCE, raw)
        .or_else(|| fenced(&ANY_FENCE, raw))
        .or_else(|| SQL_START.find(raw).map(|m| m.as_str().trim().to_string()))
        .unwrap_or_else(|| raw.trim().to_string());
    sanitize_quotes(&text)
}

/// `dax` fence, then any fence, then everything from the first EVALUATE/DEFINE.
pub fn extract_dax(raw: &str) -> String {
    let text = fenced(&DAX_FENCE, raw)
        .or_else(|| fenced(&ANY_FENCE, raw))
        .or_else(|| DAX_START.find(raw).map(|m| m.as_str().trim().to_string()))
        .unwrap_or_else(|| raw.trim().to_string());
    sanitize_quotes(&text)
}

/// JSON body of a reply that may be wrapped in a fence.
pub fn extract_json(raw: &str) -> String {
    fenced(&JSON_FENCE, raw)
        .or_else(|| fenced(&ANY_FENCE, raw))
        .unwrap_or_else(|| raw.trim().to_string())
}

fn starts_with_keyword(line: &str, keywords: &[&str]) -> bool {
    let upper = line.trim_start().to_uppercase();
    keywords.iter().any(|k| {
        upper.starts_with(k)
            && upper[k.len()..]
                .chars()
                .next()
                .map_or(true, |c| !c.is_alphanumeric() && c != '_')
    })
}

/// Keep the statement from its first keyword line through the first `;`, terminated with `;`.
pub fn clean_sql(raw: &str) -> String {
    let without_fences = FENCE_LINE.replace_all(raw, "");
    let mut lines = Vec::new();
    let mut started = false;

    for line in without_fences.lines() {
        if !started && starts_with_keyword(line, SQL_KEYWORDS) {
            started = true;
        }
        if started {
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                continue;
            }
            lines.push(trimmed.to_string());
            if trimmed.ends_with(';') {
                break;
            }
        }
    }

    let mut sql = lines.join("\n").trim().to_string();
    if sql.is_empty() {
        return sql;
    }
    if !sql.ends_with(';') {
        sql.push(';');
    }
    sql
}

/// Keep the query from its first DAX keyword line and make sure it is evaluable.
pub fn clean_dax(raw: &str) -> String {
    let without_fences = FENCE_LINE.replace_all(raw, "");
    let mut lines = Vec::new();
    let mut started = false;

    for line in without_fences.lines() {
        if !started && starts_with_keyword(line, DAX_KEYWORDS) {
            started = true;
        }
        if started && !line.trim().is_empty() {
            lines.push(line.trim_end().to_string());
        }
    }

    let dax = lines.join("\n").trim().trim_end_matches(';').trim_end().to_string();
    if dax.is_empty() {
        return dax;
    }
    let upper = dax.to_uppercase();
    if upper.starts_with("EVALUATE") || upper.starts_with("DEFINE") {
        dax
    } else {
        format!("EVALUATE\n{}", dax)
    }
}
