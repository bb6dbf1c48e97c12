//! Textual DAX tooling: validation, correction, formatting, template planning
//! and SQL translation.
//!
//! Nothing here parses DAX into a tree. The helpers below give the rule
//! sets enough structure (call spans, top-level arguments, literal masking)
//! to avoid the worst false positives of plain substring matching.

pub mod corrector;
pub mod formatter;
pub mod patterns;
pub mod translate;
pub mod validator;

pub use corrector::{fix_customer_aggregation, suggest_improvements};
pub use formatter::{format_local, DaxFormatterClient};
pub use patterns::{DaxPattern, DaxQueryPlan, PatternPlanner};
pub use translate::translate_dax_to_sql;
pub use validator::{DaxValidator, Severity, ValidationIssue, ValidationResult};

/// Blank out string literals and comments, keeping byte offsets intact.
pub(crate) fn mask_literals(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    let mut in_string = false;

    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            if b == b'"' {
                in_string = false;
                out.push(b'"');
            } else {
                out.push(if b.is_ascii() { b' ' } else { b });
            }
            i += 1;
            continue;
        }
        if b == b'"' {
            in_string = true;
            out.push(b'"');
            i += 1;
        } else if b == b'/' && bytes.get(i + 1) == Some(&b'/') {
            while i < bytes.len() && bytes[i] != b'\n' {
                out.push(if bytes[i].is_ascii() { b' ' } else { bytes[i] });
                i += 1;
            }
        } else if b == b'/' && bytes.get(i + 1) == Some(&b'*') {
            while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                out.push(if bytes[i] == b'\n' || !bytes[i].is_ascii() { bytes[i] } else { b' ' });
                i += 1;
            }
            let end = (i + 2).min(bytes.len());
            out.extend(std::iter::repeat(b' ').take(end - i));
            i = end;
        } else {
            out.push(b);
            i += 1;
        }
    }
    // Only ASCII bytes were replaced, so UTF-8 sequences are untouched.
    String::from_utf8(out).unwrap_or_else(|_| text.to_string())
}

/// Byte offset of the `)` matching the `(` at `open`, skipping quoted names and strings.
pub(crate) fn matching_paren(text: &str, open: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            continue;
        }
        match b {
            b'\'' | b'"' => quote = Some(b),
            b'(' => depth += 1,
            b')' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Argument text of every call to `function` (case-insensitive, whole word).
pub(crate) fn find_calls<'a>(text: &'a str, function: &str) -> Vec<&'a str> {
    let pattern = format!(r"(?i)\b{}\s*\(", regex::escape(function));
    let re = match regex::Regex::new(&pattern) {
        Ok(re) => re,
        Err(_) => return Vec::new(),
    };
    re.find_iter(text)
        .filter_map(|m| {
            let open = m.end() - 1;
            matching_paren(text, open).map(|close| &text[open + 1..close])
        })
        .collect()
}

/// Split an argument list on top-level commas.
pub(crate) fn split_args(args: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;

    for (i, c) in args.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(args[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = args[start..].trim();
    if !last.is_empty() || !parts.is_empty() {
        parts.push(last);
    }
    parts
}

/// 1-based line of a byte offset.
pub(crate) fn line_of(text: &str, offset: usize) -> usize {
    text[..offset.min(text.len())].matches('\n').count() + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_literals() {
        let masked = mask_literals("EVALUATE FILTER('T', 'T'[A] = \"it's\") // note 'X'");
        assert_eq!(masked.len(), "EVALUATE FILTER('T', 'T'[A] = \"it's\") // note 'X'".len());
        assert!(masked.contains("'T'[A] = \"    \")"));
        assert!(!masked.contains("'X'"));
    }

    #[test]
    fn test_find_calls_nested() {
        let q = "EVALUATE TOPN(5, SUMMARIZE('F', 'F'[K], \"S\", SUM('F'[A])), [S], DESC)";
        let calls = find_calls(q, "TOPN");
        assert_eq!(calls.len(), 1);
        let args = split_args(calls[0]);
        assert_eq!(args.len(), 4);
        assert_eq!(args[0], "5");
        assert!(args[1].starts_with("SUMMARIZE("));
        assert_eq!(args[3], "DESC");
        assert_eq!(find_calls(q, "SUM").len(), 1);
    }

    #[test]
    fn test_split_args_quotes() {
        assert_eq!(split_args("'A, B'[x], \"a,b\""), vec!["'A, B'[x]", "\"a,b\""]);
        assert!(split_args("").is_empty());
    }

    #[test]
    fn test_line_of() {
        assert_eq!(line_of("a\nb\nc", 4), 3);
        assert_eq!(line_of("abc", 0), 1);
    }
}
