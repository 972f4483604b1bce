use serde::Serialize;

/// Alignment of one response token against the expected token at the same
/// position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TokenDiff {
    Match { token: String },
    Mismatch { expected: String, actual: String },
    /// Expected token with no response token at that position.
    Missing { expected: String },
    /// Response token past the end of the expected line.
    Extra { actual: String },
}

impl TokenDiff {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match { .. })
    }
}

pub fn diff_line(expected: &str, actual: &str, separator: &str) -> Vec<TokenDiff> {
    let exp = split_tokens(expected, separator);
    let act = split_tokens(actual, separator);

    (0..exp.len().max(act.len()))
        .filter_map(|i| match (exp.get(i), act.get(i)) {
            (Some(e), Some(a)) if e == a => Some(TokenDiff::Match { token: e.to_string() }),
            (Some(e), Some(a)) => Some(TokenDiff::Mismatch {
                expected: e.to_string(),
                actual: a.to_string(),
            }),
            (Some(e), None) => Some(TokenDiff::Missing { expected: e.to_string() }),
            (None, Some(a)) => Some(TokenDiff::Extra { actual: a.to_string() }),
            (None, None) => None,
        })
        .collect()
}

fn split_tokens<'a>(line: &'a str, separator: &str) -> Vec<&'a str> {
    if line.is_empty() {
        Vec::new()
    } else {
        line.split(separator).collect()
    }
}

/// Plain-text rendering: matches as-is, mismatches as `[actual!=expected]`,
/// missing as `[-expected]`, extras as `[+actual]`.
pub fn render_diff(diffs: &[TokenDiff], separator: &str) -> String {
    diffs
        .iter()
        .map(|d| match d {
            TokenDiff::Match { token } => token.clone(),
            TokenDiff::Mismatch { expected, actual } => format!("[{actual}!={expected}]"),
            TokenDiff::Missing { expected } => format!("[-{expected}]"),
            TokenDiff::Extra { actual } => format!("[+{actual}]"),
        })
        .collect::<Vec<_>>()
        .join(separator)
}

/// Diff every expected line against the response line at the same index.
pub fn diff_response(expected: &str, response: &str, separator: &str) -> Vec<Vec<TokenDiff>> {
    let exp: Vec<&str> = expected.lines().collect();
    let resp: Vec<&str> = response.lines().collect();
    (0..exp.len().max(resp.len()))
        .map(|i| {
            diff_line(
                exp.get(i).copied().unwrap_or(""),
                resp.get(i).copied().unwrap_or(""),
                separator,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_line_kinds() {
        let d = diff_line("a|b|c", "a|x", "|");
        assert_eq!(
            d,
            vec![
                TokenDiff::Match { token: "a".into() },
                TokenDiff::Mismatch {
                    expected: "b".into(),
                    actual: "x".into()
                },
                TokenDiff::Missing { expected: "c".into() },
            ]
        );
        let d = diff_line("a", "a|z", "|");
        assert_eq!(d[1], TokenDiff::Extra { actual: "z".into() });
    }

    #[test]
    fn test_empty_actual_is_all_missing() {
        let d = diff_line("a|b", "", "|");
        assert!(d.iter().all(|t| matches!(t, TokenDiff::Missing { .. })));
        assert_eq!(d.len(), 2);
    }

    #[test]
    fn test_render() {
        let d = diff_line("a|b|c", "a|x", "|");
        assert_eq!(render_diff(&d, "|"), "a|[x!=b]|[-c]");
    }

    #[test]
    fn test_diff_response_pads_lines() {
        let rows = diff_response("a|b\nc|d", "a|b", "|");
        assert_eq!(rows.len(), 2);
        assert!(rows[0].iter().all(TokenDiff::is_match));
        assert_eq!(rows[1].len(), 2);
    }
}
