//! Query and content tokenization shared by both lexical ranking paths.
//!
//! No stemming and no stopword removal: identifiers such as `parse_config`
//! must survive verbatim.

use std::collections::HashMap;

fn is_token_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Lowercased tokens in document order, duplicates kept.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !is_token_char(c))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Term frequencies for one chunk.
pub(crate) fn term_frequencies(text: &str) -> HashMap<String, u32> {
    let mut tf = HashMap::new();
    for token in tokenize(text) {
        *tf.entry(token).or_insert(0) += 1;
    }
    tf
}

/// Distinct query terms in first-seen order.
pub(crate) fn query_terms(query: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for token in tokenize(query) {
        if !seen.contains(&token) {
            seen.push(token);
        }
    }
    seen
}

/// FTS5 `MATCH` expression: every term quoted as a phrase, joined with `OR`.
pub(crate) fn fts5_match_expression(terms: &[String]) -> String {
    terms
        .iter()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_survive() {
        assert_eq!(
            tokenize("fn parse_config(path: &Path) -> Config"),
            vec!["fn", "parse_config", "path", "path", "config"]
        );
    }

    #[test]
    fn no_stemming() {
        assert_eq!(tokenize("running runs"), vec!["running", "runs"]);
    }

    #[test]
    fn frequencies_count_duplicates() {
        let tf = term_frequencies("login login Logout");
        assert_eq!(tf["login"], 2);
        assert_eq!(tf["logout"], 1);
    }

    #[test]
    fn query_terms_dedup_in_order() {
        assert_eq!(query_terms("Auth token auth"), vec!["auth", "token"]);
        assert!(query_terms("  -- ;; ").is_empty());
    }

    #[test]
    fn match_expression_quotes_terms() {
        let terms = vec!["user_id".to_string(), "and".to_string()];
        assert_eq!(fts5_match_expression(&terms), "\"user_id\" OR \"and\"");
    }
}
