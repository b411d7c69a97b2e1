//! Embedding input text.
//!
//! Vectors are computed over the chunk body prefixed with its location, so
//! path-flavoured queries ("auth middleware") also match on file names.

use crate::types::Chunk;

/// Generate text for embedding (not for display).
#[must_use]
pub fn contextualize_for_embedding(chunk: &Chunk) -> String {
    let mut text = String::with_capacity(chunk.content.len() + chunk.file_path.len() + 32);
    text.push_str("# ");
    text.push_str(&chunk.file_path);
    text.push('\n');
    text.push_str(&format!("# lines {}-{}\n", chunk.start_line, chunk.end_line));
    text.push_str(&chunk.content);
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn header_precedes_content() {
        let chunk = Chunk {
            id: "c".into(),
            project_id: "p".into(),
            file_path: "src/auth/session.rs".into(),
            start_line: 16,
            end_line: 35,
            content: "fn refresh() {}\n".into(),
            hash: "h".into(),
            updated_at: Utc::now(),
        };
        let text = contextualize_for_embedding(&chunk);
        assert!(text.starts_with("# src/auth/session.rs\n# lines 16-35\n"));
        assert!(text.ends_with("fn refresh() {}\n"));
    }
}
