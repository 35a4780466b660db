//! Contextualized embedding text.
//!
//! Raw chunk content alone retrieves poorly for conceptual queries. The file
//! path, language, symbol name, and summary are prepended so the vector also
//! carries where the code lives and what it does.

use crate::collaborators::Chunk;

/// Summary characters kept in the embedding text.
const MAX_SUMMARY_CHARS: usize = 1000;

/// Text sent to the embedder for `chunk` (not for display).
#[must_use]
pub fn contextualize_for_embedding(chunk: &Chunk, summary: Option<&str>) -> String {
    let mut text = String::with_capacity(chunk.content.len() + 256);

    text.push_str("# ");
    text.push_str(&chunk.file_path);
    text.push('\n');

    if let Some(lang) = chunk.language.as_deref() {
        text.push_str("# Language: ");
        text.push_str(lang);
        text.push('\n');
    }

    if let Some(symbol) = chunk.symbol_name.as_deref() {
        text.push_str("# Symbol: ");
        text.push_str(&chunk.chunk_type);
        text.push(' ');
        text.push_str(symbol);
        text.push('\n');
    }

    if let Some(summary) = summary.map(str::trim).filter(|s| !s.is_empty()) {
        text.push_str("# Summary: ");
        text.extend(summary.chars().take(MAX_SUMMARY_CHARS));
        text.push('\n');
    }

    text.push_str(&chunk.content);
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chunk() -> Chunk {
        Chunk {
            id: "src/lib.rs#0".into(),
            content: "fn hello() { 42 }".into(),
            file_path: "src/lib.rs".into(),
            language: Some("rust".into()),
            chunk_type: "function".into(),
            symbol_name: Some("hello".into()),
            start_line: 1,
            end_line: 3,
            token_count: 5,
        }
    }

    #[test]
    fn contextualize_includes_file_path() {
        let text = contextualize_for_embedding(&sample_chunk(), None);
        assert!(text.starts_with("# src/lib.rs\n"));
    }

    #[test]
    fn contextualize_includes_language_and_symbol() {
        let text = contextualize_for_embedding(&sample_chunk(), None);
        assert!(text.contains("# Language: rust\n"));
        assert!(text.contains("# Symbol: function hello\n"));
    }

    #[test]
    fn contextualize_ends_with_content() {
        let text = contextualize_for_embedding(&sample_chunk(), Some("says hello"));
        assert!(text.contains("# Summary: says hello\n"));
        assert!(text.ends_with("fn hello() { 42 }"));
    }

    #[test]
    fn blank_summary_and_missing_symbol_are_omitted() {
        let mut chunk = sample_chunk();
        chunk.symbol_name = None;
        chunk.language = None;
        let text = contextualize_for_embedding(&chunk, Some("   "));
        assert!(!text.contains("# Summary"));
        assert!(!text.contains("# Symbol"));
        assert!(!text.contains("# Language"));
        assert_eq!(text, "# src/lib.rs\nfn hello() { 42 }");
    }
}
