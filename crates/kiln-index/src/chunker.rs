//! Line-window chunking with a lightweight symbol heuristic.
//!
//! Windows grow to `target_lines` and then close at the next blank line, or
//! unconditionally at `max_lines`. No language grammar is involved.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::collaborators::{Chunk, Parser};
use crate::error::{IndexError, Result};
use crate::fingerprint::chunk_id;
use crate::languages::detect_language;

static SYMBOL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:(?:pub(?:\([^)]*\))?|export|default|async|static|public|private|protected|abstract|final|unsafe|const|extern)\s+)*(fn|def|class|struct|enum|trait|impl|interface|func|function|type|module|mod|object)\s+([A-Za-z_$][A-Za-z0-9_$]*)",
    )
    .unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Preferred window length; the window closes at the next blank line after this.
    #[serde(default = "default_target_lines")]
    pub target_lines: usize,
    /// Hard cap on window length.
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
}

fn default_target_lines() -> usize {
    40
}

fn default_max_lines() -> usize {
    80
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            target_lines: default_target_lines(),
            max_lines: default_max_lines(),
        }
    }
}

/// Rough token estimate: four characters per token.
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[derive(Debug, Clone, Default)]
pub struct LineChunker {
    config: ChunkerConfig,
}

impl LineChunker {
    #[must_use]
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }
}

fn symbol_kind(keyword: &str) -> &'static str {
    match keyword {
        "fn" | "def" | "func" | "function" => "function",
        "class" | "object" => "class",
        "struct" => "struct",
        "enum" => "enum",
        "trait" | "interface" => "interface",
        "impl" => "impl",
        "type" => "type",
        _ => "module",
    }
}

fn find_symbol(lines: &[&str]) -> Option<(&'static str, String)> {
    lines.iter().find_map(|line| {
        let caps = SYMBOL_RE.captures(line)?;
        Some((symbol_kind(&caps[1]), caps[2].to_owned()))
    })
}

impl Parser for LineChunker {
    fn parse(&self, path: &str, source: &str) -> Result<Vec<Chunk>> {
        if source.contains('\0') {
            return Err(IndexError::Parse(format!("{path}: binary content")));
        }
        let lang = detect_language(Path::new(path));
        let code = lang.is_none_or(|l| l.is_code());
        let target = self.config.target_lines.max(1);
        let max = self.config.max_lines.max(target);

        let lines: Vec<&str> = source.lines().collect();
        let mut windows: Vec<(usize, usize)> = Vec::new();
        let mut start = 0;
        for (i, line) in lines.iter().enumerate() {
            let len = i + 1 - start;
            if (len >= target && line.trim().is_empty()) || len >= max {
                windows.push((start, i));
                start = i + 1;
            }
        }
        if start < lines.len() {
            windows.push((start, lines.len() - 1));
        }

        let mut chunks = Vec::with_capacity(windows.len());
        for (first, last) in windows {
            let window = &lines[first..=last];
            let content = window.join("\n");
            if content.trim().is_empty() {
                continue;
            }
            let (chunk_type, symbol_name) = match code.then(|| find_symbol(window)).flatten() {
                Some((kind, name)) => (kind.to_owned(), Some(name)),
                None => ("block".to_owned(), None),
            };
            chunks.push(Chunk {
                id: chunk_id(path, chunks.len()),
                token_count: estimate_tokens(&content),
                content,
                file_path: path.to_owned(),
                language: lang.map(|l| l.id().to_owned()),
                chunk_type,
                symbol_name,
                start_line: first + 1,
                end_line: last + 1,
            });
        }
        Ok(chunks)
    }
}
