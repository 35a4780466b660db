//! Language detection by file extension.

use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lang {
    Rust,
    Python,
    JavaScript,
    TypeScript,
    Go,
    Java,
    Kotlin,
    C,
    Cpp,
    CSharp,
    Ruby,
    Php,
    Swift,
    Bash,
    Sql,
    Toml,
    Yaml,
    Json,
    Markdown,
}

impl Lang {
    /// Identifier used in vector payloads and config.
    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            Self::Rust => "rust",
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Go => "go",
            Self::Java => "java",
            Self::Kotlin => "kotlin",
            Self::C => "c",
            Self::Cpp => "cpp",
            Self::CSharp => "csharp",
            Self::Ruby => "ruby",
            Self::Php => "php",
            Self::Swift => "swift",
            Self::Bash => "bash",
            Self::Sql => "sql",
            Self::Toml => "toml",
            Self::Yaml => "yaml",
            Self::Json => "json",
            Self::Markdown => "markdown",
        }
    }

    /// Prose and config formats carry no symbols worth extracting.
    #[must_use]
    pub fn is_code(self) -> bool {
        !matches!(
            self,
            Self::Toml | Self::Yaml | Self::Json | Self::Markdown
        )
    }
}

impl std::fmt::Display for Lang {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Lowercase extension to language. Anything not listed is skipped by discovery.
const EXTENSIONS: &[(&str, Lang)] = &[
    ("rs", Lang::Rust),
    ("py", Lang::Python),
    ("pyi", Lang::Python),
    ("js", Lang::JavaScript),
    ("jsx", Lang::JavaScript),
    ("mjs", Lang::JavaScript),
    ("cjs", Lang::JavaScript),
    ("ts", Lang::TypeScript),
    ("tsx", Lang::TypeScript),
    ("mts", Lang::TypeScript),
    ("cts", Lang::TypeScript),
    ("go", Lang::Go),
    ("java", Lang::Java),
    ("kt", Lang::Kotlin),
    ("kts", Lang::Kotlin),
    ("c", Lang::C),
    ("h", Lang::C),
    ("cc", Lang::Cpp),
    ("cpp", Lang::Cpp),
    ("cxx", Lang::Cpp),
    ("hpp", Lang::Cpp),
    ("hh", Lang::Cpp),
    ("hxx", Lang::Cpp),
    ("cs", Lang::CSharp),
    ("rb", Lang::Ruby),
    ("php", Lang::Php),
    ("swift", Lang::Swift),
    ("sh", Lang::Bash),
    ("bash", Lang::Bash),
    ("zsh", Lang::Bash),
    ("sql", Lang::Sql),
    ("toml", Lang::Toml),
    ("yaml", Lang::Yaml),
    ("yml", Lang::Yaml),
    ("json", Lang::Json),
    ("jsonc", Lang::Json),
    ("md", Lang::Markdown),
    ("markdown", Lang::Markdown),
];

#[must_use]
pub fn detect_language(path: &Path) -> Option<Lang> {
    let ext = path.extension()?.to_str()?;
    EXTENSIONS
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(ext))
        .map(|&(_, lang)| lang)
}

/// Whether discovery should pick up `path`.
#[must_use]
pub fn is_indexable(path: &Path) -> bool {
    detect_language(path).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_lookup_ignores_case() {
        assert_eq!(detect_language(Path::new("src/main.rs")), Some(Lang::Rust));
        assert_eq!(detect_language(Path::new("web/App.TSX")), Some(Lang::TypeScript));
        assert_eq!(detect_language(Path::new("build.MJS")), Some(Lang::JavaScript));
    }

    #[test]
    fn unknown_or_missing_extension_is_skipped() {
        assert_eq!(detect_language(Path::new("notes.xyz")), None);
        assert_eq!(detect_language(Path::new("Makefile")), None);
        assert!(!is_indexable(Path::new(".kiln/manifest.json.tmp")));
    }

    #[test]
    fn every_extension_is_lowercase_and_unique() {
        let mut seen = std::collections::HashSet::new();
        for (ext, _) in EXTENSIONS {
            assert_eq!(*ext, ext.to_ascii_lowercase());
            assert!(seen.insert(*ext), "duplicate extension {ext}");
        }
    }

    #[test]
    fn config_formats_are_not_code() {
        assert!(!Lang::Toml.is_code());
        assert!(!Lang::Markdown.is_code());
        assert!(Lang::Go.is_code());
    }

    #[test]
    fn display_matches_id() {
        for lang in [Lang::Rust, Lang::Cpp, Lang::CSharp, Lang::Yaml] {
            assert_eq!(lang.to_string(), lang.id());
        }
    }
}
