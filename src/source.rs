//! Source resolution contract.
//!
//! The debugger core never reads source files. Consumers that show source
//! plug in a [`SourceResolver`]; breakpoints and status locations carry the
//! literal file name the target reports, so resolvers match on the exact
//! relative path.

use std::collections::BTreeMap;

/// Tab stop width used by [`normalize_source`].
pub const TAB_WIDTH: usize = 8;

/// Looks up source text by the file name the target reports.
pub trait SourceResolver: Send + Sync {
    /// Source text for `file_name`, matched exactly.
    fn search(&self, file_name: &str) -> Option<String>;

    /// Every file name this resolver can serve, as relative paths.
    fn list_files(&self) -> Vec<String>;
}

/// Decode and normalise raw source bytes for display.
///
/// Invalid UTF-8 is replaced, CRLF becomes LF and tabs are expanded to
/// the next multiple of [`TAB_WIDTH`] columns.
///
/// ```
/// use dvalue_debugger::source::normalize_source;
///
/// assert_eq!(normalize_source(b"a\tb\r\nc"), "a       b\nc");
/// ```
pub fn normalize_source(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let mut out = String::with_capacity(text.len());
    let mut column = 0;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                out.push('\n');
                column = 0;
            }
            '\t' => {
                let fill = TAB_WIDTH - column % TAB_WIDTH;
                out.extend(std::iter::repeat(' ').take(fill));
                column += fill;
            }
            c => {
                out.push(c);
                column += 1;
            }
        }
    }

    out
}

/// In-memory resolver, keyed by exact file name.
#[derive(Debug, Clone, Default)]
pub struct MemorySources {
    files: BTreeMap<String, String>,
}

impl MemorySources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file; the bytes are normalised on insert.
    pub fn insert(&mut self, file_name: impl Into<String>, raw: &[u8]) {
        self.files.insert(file_name.into(), normalize_source(raw));
    }
}

impl SourceResolver for MemorySources {
    fn search(&self, file_name: &str) -> Option<String> {
        self.files.get(file_name).cloned()
    }

    fn list_files(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tab_stops_track_column() {
        assert_eq!(normalize_source(b"\tx"), "        x");
        assert_eq!(normalize_source(b"abc\tx"), "abc     x");
        assert_eq!(normalize_source(b"12345678\tx"), "12345678        x");
        assert_eq!(normalize_source(b"a\n\tb"), "a\n        b");
    }

    #[test]
    fn test_line_endings() {
        assert_eq!(normalize_source(b"a\r\nb\r\n"), "a\nb\n");
        // Lone CR is kept
        assert_eq!(normalize_source(b"a\rb"), "a\rb");
    }

    #[test]
    fn test_invalid_utf8_replaced() {
        assert_eq!(normalize_source(b"a\xffb"), "a\u{fffd}b");
    }

    #[test]
    fn test_exact_match_only() {
        let mut sources = MemorySources::new();
        sources.insert("lib/app.js", b"print(1);\r\n");

        assert_eq!(sources.search("lib/app.js").as_deref(), Some("print(1);\n"));
        assert!(sources.search("app.js").is_none());
        assert!(sources.search("./lib/app.js").is_none());
        assert_eq!(sources.list_files(), vec!["lib/app.js".to_string()]);
    }
}
