//! Session-scoped file tracker: which files and symbols the model has
//! actually read, with content hashes to gate blind or stale edits.
//!
//! State is in-memory only and protected by one mutex; the operations are
//! cheap lookups and inserts, shared between the agent fiber and any plan
//! or delegate fibers.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::Utc;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("file has not been read in this session: {0}")]
    FileNotSeen(PathBuf),

    #[error("symbol '{symbol}' in {path} has changed since it was read")]
    SymbolStale { path: PathBuf, symbol: String },
}

/// SHA-256 of the content with each line's trailing whitespace removed,
/// truncated to the first 64 bits.
pub fn content_hash(content: &str) -> u64 {
    let mut hasher = Sha256::new();
    for line in content.lines() {
        hasher.update(line.trim_end().as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolRecord {
    pub hash: u64,
    pub start_line: usize,
    pub end_line: usize,
    /// Which tool produced the observation (search, extract, …).
    pub source: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct TrackerState {
    seen: HashSet<PathBuf>,
    symbols: HashMap<(PathBuf, String), SymbolRecord>,
}

#[derive(Debug, Default)]
pub struct FileTracker {
    state: Mutex<TrackerState>,
}

impl FileTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_seen(&self, path: impl Into<PathBuf>) {
        if let Ok(mut state) = self.state.lock() {
            state.seen.insert(path.into());
        }
    }

    pub fn is_seen(&self, path: &Path) -> bool {
        self.state
            .lock()
            .map(|state| state.seen.contains(path))
            .unwrap_or(false)
    }

    /// Scan a read-style tool result for `File: <path>` headers and
    /// `--- <path> ---` separators; every path found is marked seen.
    /// Relative paths resolve against `cwd`.
    pub fn ingest_output(&self, output: &str, cwd: &Path) {
        for line in output.lines() {
            let trimmed = line.trim();
            let candidate = if let Some(rest) = trimmed.strip_prefix("File: ") {
                Some(rest.trim())
            } else if let Some(rest) = trimmed.strip_prefix("--- ") {
                rest.strip_suffix(" ---").map(str::trim)
            } else {
                None
            };
            let Some(candidate) = candidate else { continue };
            // Separator lines like "--- STDERR ---" are not paths.
            if candidate.is_empty() || !looks_like_path(candidate) {
                continue;
            }
            let path = resolve(cwd, candidate);
            self.mark_seen(path);
        }
    }

    pub fn record_symbol(
        &self,
        path: impl Into<PathBuf>,
        symbol: impl Into<String>,
        content: &str,
        start_line: usize,
        end_line: usize,
        source: impl Into<String>,
    ) {
        let path = path.into();
        if let Ok(mut state) = self.state.lock() {
            state.seen.insert(path.clone());
            state.symbols.insert(
                (path, symbol.into()),
                SymbolRecord {
                    hash: content_hash(content),
                    start_line,
                    end_line,
                    source: source.into(),
                    recorded_at: Utc::now(),
                },
            );
        }
    }

    pub fn symbol_record(&self, path: &Path, symbol: &str) -> Option<SymbolRecord> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.symbols.get(&(path.to_path_buf(), symbol.to_string())).cloned())
    }

    /// Gate for any edit: the path must have been read this session.
    pub fn check_edit(&self, path: &Path) -> Result<(), IntegrityError> {
        if self.is_seen(path) {
            Ok(())
        } else {
            Err(IntegrityError::FileNotSeen(path.to_path_buf()))
        }
    }

    /// Gate for a symbol-targeted edit: the path must be seen and the
    /// symbol's current content must hash to what was last observed.
    pub fn check_symbol_edit(
        &self,
        path: &Path,
        symbol: &str,
        current_content: &str,
    ) -> Result<(), IntegrityError> {
        self.check_edit(path)?;
        match self.symbol_record(path, symbol) {
            Some(record) if record.hash == content_hash(current_content) => Ok(()),
            _ => Err(IntegrityError::SymbolStale {
                path: path.to_path_buf(),
                symbol: symbol.to_string(),
            }),
        }
    }

    /// A non-symbol edit invalidates every symbol record for the path; the
    /// file itself stays seen.
    pub fn invalidate_path(&self, path: &Path) {
        if let Ok(mut state) = self.state.lock() {
            state.symbols.retain(|(p, _), _| p != path);
        }
    }

    /// A symbol-targeted edit refreshes that symbol's record in place.
    pub fn update_symbol(
        &self,
        path: &Path,
        symbol: &str,
        new_content: &str,
        start_line: usize,
        end_line: usize,
    ) {
        if let Ok(mut state) = self.state.lock() {
            let key = (path.to_path_buf(), symbol.to_string());
            if let Some(record) = state.symbols.get_mut(&key) {
                record.hash = content_hash(new_content);
                record.start_line = start_line;
                record.end_line = end_line;
                record.recorded_at = Utc::now();
            }
        }
    }
}

fn looks_like_path(candidate: &str) -> bool {
    !candidate.contains(' ') || candidate.contains('/') || candidate.contains('\\')
}

fn resolve(cwd: &Path, candidate: &str) -> PathBuf {
    let path = PathBuf::from(candidate);
    if path.is_absolute() {
        path
    } else {
        cwd.join(path)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn hash_ignores_trailing_whitespace_only() {
        let a = content_hash("fn main() {\n    body();  \n}\n");
        let b = content_hash("fn main() {\n    body();\n}\n");
        assert_eq!(a, b);

        let c = content_hash("fn main() {\n  body();\n}\n");
        assert_ne!(a, c, "leading whitespace is significant");
    }

    #[test]
    fn ingest_marks_file_headers_and_separators() {
        let tracker = FileTracker::new();
        let cwd = Path::new("/work");
        tracker.ingest_output(
            "File: src/main.rs\nfn main() {}\n\n--- /abs/lib.rs ---\npub fn x() {}\n",
            cwd,
        );
        assert!(tracker.is_seen(Path::new("/work/src/main.rs")));
        assert!(tracker.is_seen(Path::new("/abs/lib.rs")));
        assert!(!tracker.is_seen(Path::new("/work/other.rs")));
    }

    #[test]
    fn stderr_separator_is_not_a_path() {
        let tracker = FileTracker::new();
        tracker.ingest_output("--- STDERR ---\nboom\n", Path::new("/work"));
        assert!(!tracker.is_seen(Path::new("/work/STDERR")));
    }

    #[test]
    fn edit_gate_requires_seen() {
        let tracker = FileTracker::new();
        let path = Path::new("/work/a.rs");
        assert_eq!(
            tracker.check_edit(path),
            Err(IntegrityError::FileNotSeen(path.to_path_buf()))
        );
        tracker.mark_seen(path);
        assert_eq!(tracker.check_edit(path), Ok(()));
    }

    #[test]
    fn symbol_gate_detects_stale_content() {
        let tracker = FileTracker::new();
        let path = Path::new("/work/a.rs");
        tracker.record_symbol(path, "parse", "fn parse() { v1 }", 10, 12, "extract");

        assert_eq!(
            tracker.check_symbol_edit(path, "parse", "fn parse() { v1 }"),
            Ok(())
        );
        assert_eq!(
            tracker.check_symbol_edit(path, "parse", "fn parse() { v2 }"),
            Err(IntegrityError::SymbolStale {
                path: path.to_path_buf(),
                symbol: "parse".to_string(),
            })
        );
    }

    #[test]
    fn non_symbol_edit_invalidates_symbols_but_keeps_seen() {
        let tracker = FileTracker::new();
        let path = Path::new("/work/a.rs");
        tracker.record_symbol(path, "parse", "fn parse() {}", 1, 2, "extract");
        tracker.invalidate_path(path);
        assert!(tracker.is_seen(path));
        assert!(tracker.symbol_record(path, "parse").is_none());
    }

    #[test]
    fn symbol_edit_updates_record_in_place() {
        let tracker = FileTracker::new();
        let path = Path::new("/work/a.rs");
        tracker.record_symbol(path, "parse", "fn parse() { v1 }", 10, 12, "extract");
        tracker.update_symbol(path, "parse", "fn parse() { v2 }", 10, 13);
        assert_eq!(
            tracker.check_symbol_edit(path, "parse", "fn parse() { v2 }"),
            Ok(())
        );
        let record = tracker.symbol_record(path, "parse").unwrap();
        assert_eq!(record.end_line, 13);
    }
}
