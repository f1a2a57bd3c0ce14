//! Loading the image-swap map file into ordered rule tables.
//!
//! The file format predates this implementation (see the `[EXACT]`/`[REPLACE]`
//! prefixes below) and is kept byte-for-byte compatible with the existing
//! convention operators already have deployed.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::warn;

pub const DEFAULT_KEY: &str = "default";
pub const NOSWAP_WILDCARDS_KEY: &str = "noswap_wildcards";

#[derive(Debug, Error)]
pub enum MapLoadError {
    #[error("reading map file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// The three ordered rule tables parsed from a map file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleTables {
    pub exact: HashMap<String, String>,
    pub replace: Vec<(String, String)>,
    pub prefix: HashMap<String, String>,
}

impl RuleTables {
    pub fn default_prefix(&self) -> Option<&str> {
        self.prefix.get(DEFAULT_KEY).map(String::as_str)
    }

    pub fn noswap_wildcards(&self) -> Vec<&str> {
        match self.prefix.get(NOSWAP_WILDCARDS_KEY) {
            Some(v) => v.split(',').map(str::trim).filter(|s| !s.is_empty()).collect(),
            None => Vec::new(),
        }
    }
}

/// Parses the map file grammar described in the file format documentation:
/// comments, blank lines, `::`/`:` separators, and the `[EXACT]`/`[REPLACE]`
/// key prefixes. Malformed lines are logged and skipped; the loader never
/// fails outright on a bad line, only on an unreadable file.
pub fn load(path: &Path) -> Result<RuleTables, MapLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| MapLoadError::Read {
        path: path.display().to_string(),
        source,
    })?;
    Ok(parse(&contents))
}

pub fn parse(contents: &str) -> RuleTables {
    let mut tables = RuleTables::default();

    for (lineno, raw_line) in contents.lines().enumerate() {
        let lineno = lineno + 1;
        let line = strip_comment(raw_line);
        let line: String = line.chars().filter(|c| !c.is_whitespace()).collect();
        if line.is_empty() {
            continue;
        }

        let (key, value) = match split_key_value(&line, lineno) {
            Some(kv) => kv,
            None => continue,
        };

        if let Some(exact_key) = key.strip_prefix("[EXACT]") {
            tables.exact.insert(exact_key.to_string(), value);
        } else if let Some(glob) = key.strip_prefix("[REPLACE]") {
            tables.replace.push((glob.to_string(), value));
        } else {
            tables.prefix.insert(key, value);
        }
    }

    tables
}

fn strip_comment(line: &str) -> &str {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        return "";
    }
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn split_key_value(line: &str, lineno: usize) -> Option<(String, String)> {
    if let Some((key, value)) = line.split_once("::") {
        if value.contains("::") {
            warn!(lineno, line, "map line has more than one `::` separator, skipping");
            return None;
        }
        return Some((key.to_string(), value.to_string()));
    }

    let colon_count = line.matches(':').count();
    if colon_count == 0 {
        warn!(lineno, line, "map line has no key/value separator, skipping");
        return None;
    }
    if colon_count > 1 {
        warn!(
            lineno, line,
            "map line has more than one `:`; use `::` to separate key and value, skipping"
        );
        return None;
    }

    warn!(lineno, line, "map line uses deprecated `:` separator, prefer `::`");
    line.split_once(':').map(|(k, v)| (k.to_string(), v.to_string()))
}

/// Matches a full image string against a `[REPLACE]` glob pattern using
/// shell-style wildcards (`*`, `?`).
pub fn glob_matches(pattern: &str, candidate: &str) -> bool {
    match glob::Pattern::new(pattern) {
        Ok(p) => p.matches(candidate),
        Err(_) => false,
    }
}

/// A process-wide, hot-reloadable handle to the current rule tables.
///
/// Readers call [`RuleTablesHandle::current`] once per request and operate
/// on the returned `Arc` for the whole request; they never observe a torn
/// table mid-reload. A background task calls [`RuleTablesHandle::reload_if_stale`]
/// on a fixed cadence, comparing the map file's mtime before re-parsing.
pub struct RuleTablesHandle {
    path: std::path::PathBuf,
    tables: RwLock<Arc<RuleTables>>,
    last_mtime: RwLock<Option<SystemTime>>,
}

impl RuleTablesHandle {
    pub fn load(path: impl Into<std::path::PathBuf>) -> Result<Self, MapLoadError> {
        let path = path.into();
        let tables = load(&path)?;
        let mtime = fs::metadata(&path).and_then(|m| m.modified()).ok();
        Ok(RuleTablesHandle {
            path,
            tables: RwLock::new(Arc::new(tables)),
            last_mtime: RwLock::new(mtime),
        })
    }

    /// Builds a handle around an already-parsed table, with no backing file
    /// to reload from. Used by callers that only need the shared-reader
    /// shape, such as tests.
    pub fn from_tables(tables: RuleTables) -> Self {
        RuleTablesHandle {
            path: std::path::PathBuf::new(),
            tables: RwLock::new(Arc::new(tables)),
            last_mtime: RwLock::new(None),
        }
    }

    pub fn current(&self) -> Arc<RuleTables> {
        self.tables.read().expect("rule tables lock poisoned").clone()
    }

    /// Re-parses the map file if its mtime has advanced since the last load.
    /// Returns `true` if a reload happened.
    pub fn reload_if_stale(&self) -> bool {
        let current_mtime = match fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(m) => m,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "could not stat map file, keeping previous tables");
                return false;
            }
        };

        let stale = {
            let last = self.last_mtime.read().expect("mtime lock poisoned");
            !matches!(*last, Some(prev) if prev >= current_mtime)
        };
        if !stale {
            return false;
        }

        match load(&self.path) {
            Ok(fresh) => {
                *self.tables.write().expect("rule tables lock poisoned") = Arc::new(fresh);
                *self.last_mtime.write().expect("mtime lock poisoned") = Some(current_mtime);
                crate::metrics::MAP_RELOAD_TOTAL.with_label_values(&["success"]).inc();
                true
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to reload map file, keeping previous tables");
                crate::metrics::MAP_RELOAD_TOTAL.with_label_values(&["failure"]).inc();
                false
            }
        }
    }
}

/// Spawns the background reload loop described in the concurrency model:
/// a fixed-cadence mtime check that swaps in a freshly parsed table only on
/// change.
pub fn spawn_reload_task(handle: Arc<RuleTablesHandle>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if handle.reload_if_stale() {
                tracing::info!("reloaded image swap map");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let tables = parse("# a comment\n\n   \ndefault :: default.example.com\n");
        assert_eq!(tables.prefix.get("default"), Some(&"default.example.com".to_string()));
    }

    #[test]
    fn trailing_comment_is_stripped() {
        let tables = parse("default :: default.example.com # fallback registry\n");
        assert_eq!(tables.prefix.get("default"), Some(&"default.example.com".to_string()));
    }

    #[test]
    fn whitespace_is_removed() {
        let tables = parse("  default  ::  default.example.com  \n");
        assert_eq!(tables.prefix.get("default"), Some(&"default.example.com".to_string()));
    }

    #[test]
    fn legacy_single_colon_separator_is_accepted() {
        let tables = parse("default:default.example.com\n");
        assert_eq!(tables.prefix.get("default"), Some(&"default.example.com".to_string()));
    }

    #[test]
    fn more_than_one_bare_colon_is_rejected() {
        let tables = parse("docker.io:443:my.example.com\n");
        assert!(tables.prefix.is_empty());
    }

    #[test]
    fn exact_prefix_routes_to_exact_table() {
        let tables = parse("[EXACT]hello-world::myownrepo.example.com/base/public-image-cache:hello-world\n");
        assert_eq!(
            tables.exact.get("hello-world"),
            Some(&"myownrepo.example.com/base/public-image-cache:hello-world".to_string())
        );
    }

    #[test]
    fn replace_prefix_preserves_file_order() {
        let tables = parse(
            "[REPLACE]*-server:*::myownrepo.example.com/base/public-image-cache\n\
             [REPLACE]*-client:*::myownrepo.example.com/base/other-cache\n",
        );
        assert_eq!(tables.replace.len(), 2);
        assert_eq!(tables.replace[0].0, "*-server:*");
        assert_eq!(tables.replace[1].0, "*-client:*");
    }

    #[test]
    fn duplicate_keys_take_last_definition() {
        let tables = parse("default::one.example.com\ndefault::two.example.com\n");
        assert_eq!(tables.prefix.get("default"), Some(&"two.example.com".to_string()));
    }

    #[test]
    fn noswap_wildcards_split_on_comma() {
        let tables = parse("noswap_wildcards::.external.twr.io,.internal.twr.io\n");
        assert_eq!(tables.noswap_wildcards(), vec![".external.twr.io", ".internal.twr.io"]);
    }

    #[test]
    fn glob_match_supports_star_and_question_mark() {
        assert!(glob_matches("*-server:*", "mysql/mysql-server:5.6"));
        assert!(!glob_matches("*-server:*", "mysql/mysql-client:5.6"));
    }
}
