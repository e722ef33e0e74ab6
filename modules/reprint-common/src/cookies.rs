//! Domain-scoped cookie jar with atomic persistence.
//!
//! Browser drivers hand back cookies in whatever shape the protocol uses;
//! everything is normalized into `Cookie` at this boundary and invalid
//! entries are dropped rather than erroring.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ReprintError, Result};

/// Values longer than this are truncated on save.
pub const MAX_COOKIE_VALUE_LEN: usize = 4096;

const INVALID_NAME_CHARS: [char; 4] = ['{', '}', '"', '\''];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default, rename = "httpOnly")]
    pub http_only: bool,
}

fn default_path() -> String {
    "/".to_string()
}

impl Cookie {
    /// Normalize into a storable cookie, or None if the entry is invalid.
    /// Overlong values are truncated; bad names and empty domains are fatal
    /// for the entry.
    pub fn sanitized(mut self) -> Option<Cookie> {
        if self.name.is_empty()
            || !self.name.chars().all(|c| c.is_ascii_graphic())
            || self.name.chars().any(|c| INVALID_NAME_CHARS.contains(&c))
        {
            debug!(name = %self.name, "Dropping cookie with invalid name");
            return None;
        }
        if self.domain.is_empty() {
            debug!(name = %self.name, "Dropping cookie without a domain");
            return None;
        }
        if self.value.len() > MAX_COOKIE_VALUE_LEN {
            debug!(
                name = %self.name,
                len = self.value.len(),
                "Truncating overlong cookie value"
            );
            let mut end = MAX_COOKIE_VALUE_LEN;
            while !self.value.is_char_boundary(end) {
                end -= 1;
            }
            self.value.truncate(end);
        }
        if self.path.is_empty() {
            self.path = default_path();
        }
        Some(self)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct JarFile {
    #[serde(default)]
    cookies: HashMap<String, Vec<Cookie>>,
    #[serde(default)]
    session_data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    saved_at: Option<i64>,
}

/// On-disk cookie store keyed by domain. Cookies are never merged across
/// domains; loads and saves are strictly per-domain. Writes go through a
/// temp file and an atomic rename so readers never observe a torn file.
#[derive(Debug)]
pub struct CookieJar {
    path: PathBuf,
    cookies: HashMap<String, Vec<Cookie>>,
    session_data: serde_json::Map<String, serde_json::Value>,
}

impl CookieJar {
    /// Load the jar from `path`, dropping invalid entries. A missing or
    /// unreadable file yields an empty jar.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut jar = CookieJar {
            path,
            cookies: HashMap::new(),
            session_data: serde_json::Map::new(),
        };
        jar.reload();
        jar
    }

    /// Re-read the jar from disk, replacing in-memory state.
    pub fn reload(&mut self) {
        self.cookies.clear();
        self.session_data.clear();

        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        let file: JarFile = match serde_json::from_str(&raw) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Cookie jar unreadable, starting empty");
                return;
            }
        };

        let mut dropped = 0usize;
        for (domain, entries) in file.cookies {
            let total = entries.len();
            let valid: Vec<Cookie> =
                entries.into_iter().filter_map(Cookie::sanitized).collect();
            dropped += total - valid.len();
            if !valid.is_empty() {
                self.cookies.insert(domain, valid);
            }
        }
        self.session_data = file.session_data;
        if dropped > 0 {
            info!(dropped, "Dropped invalid cookies while loading jar");
        }
    }

    /// Cookies stored for exactly this domain. No parent-domain fallback:
    /// cross-domain loads caused navigation hangs historically.
    pub fn cookies_for(&self, domain: &str) -> Vec<Cookie> {
        self.cookies.get(domain).cloned().unwrap_or_default()
    }

    /// Replace the stored cookies for one domain. Entries are sanitized;
    /// invalid ones are dropped silently.
    pub fn store(&mut self, domain: &str, cookies: Vec<Cookie>) {
        let valid: Vec<Cookie> = cookies.into_iter().filter_map(Cookie::sanitized).collect();
        if valid.is_empty() {
            self.cookies.remove(domain);
        } else {
            self.cookies.insert(domain.to_string(), valid);
        }
    }

    pub fn domains(&self) -> Vec<&str> {
        self.cookies.keys().map(String::as_str).collect()
    }

    pub fn clear(&mut self) {
        self.cookies.clear();
        self.session_data.clear();
    }

    /// Persist the jar: write `<path>.tmp`, then rename over the target.
    pub fn save(&self) -> Result<()> {
        let file = JarFile {
            cookies: self.cookies.clone(),
            session_data: self.session_data.clone(),
            saved_at: Some(chrono::Utc::now().timestamp()),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| ReprintError::Config(format!("serializing cookie jar: {e}")))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    ReprintError::Config(format!("creating cookie dir: {e}"))
                })?;
            }
        }
        let tmp = tmp_path(&self.path);
        fs::write(&tmp, json)
            .map_err(|e| ReprintError::Config(format!("writing cookie jar: {e}")))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| ReprintError::Config(format!("replacing cookie jar: {e}")))?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie(name: &str, value: &str) -> Cookie {
        Cookie {
            name: name.to_string(),
            value: value.to_string(),
            domain: "linux.do".to_string(),
            path: "/".to_string(),
            secure: true,
            http_only: true,
        }
    }

    #[test]
    fn rejects_invalid_names() {
        assert!(cookie("ab{cd", "v").sanitized().is_none());
        assert!(cookie("a\"b", "v").sanitized().is_none());
        assert!(cookie("", "v").sanitized().is_none());
        assert!(cookie("name with space", "v").sanitized().is_none());
        assert!(cookie("_t", "v").sanitized().is_some());
    }

    #[test]
    fn truncates_overlong_values() {
        let c = cookie("session", &"x".repeat(MAX_COOKIE_VALUE_LEN + 1))
            .sanitized()
            .unwrap();
        assert_eq!(c.value.len(), MAX_COOKIE_VALUE_LEN);
    }

    #[test]
    fn rejects_missing_domain() {
        let mut c = cookie("session", "v");
        c.domain.clear();
        assert!(c.sanitized().is_none());
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.json");

        let mut jar = CookieJar::open(&path);
        jar.store(
            "linux.do",
            vec![
                cookie("_t", "token"),
                cookie("bad{name", "dropped"),
                cookie("long", &"y".repeat(MAX_COOKIE_VALUE_LEN + 50)),
            ],
        );
        jar.store("nodeseek.com", vec![cookie("sid", "abc")]);
        jar.save().unwrap();

        let reloaded = CookieJar::open(&path);
        let linux = reloaded.cookies_for("linux.do");
        assert_eq!(linux.len(), 2);
        assert!(linux.iter().any(|c| c.name == "_t" && c.value == "token"));
        assert!(linux
            .iter()
            .any(|c| c.name == "long" && c.value.len() == MAX_COOKIE_VALUE_LEN));
        assert_eq!(reloaded.cookies_for("nodeseek.com").len(), 1);
        // Strictly per-domain: no bleed between domains.
        assert!(reloaded.cookies_for("mp.weixin.qq.com").is_empty());
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.json");
        let mut jar = CookieJar::open(&path);
        jar.store("linux.do", vec![cookie("a", "b")]);
        jar.save().unwrap();
        assert!(path.exists());
        assert!(!tmp_path(&path).exists());
    }
}
