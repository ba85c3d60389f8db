//! Cookie access for the page environment

use dashmap::DashMap;
use std::fmt;
use std::sync::Mutex;
use std::sync::PoisonError;
use tracing::debug;

/// Options applied when writing a cookie
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieOptions {
    pub path: Option<String>,
    pub domain: Option<String>,
    /// Lifetime in seconds
    pub max_age: Option<u64>,
    /// Expiry date, already formatted for the `expires` attribute
    pub expires: Option<String>,
}

impl CookieOptions {
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_max_age(mut self, seconds: u64) -> Self {
        self.max_age = Some(seconds);
        self
    }
}

/// Read/write access to the page cookies
pub trait CookieJar: Send + Sync + 'static {
    fn get(&self, name: &str) -> Option<String>;
    fn set(&self, name: &str, value: &str, options: &CookieOptions);
    fn remove(&self, name: &str);
}

/// Render a `Set-Cookie` style string
pub fn to_cookie_string(name: &str, value: &str, options: &CookieOptions) -> String {
    let mut out = format!("{}={}", encode(name), encode(value));
    if let Some(path) = &options.path {
        out.push_str(&format!("; path={}", path));
    }
    if let Some(domain) = &options.domain {
        out.push_str(&format!("; domain={}", domain));
    }
    if let Some(max_age) = options.max_age {
        out.push_str(&format!("; max-age={}", max_age));
    }
    if let Some(expires) = &options.expires {
        out.push_str(&format!("; expires={}", expires));
    }
    out
}

fn encode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

fn decode(s: &str) -> String {
    url::form_urlencoded::parse(format!("v={}", s).as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_else(|| s.to_string())
}

/// A recorded cookie write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieWrite {
    Set {
        name: String,
        value: String,
        options: CookieOptions,
    },
    Remove {
        name: String,
    },
}

/// In-memory cookie jar seeded from a `Cookie` header
#[derive(Default)]
pub struct MemoryCookieJar {
    cookies: DashMap<String, String>,
    writes: Mutex<Vec<CookieWrite>>,
}

impl MemoryCookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a header such as `bid=abc; __odltest__=1`
    pub fn from_header(header: &str) -> Self {
        let jar = Self::new();
        for pair in header.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            jar.cookies
                .insert(decode(name.trim()), decode(value.trim()));
        }
        jar
    }

    /// Every set/remove issued against the jar, oldest first
    pub fn writes(&self) -> Vec<CookieWrite> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current cookies rendered as a `Cookie` header, sorted by name
    pub fn header(&self) -> String {
        let mut pairs: Vec<(String, String)> = self
            .cookies
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        pairs.sort();
        pairs
            .iter()
            .map(|(k, v)| format!("{}={}", encode(k), encode(v)))
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn record(&self, write: CookieWrite) {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(write);
    }
}

impl fmt::Debug for MemoryCookieJar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCookieJar")
            .field("cookies", &self.header())
            .finish()
    }
}

impl CookieJar for MemoryCookieJar {
    fn get(&self, name: &str) -> Option<String> {
        self.cookies.get(name).map(|v| v.value().clone())
    }

    fn set(&self, name: &str, value: &str, options: &CookieOptions) {
        debug!("🍪 {}", to_cookie_string(name, value, options));
        self.cookies.insert(name.to_string(), value.to_string());
        self.record(CookieWrite::Set {
            name: name.to_string(),
            value: value.to_string(),
            options: options.clone(),
        });
    }

    fn remove(&self, name: &str) {
        debug!("🍪 removing cookie '{}'", name);
        self.cookies.remove(name);
        self.record(CookieWrite::Remove {
            name: name.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_header() {
        let jar = MemoryCookieJar::from_header("bid=abc123; theme=dark ;empty=; flag");
        assert_eq!(jar.get("bid").as_deref(), Some("abc123"));
        assert_eq!(jar.get("theme").as_deref(), Some("dark"));
        assert_eq!(jar.get("empty").as_deref(), Some(""));
        assert_eq!(jar.get("flag").as_deref(), Some(""));
        assert_eq!(jar.get("missing"), None);
    }

    #[test]
    fn test_set_and_remove_are_recorded() {
        let jar = MemoryCookieJar::new();
        let options = CookieOptions::default().with_path("/").with_max_age(60);
        jar.set("a", "1", &options);
        jar.remove("a");
        assert_eq!(jar.get("a"), None);
        assert_eq!(
            jar.writes(),
            vec![
                CookieWrite::Set {
                    name: "a".into(),
                    value: "1".into(),
                    options,
                },
                CookieWrite::Remove { name: "a".into() },
            ]
        );
    }

    #[test]
    fn test_cookie_string() {
        let options = CookieOptions::default().with_path("/").with_max_age(604800);
        assert_eq!(
            to_cookie_string("__odltest__", "1", &options),
            "__odltest__=1; path=/; max-age=604800"
        );
    }
}
