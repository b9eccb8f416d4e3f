//! Session identifiers and share links.
//!
//! A session is addressed by an opaque string id. Browsers carry it in the
//! `session` query parameter of the page URL, so the helpers here build and
//! parse those links.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

const SESSION_PARAM: &str = "session";

/// Opaque id of a shared editing session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id for a newly created session.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Extract the `session` query parameter from a page URL.
    ///
    /// Returns `None` when the parameter is absent or blank.
    pub fn from_url(url: &str) -> Option<Self> {
        let query = url.split_once('?')?.1;
        let query = query.split('#').next().unwrap_or_default();
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == SESSION_PARAM)
            .map(|(_, value)| percent_decode(value))
            .map(Self)
            .filter(|id| !id.is_empty())
    }

    /// Shareable link: `base` with the `session` parameter set to this id.
    pub fn share_url(&self, base: &str) -> String {
        let (base, fragment) = match base.split_once('#') {
            Some((base, fragment)) => (base, Some(fragment)),
            None => (base, None),
        };
        let (path, query) = match base.split_once('?') {
            Some((path, query)) => (path, query),
            None => (base, ""),
        };

        let mut params: Vec<String> = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .filter(|pair| pair.split('=').next() != Some(SESSION_PARAM))
            .map(str::to_string)
            .collect();
        params.push(format!("{}={}", SESSION_PARAM, percent_encode(&self.0)));

        let mut url = format!("{}?{}", path, params.join("&"));
        if let Some(fragment) = fragment {
            url.push('#');
            url.push_str(fragment);
        }
        url
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match hex {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_url_reads_session_param() {
        let id = SessionId::from_url("https://hozo.example/editor?session=abc123").unwrap();
        assert_eq!(id.as_str(), "abc123");

        let id = SessionId::from_url("http://h/?lang=ja&session=s-9#canvas").unwrap();
        assert_eq!(id, SessionId::new("s-9"));
    }

    #[test]
    fn test_from_url_missing_or_blank() {
        assert!(SessionId::from_url("https://hozo.example/editor").is_none());
        assert!(SessionId::from_url("https://hozo.example/editor?lang=ja").is_none());
        assert!(SessionId::from_url("https://hozo.example/editor?session=").is_none());
    }

    #[test]
    fn test_share_url_replaces_existing_param() {
        let id = SessionId::new("new-id");
        assert_eq!(
            id.share_url("https://hozo.example/editor"),
            "https://hozo.example/editor?session=new-id"
        );
        assert_eq!(
            id.share_url("https://hozo.example/editor?session=old&lang=ja#top"),
            "https://hozo.example/editor?lang=ja&session=new-id#top"
        );
    }

    #[test]
    fn test_share_url_round_trips_odd_ids() {
        let id = SessionId::new("team a/b");
        let url = id.share_url("http://h/");
        assert_eq!(url, "http://h/?session=team%20a%2Fb");
        assert_eq!(SessionId::from_url(&url), Some(id));
    }

    #[test]
    fn test_generate_is_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
        assert_eq!(SessionId::generate().as_str().len(), 32);
    }
}
