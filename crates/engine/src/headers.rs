//! Header normalization and filtering.
//!
//! The protocol delivers headers in two shapes: request headers arrive as a
//! plain name → value mapping, response headers as an ordered list of
//! `{name, value}` pairs. Both normalize to a lower-cased map here.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::rules::HeaderMatcher;

/// One name/value pair, the shape response headers arrive in (and the shape
/// cached entries persist).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
}

impl HeaderEntry {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// The two header shapes the protocol delivers.
pub enum RawHeaders<'a> {
    Pairs(&'a [HeaderEntry]),
    Map(&'a HashMap<String, String>),
}

/// Reduce a raw header collection to an allow-listed, lower-cased mapping.
/// `Never` yields an empty map; `Always` keeps everything. Values are left
/// untouched.
pub fn filter_headers(headers: RawHeaders<'_>, matcher: &HeaderMatcher) -> BTreeMap<String, String> {
    let mut filtered = BTreeMap::new();
    if matches!(matcher, HeaderMatcher::Never) {
        return filtered;
    }

    match headers {
        RawHeaders::Pairs(pairs) => {
            for header in pairs {
                let name = header.name.to_lowercase();
                if matcher.allows(&name) {
                    filtered.insert(name, header.value.clone());
                }
            }
        }
        RawHeaders::Map(map) => {
            for (name, value) in map {
                let name = name.to_lowercase();
                if matcher.allows(&name) {
                    filtered.insert(name, value.clone());
                }
            }
        }
    }
    filtered
}

/// Case-insensitive lookup in the pair shape.
pub fn pair_value<'a>(headers: &'a [HeaderEntry], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

/// Case-insensitive lookup in the map shape.
pub fn map_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// POST body plus its content type, attached to Response observer events
/// and persisted with cached POST entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostData {
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// Extract the POST payload from a request's headers and body. The
/// `content-type` header is located case-insensitively.
pub fn post_payload(headers: &HashMap<String, String>, post_data: Option<&str>) -> PostData {
    PostData {
        data: post_data.map(str::to_string),
        content_type: map_value(headers, "content-type").map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_headers() -> HashMap<String, String> {
        HashMap::from([
            ("Content-Type".to_string(), "application/json".to_string()),
            ("Authorization".to_string(), "Bearer secret".to_string()),
            ("X-Trace".to_string(), "abc".to_string()),
        ])
    }

    fn response_headers() -> Vec<HeaderEntry> {
        vec![
            HeaderEntry::new("Content-Type", "text/html"),
            HeaderEntry::new("ETag", "\"v1\""),
        ]
    }

    #[test]
    fn test_filter_never_is_empty() {
        let map = request_headers();
        assert!(filter_headers(RawHeaders::Map(&map), &HeaderMatcher::Never).is_empty());

        let pairs = response_headers();
        assert!(filter_headers(RawHeaders::Pairs(&pairs), &HeaderMatcher::Never).is_empty());
    }

    #[test]
    fn test_filter_always_lower_cases_names() {
        let map = request_headers();
        let filtered = filter_headers(RawHeaders::Map(&map), &HeaderMatcher::Always);
        assert_eq!(filtered.len(), 3);
        assert_eq!(filtered.get("content-type").map(String::as_str), Some("application/json"));
        assert_eq!(filtered.get("authorization").map(String::as_str), Some("Bearer secret"));

        let pairs = response_headers();
        let filtered = filter_headers(RawHeaders::Pairs(&pairs), &HeaderMatcher::Always);
        assert_eq!(filtered.get("etag").map(String::as_str), Some("\"v1\""));
    }

    #[test]
    fn test_filter_allow_list() {
        let matcher = HeaderMatcher::Names(vec!["content-type".to_string()]);

        let map = request_headers();
        let filtered = filter_headers(RawHeaders::Map(&map), &matcher);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.get("content-type").map(String::as_str), Some("application/json"));

        let pairs = response_headers();
        let filtered = filter_headers(RawHeaders::Pairs(&pairs), &matcher);
        assert_eq!(filtered.len(), 1);
        assert!(filtered.get("etag").is_none());
    }

    #[test]
    fn test_post_payload_finds_content_type() {
        let headers = HashMap::from([("content-TYPE".to_string(), "text/plain".to_string())]);
        let post = post_payload(&headers, Some("a=1"));
        assert_eq!(post.data.as_deref(), Some("a=1"));
        assert_eq!(post.content_type.as_deref(), Some("text/plain"));

        let post = post_payload(&HashMap::new(), None);
        assert_eq!(post, PostData::default());
    }
}
