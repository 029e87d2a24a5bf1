//! Network indicators pulled out of decoded strings.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://\S+").expect("valid url regex"));

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Indicator {
    pub url: String,
    /// Lowercased authority without credentials or port
    pub host: String,
    /// Registrable domain, approximated from the trailing host labels
    pub domain: String,
}

/// Remove embedded NUL bytes, which would otherwise end up inside matches
pub fn sanitize(s: &str) -> Cow<'_, str> {
    if s.contains('\0') {
        Cow::Owned(s.replace('\0', ""))
    } else {
        Cow::Borrowed(s)
    }
}

pub fn extract_urls(s: &str) -> Vec<String> {
    let clean = sanitize(s);
    URL_RE
        .find_iter(&clean)
        .map(|m| m.as_str().to_string())
        .collect()
}

pub fn host_of(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest
        .split(|c: char| c == '/' || c == '?' || c == '#')
        .next()
        .unwrap_or_default();
    let without_user = authority.rsplit_once('@').map_or(authority, |(_, it)| it);
    let host = if without_user.starts_with('[') {
        match without_user.find(']') {
            Some(end) => &without_user[..=end],
            None => without_user,
        }
    } else {
        without_user.split(':').next().unwrap_or_default()
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Registrable domain of `host` according to the public suffix list. IP
/// literals and hosts that are themselves a suffix are returned whole.
pub fn domain_of(host: &str) -> String {
    if host.starts_with('[') || is_ipv4(host) {
        return host.into();
    }
    psl::domain_str(host).unwrap_or(host).into()
}

fn is_ipv4(host: &str) -> bool {
    let parts = host.split('.').collect::<Vec<_>>();
    parts.len() == 4 && parts.iter().all(|it| it.parse::<u8>().is_ok())
}

impl Indicator {
    pub fn from_url(url: String) -> Self {
        let host = host_of(&url);
        let domain = domain_of(&host);
        Self { url, host, domain }
    }
}

/// Every URL indicator in `strings`, in encounter order, duplicates kept
pub fn extract_indicators<'a, I>(strings: I) -> Vec<Indicator>
where
    I: IntoIterator<Item = &'a str>,
{
    strings
        .into_iter()
        .flat_map(extract_urls)
        .map(Indicator::from_url)
        .collect()
}

#[derive(Debug, Clone)]
pub struct HighlightRule {
    pattern: Regex,
    label: String,
}

impl HighlightRule {
    pub fn new(pattern: &str, label: &str) -> crate::Result<Self> {
        let pattern = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| crate::Error::Generic(format!("bad highlight pattern: {e}")))?;
        Ok(Self {
            pattern,
            label: label.into(),
        })
    }
}

/// Labels indicators with the last matching rule
#[derive(Debug, Clone, Default)]
pub struct Highlighter {
    rules: Vec<HighlightRule>,
}

impl Highlighter {
    pub fn new(rules: Vec<HighlightRule>) -> Self {
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn classify(&self, ind: &Indicator) -> Option<&str> {
        self.rules
            .iter()
            .rev()
            .find(|rule| rule.pattern.is_match(&ind.url))
            .map(|rule| rule.label.as_str())
    }
}
