//! Navigation target → registrable domain.

use url::{Host, Url};

const TRACKED_SCHEMES: [&str; 2] = ["http", "https"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Trackable(String),
    Untrackable,
}

impl Classification {
    pub fn domain(&self) -> Option<&str> {
        match self {
            Classification::Trackable(d) => Some(d.as_str()),
            Classification::Untrackable => None,
        }
    }

    pub fn into_domain(self) -> Option<String> {
        match self {
            Classification::Trackable(d) => Some(d),
            Classification::Untrackable => None,
        }
    }
}

/// Classifies a URL string. Never fails: anything that is not an http(s) URL
/// with a host that has a public-suffix-derived eTLD+1 is `Untrackable`.
pub fn classify(url: &str) -> Classification {
    let Ok(parsed) = Url::parse(url.trim()) else {
        return Classification::Untrackable;
    };
    if !TRACKED_SCHEMES.contains(&parsed.scheme()) {
        return Classification::Untrackable;
    }
    // IP literals have no registrable domain.
    let host = match parsed.host() {
        Some(Host::Domain(h)) => h.trim_end_matches('.'),
        _ => return Classification::Untrackable,
    };
    if host.is_empty() {
        return Classification::Untrackable;
    }
    match psl::domain_str(host) {
        Some(d) if !d.is_empty() => Classification::Trackable(d.to_string()),
        _ => Classification::Untrackable,
    }
}

pub fn registrable_domain(url: &str) -> Option<String> {
    classify(url).into_domain()
}
