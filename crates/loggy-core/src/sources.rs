//! Analytics source rules and URL classification.
//!
//! A [`Source`] is a declarative matcher for a family of analytics
//! endpoints (Segment, Amplitude, GA4, ...). The [`SourceRegistry`] holds
//! the ordered rule set, answers "which source, if any, matches this
//! URL?", and tracks unmatched candidate domains so the user can be
//! offered new rules for traffic that looks like analytics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

/// Path substrings that suggest an endpoint is an analytics collector.
const ANALYTICS_PATH_HINTS: &[&str] = &[
    "/analytics",
    "/events",
    "/track",
    "/collect",
    "/log",
    "/beacon",
    "/v1/batch",
    "/v1/track",
    "/evs",
    "/telemetry",
    "/metrics",
];

/// Infrastructure domains that are never worth suggesting as sources.
const SKIP_DOMAINS: &[&str] = &[
    "google.com",
    "gstatic.com",
    "googleapis.com",
    "cloudflare.com",
];

/// Multi-label public suffixes the base-domain split must keep three
/// labels for. Everything else falls back to the last two labels.
const MULTI_LABEL_SUFFIXES: &[&str] = &["co.uk", "com.au", "co.nz", "co.jp", "com.br"];

/// Per-source capture statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStats {
    /// Number of requests captured for this source
    #[serde(default)]
    pub captures: u64,
    /// When the most recent capture happened
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_captured: Option<DateTime<Utc>>,
}

impl SourceStats {
    fn is_empty(&self) -> bool {
        self.captures == 0 && self.last_captured.is_none()
    }
}

/// A declarative matcher for one analytics vendor's endpoint family,
/// plus the hints needed to pull events out of its payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    /// Stable unique identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Disabled sources never match
    pub enabled: bool,
    /// Domain this source covers; matching compares registrable base
    /// domains, so `api.segment.io` covers every `*.segment.io` host
    pub domain: String,
    /// Optional path glob; `*` matches within a segment, `**` across
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_pattern: Option<String>,
    /// Field name -> dotted JSON path (`event_name`, `timestamp`,
    /// `user_id`, `property_container`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_mappings: Option<HashMap<String, String>>,
    /// Legacy synonym for `field_mappings.event_name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name_path: Option<String>,
    /// Dotted path to the batch array within the payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_path: Option<String>,
    /// Capture statistics, maintained by the proxy
    #[serde(default, skip_serializing_if = "SourceStats::is_empty")]
    pub stats: SourceStats,
}

impl Source {
    /// Path to the event name, preferring `field_mappings` over the
    /// legacy field.
    pub fn event_name_path(&self) -> Option<&str> {
        self.mapping("event_name").or(self.event_name_path.as_deref())
    }

    /// Path to the timestamp, if mapped.
    pub fn timestamp_path(&self) -> Option<&str> {
        self.mapping("timestamp")
    }

    /// Path to the user id, if mapped.
    pub fn user_id_path(&self) -> Option<&str> {
        self.mapping("user_id")
    }

    /// Path to the properties container, if mapped.
    pub fn property_container(&self) -> Option<&str> {
        self.mapping("property_container")
    }

    fn mapping(&self, key: &str) -> Option<&str> {
        self.field_mappings
            .as_ref()
            .and_then(|m| m.get(key))
            .map(String::as_str)
    }

    /// Whether this source matches an already-parsed URL.
    pub fn matches(&self, url: &Url) -> bool {
        if !self.enabled {
            return false;
        }

        let host = match url.host_str() {
            Some(h) => h,
            None => return false,
        };

        if base_domain(host) != base_domain(&self.domain) {
            return false;
        }

        match self.url_pattern.as_deref() {
            Some(pattern) if !pattern.is_empty() => glob_match(url.path(), pattern),
            _ => true,
        }
    }
}

/// Extract the registrable base domain from a host name.
///
/// `www.google-analytics.com` -> `google-analytics.com`,
/// `tracker.example.co.uk` -> `example.co.uk`. IPv4 literals are
/// returned unchanged.
pub fn base_domain(host: &str) -> String {
    let host = host.to_lowercase();

    if host.parse::<std::net::Ipv4Addr>().is_ok() {
        return host;
    }

    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 3 {
        return host;
    }

    let last_two = labels[labels.len() - 2..].join(".");
    if MULTI_LABEL_SUFFIXES.contains(&last_two.as_str()) {
        return labels[labels.len() - 3..].join(".");
    }

    last_two
}

/// Match a URL path against a glob pattern.
///
/// `*` matches any run of non-slash characters; `**` matches across
/// path segments. The pattern is anchored at both ends.
pub fn glob_match(path: &str, pattern: &str) -> bool {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push('^');

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    regex.push_str(".*");
                } else {
                    regex.push_str("[^/]*");
                }
            }
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
    }
    regex.push('$');

    regex::Regex::new(&regex)
        .map(|re| re.is_match(path))
        .unwrap_or(false)
}

/// Select the best-matching source for a URL.
///
/// Every enabled source whose domain and pattern match is a candidate.
/// The most specific pattern wins: any pattern beats a domain-only
/// rule, and among patterns the one with the most literal characters
/// ranks highest (`/mp/collect*` over `/*/collect*`). Ties are broken
/// by insertion order.
pub fn match_source<'a>(sources: &'a [Source], url: &Url) -> Option<&'a Source> {
    let mut best: Option<(&Source, usize)> = None;

    for source in sources {
        if !source.matches(url) {
            continue;
        }
        let score = match source.url_pattern.as_deref() {
            Some(p) if !p.is_empty() => pattern_specificity(p),
            _ => 0,
        };
        match best {
            Some((_, best_score)) if best_score >= score => {}
            _ => best = Some((source, score)),
        }
    }

    best.map(|(s, _)| s)
}

/// Rank a pattern by how much of it is literal text. Always at least 1
/// so any pattern outranks a domain-only rule.
fn pattern_specificity(pattern: &str) -> usize {
    1 + pattern.chars().filter(|c| *c != '*').count()
}

/// Whether a path looks like an analytics collector endpoint.
pub fn looks_like_analytics(path: &str) -> bool {
    let path = path.to_lowercase();
    ANALYTICS_PATH_HINTS.iter().any(|hint| path.contains(hint))
}

/// A domain that received analytics-looking POSTs but matched no source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnmatchedDomain {
    pub domain: String,
    /// One representative URL for this domain
    pub example_url: String,
    /// The most recent decoded payload
    pub last_payload: Value,
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// The ordered set of source rules plus the unmatched-domain feedback
/// list. Reads dominate: every proxied request consults the rules, while
/// writes only happen on control-plane syncs.
pub struct SourceRegistry {
    sources: RwLock<Vec<Source>>,
    unmatched: RwLock<HashMap<String, UnmatchedDomain>>,
}

impl SourceRegistry {
    pub fn new(sources: Vec<Source>) -> Self {
        Self {
            sources: RwLock::new(sources),
            unmatched: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry seeded with the built-in vendor rules.
    pub fn with_defaults() -> Self {
        Self::new(default_sources())
    }

    /// Find the best source match for a URL string, if any.
    pub async fn match_url(&self, url: &str) -> Option<Source> {
        let url = Url::parse(url).ok()?;
        let sources = self.sources.read().await;
        match_source(&sources, &url).cloned()
    }

    /// Append a source. Any unmatched-domain entry for its domain is
    /// resolved by the addition.
    pub async fn add(&self, mut source: Source) {
        source.domain = base_domain(&source.domain);
        self.unmatched.write().await.remove(&source.domain);
        self.sources.write().await.push(source);
    }

    /// Replace a source in place, matched by id. Returns false when no
    /// source has that id.
    pub async fn update(&self, source: Source) -> bool {
        let mut sources = self.sources.write().await;
        match sources.iter_mut().find(|s| s.id == source.id) {
            Some(slot) => {
                *slot = source;
                true
            }
            None => false,
        }
    }

    /// Remove a source by id. Returns false when no source has that id.
    pub async fn remove(&self, id: &str) -> bool {
        let mut sources = self.sources.write().await;
        let before = sources.len();
        sources.retain(|s| s.id != id);
        sources.len() != before
    }

    /// Replace the whole rule set (full sync from the extension).
    /// Unmatched entries covered by the new set are cleared.
    pub async fn replace_all(&self, new_sources: Vec<Source>) {
        {
            let mut unmatched = self.unmatched.write().await;
            for source in &new_sources {
                unmatched.remove(&base_domain(&source.domain));
            }
        }
        *self.sources.write().await = new_sources;
    }

    /// Snapshot of the current rule set.
    pub async fn snapshot(&self) -> Vec<Source> {
        self.sources.read().await.clone()
    }

    /// Bump capture statistics for a source after events were extracted.
    pub async fn record_capture(&self, id: &str) {
        let mut sources = self.sources.write().await;
        if let Some(source) = sources.iter_mut().find(|s| s.id == id) {
            source.stats.captures += 1;
            source.stats.last_captured = Some(Utc::now());
        }
    }

    /// Record an analytics-looking request that matched no source.
    ///
    /// Only paths matching the analytics heuristics are tracked, and
    /// well-known infrastructure domains are skipped.
    pub async fn track_unmatched(&self, url: &str, payload: &Value) {
        let parsed = match Url::parse(url) {
            Ok(u) => u,
            Err(_) => return,
        };

        if !looks_like_analytics(parsed.path()) {
            return;
        }

        let host = match parsed.host_str() {
            Some(h) => h,
            None => return,
        };
        let domain = base_domain(host);

        if SKIP_DOMAINS.contains(&domain.as_str()) {
            return;
        }

        let now = Utc::now();
        let mut unmatched = self.unmatched.write().await;
        let entry = unmatched.entry(domain.clone()).or_insert_with(|| {
            debug!(domain = %domain, url = %url, "New unmatched analytics domain");
            UnmatchedDomain {
                domain,
                example_url: url.to_string(),
                last_payload: Value::Null,
                count: 0,
                first_seen: now,
                last_seen: now,
            }
        });
        entry.count += 1;
        entry.last_seen = now;
        entry.last_payload = payload.clone();
    }

    /// Snapshot of the unmatched-domain map, keyed by base domain.
    pub async fn unmatched_snapshot(&self) -> HashMap<String, UnmatchedDomain> {
        self.unmatched.read().await.clone()
    }

    /// Unmatched domains ordered by observation count, highest first.
    pub async fn unmatched_ranked(&self) -> Vec<UnmatchedDomain> {
        let mut entries: Vec<UnmatchedDomain> =
            self.unmatched.read().await.values().cloned().collect();
        entries.sort_by(|a, b| b.count.cmp(&a.count));
        entries
    }

    /// Drop all unmatched-domain entries.
    pub async fn clear_unmatched(&self) {
        self.unmatched.write().await.clear();
    }
}

/// The vendor rules the registry ships with.
pub fn default_sources() -> Vec<Source> {
    fn source(id: &str, name: &str, domain: &str) -> Source {
        Source {
            id: id.to_string(),
            name: name.to_string(),
            enabled: true,
            domain: domain.to_string(),
            url_pattern: None,
            field_mappings: None,
            event_name_path: None,
            batch_path: None,
            stats: SourceStats::default(),
        }
    }

    vec![
        Source {
            url_pattern: Some("/*/collect*".to_string()),
            event_name_path: Some("en".to_string()),
            ..source("google-analytics", "Google Analytics", "google-analytics.com")
        },
        Source {
            url_pattern: Some("/mp/collect*".to_string()),
            event_name_path: Some("events[0].name".to_string()),
            batch_path: Some("events".to_string()),
            ..source(
                "google-analytics-mp",
                "Google Analytics (MP)",
                "google-analytics.com",
            )
        },
        Source {
            url_pattern: Some("/v1/*".to_string()),
            batch_path: Some("batch".to_string()),
            ..source("segment", "Segment", "api.segment.io")
        },
        Source {
            batch_path: Some("events".to_string()),
            ..source("amplitude", "Amplitude", "api.amplitude.com")
        },
        Source {
            event_name_path: Some("event".to_string()),
            ..source("mixpanel", "Mixpanel", "api.mixpanel.com")
        },
        Source {
            url_pattern: Some("/rp.gif*".to_string()),
            event_name_path: Some("event".to_string()),
            ..source("reddit-pixel", "Reddit Pixel", "alb.reddit.com")
        },
        Source {
            event_name_path: Some("a".to_string()),
            batch_path: Some("b".to_string()),
            ..source("heap", "Heap Analytics", "heapanalytics.com")
        },
        Source {
            batch_path: Some("batch".to_string()),
            ..source("posthog", "PostHog", "app.posthog.com")
        },
        Source {
            batch_path: Some("batch".to_string()),
            ..source("rudderstack", "RudderStack", "rudderstack.com")
        },
    ]
}
