//! Matching over unstructured `cloudflared` output
//!
//! The tunnel client reports everything (assigned hostnames, login URLs,
//! tunnel UUIDs, usage errors) as free text on stdout/stderr. These
//! functions are the single place that text is interpreted. Each returns
//! `None`/`false` on anything it does not recognize; callers treat that as
//! "keep waiting" rather than as a failure.

use std::sync::OnceLock;

use regex::Regex;
use uuid::Uuid;

/// Matches assigned quick-tunnel hostnames under a given public domain
///
/// `https://` is optional. The domain's own API host (`api.<domain>`), which
/// shows up in request error messages, is never treated as an assignment.
#[derive(Debug, Clone)]
pub struct HostnameMatcher {
    pattern: Regex,
    api_host: String,
}

impl HostnameMatcher {
    pub fn new(public_domain: &str) -> Self {
        let domain = public_domain.trim().trim_matches('.').to_lowercase();
        let pattern = Regex::new(&format!(
            r"(?i)(?:https?://)?([a-z0-9-]+(?:\.[a-z0-9-]+)*\.{})",
            regex::escape(&domain)
        ))
        .expect("escaped domain forms a valid pattern");
        Self {
            pattern,
            api_host: format!("api.{}", domain),
        }
    }

    /// First assigned hostname in `chunk`, lowercased
    pub fn extract(&self, chunk: &str) -> Option<String> {
        self.pattern
            .captures_iter(chunk)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str().to_lowercase())
            .find(|host| *host != self.api_host)
    }
}

fn url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"https?://[^\s"'<>]+"#).expect("static pattern is valid")
    })
}

fn flag_rejection_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)flag provided but not defined|unknown flag|incorrect usage|unrecognized (?:option|flag|argument)",
        )
        .expect("static pattern is valid")
    })
}

fn uuid_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)\b([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})\b",
        )
        .expect("static pattern is valid")
    })
}

fn created_with_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)with id\s+([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})")
            .expect("static pattern is valid")
    })
}

/// First URL in a login-flow output chunk, with trailing punctuation removed
pub fn extract_login_url(chunk: &str) -> Option<String> {
    url_pattern().find(chunk).map(|m| {
        m.as_str()
            .trim_end_matches(|c| matches!(c, '.' | ',' | ')' | ']'))
            .to_string()
    })
}

/// Whether output shows the client rejected a command-line flag
pub fn is_flag_rejection(output: &str) -> bool {
    flag_rejection_pattern().is_match(output)
}

/// Tunnel UUID printed by `cloudflared tunnel create`
///
/// Prefers the id following "with id"; falls back to the first UUID anywhere
/// in the output.
pub fn extract_tunnel_uuid(output: &str) -> Option<String> {
    created_with_id_pattern()
        .captures(output)
        .and_then(|caps| caps.get(1))
        .or_else(|| uuid_pattern().captures(output).and_then(|caps| caps.get(1)))
        .and_then(|m| Uuid::parse_str(m.as_str()).ok())
        .map(|id| id.hyphenated().to_string())
}
