//! Proxy rule data model and validation
//!
//! A `ProxyRule` maps a routing key (source host + path) to a container
//! target, with optional health checking, load balancing, SSL termination
//! and advanced per-location policies. Drafts are validated before the
//! registry commits them; the invariants enforced here are the ones the
//! compiler relies on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Forwarding protocol for a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Http,
    Https,
    Tcp,
    Udp,
}

impl Protocol {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            "tcp" => Some(Self::Tcp),
            "udp" => Some(Self::Udp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }

    /// Stream protocols are rendered as `stream` blocks rather than
    /// `server`/`location` blocks
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Tcp | Self::Udp)
    }
}

/// Load balancing method for an upstream pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LbMethod {
    #[default]
    RoundRobin,
    LeastConn,
    IpHash,
    Random,
}

impl LbMethod {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "round_robin" => Some(Self::RoundRobin),
            "least_conn" => Some(Self::LeastConn),
            "ip_hash" => Some(Self::IpHash),
            "random" => Some(Self::Random),
            _ => None,
        }
    }

    /// The nginx directive for this method, if one is needed
    ///
    /// Round-robin is nginx's implicit default and renders nothing.
    pub fn directive(&self) -> Option<&'static str> {
        match self {
            Self::RoundRobin => None,
            Self::LeastConn => Some("least_conn"),
            Self::IpHash => Some("ip_hash"),
            Self::Random => Some("random"),
        }
    }
}

/// Active health probe settings for a rule's backends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    #[serde(default = "default_health_path")]
    pub path: String,
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_health_retries")]
    pub retries: u32,
    /// HTTP statuses counted as a passing probe
    #[serde(default = "default_success_codes")]
    pub success_codes: Vec<u16>,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            interval_secs: default_health_interval(),
            timeout_secs: default_health_timeout(),
            retries: default_health_retries(),
            success_codes: default_success_codes(),
        }
    }
}

fn default_health_path() -> String {
    "/".to_string()
}

fn default_health_interval() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    5
}

fn default_health_retries() -> u32 {
    3
}

fn default_success_codes() -> Vec<u16> {
    vec![200]
}

/// One backend in an upstream pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LbTarget {
    pub container: String,
    pub port: u16,
    /// Relative weight; 1 when omitted
    pub weight: Option<u32>,
}

/// Upstream pool configuration for a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancing {
    #[serde(default)]
    pub method: LbMethod,
    pub targets: Vec<LbTarget>,
    #[serde(default)]
    pub sticky_sessions: bool,
    /// Cookie used for sticky sessions; defaults to "rulegate_sticky"
    pub cookie_name: Option<String>,
}

/// One rewrite directive; applied in list order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewriteRule {
    pub pattern: String,
    pub replacement: String,
    /// Passed through verbatim (e.g. "last", "break", "redirect")
    pub flag: Option<String>,
}

/// Request rate limiting for a rule's location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub requests_per_second: u32,
    #[serde(default)]
    pub burst_size: u32,
    #[serde(default)]
    pub nodelay: bool,
}

/// Advanced per-location policies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AdvancedConfig {
    /// Maximum request body size, nginx size syntax (e.g. "10m")
    pub max_body_size: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub send_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
    /// Explicit proxy buffering on/off; nginx default when absent
    pub buffering: Option<bool>,
    #[serde(default)]
    pub cache_enabled: bool,
    pub cache_valid_secs: Option<u64>,
    #[serde(default)]
    pub cors_enabled: bool,
    /// Allowed origin for CORS; "*" when omitted
    pub cors_allow_origin: Option<String>,
    pub rate_limit: Option<RateLimit>,
    #[serde(default)]
    pub rewrites: Vec<RewriteRule>,
}

/// A declarative routing rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRule {
    pub id: String,
    pub name: String,
    pub source_host: String,
    pub source_path: String,
    pub target_container: String,
    pub target_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub ssl_enabled: bool,
    pub ssl_cert_path: Option<String>,
    pub ssl_key_path: Option<String>,
    #[serde(default)]
    pub request_headers: HashMap<String, String>,
    #[serde(default)]
    pub response_headers: HashMap<String, String>,
    pub health_check: Option<HealthCheck>,
    pub load_balancing: Option<LoadBalancing>,
    pub advanced: Option<AdvancedConfig>,
    /// Escape hatch appended verbatim to the rule's location block.
    /// Validated only by the proxy's own config test.
    pub custom_config: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ProxyRule {
    /// The routing key this rule claims while enabled
    pub fn routing_key(&self) -> (&str, &str) {
        (&self.source_host, &self.source_path)
    }
}

/// Input for creating a rule; the registry assigns id and creation time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDraft {
    pub name: String,
    pub source_host: String,
    #[serde(default = "default_source_path")]
    pub source_path: String,
    pub target_container: String,
    pub target_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub ssl_enabled: bool,
    pub ssl_cert_path: Option<String>,
    pub ssl_key_path: Option<String>,
    #[serde(default)]
    pub request_headers: HashMap<String, String>,
    #[serde(default)]
    pub response_headers: HashMap<String, String>,
    pub health_check: Option<HealthCheck>,
    pub load_balancing: Option<LoadBalancing>,
    pub advanced: Option<AdvancedConfig>,
    pub custom_config: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_source_path() -> String {
    "/".to_string()
}

impl RuleDraft {
    /// Materialize the draft into a rule with the given id
    pub fn into_rule(self, id: String) -> ProxyRule {
        ProxyRule {
            id,
            name: self.name,
            source_host: self.source_host,
            source_path: self.source_path,
            target_container: self.target_container,
            target_port: self.target_port,
            protocol: self.protocol,
            ssl_enabled: self.ssl_enabled,
            ssl_cert_path: self.ssl_cert_path,
            ssl_key_path: self.ssl_key_path,
            request_headers: self.request_headers,
            response_headers: self.response_headers,
            health_check: self.health_check,
            load_balancing: self.load_balancing,
            advanced: self.advanced,
            custom_config: self.custom_config,
            created_at: Utc::now(),
            enabled: self.enabled,
        }
    }
}

/// Partial update for an existing rule; `None` fields are left unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulePatch {
    pub name: Option<String>,
    pub source_host: Option<String>,
    pub source_path: Option<String>,
    pub target_container: Option<String>,
    pub target_port: Option<u16>,
    pub protocol: Option<Protocol>,
    pub ssl_enabled: Option<bool>,
    pub ssl_cert_path: Option<Option<String>>,
    pub ssl_key_path: Option<Option<String>>,
    pub request_headers: Option<HashMap<String, String>>,
    pub response_headers: Option<HashMap<String, String>>,
    pub health_check: Option<Option<HealthCheck>>,
    pub load_balancing: Option<Option<LoadBalancing>>,
    pub advanced: Option<Option<AdvancedConfig>>,
    pub custom_config: Option<Option<String>>,
    pub enabled: Option<bool>,
}

impl RulePatch {
    /// Apply the patch to a copy of the rule; id and created_at never change
    pub fn apply_to(&self, rule: &ProxyRule) -> ProxyRule {
        let mut updated = rule.clone();
        if let Some(v) = &self.name {
            updated.name = v.clone();
        }
        if let Some(v) = &self.source_host {
            updated.source_host = v.clone();
        }
        if let Some(v) = &self.source_path {
            updated.source_path = v.clone();
        }
        if let Some(v) = &self.target_container {
            updated.target_container = v.clone();
        }
        if let Some(v) = self.target_port {
            updated.target_port = v;
        }
        if let Some(v) = self.protocol {
            updated.protocol = v;
        }
        if let Some(v) = self.ssl_enabled {
            updated.ssl_enabled = v;
        }
        if let Some(v) = &self.ssl_cert_path {
            updated.ssl_cert_path = v.clone();
        }
        if let Some(v) = &self.ssl_key_path {
            updated.ssl_key_path = v.clone();
        }
        if let Some(v) = &self.request_headers {
            updated.request_headers = v.clone();
        }
        if let Some(v) = &self.response_headers {
            updated.response_headers = v.clone();
        }
        if let Some(v) = &self.health_check {
            updated.health_check = v.clone();
        }
        if let Some(v) = &self.load_balancing {
            updated.load_balancing = v.clone();
        }
        if let Some(v) = &self.advanced {
            updated.advanced = v.clone();
        }
        if let Some(v) = &self.custom_config {
            updated.custom_config = v.clone();
        }
        if let Some(v) = self.enabled {
            updated.enabled = v;
        }
        updated
    }
}

/// Validate the invariants a rule must hold before it may be committed
///
/// Checks shape only; routing-key uniqueness is the registry's job since
/// it depends on the other enabled rules.
pub fn validate_rule(rule: &ProxyRule) -> Result<(), String> {
    if rule.name.trim().is_empty() {
        return Err("name cannot be empty".to_string());
    }

    validate_host(&rule.source_host)?;

    if !rule.source_path.starts_with('/') {
        return Err(format!(
            "source_path must start with '/', got '{}'",
            rule.source_path
        ));
    }

    if rule.target_container.trim().is_empty() {
        return Err("target_container cannot be empty".to_string());
    }

    if rule.target_port == 0 {
        return Err("target_port must be in 1-65535".to_string());
    }

    if let Some(lb) = &rule.load_balancing {
        if lb.targets.is_empty() {
            return Err("load_balancing requires at least one target".to_string());
        }
        for target in &lb.targets {
            if target.container.trim().is_empty() {
                return Err("load balancing target container cannot be empty".to_string());
            }
            if target.port == 0 {
                return Err(format!(
                    "load balancing target port for '{}' must be in 1-65535",
                    target.container
                ));
            }
            if target.weight == Some(0) {
                return Err(format!(
                    "load balancing target weight for '{}' must be positive",
                    target.container
                ));
            }
        }
    }

    if let Some(hc) = &rule.health_check {
        if !hc.path.starts_with('/') {
            return Err("health check path must start with '/'".to_string());
        }
        if hc.interval_secs == 0 {
            return Err("health check interval must be positive".to_string());
        }
    }

    if let Some(advanced) = &rule.advanced {
        if let Some(rl) = &advanced.rate_limit {
            if rl.requests_per_second == 0 {
                return Err("rate limit requests_per_second must be positive".to_string());
            }
        }
    }

    if rule.ssl_enabled && (rule.ssl_cert_path.is_none() || rule.ssl_key_path.is_none()) {
        return Err("ssl_enabled requires ssl_cert_path and ssl_key_path".to_string());
    }

    Ok(())
}

/// Validate a hostname: lowercase labels, digits, dashes and dots
fn validate_host(host: &str) -> Result<(), String> {
    let host = host.trim();

    if host.is_empty() {
        return Err("source_host cannot be empty".to_string());
    }

    if host.len() > 253 {
        return Err("source_host is too long".to_string());
    }

    let valid = host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '*');

    if !valid {
        return Err(format!("source_host '{}' contains invalid characters", host));
    }

    // Wildcard only as a leading label
    if host.contains('*') && !host.starts_with("*.") {
        return Err("wildcard (*) must be the leading label".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_rule() -> ProxyRule {
        ProxyRule {
            id: "r1".to_string(),
            name: "app".to_string(),
            source_host: "app.example.com".to_string(),
            source_path: "/".to_string(),
            target_container: "app-1".to_string(),
            target_port: 8080,
            protocol: Protocol::Http,
            ssl_enabled: false,
            ssl_cert_path: None,
            ssl_key_path: None,
            request_headers: HashMap::new(),
            response_headers: HashMap::new(),
            health_check: None,
            load_balancing: None,
            advanced: None,
            custom_config: None,
            created_at: Utc::now(),
            enabled: true,
        }
    }

    #[test]
    fn test_valid_rule_passes() {
        assert!(validate_rule(&base_rule()).is_ok());
    }

    #[test]
    fn test_source_path_must_be_absolute() {
        let mut rule = base_rule();
        rule.source_path = "api".to_string();
        let err = validate_rule(&rule).unwrap_err();
        assert!(err.contains("source_path"));
    }

    #[test]
    fn test_port_zero_rejected() {
        let mut rule = base_rule();
        rule.target_port = 0;
        assert!(validate_rule(&rule).is_err());
    }

    #[test]
    fn test_empty_upstream_rejected() {
        let mut rule = base_rule();
        rule.load_balancing = Some(LoadBalancing {
            method: LbMethod::RoundRobin,
            targets: vec![],
            sticky_sessions: false,
            cookie_name: None,
        });
        assert!(validate_rule(&rule).is_err());
    }

    #[test]
    fn test_ssl_requires_cert_paths() {
        let mut rule = base_rule();
        rule.ssl_enabled = true;
        assert!(validate_rule(&rule).is_err());

        rule.ssl_cert_path = Some("/etc/ssl/app.crt".to_string());
        rule.ssl_key_path = Some("/etc/ssl/app.key".to_string());
        assert!(validate_rule(&rule).is_ok());
    }

    #[test]
    fn test_wildcard_host_placement() {
        let mut rule = base_rule();
        rule.source_host = "*.example.com".to_string();
        assert!(validate_rule(&rule).is_ok());

        rule.source_host = "app.*.example.com".to_string();
        assert!(validate_rule(&rule).is_err());
    }

    #[test]
    fn test_draft_into_rule_sets_identity() {
        let draft = RuleDraft {
            name: "app".to_string(),
            source_host: "app.example.com".to_string(),
            source_path: "/".to_string(),
            target_container: "app-1".to_string(),
            target_port: 8080,
            protocol: Protocol::Http,
            ssl_enabled: false,
            ssl_cert_path: None,
            ssl_key_path: None,
            request_headers: HashMap::new(),
            response_headers: HashMap::new(),
            health_check: None,
            load_balancing: None,
            advanced: None,
            custom_config: None,
            enabled: true,
        };
        let rule = draft.into_rule("abc".to_string());
        assert_eq!(rule.id, "abc");
        assert!(rule.enabled);
    }

    #[test]
    fn test_patch_preserves_identity() {
        let rule = base_rule();
        let patch = RulePatch {
            target_port: Some(9090),
            ..Default::default()
        };
        let updated = patch.apply_to(&rule);
        assert_eq!(updated.id, rule.id);
        assert_eq!(updated.created_at, rule.created_at);
        assert_eq!(updated.target_port, 9090);
        assert_eq!(updated.source_host, rule.source_host);
    }

    #[test]
    fn test_patch_can_clear_optional_section() {
        let mut rule = base_rule();
        rule.custom_config = Some("proxy_intercept_errors on;".to_string());
        let patch = RulePatch {
            custom_config: Some(None),
            ..Default::default()
        };
        let updated = patch.apply_to(&rule);
        assert!(updated.custom_config.is_none());
    }

    #[test]
    fn test_lb_method_directives() {
        assert_eq!(LbMethod::RoundRobin.directive(), None);
        assert_eq!(LbMethod::LeastConn.directive(), Some("least_conn"));
        assert_eq!(LbMethod::IpHash.directive(), Some("ip_hash"));
    }

    #[test]
    fn test_protocol_roundtrip() {
        assert_eq!(Protocol::from_str("https"), Some(Protocol::Https));
        assert_eq!(Protocol::from_str("HTTP"), Some(Protocol::Http));
        assert_eq!(Protocol::from_str("spdy"), None);
        assert!(Protocol::Tcp.is_stream());
        assert!(!Protocol::Http.is_stream());
    }
}
