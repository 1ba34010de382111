//! Table-driven classification of VPN client output lines
//!
//! The wrapped client's log grammar changes between versions, so the rules
//! live in one ordered table pinned against the client version instead of
//! being scattered through the orchestrator. Each rule maps a regex onto one
//! of a closed set of semantic events; unmatched lines are informational.

use regex::Regex;
use std::process::ExitStatus;

/// Semantic events derived from the client subprocess
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Tunnel interface is up and traffic can flow
    TunnelUp { device: String, index: Option<u32> },
    /// The client needs an interactive SSO login at the given URL
    AuthRequired { url: String },
    /// A line the table classifies as fatal for the attempt
    Fatal(String),
    /// Unclassified output, forwarded for display/logging only
    Info(String),
    /// The subprocess exited (synthesized by the launcher, not the table)
    Exited(Option<ExitStatus>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleKind {
    TunnelUp,
    AuthRequired,
    Fatal,
}

struct Rule {
    regex: Regex,
    kind: RuleKind,
}

/// Ordered pattern table; first matching rule wins
pub struct PatternTable {
    rules: Vec<Rule>,
}

impl PatternTable {
    /// Rules for openconnect 8.x/9.x output, covering both the Windows
    /// device announcement and the unix `Connected tunN` form
    pub fn openconnect() -> Self {
        Self::from_rules(vec![
            // "Using TAP-Windows device 'oc0', index 12" (also Wintun/TAP)
            (
                r"Using (?P<devtype>[\w-]+) device '(?P<name>[^']+)', index (?P<index>\d+)",
                RuleKind::TunnelUp,
            ),
            // "Connected tun0 as 10.4.2.13, using SSL"
            (
                r"Connected (?P<name>[\w.-]+) as [0-9.]+",
                RuleKind::TunnelUp,
            ),
            // SAML/SSO handoff lines carry the IdP URL
            (
                r"(?i)please (?:visit|complete).*?(?P<url>https?://\S+)",
                RuleKind::AuthRequired,
            ),
            (
                r"(?i)SSO login.*?(?P<url>https?://\S+)",
                RuleKind::AuthRequired,
            ),
            // Terminal failures for the attempt
            (r"(?i)^login failed", RuleKind::Fatal),
            (r"(?i)cookie (?:was )?(?:rejected|expired|invalid)", RuleKind::Fatal),
            (r"(?i)^failed to (?:connect|open|obtain)", RuleKind::Fatal),
            (r"(?i)certificate verification failed", RuleKind::Fatal),
            (r"fgets \(stdin\)", RuleKind::Fatal),
        ])
    }

    fn from_rules(rules: Vec<(&str, RuleKind)>) -> Self {
        let rules = rules
            .into_iter()
            .map(|(pattern, kind)| Rule {
                // Table patterns are compile-time constants, checked by tests
                regex: Regex::new(pattern).expect("invalid pattern table entry"),
                kind,
            })
            .collect();
        Self { rules }
    }

    /// Classify one output line
    pub fn classify(&self, line: &str) -> ClientEvent {
        for rule in &self.rules {
            let Some(caps) = rule.regex.captures(line) else {
                continue;
            };
            match rule.kind {
                RuleKind::TunnelUp => {
                    let device = caps
                        .name("name")
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default();
                    let index = caps
                        .name("index")
                        .and_then(|m| m.as_str().parse().ok());
                    return ClientEvent::TunnelUp { device, index };
                }
                RuleKind::AuthRequired => {
                    let url = caps
                        .name("url")
                        .map(|m| m.as_str().trim_end_matches(['.', ',']).to_string())
                        .unwrap_or_default();
                    return ClientEvent::AuthRequired { url };
                }
                RuleKind::Fatal => return ClientEvent::Fatal(line.to_string()),
            }
        }
        ClientEvent::Info(line.to_string())
    }
}

impl Default for PatternTable {
    fn default() -> Self {
        Self::openconnect()
    }
}
