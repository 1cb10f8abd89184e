/// Commands, responses, and the per-agent filter predicate.
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::ClientSnapshot;
use crate::error::ProtoError;

/// Log level override carried by a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive string for a tracing env-filter reload.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(ProtoError::Filter(format!("unknown log level {other:?}"))),
        }
    }
}

/// A file the controller pushes to matching agents before exec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendFile {
    /// Relative path, forward-slash separated on the wire.
    pub name: String,
    /// POSIX mode bits applied on the agent side.
    pub perm: u32,
}

/// Connectivity probe attached to a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnTest {
    /// Endpoint URI, e.g. `tcp://10.0.0.1:443` or `udp://10.0.0.1:53`.
    pub endpoint: String,
    /// How long to wait for the dial.
    pub wait: Duration,
    /// Optional payload written after a UDP dial.
    pub packet: Vec<u8>,
}

/// A unit of work dispatched from controller to matching agents.
///
/// Immutable after creation except for `sent` (set when a once-command is
/// dispatched) and `checked_in` (appended as agents respond).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Command {
    /// Monotonic ID assigned by the controller.
    pub id: u64,
    /// Argv to execute; empty means nothing to run.
    pub exec: Vec<String>,
    pub files_send: Vec<SendFile>,
    pub files_recv: Vec<String>,
    pub conn_test: Option<ConnTest>,
    /// PID to kill; -1 kills every tracked process.
    pub pid: Option<i32>,
    /// Kill every tracked process whose joined argv contains this substring.
    pub kill_all: Option<String>,
    pub level: Option<LogLevel>,
    pub background: bool,
    /// Dispatch to at most one matching agent per controller lifetime.
    pub once: bool,
    /// Set when a once-command has been handed to an agent.
    pub sent: bool,
    /// Label echoed into response bookkeeping.
    pub prefix: String,
    /// Optional plumbing pipe names for stdio.
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub filter: Option<Filter>,
    /// UUIDs that have acknowledged this command. Never repeats an entry.
    pub checked_in: Vec<String>,
}

impl Command {
    pub fn exec(argv: Vec<String>) -> Self {
        Self {
            exec: argv,
            ..Default::default()
        }
    }

    /// Record an acknowledgement, keeping the list duplicate-free even
    /// under repeated delivery.
    pub fn check_in(&mut self, uuid: &str) {
        if !self.checked_in.iter().any(|u| u == uuid) {
            self.checked_in.push(uuid.to_string());
        }
    }
}

/// What an agent reports back for one command.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Response {
    /// The command this answers.
    pub id: u64,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// False for background commands, whose exit is not observed inline.
    pub record_exit_code: bool,
}

// ── Filter ─────────────────────────────────────────────────────────────

/// Conjunctive predicate over agent fields. Empty field = wildcard;
/// an agent matches iff every non-empty field matches.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Filter {
    pub uuid: String,
    pub hostname: String,
    pub arch: String,
    pub os: String,
    /// Exact IP or CIDR the agent must have an address in.
    pub ip: String,
    /// Any of the agent's MACs must equal this.
    pub mac: String,
    pub tags: BTreeMap<String, String>,
}

impl Filter {
    pub fn is_empty(&self) -> bool {
        self.uuid.is_empty()
            && self.hostname.is_empty()
            && self.arch.is_empty()
            && self.os.is_empty()
            && self.ip.is_empty()
            && self.mac.is_empty()
            && self.tags.is_empty()
    }

    pub fn matches(&self, client: &ClientSnapshot) -> bool {
        if !self.uuid.is_empty() && !self.uuid.eq_ignore_ascii_case(&client.uuid) {
            return false;
        }
        if !self.hostname.is_empty() && self.hostname != client.hostname {
            return false;
        }
        if !self.arch.is_empty() && self.arch != client.arch {
            return false;
        }
        if !self.os.is_empty() && self.os != client.os {
            return false;
        }
        if !self.mac.is_empty()
            && !client
                .macs
                .iter()
                .any(|m| m.eq_ignore_ascii_case(&self.mac))
        {
            return false;
        }
        if !self.ip.is_empty() && !ip_matches(&self.ip, &client.ips) {
            return false;
        }
        for (key, want) in &self.tags {
            if client.tags.get(key) != Some(want) {
                return false;
            }
        }
        true
    }

    /// Parse one `field=value` term of the CLI filter grammar.
    ///
    /// Recognized fields: uuid, hostname, arch, os, ip, mac, tag keys as
    /// `tag:<key>`. Errors return to the caller; nothing persists.
    pub fn parse(term: &str) -> Result<Filter, ProtoError> {
        let (field, value) = term
            .split_once('=')
            .ok_or_else(|| ProtoError::Filter(format!("expected field=value, got {term:?}")))?;
        let value = value.trim().to_string();
        let mut filter = Filter::default();
        match field.trim().to_ascii_lowercase().as_str() {
            "uuid" => filter.uuid = value,
            "hostname" => filter.hostname = value,
            "arch" => filter.arch = value,
            "os" => filter.os = value,
            "ip" => filter.ip = value,
            "mac" => filter.mac = value,
            field => {
                if let Some(key) = field.strip_prefix("tag:") {
                    filter.tags.insert(key.to_string(), value);
                } else {
                    return Err(ProtoError::Filter(format!("unknown field {field:?}")));
                }
            }
        }
        Ok(filter)
    }

    /// Merge another term into this filter (conjunction).
    pub fn and(mut self, other: Filter) -> Filter {
        if !other.uuid.is_empty() {
            self.uuid = other.uuid;
        }
        if !other.hostname.is_empty() {
            self.hostname = other.hostname;
        }
        if !other.arch.is_empty() {
            self.arch = other.arch;
        }
        if !other.os.is_empty() {
            self.os = other.os;
        }
        if !other.ip.is_empty() {
            self.ip = other.ip;
        }
        if !other.mac.is_empty() {
            self.mac = other.mac;
        }
        self.tags.extend(other.tags);
        self
    }
}

fn ip_matches(pattern: &str, ips: &[String]) -> bool {
    if let Ok(net) = pattern.parse::<ipnet::IpNet>() {
        return ips
            .iter()
            .filter_map(|i| i.parse::<IpAddr>().ok())
            .any(|ip| net.contains(&ip));
    }
    ips.iter().any(|i| i == pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ClientSnapshot {
        let mut c = ClientSnapshot::new("aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa");
        c.hostname = "edge-1".into();
        c.arch = "x86_64".into();
        c.os = "linux".into();
        c.ips = vec!["10.0.0.7".into(), "192.168.1.4".into()];
        c.macs = vec!["00:11:22:33:44:55".into()];
        c.tags.insert("role".into(), "edge".into());
        c
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(Filter::default().matches(&client()));
    }

    #[test]
    fn conjunction_requires_every_field() {
        let filter = Filter {
            hostname: "edge-1".into(),
            os: "plan9".into(),
            ..Default::default()
        };
        assert!(!filter.matches(&client()));
    }

    #[test]
    fn cidr_membership() {
        let filter = Filter {
            ip: "10.0.0.0/8".into(),
            ..Default::default()
        };
        assert!(filter.matches(&client()));

        let miss = Filter {
            ip: "172.16.0.0/12".into(),
            ..Default::default()
        };
        assert!(!miss.matches(&client()));
    }

    #[test]
    fn exact_ip() {
        let filter = Filter {
            ip: "192.168.1.4".into(),
            ..Default::default()
        };
        assert!(filter.matches(&client()));
    }

    #[test]
    fn mac_is_case_insensitive() {
        let filter = Filter {
            mac: "00:11:22:33:44:55".to_uppercase(),
            ..Default::default()
        };
        assert!(filter.matches(&client()));
    }

    #[test]
    fn tag_equality() {
        let mut filter = Filter::default();
        filter.tags.insert("role".into(), "edge".into());
        assert!(filter.matches(&client()));

        filter.tags.insert("site".into(), "west".into());
        assert!(!filter.matches(&client()));
    }

    #[test]
    fn parse_terms() {
        let filter = Filter::parse("hostname=edge-1").unwrap();
        assert_eq!(filter.hostname, "edge-1");

        let filter = Filter::parse("tag:role=edge").unwrap();
        assert_eq!(filter.tags.get("role").map(String::as_str), Some("edge"));

        assert!(Filter::parse("color=blue").is_err());
        assert!(Filter::parse("no-equals").is_err());
    }

    #[test]
    fn and_merges_terms() {
        let merged = Filter::parse("hostname=edge-1")
            .unwrap()
            .and(Filter::parse("tag:role=edge").unwrap());
        assert!(merged.matches(&client()));
    }

    #[test]
    fn check_in_never_repeats() {
        let mut command = Command::exec(vec!["true".into()]);
        command.check_in("aaaa");
        command.check_in("aaaa");
        command.check_in("bbbb");
        assert_eq!(command.checked_in, vec!["aaaa", "bbbb"]);
    }
}
