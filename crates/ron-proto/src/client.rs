/// Agent identity and the snapshot it reports on handshake and heartbeat.
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::command::Response;
use crate::error::ProtoError;

/// One entry in the agent's process table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: i32,
    pub command: Vec<String>,
}

/// Full agent snapshot carried in CLIENT messages.
///
/// Sent once at handshake and again on every heartbeat; the heartbeat
/// variant drains the agent's buffered responses and tag updates.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClientSnapshot {
    /// Canonical lowercase UUID (see [`normalize_uuid`]).
    pub uuid: String,
    pub arch: String,
    pub os: String,
    /// Agent software version.
    pub version: String,
    pub hostname: String,
    /// Namespace assigned by the controller at handshake.
    pub namespace: String,
    pub ips: Vec<String>,
    pub macs: Vec<String>,
    pub processes: BTreeMap<i32, ProcessInfo>,
    /// Responses drained from the agent's buffer.
    pub responses: Vec<Response>,
    /// Tag updates drained from the agent's tag store.
    pub tags: HashMap<String, String>,
}

impl ClientSnapshot {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            arch: std::env::consts::ARCH.to_string(),
            os: std::env::consts::OS.to_string(),
            ..Default::default()
        }
    }
}

// ── UUID handling ──────────────────────────────────────────────────────

/// Normalize a UUID to canonical lowercase 8-4-4-4-12 form.
pub fn normalize_uuid(raw: &str) -> Result<String, ProtoError> {
    let parsed = uuid::Uuid::parse_str(raw.trim())
        .map_err(|_| ProtoError::InvalidUuid(raw.to_string()))?;
    Ok(parsed.as_hyphenated().to_string())
}

/// The byte-order-mangled form some VM firmwares present: each of the
/// first three groups has its bytes swapped. Applying it twice restores
/// the canonical form.
pub fn mangle_uuid(canonical: &str) -> String {
    let mut groups: Vec<String> = canonical.split('-').map(str::to_string).collect();
    for group in groups.iter_mut().take(3) {
        *group = swap_group(group);
    }
    groups.join("-")
}

fn swap_group(group: &str) -> String {
    let bytes = group.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    for pair in bytes.chunks(2).rev() {
        for &b in pair {
            out.push(b as char);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_lowercases_and_validates() {
        let canonical = normalize_uuid("AAAAAAAA-BBBB-CCCC-DDDD-EEEEEEEEEEEE").unwrap();
        assert_eq!(canonical, "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee");
        assert!(normalize_uuid("not-a-uuid").is_err());
    }

    #[test]
    fn mangle_swaps_first_three_groups() {
        let mangled = mangle_uuid("00010203-0405-0607-0809-0a0b0c0d0e0f");
        assert_eq!(mangled, "03020100-0504-0706-0809-0a0b0c0d0e0f");
    }

    #[test]
    fn mangle_is_an_involution() {
        let canonical = "4d3f9a2c-1b5e-7f80-9a1b-2c3d4e5f6a7b";
        assert_eq!(mangle_uuid(&mangle_uuid(canonical)), canonical);
    }

    #[test]
    fn snapshot_roundtrip() {
        let mut snapshot = ClientSnapshot::new("aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa");
        snapshot.hostname = "edge-1".into();
        snapshot.tags.insert("role".into(), "edge".into());
        snapshot.processes.insert(
            41,
            ProcessInfo {
                pid: 41,
                command: vec!["sleep".into(), "60".into()],
            },
        );

        let bytes = crate::codec::to_record(&snapshot).unwrap();
        let decoded: ClientSnapshot = crate::codec::from_record(&bytes).unwrap();
        assert_eq!(decoded, snapshot);
    }
}
