/// In-flight transfer bookkeeping and version selection. Pure state,
/// no I/O.
use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::message::FileInfo;

/// No part currently being pulled.
pub const NO_PART: i64 = -1;

/// One in-flight file pull.
#[derive(Debug)]
pub struct Transfer {
    /// Staging directory holding `basename.part_N` files.
    pub dir: PathBuf,
    pub parts: i64,
    pub completed: BTreeSet<i64>,
    /// Part currently being pulled, or [`NO_PART`].
    pub inflight: i64,
    /// Still waiting for a queue slot.
    pub queued: bool,
}

impl Transfer {
    pub fn new(dir: PathBuf, parts: i64) -> Self {
        Self {
            dir,
            parts,
            completed: BTreeSet::new(),
            inflight: NO_PART,
            queued: true,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed.len() as i64 == self.parts
    }

    /// Claim a part for a snooped write: succeeds only when the part is
    /// neither completed nor currently being pulled.
    pub fn claim_snoop(&mut self, part: i64) -> bool {
        if part < 0 || part >= self.parts {
            return false;
        }
        if self.inflight == part || self.completed.contains(&part) {
            return false;
        }
        self.completed.insert(part);
        true
    }

    /// Roll back a claim whose write failed.
    pub fn unclaim(&mut self, part: i64) {
        self.completed.remove(&part);
    }
}

/// Pick which advertised version to fetch.
///
/// With hashing off the first responder wins. With a head node configured,
/// its version is preferred whenever its hash differs from the local one;
/// when the head lacks the file (or no head is set), the newest
/// modification time across differing hashes decides.
pub fn select_version(
    candidates: &[FileInfo],
    head_node: Option<&str>,
    hashing: bool,
    local_hash: Option<&str>,
) -> Option<FileInfo> {
    if candidates.is_empty() {
        return None;
    }
    if !hashing {
        return Some(candidates[0].clone());
    }
    if let Some(head) = head_node {
        if let Some(from_head) = candidates.iter().find(|c| c.from == head) {
            if local_hash != Some(from_head.hash.as_str()) {
                return Some(from_head.clone());
            }
            return Some(from_head.clone());
        }
    }
    candidates.iter().max_by_key(|c| c.modtime).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(from: &str, hash: &str, modtime: i64) -> FileInfo {
        FileInfo {
            name: "foo".into(),
            size: 1,
            parts: 1,
            perm: 0o644,
            modtime,
            hash: hash.into(),
            from: from.into(),
        }
    }

    #[test]
    fn conflicting_hashes_pick_newest_mtime() {
        // n1 hash=H1 mtime=1, n2 hash=H2 mtime=2, n3 hash=H1 mtime=0
        let candidates = vec![info("n1", "H1", 1), info("n2", "H2", 2), info("n3", "H1", 0)];
        let picked = select_version(&candidates, None, true, None).unwrap();
        assert_eq!(picked.from, "n2");
        assert_eq!(picked.hash, "H2");
    }

    #[test]
    fn head_node_wins_when_hash_differs_from_local() {
        let candidates = vec![info("n1", "H1", 9), info("head", "H2", 1)];
        let picked = select_version(&candidates, Some("head"), true, Some("H1")).unwrap();
        assert_eq!(picked.from, "head");
    }

    #[test]
    fn missing_head_falls_back_to_mtime() {
        let candidates = vec![info("n1", "H1", 1), info("n2", "H2", 5)];
        let picked = select_version(&candidates, Some("head"), true, None).unwrap();
        assert_eq!(picked.from, "n2");
    }

    #[test]
    fn hashing_off_takes_first_responder() {
        let candidates = vec![info("n2", "", 1), info("n1", "", 9)];
        let picked = select_version(&candidates, None, false, None).unwrap();
        assert_eq!(picked.from, "n2");
    }

    #[test]
    fn snoop_claim_rules() {
        let mut transfer = Transfer::new(PathBuf::from("/tmp/x"), 4);
        assert!(transfer.claim_snoop(2));
        // Already completed.
        assert!(!transfer.claim_snoop(2));
        // Currently being pulled.
        transfer.inflight = 1;
        assert!(!transfer.claim_snoop(1));
        // Out of range.
        assert!(!transfer.claim_snoop(9));
        assert!(!transfer.claim_snoop(-1));

        transfer.unclaim(2);
        assert!(transfer.claim_snoop(2));
    }

    #[test]
    fn completeness() {
        let mut transfer = Transfer::new(PathBuf::from("/tmp/x"), 2);
        assert!(!transfer.is_complete());
        transfer.completed.insert(0);
        transfer.completed.insert(1);
        assert!(transfer.is_complete());
    }
}
