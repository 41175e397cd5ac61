use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest as ShaDigest, Sha256};

use crate::common::error::ConfigError;

/// Dense 0-based index of a member within a cabinet.
pub type Rank = u32;

/// Opaque member identity. Ordering is byte-wise and defines ranks.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(pub Vec<u8>);

impl MemberId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        MemberId(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8; 32]> for MemberId {
    fn from(bytes: &[u8; 32]) -> Self {
        MemberId(bytes.to_vec())
    }
}

impl From<&str> for MemberId {
    fn from(name: &str) -> Self {
        MemberId(name.as_bytes().to_vec())
    }
}

impl AsRef<[u8]> for MemberId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemberId({})", self)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = &self.0[..self.0.len().min(8)];
        write!(f, "{}", hex::encode(shown))
    }
}

/// The fixed validator set of one epoch.
///
/// Members are kept sorted, so a member's rank is the same on every node
/// that was handed the same set. A cabinet is never mutated; a new epoch
/// gets a new cabinet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cabinet {
    members: Vec<MemberId>,
    threshold: usize,
}

impl Cabinet {
    /// Build a cabinet tolerating `threshold` Byzantine members.
    ///
    /// Duplicate identities collapse into one member.
    pub fn new(
        members: impl IntoIterator<Item = MemberId>,
        threshold: usize,
    ) -> Result<Self, ConfigError> {
        let members: Vec<MemberId> = members
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if members.is_empty() {
            return Err(ConfigError::EmptyCabinet);
        }

        // n >= 3t + 1, written so that a huge threshold cannot overflow.
        if threshold > (members.len() - 1) / 3 {
            return Err(ConfigError::ThresholdTooLarge {
                members: members.len(),
                threshold,
            });
        }

        Ok(Cabinet { members, threshold })
    }

    /// Build a cabinet with the largest threshold its size can tolerate.
    pub fn with_max_threshold(members: impl IntoIterator<Item = MemberId>) -> Result<Self, ConfigError> {
        let members: BTreeSet<MemberId> = members.into_iter().collect();
        let n = members.len();
        if n == 0 {
            return Err(ConfigError::EmptyCabinet);
        }
        let threshold = if n % 3 == 0 { n / 3 - 1 } else { n / 3 };
        Cabinet::new(members, threshold)
    }

    pub fn rank(&self, member: &MemberId) -> Option<Rank> {
        self.members
            .binary_search(member)
            .ok()
            .map(|index| index as Rank)
    }

    pub fn member(&self, rank: Rank) -> Option<&MemberId> {
        self.members.get(rank as usize)
    }

    pub fn members(&self) -> &[MemberId] {
        &self.members
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Echoes needed before sending Ready: `n - t`.
    pub fn echo_quorum(&self) -> usize {
        self.size() - self.threshold
    }

    /// Readies that prove at least one honest member is ready: `t + 1`.
    pub fn amplify_quorum(&self) -> usize {
        self.threshold + 1
    }

    /// Readies needed to deliver: `2t + 1`.
    pub fn ready_quorum(&self) -> usize {
        2 * self.threshold + 1
    }

    /// Epoch identifier shared by every node holding this exact cabinet.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update((self.threshold as u64).to_be_bytes());
        for member in &self.members {
            hasher.update((member.0.len() as u64).to_be_bytes());
            hasher.update(&member.0);
        }
        let result = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&result[..8]);
        u64::from_be_bytes(head)
    }
}
