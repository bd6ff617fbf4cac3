//! Agreement among replicas.
//!
//! Every participant proposes a payload for the current round. Votes carry
//! the SHA-256 digest of the payload's JSON encoding; a reducer turns the
//! collected votes into one canonical payload or reports no agreement.
//!
//! The JSON encoding is canonical because payloads only contain structs,
//! `Vec`s, `BTreeMap`s and `serde_json::Value` (whose maps are sorted).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Participants and votes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(pub usize);

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Hex SHA-256 of the payload's canonical JSON.
pub fn payload_digest<T: Serialize>(payload: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(payload)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// One participant's proposal.
#[derive(Debug, Clone, PartialEq)]
pub struct Vote<P> {
    pub participant: ParticipantId,
    pub digest: String,
    pub payload: P,
}

impl<P: Serialize> Vote<P> {
    pub fn new(participant: ParticipantId, payload: P) -> Result<Self, serde_json::Error> {
        let digest = payload_digest(&payload)?;
        Ok(Self {
            participant,
            digest,
            payload,
        })
    }
}

// ---------------------------------------------------------------------------
// Quorum
// ---------------------------------------------------------------------------

/// How many votes a reducer needs. Written in config as `"all"`,
/// `"majority"` or an explicit count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "QuorumSetting")]
pub enum Quorum {
    All,
    Majority,
    Count(usize),
}

impl Quorum {
    pub fn required(&self, participants: usize) -> usize {
        match self {
            Quorum::All => participants,
            Quorum::Majority => participants / 2 + 1,
            Quorum::Count(n) => *n,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QuorumSetting {
    Count(usize),
    Named(String),
}

impl TryFrom<QuorumSetting> for Quorum {
    type Error = String;

    fn try_from(setting: QuorumSetting) -> Result<Self, Self::Error> {
        match setting {
            QuorumSetting::Count(0) => Err("quorum count must be at least 1".to_string()),
            QuorumSetting::Count(n) => Ok(Quorum::Count(n)),
            QuorumSetting::Named(name) => match name.to_ascii_lowercase().as_str() {
                "all" => Ok(Quorum::All),
                "majority" => Ok(Quorum::Majority),
                other => Err(format!("unknown quorum '{other}' (expected all, majority or a count)")),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Reducers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no agreement: best {best} of {received} votes, {required} required")]
pub struct NoAgreement {
    pub received: usize,
    /// Size of the largest group of identical payloads.
    pub best: usize,
    pub required: usize,
}

/// Reduces collected votes to one canonical payload.
pub trait Reducer {
    fn reduce<'a, P>(
        &self,
        votes: &'a [Vote<P>],
        participants: usize,
    ) -> Result<&'a Vote<P>, NoAgreement>;
}

/// A quorum of byte-identical payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Matching(pub Quorum);

impl Reducer for Matching {
    fn reduce<'a, P>(
        &self,
        votes: &'a [Vote<P>],
        participants: usize,
    ) -> Result<&'a Vote<P>, NoAgreement> {
        let required = self.0.required(participants);
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for v in votes {
            *counts.entry(v.digest.as_str()).or_default() += 1;
        }

        // Largest group wins; BTreeMap order makes ties pick the smallest digest.
        let best = counts
            .iter()
            .fold(None::<(&str, usize)>, |acc, (digest, count)| match acc {
                Some((_, c)) if c >= *count => acc,
                _ => Some((digest, *count)),
            });

        match best {
            Some((digest, count)) if count >= required && required > 0 => votes
                .iter()
                .find(|v| v.digest == digest)
                .ok_or(NoAgreement {
                    received: votes.len(),
                    best: count,
                    required,
                }),
            _ => Err(NoAgreement {
                received: votes.len(),
                best: best.map_or(0, |(_, c)| c),
                required,
            }),
        }
    }
}

/// Once a quorum of payloads has arrived, the one with the smallest
/// digest is canonical. Used where payloads carry independently fetched
/// data that is not expected to match byte for byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmallestDigest(pub Quorum);

impl Reducer for SmallestDigest {
    fn reduce<'a, P>(
        &self,
        votes: &'a [Vote<P>],
        participants: usize,
    ) -> Result<&'a Vote<P>, NoAgreement> {
        let required = self.0.required(participants);
        if votes.len() < required || votes.is_empty() {
            return Err(NoAgreement {
                received: votes.len(),
                best: votes.len(),
                required,
            });
        }
        votes
            .iter()
            .min_by(|a, b| a.digest.cmp(&b.digest))
            .ok_or(NoAgreement {
                received: 0,
                best: 0,
                required,
            })
    }
}

/// The reducer a round agrees with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    Matching(Matching),
    SmallestDigest(SmallestDigest),
}

impl Reducer for Reduction {
    fn reduce<'a, P>(
        &self,
        votes: &'a [Vote<P>],
        participants: usize,
    ) -> Result<&'a Vote<P>, NoAgreement> {
        match self {
            Reduction::Matching(r) => r.reduce(votes, participants),
            Reduction::SmallestDigest(r) => r.reduce(votes, participants),
        }
    }
}

impl fmt::Display for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reduction::Matching(Matching(q)) => write!(f, "matching({q:?})"),
            Reduction::SmallestDigest(SmallestDigest(q)) => write!(f, "smallest-digest({q:?})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
