//! Deterministic node election.
//!
//! Every candidate is hashed with SHA-256 and the extreme digest wins, so the
//! result only depends on the set of candidates and the key, never on the
//! order in which they were collected.
//!
//! Service election hashes `node#namespace/name` and takes the smallest
//! digest. This is the ordering MetalLB's layer-2 speaker uses, so services
//! with `externalTrafficPolicy: Local` get their floating IP on the same node
//! MetalLB announces from. Manual election has no key and takes the largest
//! digest of the bare node name.

use crate::error::ControllerError;
use sha2::{Digest, Sha256};

fn digest(input: &str) -> [u8; 32] {
    Sha256::digest(input.as_bytes()).into()
}

/// Elects the node for a service identified by `key` (`namespace/name`).
pub fn elect_for_service<'a, I>(candidates: I, key: &str) -> Result<String, ControllerError>
where
    I: IntoIterator<Item = &'a String>,
{
    candidates
        .into_iter()
        .map(|node| (digest(&format!("{}#{}", node, key)), node))
        .min()
        .map(|(_, node)| node.clone())
        .ok_or_else(|| ControllerError::EmptyCandidateSet(key.to_string()))
}

/// Elects the node for a manually assigned address.
pub fn elect_for_manual<'a, I>(candidates: I) -> Result<String, ControllerError>
where
    I: IntoIterator<Item = &'a String>,
{
    candidates
        .into_iter()
        .map(|node| (digest(node), node))
        .max()
        .map(|(_, node)| node.clone())
        .ok_or_else(|| ControllerError::EmptyCandidateSet(String::new()))
}
