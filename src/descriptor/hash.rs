//! Content hash of a desired state using BLAKE3

use crate::descriptor::DesiredState;
use crate::types::StateHash;
use blake3::Hasher;

/// Compute the content hash of a desired state
///
/// StateHash = hash("hostform-state:v1\n" || canonical_json(state))
///
/// The JSON encoding is canonical because every map in the tree is either a
/// `DeclaredMap` (declaration order) or absent; the same descriptor content
/// therefore always hashes to the same value, whatever file it came from.
pub fn compute_state_hash(state: &DesiredState) -> Result<StateHash, serde_json::Error> {
    let mut hasher = Hasher::new();
    hasher.update(b"hostform-state:v1\n");
    serde_json::to_writer(&mut hasher, state)?;
    Ok(*hasher.finalize().as_bytes())
}

/// Hash of file content as recorded for managed files.
pub fn compute_content_hash(content: &[u8]) -> [u8; 32] {
    *blake3::hash(content).as_bytes()
}
