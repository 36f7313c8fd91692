//! Signature-based verifiable random function.
//!
//! Ed25519 signing is deterministic, so a signature over a fixed input is a
//! value only the key holder can compute and anyone can check. The proof is
//! that signature; the seed is a domain-separated BLAKE3 of the proof.
//!
//! The block header carries `(seed, proof)` computed over
//! `ancestor_hash ‖ parent_seed`, which chains randomness block to block
//! without letting the proposer grind it.

use serde::{Deserialize, Serialize};

use super::hash::{blake3_hash_many, Hash};
use super::keys::{Keypair, PublicKey, Signature};

const VRF_INPUT_TAG: &[u8] = b"pod.vrf.input";
const VRF_OUTPUT_TAG: &[u8] = b"pod.vrf.output";

/// Randomness attached to a block above the activation height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VrfOutput {
    pub seed: Hash,
    pub proof: Vec<u8>,
}

fn vrf_input(ancestor_hash: &Hash, parent_seed: &Hash) -> Hash {
    blake3_hash_many(&[VRF_INPUT_TAG, ancestor_hash.as_bytes(), parent_seed.as_bytes()])
}

fn seed_from_proof(proof: &[u8]) -> Hash {
    blake3_hash_many(&[VRF_OUTPUT_TAG, proof])
}

/// Evaluate the VRF for `(ancestor_hash, parent_seed)`.
pub fn evaluate(keypair: &Keypair, ancestor_hash: &Hash, parent_seed: &Hash) -> VrfOutput {
    let input = vrf_input(ancestor_hash, parent_seed);
    let proof = keypair.sign(input.as_bytes()).as_bytes().to_vec();
    VrfOutput {
        seed: seed_from_proof(&proof),
        proof,
    }
}

/// Check that `output` was produced by `public_key` over the given input.
pub fn verify(
    public_key: &PublicKey,
    ancestor_hash: &Hash,
    parent_seed: &Hash,
    output: &VrfOutput,
) -> bool {
    let input = vrf_input(ancestor_hash, parent_seed);
    let signature = Signature::from_bytes(output.proof.clone());
    public_key.verify(input.as_bytes(), &signature) && seed_from_proof(&output.proof) == output.seed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::blake3_hash;

    #[test]
    fn evaluate_is_deterministic_and_verifies() {
        let kp = Keypair::from_seed(&[1u8; 32]);
        let ancestor = blake3_hash(b"ancestor");
        let parent_seed = blake3_hash(b"parent");

        let a = evaluate(&kp, &ancestor, &parent_seed);
        let b = evaluate(&kp, &ancestor, &parent_seed);
        assert_eq!(a, b);
        assert!(verify(&kp.public_key(), &ancestor, &parent_seed, &a));
    }

    #[test]
    fn tampered_seed_is_rejected() {
        let kp = Keypair::generate();
        let ancestor = blake3_hash(b"a");
        let mut out = evaluate(&kp, &ancestor, &Hash::ZERO);
        out.seed = blake3_hash(b"chosen by the proposer");
        assert!(!verify(&kp.public_key(), &ancestor, &Hash::ZERO, &out));
    }

    #[test]
    fn other_key_or_input_is_rejected() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let ancestor = blake3_hash(b"a");
        let out = evaluate(&kp, &ancestor, &Hash::ZERO);
        assert!(!verify(&other.public_key(), &ancestor, &Hash::ZERO, &out));
        assert!(!verify(&kp.public_key(), &blake3_hash(b"b"), &Hash::ZERO, &out));
    }
}
