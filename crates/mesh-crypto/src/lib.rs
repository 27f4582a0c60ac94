//! Ed25519 keypair management and detached signatures.
//!
//! All signatures in the fabric are detached Ed25519 signatures over a
//! deterministic canonical encoding; verification is always performed
//! against the peer's advertised public key.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use mesh_types::{NodeId, PublicKey, Signature};

/// The local node's signing identity. Generated once per process; the
/// node id is derived from the public key and stays stable for the
/// session.
pub struct MeshKeypair {
    signing_key: SigningKey,
}

impl MeshKeypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_bytes(self.signing_key.verifying_key().to_bytes())
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key(self.public_key().as_bytes())
    }

    /// Detached 64-byte signature over `data`.
    pub fn sign(&self, data: &[u8]) -> Signature {
        let sig = self.signing_key.sign(data);
        Signature::new(sig.to_bytes().to_vec())
    }
}

/// Verify a detached signature against the advertised public key.
/// Malformed keys or signatures verify as false, never panic.
pub fn verify_signature(public_key: &PublicKey, data: &[u8], signature: &Signature) -> bool {
    if !signature.is_well_formed() {
        return false;
    }
    let Ok(verifying_key) = VerifyingKey::from_bytes(public_key.as_bytes()) else {
        return false;
    };
    let mut sig_bytes = [0u8; 64];
    sig_bytes.copy_from_slice(signature.as_bytes());
    let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
    verifying_key.verify(data, &sig).is_ok()
}

/// The node id a peer with `public_key` must present.
pub fn node_id_for(public_key: &PublicKey) -> NodeId {
    NodeId::from_public_key(public_key.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_round_trip() {
        let keypair = MeshKeypair::generate();
        let data = b"attestation bytes";
        let sig = keypair.sign(data);

        assert!(sig.is_well_formed());
        assert!(verify_signature(&keypair.public_key(), data, &sig));
    }

    #[test]
    fn test_tampered_data_rejected() {
        let keypair = MeshKeypair::generate();
        let sig = keypair.sign(b"original");
        assert!(!verify_signature(&keypair.public_key(), b"tampered", &sig));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let signer = MeshKeypair::generate();
        let other = MeshKeypair::generate();
        let sig = signer.sign(b"data");
        assert!(!verify_signature(&other.public_key(), b"data", &sig));
    }

    #[test]
    fn test_malformed_signature_rejected() {
        let keypair = MeshKeypair::generate();
        // A non-empty signature of the wrong length must not verify.
        let bogus = Signature::new(vec![1, 2, 3]);
        assert!(!verify_signature(&keypair.public_key(), b"data", &bogus));
        assert!(!verify_signature(
            &keypair.public_key(),
            b"data",
            &Signature::empty()
        ));
    }

    #[test]
    fn test_node_id_stable_per_key() {
        let keypair = MeshKeypair::from_seed([9u8; 32]);
        assert_eq!(keypair.node_id(), node_id_for(&keypair.public_key()));
    }
}
