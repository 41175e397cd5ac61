use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use sha2::{Digest as ShaDigest, Sha256};

use crate::broadcast::cabinet::MemberId;

pub const DIGEST_SIZE: usize = 32;

pub type Digest = [u8; DIGEST_SIZE];

/// Content hash used for echo/ready votes.
pub fn hash(bytes: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let result = hasher.finalize();
    let mut digest = [0u8; DIGEST_SIZE];
    digest.copy_from_slice(&result[..]);
    digest
}

/// Node key material. Only the verifying key travels: it is the member's
/// identity inside a cabinet.
pub struct Keypair {
    member_id: MemberId,
    dalek_signer: SigningKey,
}

impl Keypair {
    pub fn new_pair() -> Self {
        let mut csprng = OsRng;
        let dalek_signer = SigningKey::generate(&mut csprng);
        let member_id = MemberId::from(&dalek_signer.verifying_key().to_bytes());

        Keypair {
            member_id,
            dalek_signer,
        }
    }

    pub fn member_id(&self) -> MemberId {
        self.member_id.clone()
    }

    pub fn verifying_key(&self) -> [u8; 32] {
        self.dalek_signer.verifying_key().to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(hash(b"hello"), hash(b"hello"));
        assert_ne!(hash(b"hello"), hash(b"hellp"));
    }

    #[test]
    fn test_member_id_is_verifying_key() {
        let keypair = Keypair::new_pair();
        assert_eq!(keypair.member_id().as_bytes(), &keypair.verifying_key()[..]);
        assert_ne!(keypair.member_id(), Keypair::new_pair().member_id());
    }
}
