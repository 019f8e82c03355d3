// Shared-secret verification for the webhook ingresses
//
// Comparison goes through SHA-256 digests so the byte comparison is over
// fixed-length, attacker-independent values (timing-safe).

use sha2::{Digest, Sha256};

pub fn secrets_match(presented: &str, expected: &str) -> bool {
    Sha256::digest(presented.as_bytes()) == Sha256::digest(expected.as_bytes())
}
