//! Deduplication gate: `(user_id, file_checksum, job_type=MAIN)` is
//! unique. Only file sources carry a known checksum at submission
//! time; URL and cloud-drive sources skip the gate entirely because
//! the checksum isn't known until fetch.

use sha2::{Digest, Sha256};

use crate::error::StoreError;
use crate::model::Job;
use crate::store::MetadataGateway;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Looks up an existing MAIN for `(user_id, file_checksum)`. `Some`
/// means the submission should be satisfied by the existing job
/// instead of creating a new one.
pub async fn find_existing(
    metadata: &dyn MetadataGateway,
    user_id: &str,
    file_checksum: &str,
) -> Result<Option<Job>, StoreError> {
    metadata.find_dedup(user_id, file_checksum).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_is_deterministic_and_lowercase_hex() {
        let a = sha256_hex(b"hello world");
        let b = sha256_hex(b"hello world");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn different_bytes_hash_differently() {
        assert_ne!(sha256_hex(b"a"), sha256_hex(b"b"));
    }
}
