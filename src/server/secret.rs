//! Constant-time webhook secret comparison.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const COMPARE_KEY: &[u8] = b"webhook-secret-compare";

/// Compares two secrets without leaking the match length through timing.
///
/// Both sides are run through HMAC-SHA256 under a fixed key and the tags
/// are compared with the Mac's constant-time verify.
pub fn secrets_match(expected: &str, provided: &str) -> bool {
    let mut expected_mac =
        HmacSha256::new_from_slice(COMPARE_KEY).expect("HMAC can take key of any size");
    expected_mac.update(expected.as_bytes());
    let expected_tag = expected_mac.finalize().into_bytes();

    let mut provided_mac =
        HmacSha256::new_from_slice(COMPARE_KEY).expect("HMAC can take key of any size");
    provided_mac.update(provided.as_bytes());
    provided_mac.verify_slice(&expected_tag).is_ok()
}
