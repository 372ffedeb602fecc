use circular_core::response::Response;
use circular_render::sha256_hex;
use tracing::error;

use crate::error::SigningError;

/// Compare `bytes` with the hash recorded on `response`.
///
/// A mismatch is logged at ERROR and returned; nothing is rewritten.
pub fn check_artifact(response: &Response, bytes: &[u8]) -> Result<String, SigningError> {
    let expected = response.document.content_hash.as_deref().ok_or_else(|| {
        SigningError::NotFound(format!("no content hash recorded for response {}", response.id))
    })?;
    let actual = sha256_hex(bytes);
    if !actual.eq_ignore_ascii_case(expected) {
        error!(
            response_id = %response.id,
            campaign_id = %response.campaign_id,
            expected,
            actual = %actual,
            "artifact hash does not match the ledger"
        );
        return Err(SigningError::IntegrityMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(actual)
}
