//! Message content limits.

use crate::errors::MessageError;

/// Maximum message size accepted by the message API, in UTF-8 bytes.
pub const MAX_CONTENT_BYTES: usize = 2500;

/// Check that `content` would be accepted by the server.
///
/// The server measures length in bytes, not characters, so a message of
/// multi-byte characters hits the limit sooner.
pub fn validate_content(content: &str) -> Result<(), MessageError> {
    if content.trim().is_empty() {
        return Err(MessageError::Empty);
    }

    if content.len() > MAX_CONTENT_BYTES {
        return Err(MessageError::TooLong { len: content.len(), max: MAX_CONTENT_BYTES });
    }

    Ok(())
}
