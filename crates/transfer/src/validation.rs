use std::path::{Component, Path};

use crate::TransferError;

const MAX_UPLOAD_ID_LEN: usize = 128;
const MAX_FILE_NAME_LEN: usize = 255;

/// Validates an upload id before it is used as a directory name.
///
/// Accepts 1 to 128 characters from `[A-Za-z0-9_-]`.
pub fn validate_upload_id(id: &str) -> Result<(), TransferError> {
    if id.is_empty() || id.len() > MAX_UPLOAD_ID_LEN {
        return Err(TransferError::InvalidUploadId(format!(
            "length must be 1..={MAX_UPLOAD_ID_LEN}: {id:?}"
        )));
    }
    if !id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(TransferError::InvalidUploadId(format!(
            "unexpected character: {id:?}"
        )));
    }
    Ok(())
}

/// Validates that a file name is a single path component.
///
/// Rejects:
/// - Empty names and names over 255 bytes
/// - Anything containing a separator, `..` or a drive prefix
/// - `.` on its own
pub fn validate_file_name(name: &str) -> Result<(), TransferError> {
    if name.is_empty() || name.len() > MAX_FILE_NAME_LEN {
        return Err(TransferError::InvalidFileName(format!(
            "length must be 1..={MAX_FILE_NAME_LEN}"
        )));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(TransferError::InvalidFileName(format!(
            "separator not allowed: {name}"
        )));
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(TransferError::InvalidFileName(format!(
            "not a plain file name: {name}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_uuid_upload_id() {
        assert!(validate_upload_id("0b6f3c1e-4a57-4d5b-9a7e-2f0d1c9b8a7e").is_ok());
        assert!(validate_upload_id("up_1").is_ok());
    }

    #[test]
    fn rejects_bad_upload_ids() {
        assert!(validate_upload_id("").is_err());
        assert!(validate_upload_id("../etc").is_err());
        assert!(validate_upload_id("a/b").is_err());
        assert!(validate_upload_id("with space").is_err());
        assert!(validate_upload_id(&"x".repeat(129)).is_err());
    }

    #[test]
    fn accepts_plain_names() {
        assert!(validate_file_name("book.cbz").is_ok());
        assert!(validate_file_name(".hidden").is_ok());
        assert!(validate_file_name("Vol 01 (2024).zip").is_ok());
    }

    #[test]
    fn rejects_empty_name() {
        assert!(validate_file_name("").is_err());
    }

    #[test]
    fn rejects_traversal_and_separators() {
        assert!(validate_file_name("..").is_err());
        assert!(validate_file_name(".").is_err());
        assert!(validate_file_name("../passwd").is_err());
        assert!(validate_file_name("sub/file.txt").is_err());
        assert!(validate_file_name("sub\\file.txt").is_err());
        assert!(validate_file_name("/etc/passwd").is_err());
    }

    #[test]
    fn rejects_long_name() {
        assert!(validate_file_name(&"a".repeat(256)).is_err());
    }
}
