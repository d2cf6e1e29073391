use std::path::Path;

use crate::errors::{AppError, AppResult};

/// Item-level policy checks applied before any network call.
pub struct InputValidator;

impl InputValidator {
    /// Captions are measured in characters, not bytes.
    pub fn validate_caption(caption: &str, max_chars: usize) -> AppResult<()> {
        let length = caption.chars().count();
        if length > max_chars {
            return Err(AppError::CaptionTooLong {
                length,
                limit: max_chars,
            });
        }
        Ok(())
    }

    pub fn validate_payload_size(size: u64, max_bytes: u64) -> AppResult<()> {
        if size > max_bytes {
            return Err(AppError::PayloadTooLarge {
                size,
                limit: max_bytes,
            });
        }
        Ok(())
    }

    /// Maps a payload name to the MIME type declared at INIT.
    pub fn mime_type_for(file_name: &str) -> AppResult<&'static str> {
        let extension = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase());

        match extension.as_deref() {
            Some("png") => Ok("image/png"),
            Some("jpg") | Some("jpeg") => Ok("image/jpeg"),
            _ => Err(AppError::unsupported_media_type(file_name)),
        }
    }

    pub fn is_supported_image(file_name: &str) -> bool {
        Self::mime_type_for(file_name).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caption_at_the_limit_is_accepted() {
        let caption = "a".repeat(280);
        assert!(InputValidator::validate_caption(&caption, 280).is_ok());
    }

    #[test]
    fn caption_one_over_the_limit_is_rejected() {
        let caption = "a".repeat(281);
        match InputValidator::validate_caption(&caption, 280) {
            Err(AppError::CaptionTooLong { length, limit }) => {
                assert_eq!(length, 281);
                assert_eq!(limit, 280);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn caption_length_counts_characters() {
        // 280 two-byte characters
        let caption = "é".repeat(280);
        assert!(InputValidator::validate_caption(&caption, 280).is_ok());
    }

    #[test]
    fn payload_ceiling_is_inclusive() {
        assert!(InputValidator::validate_payload_size(5, 5).is_ok());
        assert!(matches!(
            InputValidator::validate_payload_size(6, 5),
            Err(AppError::PayloadTooLarge { size: 6, limit: 5 })
        ));
    }

    #[test]
    fn mime_types_follow_the_extension() {
        assert_eq!(InputValidator::mime_type_for("a.png").unwrap(), "image/png");
        assert_eq!(InputValidator::mime_type_for("b.jpg").unwrap(), "image/jpeg");
        assert_eq!(InputValidator::mime_type_for("c.JPEG").unwrap(), "image/jpeg");
        assert_eq!(
            InputValidator::mime_type_for("dir/photo.PNG").unwrap(),
            "image/png"
        );
    }

    #[test]
    fn unknown_extensions_are_validation_errors() {
        for name in ["clip.gif", "noextension", "archive.png.zip"] {
            let err = InputValidator::mime_type_for(name).unwrap_err();
            assert!(err.is_permanent(), "{} should be a validation error", name);
        }
    }
}
