/*!
Tests for error handling and error types.
*/

#[cfg(test)]
mod tests {
    use crate::error::ArchivistError;
    use std::io;

    #[test]
    fn test_archivist_error_display() {
        let error = ArchivistError::validation("Invalid format. Choose 7z, zip, or tar.");
        assert_eq!(
            error.to_string(),
            "Invalid input: Invalid format. Choose 7z, zip, or tar."
        );

        let error = ArchivistError::upload("connection reset");
        assert_eq!(error.to_string(), "Upload failed: connection reset");

        let error = ArchivistError::Download("file expired".to_string());
        assert_eq!(error.to_string(), "Download failed: file expired");
    }

    #[test]
    fn test_archive_errors_carry_name_and_cause() {
        let error = ArchivistError::build("docs_1.zip", "No space left on device");
        let text = error.to_string();
        assert!(text.contains("docs_1.zip"));
        assert!(text.contains("No space left on device"));

        let error = ArchivistError::verify("docs_2.7z", "checksum mismatch");
        match &error {
            ArchivistError::ArchiveVerify { archive, reason } => {
                assert_eq!(archive, "docs_2.7z");
                assert_eq!(reason, "checksum mismatch");
            }
            _ => panic!("Expected ArchiveVerify error variant"),
        }
    }

    #[test]
    fn test_archivist_error_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let error = ArchivistError::from(io_error);

        match error {
            ArchivistError::Io(_) => {}
            _ => panic!("Expected Io error variant"),
        }
    }

    #[test]
    fn test_archivist_error_from_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error = ArchivistError::from(json_error);

        match error {
            ArchivistError::Json(_) => {}
            _ => panic!("Expected Json error variant"),
        }
    }

    #[test]
    fn test_cancelled_detection() {
        assert!(ArchivistError::Cancelled.is_cancelled());
        assert!(!ArchivistError::session("no session").is_cancelled());
        assert_eq!(ArchivistError::Cancelled.to_string(), "Operation cancelled");
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<ArchivistError>();
        assert_sync::<ArchivistError>();
    }
}
