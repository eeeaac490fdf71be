use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),

    #[error("Timeout error: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Transport unreachable or a reply that could not be understood.
    #[error("Communication error: {0}")]
    Communication(String),

    /// The peer sent something the upload protocol does not allow.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Upload rejected by device: {0}")]
    TransferRejected(String),

    #[error("Server not available, stalled progress or {reason} (after {attempts} attempts)")]
    TransferStalled { attempts: u32, reason: String },

    #[error("{message} [{stage}]")]
    DeviceReported { stage: String, message: String },

    #[error("Firmware update finished with unknown state! ({0})")]
    UnknownStage(String),

    #[error("Update aborted by timeout in stage {stage} after {seconds}s! Please try to repeat")]
    StageTimeout { stage: String, seconds: u64 },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Firmware image of {0} bytes exceeds the 32-bit offset range of the upload protocol")]
    AssetTooLarge(u64),
}

impl UpdateError {
    /// True for failures raised by the device's own validation pipeline, as
    /// opposed to the link or the client.
    pub fn is_device_failure(&self) -> bool {
        matches!(
            self,
            UpdateError::DeviceReported { .. }
                | UpdateError::UnknownStage(_)
                | UpdateError::TransferRejected(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            UpdateError::Timeout(_)
                | UpdateError::StageTimeout { .. }
                | UpdateError::TransferStalled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let update_error: UpdateError = io_error.into();

        match update_error {
            UpdateError::Io(_) => {},
            _ => panic!("Expected Io error variant"),
        }
    }

    #[test]
    fn test_serialization_error_conversion() {
        let json_error = serde_json::from_str::<i32>("invalid json").unwrap_err();
        let update_error: UpdateError = json_error.into();

        match update_error {
            UpdateError::Serialization(_) => {},
            _ => panic!("Expected Serialization error variant"),
        }
    }

    #[test]
    fn test_toml_deserialization_error_conversion() {
        let toml_error = toml::from_str::<i32>("invalid toml").unwrap_err();
        let update_error: UpdateError = toml_error.into();

        match update_error {
            UpdateError::TomlDeserialization(_) => {},
            _ => panic!("Expected TomlDeserialization error variant"),
        }
    }

    #[tokio::test]
    async fn test_timeout_error_conversion() {
        let elapsed = tokio::time::timeout(
            std::time::Duration::from_millis(1),
            std::future::pending::<()>(),
        )
        .await
        .unwrap_err();
        let update_error: UpdateError = elapsed.into();
        assert!(update_error.is_timeout());
    }

    #[test]
    fn test_unknown_stage_carries_tag() {
        let error = UpdateError::UnknownStage("FOOBAR".to_string());
        let error_string = error.to_string();
        assert!(error_string.contains("FOOBAR"));
        assert!(error.is_device_failure());
    }

    #[test]
    fn test_stage_timeout_message() {
        let error = UpdateError::StageTimeout { stage: "EVALUATE_PACKAGE".to_string(), seconds: 60 };
        let error_string = error.to_string();
        assert!(error_string.contains("timeout"));
        assert!(error_string.contains("EVALUATE_PACKAGE"));
        assert!(error.is_timeout());
        assert!(!error.is_device_failure());
    }

    #[test]
    fn test_device_reported_error() {
        let error = UpdateError::DeviceReported {
            stage: "STARTUP_FAILED".to_string(),
            message: "Startup failed! Possible reason: disk full".to_string(),
        };
        let error_string = error.to_string();
        assert!(error_string.contains("disk full"));
        assert!(error_string.contains("STARTUP_FAILED"));
        assert!(error.is_device_failure());
    }

    #[test]
    fn test_transfer_stalled_error() {
        let error = UpdateError::TransferStalled { attempts: 6, reason: "connection refused".to_string() };
        let error_string = error.to_string();
        assert!(error_string.contains("stalled progress"));
        assert!(error_string.contains("connection refused"));
    }

    #[test]
    fn test_protocol_violation() {
        let error = UpdateError::ProtocolViolation("binary frame from server".to_string());
        let error_string = error.to_string();
        assert!(error_string.contains("binary frame from server"));
        assert!(!error.is_timeout());
    }

    #[test]
    fn test_file_not_found_error() {
        let path = PathBuf::from("/nonexistent/firmware.swu");
        let error = UpdateError::FileNotFound(path.clone());
        let error_string = error.to_string();
        assert!(error_string.contains(path.to_string_lossy().as_ref()));
    }

    #[test]
    fn test_error_debug_format() {
        let error = UpdateError::Communication("Test error".to_string());
        let debug_string = format!("{:?}", error);
        assert!(debug_string.contains("Communication"));
        assert!(debug_string.contains("Test error"));
    }
}
