/*!
Per-camera options supplied by the host.
*/

use crate::error::{Result, SxError};
use serde::{Deserialize, Serialize};

/// Limits the host applies on top of what the sensor reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraOptions {
    /// Largest horizontal binning factor accepted
    pub max_x_bin: u8,

    /// Largest vertical binning factor accepted
    pub max_y_bin: u8,
}

impl CameraOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_x_bin == 0 || self.max_y_bin == 0 {
            return Err(SxError::argument(format!(
                "binning limits must be at least 1, got {}x{}",
                self.max_x_bin, self.max_y_bin
            )));
        }
        Ok(())
    }
}

impl Default for CameraOptions {
    fn default() -> Self {
        Self {
            max_x_bin: 4,
            max_y_bin: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let options: CameraOptions = serde_json::from_str(r#"{"max_y_bin": 2}"#).unwrap();
        assert_eq!(options.max_x_bin, 4);
        assert_eq!(options.max_y_bin, 2);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_zero_bin_limit_rejected() {
        let options = CameraOptions { max_x_bin: 0, max_y_bin: 4 };
        assert!(options.validate().is_err());
    }
}
