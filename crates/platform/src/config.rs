//! Generic JSON configuration loading

use crate::PlatformResult;
use serde::de::DeserializeOwned;
use std::path::Path;

/// Decode a configuration object from JSON text
pub fn load_json_str<T: DeserializeOwned>(text: &str) -> PlatformResult<T> {
    Ok(serde_json::from_str(text)?)
}

/// Read and decode a configuration object from a JSON file
pub fn load_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> PlatformResult<T> {
    let text = std::fs::read_to_string(path)?;
    load_json_str(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PlatformError;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        port: u16,
    }

    #[test]
    fn test_load_json_str() {
        let sample: Sample = load_json_str(r#"{"name": "gw", "port": 500}"#).unwrap();
        assert_eq!(
            sample,
            Sample {
                name: "gw".into(),
                port: 500
            }
        );
    }

    #[test]
    fn test_load_json_str_invalid() {
        let result: PlatformResult<Sample> = load_json_str("{");
        assert!(matches!(result, Err(PlatformError::Decode(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let result: PlatformResult<Sample> = load_json_file("/nonexistent/ike-engine.json");
        assert!(matches!(result, Err(PlatformError::Io(_))));
    }
}
