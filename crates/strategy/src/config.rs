use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use common::{Error, Result};

/// Signal config file (TOML).
///
/// Example `config/signal.toml`:
/// ```toml
/// [signal]
/// type = "sma"
///
/// [signal.params]
/// window = 20
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SignalFileConfig {
    #[serde(default)]
    pub signal: SignalConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SignalConfig {
    /// Evaluator type identifier: "sma" or "rsi".
    #[serde(rename = "type")]
    pub signal_type: String,
    /// Evaluator-specific parameters.
    #[serde(default)]
    pub params: HashMap<String, toml::Value>,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            signal_type: "sma".to_string(),
            params: HashMap::new(),
        }
    }
}

impl SignalFileConfig {
    /// Load from a TOML file. A missing file yields the default SMA crossover.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("failed to parse '{}': {e}", path.display())))
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_defaults_to_sma() {
        let cfg = SignalFileConfig::load("definitely/not/here.toml").unwrap();
        assert_eq!(cfg.signal.signal_type, "sma");
    }

    #[test]
    fn parses_type_and_params() {
        let cfg = SignalFileConfig::parse(
            r#"
            [signal]
            type = "rsi"

            [signal.params]
            period = 9
            oversold = 25.0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.signal.signal_type, "rsi");
        assert_eq!(cfg.signal.params["period"].as_integer(), Some(9));
    }
}
