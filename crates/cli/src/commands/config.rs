use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use strdec_core::RunOptions;

/// Saved settings for `scan`, read from YAML or JSON.
///
/// ```yaml
/// rule: rules/family.yar
/// decoder: "xor:41"
/// lookback: 8
/// inline: false
/// rename_name: decrypt_string
/// patch: true
/// ```
///
/// Command-line flags take precedence over the file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Rule file. Relative paths resolve against the config file's directory.
    pub rule: Option<PathBuf>,
    pub decoder: Option<String>,
    /// Instructions walked back from a call site looking for the string.
    pub lookback: Option<usize>,
    #[serde(flatten)]
    pub options: RunOptions,
}

impl ScanConfig {
    /// Load a config, picking the format from the extension (`.json` or YAML).
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let is_json = path.extension().and_then(|e| e.to_str()).is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let mut config: ScanConfig = if is_json {
            serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse config JSON: {}", path.display()))?
        } else {
            serde_yaml::from_str(&text)
                .with_context(|| format!("Failed to parse config YAML: {}", path.display()))?
        };

        if let (Some(rule), Some(dir)) = (config.rule.as_ref(), path.parent()) {
            if rule.is_relative() {
                config.rule = Some(dir.join(rule));
            }
        }
        Ok(config)
    }
}
