use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use iati_colab_core::parse_iso_date;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

pub const DEFAULT_VALIDATION_ENDPOINT: &str = "https://iati.cove.opendataservices.coop/api_test";

/// Toolkit settings, read from YAML. Every field is optional in the file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ColabConfig {
    /// Source locators merged when a command is given none.
    pub sources: Vec<String>,
    pub validation_endpoint: String,
    /// Directory for the merged document and validation artifacts.
    pub output_dir: PathBuf,
    /// Root of the `.feature` tree.
    pub features_dir: PathBuf,
    pub classification_log: PathBuf,
    /// Applies to source fetches and the validation POST.
    pub timeout_secs: u64,
    /// Fixed reference date (`YYYY-MM-DD`); the current UTC date when unset.
    pub today: Option<String>,
}

impl Default for ColabConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            validation_endpoint: DEFAULT_VALIDATION_ENDPOINT.to_string(),
            output_dir: PathBuf::from("output"),
            features_dir: PathBuf::from("features"),
            classification_log: PathBuf::from("output/classification_log.csv"),
            timeout_secs: 60,
            today: None,
        }
    }
}

impl ColabConfig {
    /// # Errors
    /// Returns an error when the file cannot be read or is not valid config YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Defaults when `path` is `None`.
    ///
    /// # Errors
    /// See [`ColabConfig::load`].
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }

    /// # Errors
    /// Returns an error for malformed YAML, unknown keys, or an invalid `today`.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        // An empty file deserializes as null rather than an empty mapping.
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(raw).context("failed to parse config YAML")?;
        config.reference_date()?;
        Ok(config)
    }

    /// The configured `today`, or the current UTC date.
    ///
    /// # Errors
    /// Returns an error when `today` is not `YYYY-MM-DD`.
    pub fn reference_date(&self) -> Result<Date> {
        match &self.today {
            Some(value) => Ok(parse_iso_date(value)?),
            None => Ok(OffsetDateTime::now_utc().date()),
        }
    }
}
