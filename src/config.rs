//! Configuration loading and validation
//!
//! One YAML document, one serde struct per section, defaults matching the
//! shipped `config.yaml`. Unknown keys are rejected so a typo refuses
//! startup instead of silently running with defaults.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Resolved service configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub dicom_listener: ListenerConfig,
    pub dicom_destination: DestinationConfig,
    pub directories: DirectoriesConfig,
    pub watcher: WatcherConfig,
    pub processing: ProcessingConfig,
    pub anonymization: AnonymizationConfig,
    pub feature_flags: FeatureFlags,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
    pub ae_title: String,
    /// Persist datasets with the negotiated transfer syntax. When false the
    /// listener only accepts uncompressed syntaxes and re-encodes to
    /// explicit VR little endian on write.
    pub config_negotiated_transfer_syntax: bool,
    /// Upper bound on concurrently open associations.
    pub max_associations: usize,
    /// Tear down an association after this long without a PDU.
    pub inactivity_timeout_seconds: u64,
    /// Reject instances larger than this once accumulated.
    pub max_instance_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 11112,
            ae_title: "NETRT".to_string(),
            config_negotiated_transfer_syntax: true,
            max_associations: 16,
            inactivity_timeout_seconds: 60,
            max_instance_bytes: 512 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct DestinationConfig {
    pub ip: String,
    pub port: u16,
    pub ae_title: String,
    /// Attempts for transient network failures before giving up.
    pub max_retries: u32,
    /// Base of the exponential backoff between attempts.
    pub retry_backoff_seconds: u64,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: 104,
            ae_title: "DEST_AET".to_string(),
            max_retries: 3,
            retry_backoff_seconds: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct DirectoriesConfig {
    pub working: PathBuf,
    pub logs: PathBuf,
    /// Subdirectory of `working` that holds quarantined studies.
    pub quarantine_subdir: String,
}

impl Default for DirectoriesConfig {
    fn default() -> Self {
        Self {
            working: PathBuf::from("~/CNCT_working"),
            logs: PathBuf::from("~/CNCT_logs"),
            quarantine_subdir: "quarantine".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct WatcherConfig {
    pub debounce_interval_seconds: u64,
    pub min_file_count_for_processing: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_interval_seconds: 5,
            min_file_count_for_processing: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProcessingConfig {
    /// ROIs whose name contains any of these (case-insensitive) are dropped.
    pub ignore_contour_names_containing: Vec<String>,
    pub overlay_series_number: i32,
    pub overlay_series_description: String,
    pub overlay_study_description: String,
    pub add_burn_in_disclaimer: bool,
    pub burn_in_text: String,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            ignore_contour_names_containing: vec![
                "skull".to_string(),
                "patient_outline".to_string(),
            ],
            overlay_series_number: 9901,
            overlay_series_description: "Unapproved Treatment Plan with Overlay".to_string(),
            overlay_study_description: "Unapproved Treatment Plan with Overlay".to_string(),
            add_burn_in_disclaimer: false,
            burn_in_text: "RESEARCH IMAGE - Not for diagnostic purpose".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct AnonymizationConfig {
    pub enabled: bool,
    /// Switch to the built-in comprehensive tag table and date blanking.
    pub full_anonymization_enabled: bool,
    pub rules: AnonymizationRules,
}

impl Default for AnonymizationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            full_anonymization_enabled: false,
            rules: AnonymizationRules::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct AnonymizationRules {
    /// Tag keywords removed from the dataset entirely.
    pub remove_tags: Vec<String>,
    /// Tag keywords kept but replaced with an empty value.
    pub blank_tags: Vec<String>,
}

impl Default for AnonymizationRules {
    fn default() -> Self {
        Self {
            remove_tags: vec!["AccessionNumber".to_string(), "PatientID".to_string()],
            blank_tags: vec![],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct FeatureFlags {
    pub enable_segmentation_export: bool,
    pub enable_debug_visualisation: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            enable_segmentation_export: false,
            enable_debug_visualisation: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error.
    pub level: String,
    pub application_log_file: String,
    pub transaction_log_file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            application_log_file: "application.log".to_string(),
            transaction_log_file: "transaction.log".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// A missing file yields the compiled defaults when `require_file` is
    /// false (the `--config` default path case); otherwise it is a
    /// configuration error.
    pub fn load(path: &Path, require_file: bool) -> Result<Config> {
        if !path.exists() {
            if require_file {
                return Err(Error::Config(format!(
                    "configuration file not found: {}",
                    path.display()
                )));
            }
            tracing::warn!(
                "configuration file {} not found, using defaults",
                path.display()
            );
            let mut config = Config::default();
            config.expand_directories();
            config.validate()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut config: Config = serde_yaml::from_str(&content)
            .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.expand_directories();
        config.validate()?;
        Ok(config)
    }

    /// Expand a leading `~` in the working and logs directories.
    fn expand_directories(&mut self) {
        self.directories.working = expand_tilde(&self.directories.working);
        self.directories.logs = expand_tilde(&self.directories.logs);
    }

    /// Reject configurations the service cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.dicom_listener.ae_title.is_empty() || self.dicom_listener.ae_title.len() > 16 {
            return Err(Error::Config(
                "dicom_listener.ae_title must be 1-16 characters".to_string(),
            ));
        }
        if self.dicom_destination.ae_title.is_empty() || self.dicom_destination.ae_title.len() > 16
        {
            return Err(Error::Config(
                "dicom_destination.ae_title must be 1-16 characters".to_string(),
            ));
        }
        if self.dicom_destination.ip.is_empty() {
            return Err(Error::Config(
                "dicom_destination.ip must be set".to_string(),
            ));
        }
        if self.watcher.debounce_interval_seconds == 0 {
            return Err(Error::Config(
                "watcher.debounce_interval_seconds must be at least 1".to_string(),
            ));
        }
        if self.dicom_listener.max_associations == 0 {
            return Err(Error::Config(
                "dicom_listener.max_associations must be at least 1".to_string(),
            ));
        }
        if self
            .directories
            .quarantine_subdir
            .contains(std::path::MAIN_SEPARATOR)
        {
            return Err(Error::Config(
                "directories.quarantine_subdir must be a plain directory name".to_string(),
            ));
        }
        if self.feature_flags.enable_segmentation_export {
            return Err(Error::Config(
                "feature_flags.enable_segmentation_export is not supported by this build"
                    .to_string(),
            ));
        }
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(Error::Config(format!(
                    "logging.level {:?} is not one of trace/debug/info/warn/error",
                    other
                )))
            }
        }
        Ok(())
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.dicom_listener.host, "0.0.0.0");
        assert_eq!(config.dicom_listener.port, 11112);
        assert_eq!(config.dicom_listener.ae_title, "NETRT");
        assert!(config.dicom_listener.config_negotiated_transfer_syntax);
        assert_eq!(config.dicom_destination.port, 104);
        assert_eq!(config.watcher.debounce_interval_seconds, 5);
        assert_eq!(config.watcher.min_file_count_for_processing, 2);
        assert_eq!(config.directories.quarantine_subdir, "quarantine");
        assert!(config
            .processing
            .ignore_contour_names_containing
            .contains(&"skull".to_string()));
    }

    #[test]
    fn partial_document_keeps_section_defaults() {
        let config: Config = serde_yaml::from_str(
            "dicom_listener:\n  port: 4242\nprocessing:\n  add_burn_in_disclaimer: true\n",
        )
        .unwrap();
        assert_eq!(config.dicom_listener.port, 4242);
        assert_eq!(config.dicom_listener.ae_title, "NETRT");
        assert!(config.processing.add_burn_in_disclaimer);
        assert_eq!(config.processing.overlay_series_number, 9901);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: std::result::Result<Config, _> =
            serde_yaml::from_str("dicom_listener:\n  prot: 11112\n");
        assert!(result.is_err());
    }

    #[test]
    fn validation_rejects_long_ae_title() {
        let mut config = Config::default();
        config.dicom_listener.ae_title = "THIS_TITLE_IS_FAR_TOO_LONG".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_refuses_segmentation_export() {
        let mut config = Config::default();
        config.feature_flags.enable_segmentation_export = true;
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), "config-error");
    }
}
