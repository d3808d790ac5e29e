//! Run configuration, loadable from TOML and overridden by command line flags.
//!
//! ```toml
//! output_dir = "/data/converted"
//! ledger = "/data/converted/ledger.csv"
//! keywords = ["T1", "DTI"]
//! orientation = "LPS"
//! mode = "copy"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::enums::OrganizeMode;
use crate::grouper::DEFAULT_GROUP_BY;
use crate::ledger::LockPolicy;
use crate::orchestrator::DEFAULT_MULTI_OUTPUT_EXEMPT;
use crate::orientation::OrientationCode;
use crate::selector::DEFAULT_EXCLUDE;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Root of the `dicoms/` and `Nifti/` trees.
    pub output_dir: PathBuf,
    /// Shared conversion ledger; without one nothing is skipped or recorded.
    pub ledger: Option<PathBuf>,
    /// Run scratch directory, kept after the run. A temporary one otherwise.
    pub workdir: Option<PathBuf>,
    /// Only sequences whose label contains one of these.
    pub keywords: Option<Vec<String>>,
    /// Sequences whose label contains one of these are dropped.
    pub exclude: Option<Vec<String>>,
    pub recursive: bool,
    pub orientation: OrientationCode,
    pub mode: OrganizeMode,
    /// Convert even when the ledger says the output exists.
    pub force: bool,
    pub group_by: Vec<String>,
    pub lock_timeout_secs: u64,
    pub lock_poll_interval_ms: u64,
    /// Sequence keywords exempt from letter suffixes on extra outputs.
    pub multi_output_exempt: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            ledger: None,
            workdir: None,
            keywords: None,
            exclude: Some(strings(DEFAULT_EXCLUDE)),
            recursive: true,
            orientation: OrientationCode::LPS,
            mode: OrganizeMode::default(),
            force: false,
            group_by: strings(DEFAULT_GROUP_BY),
            lock_timeout_secs: 3600,
            lock_poll_interval_ms: 1000,
            multi_output_exempt: strings(DEFAULT_MULTI_OUTPUT_EXEMPT),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Load a configuration file; keys it leaves out keep their defaults
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text, path)
    }

    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            timeout: Duration::from_secs(self.lock_timeout_secs),
            poll_interval: Duration::from_millis(self.lock_poll_interval_ms),
        }
    }

    /// Staged slices go under `<output>/dicoms/<subject>/<sequence>`.
    pub fn dicom_dir(&self) -> PathBuf {
        self.output_dir.join("dicoms")
    }

    /// Converted volumes go under `<output>/Nifti/<subject>`.
    pub fn nifti_dir(&self) -> PathBuf {
        self.output_dir.join("Nifti")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.exclude, Some(vec!["localizer".to_string(), "moco".to_string()]));
        assert_eq!(config.orientation, OrientationCode::LPS);
        assert_eq!(config.mode, OrganizeMode::Link);
        assert_eq!(config.lock_policy().timeout, Duration::from_secs(3600));
        assert_eq!(
            config.group_by,
            ["SeriesInstanceUID", "SeriesNumber", "SeriesDescription"]
        );
        assert!(config.recursive && !config.force);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config = PipelineConfig::from_toml_str(
            "output_dir = \"/data/out\"\norientation = \"ras\"\nmode = \"copy\"\nkeywords = [\"T1\"]\n",
            Path::new("run.toml"),
        )
        .unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/data/out"));
        assert_eq!(config.orientation, OrientationCode::RAS);
        assert_eq!(config.mode, OrganizeMode::Copy);
        assert_eq!(config.keywords, Some(vec!["T1".to_string()]));
        assert_eq!(config.lock_timeout_secs, 3600);
        assert_eq!(config.nifti_dir(), PathBuf::from("/data/out/Nifti"));
    }

    #[test]
    fn invalid_orientation_is_rejected() {
        let error = PipelineConfig::from_toml_str("orientation = \"LPZ\"", Path::new("run.toml"))
            .unwrap_err();
        assert!(matches!(error, ConfigError::Parse { .. }));
        assert!(error.to_string().contains("LPZ"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(PipelineConfig::from_toml_str("colour = true", Path::new("run.toml")).is_err());
    }
}
