use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use super::{ReviewMode, Settings};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid max_concurrent_coders: {0}, must be at least 1")]
    InvalidMaxConcurrentCoders(u32),

    #[error("invalid max_coding_attempts: {0}, must be at least 1")]
    InvalidMaxCodingAttempts(u32),

    #[error("database path cannot be empty")]
    EmptyDatabasePath,

    #[error("invalid log level: {0}, must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("invalid log format: {0}, must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("complex-only review mode requires a complex_complexity_agent executable")]
    MissingComplexAgent,
}

/// Loads [`Settings`] with hierarchical merging.
///
/// Precedence (lowest to highest):
/// 1. Programmatic defaults
/// 2. `.opensprint/config.yaml` (project config)
/// 3. `.opensprint/local.yaml` (optional local overrides)
/// 4. Environment variables (`OPENSPRINT_` prefix, highest priority)
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load(project_root: impl AsRef<std::path::Path>) -> Result<Settings> {
        let root = project_root.as_ref();
        let settings: Settings = Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Yaml::file(root.join(".opensprint/config.yaml")))
            .merge(Yaml::file(root.join(".opensprint/local.yaml")))
            .merge(Env::prefixed("OPENSPRINT_").split("__"))
            .extract()
            .context("failed to extract settings from layered configuration")?;

        Self::validate(&settings)?;
        Ok(settings)
    }

    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Settings> {
        let settings: Settings = Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .with_context(|| format!("failed to load settings from {}", path.as_ref().display()))?;

        Self::validate(&settings)?;
        Ok(settings)
    }

    pub fn validate(settings: &Settings) -> Result<(), ConfigError> {
        if settings.max_concurrent_coders == 0 {
            return Err(ConfigError::InvalidMaxConcurrentCoders(settings.max_concurrent_coders));
        }
        if settings.max_coding_attempts == 0 {
            return Err(ConfigError::InvalidMaxCodingAttempts(settings.max_coding_attempts));
        }
        if settings.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&settings.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(settings.logging.level.clone()));
        }
        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&settings.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(settings.logging.format.clone()));
        }
        if matches!(settings.review_mode, ReviewMode::ComplexOnly | ReviewMode::Always)
            && settings.complex_complexity_agent.executable.is_empty()
        {
            return Err(ConfigError::MissingComplexAgent);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(ConfigLoader::validate(&Settings::default()).is_ok());
    }

    #[test]
    fn zero_slots_rejected() {
        let mut settings = Settings::default();
        settings.max_concurrent_coders = 0;
        assert!(ConfigLoader::validate(&settings).is_err());
    }

    #[test]
    fn branches_mode_forces_single_slot() {
        let mut settings = Settings::default();
        settings.max_concurrent_coders = 5;
        settings.git_working_mode = super::super::GitWorkingMode::Branches;
        assert_eq!(settings.effective_max_slots(), 1);
    }

    /// `OPENSPRINT_MAX_CONCURRENT_CODERS` must win over both the
    /// programmatic default and `config.yaml` (`SPEC_FULL.md` §3 precedence
    /// order). `temp_env` scopes the var to this closure so the assertion
    /// can't leak into other tests running in parallel in this process.
    #[test]
    fn env_override_wins_over_file_and_default() {
        let tmp = tempfile::tempdir().unwrap();
        let config_dir = tmp.path().join(".opensprint");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(config_dir.join("config.yaml"), "max_concurrent_coders: 4\n").unwrap();

        temp_env::with_var("OPENSPRINT_MAX_CONCURRENT_CODERS", Some("9"), || {
            let settings = ConfigLoader::load(tmp.path()).unwrap();
            assert_eq!(settings.max_concurrent_coders, 9);
        });
    }
}
