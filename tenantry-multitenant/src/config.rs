// Loading tenant settings from files and the environment

use crate::options::{DEFAULT_REAPER_PERIOD, TenantOptions};
use crate::{Result, TenantError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Environment prefix read by [`TenantSettings::from_env`]
pub const ENV_PREFIX: &str = "TENANTRY";

/// Supported settings file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    Toml,
}

impl FileFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "json" => Some(FileFormat::Json),
            "toml" => Some(FileFormat::Toml),
            _ => None,
        }
    }
}

/// Trait for validating configuration
pub trait Validate {
    fn validate(&self) -> Result<()>;
}

/// The scalar tenant knobs, as they appear in configuration.
///
/// A `stop_interval_secs` of 0 or absent disables idle eviction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantSettings {
    pub stop_interval_secs: Option<u64>,
    pub allow_fallback_to_host: bool,
    pub reaper_period_secs: u64,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            stop_interval_secs: None,
            allow_fallback_to_host: false,
            reaper_period_secs: DEFAULT_REAPER_PERIOD.as_secs(),
        }
    }
}

impl TenantSettings {
    /// Parse settings from a string
    pub fn parse(content: &str, format: FileFormat) -> Result<Self> {
        let settings: Self = match format {
            FileFormat::Json => serde_json::from_str(content)
                .map_err(|e| TenantError::Parse(format!("JSON parse error: {}", e)))?,
            FileFormat::Toml => toml::from_str(content)
                .map_err(|e| TenantError::Parse(format!("TOML parse error: {}", e)))?,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a file, detecting the format from the extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| TenantError::Configuration("No file extension found".to_string()))?;
        let format = FileFormat::from_extension(ext)
            .ok_or_else(|| TenantError::Configuration(format!("Unsupported format: {}", ext)))?;

        let content = std::fs::read_to_string(path)?;
        Self::parse(&content, format)
    }

    /// Read `<PREFIX>_STOP_INTERVAL_SECS`, `<PREFIX>_ALLOW_FALLBACK_TO_HOST` and
    /// `<PREFIX>_REAPER_PERIOD_SECS` from the process environment
    pub fn from_env(prefix: &str) -> Result<Self> {
        Self::from_vars(prefix, std::env::vars())
    }

    /// Load a `.env` file if one exists, then read the environment
    pub fn from_dotenv(prefix: &str) -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!(path = %path.display(), "Loaded .env file"),
            Err(e) if e.not_found() => {}
            Err(e) => return Err(TenantError::Configuration(format!("Invalid .env file: {}", e))),
        }
        Self::from_env(prefix)
    }

    /// Build settings from `(key, value)` pairs; unprefixed keys are ignored
    pub fn from_vars<I>(prefix: &str, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(prefix)
                    .map(|rest| (rest.trim_start_matches('_').to_lowercase(), value))
            })
            .collect();

        let mut settings = Self::default();
        if let Some(value) = vars.get("stop_interval_secs") {
            settings.stop_interval_secs = Some(parse_var("stop_interval_secs", value)?);
        }
        if let Some(value) = vars.get("allow_fallback_to_host") {
            settings.allow_fallback_to_host = parse_var("allow_fallback_to_host", value)?;
        }
        if let Some(value) = vars.get("reaper_period_secs") {
            settings.reaper_period_secs = parse_var("reaper_period_secs", value)?;
        }
        settings.validate()?;
        Ok(settings)
    }

    /// Copy the knobs onto `options`, leaving the redirect set untouched
    pub fn apply_to(&self, options: &mut TenantOptions) {
        options.stop_interval = self
            .stop_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        options.allow_fallback_to_host = self.allow_fallback_to_host;
        options.reaper_period = Duration::from_secs(self.reaper_period_secs);
    }

    pub fn to_options(&self) -> TenantOptions {
        let mut options = TenantOptions::default();
        self.apply_to(&mut options);
        options
    }
}

impl Validate for TenantSettings {
    fn validate(&self) -> Result<()> {
        if self.reaper_period_secs == 0 {
            return Err(TenantError::Configuration(
                "reaper_period_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| TenantError::Parse(format!("Invalid value for {}: {:?}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_toml() {
        let settings = TenantSettings::parse(
            "stop_interval_secs = 300\nallow_fallback_to_host = true\n",
            FileFormat::Toml,
        )
        .unwrap();

        assert_eq!(settings.stop_interval_secs, Some(300));
        assert!(settings.allow_fallback_to_host);
        assert_eq!(settings.reaper_period_secs, 60);
    }

    #[test]
    fn test_parse_json() {
        let settings =
            TenantSettings::parse(r#"{"reaper_period_secs": 5}"#, FileFormat::Json).unwrap();
        assert_eq!(settings.reaper_period_secs, 5);
        assert_eq!(settings.stop_interval_secs, None);
    }

    #[test]
    fn test_zero_reaper_period_is_rejected() {
        let result = TenantSettings::parse("reaper_period_secs = 0", FileFormat::Toml);
        assert!(matches!(result, Err(TenantError::Configuration(_))));
    }

    #[test]
    fn test_from_vars() {
        let settings = TenantSettings::from_vars(
            ENV_PREFIX,
            vars(&[
                ("TENANTRY_STOP_INTERVAL_SECS", "120"),
                ("TENANTRY_ALLOW_FALLBACK_TO_HOST", "true"),
                ("OTHER_REAPER_PERIOD_SECS", "1"),
            ]),
        )
        .unwrap();

        assert_eq!(settings.stop_interval_secs, Some(120));
        assert!(settings.allow_fallback_to_host);
        assert_eq!(settings.reaper_period_secs, 60);
    }

    #[test]
    fn test_from_vars_rejects_garbage() {
        let result =
            TenantSettings::from_vars(ENV_PREFIX, vars(&[("TENANTRY_REAPER_PERIOD_SECS", "soon")]));
        assert!(matches!(result, Err(TenantError::Parse(_))));
    }

    #[test]
    fn test_zero_interval_means_never() {
        let settings = TenantSettings {
            stop_interval_secs: Some(0),
            ..Default::default()
        };
        assert_eq!(settings.to_options().eviction_interval(), None);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tenants.toml");
        std::fs::write(&path, "stop_interval_secs = 30").unwrap();

        let settings = TenantSettings::from_file(&path).unwrap();
        assert_eq!(
            settings.to_options().eviction_interval(),
            Some(Duration::from_secs(30))
        );

        let yaml = dir.path().join("tenants.yaml");
        std::fs::write(&yaml, "").unwrap();
        assert!(matches!(
            TenantSettings::from_file(&yaml),
            Err(TenantError::Configuration(_))
        ));
    }
}
