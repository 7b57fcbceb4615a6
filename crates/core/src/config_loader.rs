use crate::config::AppConfig;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use std::path::Path;

/// Environment variable prefix; nested keys are separated by `__`.
pub const ENV_PREFIX: &str = "FCV_";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads configuration from `config/Config.toml` and `FCV_` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read or parsed.
    pub fn load() -> Result<AppConfig> {
        Self::load_from(Path::new("config"), None)
    }

    /// Loads configuration with a specific profile layered over the base file.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read or parsed.
    pub fn load_with_profile(profile: &str) -> Result<AppConfig> {
        Self::load_from(Path::new("config"), Some(profile))
    }

    /// Loads `Config.toml` and the optional `Config.<profile>.toml` from `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read or parsed.
    pub fn load_from(dir: &Path, profile: Option<&str>) -> Result<AppConfig> {
        let mut figment = Figment::new().merge(Toml::file(dir.join("Config.toml")));
        if let Some(profile) = profile {
            figment = figment.merge(Toml::file(dir.join(format!("Config.{profile}.toml"))));
        }

        let config: AppConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", dir.display()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForecastBinding;
    use std::fs;

    const BASE: &str = r#"
[database]
url = "postgresql://localhost/fcv_test"

[matching]
tolerance_minutes = 30
retention_hours = 48
observation_lookback_hours = 6

[[horizons]]
hours = 6
band_hours = 1

[[horizons]]
hours = 24
band_hours = 2

[[locations]]
id = "planfait"
name = "Col de la Forclaz"
latitude = 45.81
longitude = 6.25
stations = { pioupiou = "110" }

[[models]]
id = "icon_d2"
name = "ICON-D2"
parameters = ["wind_speed", "wind_gust"]

[models.collector]
kind = "open_meteo"
model = "icon_d2"
"#;

    #[test]
    fn test_load_base_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Config.toml"), BASE).unwrap();

        let config = ConfigLoader::load_from(dir.path(), None).unwrap();
        assert_eq!(config.database.url, "postgresql://localhost/fcv_test");
        assert_eq!(config.horizons.len(), 2);
        assert_eq!(config.locations[0].station_for("pioupiou"), Some("110"));
        assert!(matches!(config.models[0].collector, ForecastBinding::OpenMeteo { .. }));
        assert_eq!(config.models[0].retry.max_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_profile_overrides_base() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Config.toml"), BASE).unwrap();
        fs::write(
            dir.path().join("Config.staging.toml"),
            "[matching]\ntolerance_minutes = 15\nretention_hours = 48\nobservation_lookback_hours = 6\n",
        )
        .unwrap();

        let config = ConfigLoader::load_from(dir.path(), Some("staging")).unwrap();
        assert_eq!(config.matching.tolerance_minutes, 15);
    }

    #[test]
    fn test_missing_database_section_fails() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Config.toml"), "[matching]\ntolerance_minutes = 30\n").unwrap();
        assert!(ConfigLoader::load_from(dir.path(), None).is_err());
    }
}
