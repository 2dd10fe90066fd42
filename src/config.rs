use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub migrastep: String,
    pub rusqlite: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const MIGRASTEP_LEVEL: &str = "info";
    const RUSQLITE_LEVEL: &str = "warn";

    fn default() -> Self {
        LoggingConfig {
            migrastep: Self::MIGRASTEP_LEVEL.to_string(),
            rusqlite: Self::RUSQLITE_LEVEL.to_string(),
        }
    }

    /// Log specification string for flexi_logger.
    pub fn spec(&self) -> String {
        format!("migrastep={}, rusqlite={}", self.migrastep, self.rusqlite)
    }

    fn ensure_valid(&mut self) {
        Self::ensure_level(&mut self.migrastep, "migrastep", Self::MIGRASTEP_LEVEL);
        Self::ensure_level(&mut self.rusqlite, "rusqlite", Self::RUSQLITE_LEVEL);
    }

    fn ensure_level(level: &mut String, target: &str, default: &str) {
        let original = level.clone();
        *level = level.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&level.as_str()) {
            eprintln!(
                "Config error: {} log level of '{}' is invalid - using default of '{}'",
                target, original, default
            );
            *level = default.to_owned();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            backoff_factor: 2.0,
        }
    }

    fn ensure_valid(&mut self) {
        if self.max_attempts == 0 {
            eprintln!("Config error: retry.max_attempts must be at least 1 - using 1");
            self.max_attempts = 1;
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            eprintln!(
                "Config error: retry.backoff_factor of '{}' is invalid - using default of '{}'",
                self.backoff_factor,
                Self::default().backoff_factor
            );
            self.backoff_factor = Self::default().backoff_factor;
        }
        if self.max_delay_ms < self.initial_delay_ms {
            eprintln!(
                "Config error: retry.max_delay_ms ({}) is below initial_delay_ms ({}) - using {}",
                self.max_delay_ms, self.initial_delay_ms, self.initial_delay_ms
            );
            self.max_delay_ms = self.initial_delay_ms;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    /// How long SQLite waits on a locked database before reporting busy.
    pub busy_timeout_ms: u64,
}

impl DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            busy_timeout_ms: 5000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub retry: RetryConfig,
    pub database: DatabaseConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: LoggingConfig::default(),
            retry: RetryConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Config {
    const ENV_PREFIX: &str = "MIGRASTEP_";

    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "migrastep").map(|dirs| dirs.data_local_dir().join("config.toml"))
    }

    /// Defaults, then the TOML file, then `MIGRASTEP_` environment variables
    /// (`MIGRASTEP_RETRY__MAX_ATTEMPTS=3`).
    pub fn figment(config_path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(Self::ENV_PREFIX).split("__"))
    }

    /// Loads the configuration from `explicit_path`, or from config.toml in the
    /// app's data directory. A missing default file is written out with the
    /// defaults. If loading fails, defaults are used.
    pub fn load_config(explicit_path: Option<&Path>) -> Self {
        let config_path = match explicit_path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) => {
                    Self::write_default_if_missing(&path);
                    path
                }
                None => {
                    eprintln!("Could not determine a configuration directory. Using defaults.");
                    PathBuf::from("config.toml")
                }
            },
        };

        let mut config = Self::figment(&config_path).extract().unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            Config::default()
        });

        config.ensure_valid();
        config
    }

    fn write_default_if_missing(config_path: &Path) {
        if config_path.exists() {
            return;
        }
        if let Some(parent) = config_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                eprintln!(
                    "Failed to create configuration directory {}: {}",
                    parent.display(),
                    e
                );
                return;
            }
        }
        match toml::to_string_pretty(&Config::default()) {
            Ok(toml_string) => {
                if let Err(e) = fs::write(config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            }
            Err(_) => eprintln!("Failed to serialize default config."),
        }
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.retry.ensure_valid();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_file_and_env_layers() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                [logging]
                migrastep = "debug"

                [retry]
                max_attempts = 2
                "#,
            )?;
            jail.set_env("MIGRASTEP_DATABASE__BUSY_TIMEOUT_MS", "250");

            let config: Config = Config::figment(Path::new("config.toml")).extract()?;
            assert_eq!(config.logging.migrastep, "debug");
            assert_eq!(config.logging.rusqlite, "warn");
            assert_eq!(config.retry.max_attempts, 2);
            assert_eq!(config.retry.initial_delay_ms, 100);
            assert_eq!(config.database.busy_timeout_ms, 250);
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        Jail::expect_with(|_jail| {
            let config = Config::load_config(Some(Path::new("absent.toml")));
            assert_eq!(config, Config::default());
            Ok(())
        });
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let mut config = Config::default();
        config.logging.migrastep = " TRACE ".to_string();
        config.logging.rusqlite = "verbose".to_string();
        config.retry.max_attempts = 0;
        config.retry.backoff_factor = 0.5;
        config.retry.max_delay_ms = 10;
        config.ensure_valid();

        assert_eq!(config.logging.migrastep, "trace");
        assert_eq!(config.logging.rusqlite, "warn");
        assert_eq!(config.retry.max_attempts, 1);
        assert_eq!(config.retry.backoff_factor, 2.0);
        assert_eq!(config.retry.max_delay_ms, 100);
        assert_eq!(config.logging.spec(), "migrastep=trace, rusqlite=warn");
    }
}
