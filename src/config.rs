use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default sync server for the CLI.
pub const DEFAULT_SERVER_URL: &str = "ws://localhost:8080";
/// Default room for the CLI.
pub const DEFAULT_ROOM: &str = "/";

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

/// CLI configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Sync server URL (ws, wss, http, https or bare host:port)
    pub server_url: ConfigValue<String>,
    /// Room used when a command does not name one
    pub room: ConfigValue<String>,
    /// Directory holding the persisted player identity
    pub data_dir: ConfigValue<PathBuf>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    server_url: Option<String>,
    room: Option<String>,
    data_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        Self::load_with(config_path, |key| std::env::var(key).ok())
    }

    fn load_with(
        config_path: Option<PathBuf>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut server_url =
            ConfigValue::new(DEFAULT_SERVER_URL.to_string(), ConfigSource::Default);
        let mut room = ConfigValue::new(DEFAULT_ROOM.to_string(), ConfigSource::Default);
        let mut data_dir = ConfigValue::new(Self::default_data_dir(), ConfigSource::Default);
        let mut config_file = None;

        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(url) = file_config.server_url {
                server_url = ConfigValue::new(url, ConfigSource::File);
            }
            if let Some(name) = file_config.room {
                room = ConfigValue::new(name, ConfigSource::File);
            }
            if let Some(dir) = file_config.data_dir {
                // Resolve relative paths against config file's directory
                let resolved = if dir.is_relative() {
                    path.parent().map(|p| p.join(&dir)).unwrap_or(dir)
                } else {
                    dir
                };
                data_dir = ConfigValue::new(resolved, ConfigSource::File);
            }
        }

        if let Some(url) = env("SHAREDSTATE_SERVER_URL") {
            server_url = ConfigValue::new(url, ConfigSource::Environment);
        }
        if let Some(name) = env("SHAREDSTATE_ROOM") {
            room = ConfigValue::new(name, ConfigSource::Environment);
        }
        if let Some(dir) = env("SHAREDSTATE_DATA_DIR") {
            data_dir = ConfigValue::new(PathBuf::from(dir), ConfigSource::Environment);
        }

        Ok(Self {
            server_url,
            room,
            data_dir,
            config_file,
        })
    }

    /// Default config directory (platform-specific config dir + sharedstate)
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sharedstate")
    }

    /// Default data directory (platform-specific data dir + sharedstate)
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sharedstate")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }

    /// File holding the player identity record.
    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.value.join("local.json")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::tempdir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_default_config() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nonexistent.yaml");

        let config = Config::load_with(Some(config_path), no_env).unwrap();
        assert_eq!(config.server_url.value, DEFAULT_SERVER_URL);
        assert_eq!(config.server_url.source, ConfigSource::Default);
        assert_eq!(config.room.value, "/");
        assert_eq!(config.room.source, ConfigSource::Default);
        assert!(config.data_dir.value.ends_with("sharedstate"));
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "server_url: wss://sync.example.com").unwrap();
        writeln!(file, "room: /blog").unwrap();
        writeln!(file, "data_dir: /custom/data").unwrap();

        let config = Config::load_with(Some(config_path.clone()), no_env).unwrap();
        assert_eq!(config.server_url.value, "wss://sync.example.com");
        assert_eq!(config.server_url.source, ConfigSource::File);
        assert_eq!(config.room.value, "/blog");
        assert_eq!(config.data_dir.value, PathBuf::from("/custom/data"));
        assert_eq!(config.config_file, Some(config_path));
        assert_eq!(config.identity_path(), PathBuf::from("/custom/data/local.json"));
    }

    #[test]
    fn test_relative_data_dir_resolves_against_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        std::fs::write(&config_path, "data_dir: state\n").unwrap();

        let config = Config::load_with(Some(config_path), no_env).unwrap();
        assert_eq!(config.data_dir.value, temp_dir.path().join("state"));
    }

    #[test]
    fn test_env_var_overrides_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        std::fs::write(&config_path, "room: /fromfile\nserver_url: ws://file:1\n").unwrap();

        let env: HashMap<&str, &str> = [("SHAREDSTATE_ROOM", "/fromenv")].into();
        let config = Config::load_with(Some(config_path), |key| {
            env.get(key).map(|v| v.to_string())
        })
        .unwrap();
        assert_eq!(config.room.value, "/fromenv");
        assert_eq!(config.room.source, ConfigSource::Environment);
        assert_eq!(config.server_url.value, "ws://file:1");
        assert_eq!(config.server_url.source, ConfigSource::File);
    }

    #[test]
    fn test_invalid_yaml_error() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "invalid: yaml: content: [").unwrap();

        let result = Config::load_with(Some(config_path), no_env);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_json_output_includes_sources() {
        let temp_dir = tempdir().unwrap();
        let config = Config::load_with(Some(temp_dir.path().join("none.yaml")), no_env).unwrap();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["room"]["source"], "default");
        assert_eq!(json["server_url"]["value"], DEFAULT_SERVER_URL);
        assert!(json.get("config_file").is_none());
    }
}
