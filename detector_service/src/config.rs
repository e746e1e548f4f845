use crate::callback::MessageLevel;
use serde::Deserialize;
use std::{collections::BTreeSet, path::PathBuf, time::Duration};

pub const DEFAULT_SKIP_FRAMES: usize = 150;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub detector: DetectorConfig,
    #[serde(default)]
    pub runset: RunSetConfig,
    #[serde(default)]
    pub model: ModelConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

pub trait Validatable {
    fn validate(&self) -> Result<(), String>;
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectorConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub data_dir: PathBuf,
    pub sandbox_dir: PathBuf,
    /// Model package loaded at start-up. Relative paths resolve under `data_dir`.
    #[serde(default)]
    pub default_model: Option<PathBuf>,
    #[serde(default)]
    pub allow_absolute_paths: bool,
    #[serde(default = "default_cancel_timeout_ms")]
    pub cancel_timeout_ms: u64,
    #[serde(default = "default_verbosity")]
    pub verbosity: MessageLevel,
}

fn default_cancel_timeout_ms() -> u64 {
    5000
}

fn default_verbosity() -> MessageLevel {
    MessageLevel::Info
}

impl DetectorConfig {
    pub fn new(name: &str, data_dir: PathBuf, sandbox_dir: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            data_dir,
            sandbox_dir,
            default_model: None,
            allow_absolute_paths: false,
            cancel_timeout_ms: default_cancel_timeout_ms(),
            verbosity: default_verbosity(),
        }
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }

    pub fn get_default_model_path(&self) -> Option<PathBuf> {
        self.default_model.as_ref().map(|path| {
            if path.is_absolute() {
                path.clone()
            } else {
                self.data_dir.join(path)
            }
        })
    }
}

impl Validatable for DetectorConfig {
    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Detector name must not be empty".to_string());
        }
        if !self.data_dir.is_dir() {
            return Err(format!("Data directory not found: {:?}", self.data_dir));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunSetConfig {
    #[serde(default = "default_skip_frames")]
    pub skip_frames: usize,
    #[serde(default = "default_admitted_types")]
    pub admitted_types: BTreeSet<String>,
}

fn default_skip_frames() -> usize {
    DEFAULT_SKIP_FRAMES
}

fn default_admitted_types() -> BTreeSet<String> {
    ["jpg", "JPG", "jpeg", "JPEG", "png", "PNG", "bmp", "BMP"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for RunSetConfig {
    fn default() -> Self {
        Self {
            skip_frames: default_skip_frames(),
            admitted_types: default_admitted_types(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_min_probability")]
    pub min_probability: f32,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
}

fn default_min_probability() -> f32 {
    0.5
}

fn default_iou_threshold() -> f32 {
    0.7
}

fn default_input_size() -> u32 {
    640
}

impl Validatable for ModelConfig {
    fn validate(&self) -> Result<(), String> {
        if !(self.iou_threshold > 0.0 && self.iou_threshold <= 1.0) {
            return Err(format!(
                "iou_threshold must be in (0, 1], got {}",
                self.iou_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.min_probability) {
            return Err(format!(
                "min_probability must be in [0, 1], got {}",
                self.min_probability
            ));
        }
        if self.input_size == 0 {
            return Err("input_size must be positive".to_string());
        }
        Ok(())
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            min_probability: default_min_probability(),
            iou_threshold: default_iou_threshold(),
            input_size: default_input_size(),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("current directory: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let settings = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(format!("{}.yaml", environment.as_str())),
        ))
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config = settings.try_deserialize::<Config>()?;
    if let Err(e) = config
        .detector
        .validate()
        .and_then(|_| config.model.validate())
    {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }

    Ok(config)
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    // `Self::Error` would be ambiguous with the `Error` variant.
    fn try_from(s: String) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!(
                "{} is not a supported minimum log level. Use one of `debug`, `info`, `warn`, `error`.",
                other
            )),
        }
    }
}
