use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_PATH: &str = "config/analysis.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid YAML in config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid value for {key}: {value}")]
    InvalidOverride { key: &'static str, value: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub image: ImageConfig,
    pub analysis: AnalysisConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8081,
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Native,
    Torch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub weights_path: PathBuf,
    pub backend: BackendKind,
    /// Seed for the random weights used when no artifact is present. Unset draws from the OS.
    pub degraded_seed: Option<u64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            weights_path: PathBuf::from("./models/skin_lesion.json"),
            backend: BackendKind::Native,
            degraded_seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub size: [u32; 2],
    pub min_dimension: u32,
    pub max_dimension: u32,
    pub allowed_content_types: Vec<String>,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            size: [224, 224],
            min_dimension: 100,
            max_dimension: 4000,
            allowed_content_types: vec![
                "image/jpeg".to_string(),
                "image/png".to_string(),
                "image/webp".to_string(),
                "image/bmp".to_string(),
            ],
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Millimetres per source-image pixel assumed when a request carries no calibration.
    pub default_mm_per_pixel: f32,
    pub overlay_alpha: f32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            default_mm_per_pixel: 0.1,
            overlay_alpha: 0.4,
        }
    }
}

impl AppConfig {
    /// Loads `.env`, the YAML file named by `DERM_CONFIG` (or the default path when it
    /// exists), then applies environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let explicit = env::var("DERM_CONFIG").ok().map(PathBuf::from);
        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => {
                log::info!("No config file found, using built-in defaults");
                Self::default()
            }
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&config_str)?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(port) = env::var("PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| ConfigError::InvalidOverride { key: "PORT", value: port })?;
        }
        if let Ok(path) = env::var("MODEL_PATH") {
            self.model.weights_path = PathBuf::from(path);
        }
        if let Ok(limit) = env::var("MAX_UPLOAD_BYTES") {
            self.server.max_upload_bytes =
                limit.parse().map_err(|_| ConfigError::InvalidOverride {
                    key: "MAX_UPLOAD_BYTES",
                    value: limit,
                })?;
        }
        if let Ok(ratio) = env::var("DEFAULT_MM_PER_PIXEL") {
            self.analysis.default_mm_per_pixel =
                ratio.parse().map_err(|_| ConfigError::InvalidOverride {
                    key: "DEFAULT_MM_PER_PIXEL",
                    value: ratio,
                })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let [width, height] = self.image.size;
        if width == 0 || height == 0 {
            return Err(ConfigError::Invalid("image.size must be non-zero".into()));
        }
        if self.image.min_dimension > self.image.max_dimension {
            return Err(ConfigError::Invalid(
                "image.min_dimension exceeds image.max_dimension".into(),
            ));
        }
        if self.image.std.iter().any(|s| *s <= 0.0 || !s.is_finite()) {
            return Err(ConfigError::Invalid("image.std must be positive".into()));
        }
        if self.image.allowed_content_types.is_empty() {
            return Err(ConfigError::Invalid(
                "image.allowed_content_types must not be empty".into(),
            ));
        }
        if !(self.analysis.default_mm_per_pixel > 0.0) {
            return Err(ConfigError::Invalid(
                "analysis.default_mm_per_pixel must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.analysis.overlay_alpha) {
            return Err(ConfigError::Invalid(
                "analysis.overlay_alpha must lie in [0, 1]".into(),
            ));
        }
        if self.server.max_upload_bytes == 0 {
            return Err(ConfigError::Invalid("server.max_upload_bytes must be non-zero".into()));
        }
        Ok(())
    }
}
