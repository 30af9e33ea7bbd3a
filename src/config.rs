use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pipeline::ResolverFailurePolicy;

const DEFAULT_DB_PATH: &str = "food_nutrition.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_READ_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_CONFIDENCE: f32 = 0.25;
const DEFAULT_IOU: f32 = 0.45;
const DEFAULT_JPEG_QUALITY: u8 = 90;
const DEFAULT_LINE_THICKNESS: u32 = 2;
const DEFAULT_FONT_SIZE: f32 = 16.0;
const DEFAULT_RESOLVER_TIMEOUT_MS: u64 = 2_000;

#[derive(Debug, Deserialize, Default)]
struct ServiceConfigFile {
    db_path: Option<String>,
    api: Option<ApiConfigFile>,
    detector: Option<DetectorConfigFile>,
    annotation: Option<AnnotationConfigFile>,
    resolver: Option<ResolverConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    max_body_bytes: Option<usize>,
    read_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<DetectorKind>,
    model_path: Option<PathBuf>,
    labels_path: Option<PathBuf>,
    input_size: Option<u32>,
    confidence_threshold: Option<f32>,
    iou_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct AnnotationConfigFile {
    font_path: Option<PathBuf>,
    font_size: Option<f32>,
    jpeg_quality: Option<u8>,
    line_thickness: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ResolverConfigFile {
    timeout_ms: Option<u64>,
    on_failure: Option<ResolverFailurePolicy>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    #[default]
    Tract,
    Stub,
}

impl std::str::FromStr for DetectorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tract" => Ok(DetectorKind::Tract),
            "stub" => Ok(DetectorKind::Stub),
            other => Err(anyhow!("unknown detector backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub db_path: String,
    pub api: ApiSettings,
    pub detector: DetectorSettings,
    pub annotation: AnnotationSettings,
    pub resolver: ResolverSettings,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub addr: String,
    pub max_body_bytes: usize,
    pub read_timeout: Duration,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            addr: DEFAULT_API_ADDR.to_string(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: DetectorKind,
    pub model_path: Option<PathBuf>,
    pub labels_path: Option<PathBuf>,
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: DetectorKind::default(),
            model_path: None,
            labels_path: None,
            input_size: DEFAULT_INPUT_SIZE,
            confidence_threshold: DEFAULT_CONFIDENCE,
            iou_threshold: DEFAULT_IOU,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnnotationSettings {
    pub font_path: Option<PathBuf>,
    pub font_size: f32,
    pub jpeg_quality: u8,
    pub line_thickness: u32,
}

impl Default for AnnotationSettings {
    fn default() -> Self {
        Self {
            font_path: None,
            font_size: DEFAULT_FONT_SIZE,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            line_thickness: DEFAULT_LINE_THICKNESS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub timeout: Duration,
    pub on_failure: ResolverFailurePolicy,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_RESOLVER_TIMEOUT_MS),
            on_failure: ResolverFailurePolicy::default(),
        }
    }
}

impl ServiceConfig {
    /// Load from `FOOD_DETECT_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FOOD_DETECT_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ServiceConfigFile) -> Self {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let api = file.api.unwrap_or_default();
        let api = ApiSettings {
            addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            max_body_bytes: api.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES),
            read_timeout: Duration::from_millis(
                api.read_timeout_ms.unwrap_or(DEFAULT_READ_TIMEOUT_MS),
            ),
        };
        let detector = file.detector.unwrap_or_default();
        let detector = DetectorSettings {
            backend: detector.backend.unwrap_or_default(),
            model_path: detector.model_path,
            labels_path: detector.labels_path,
            input_size: detector.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
            confidence_threshold: detector.confidence_threshold.unwrap_or(DEFAULT_CONFIDENCE),
            iou_threshold: detector.iou_threshold.unwrap_or(DEFAULT_IOU),
        };
        let annotation = file.annotation.unwrap_or_default();
        let annotation = AnnotationSettings {
            font_path: annotation.font_path,
            font_size: annotation.font_size.unwrap_or(DEFAULT_FONT_SIZE),
            jpeg_quality: annotation.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            line_thickness: annotation.line_thickness.unwrap_or(DEFAULT_LINE_THICKNESS),
        };
        let resolver = file.resolver.unwrap_or_default();
        let resolver = ResolverSettings {
            timeout: Duration::from_millis(
                resolver.timeout_ms.unwrap_or(DEFAULT_RESOLVER_TIMEOUT_MS),
            ),
            on_failure: resolver.on_failure.unwrap_or_default(),
        };
        Self {
            db_path,
            api,
            detector,
            annotation,
            resolver,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(port) = env_value("PORT") {
            let port: u16 = port
                .parse()
                .map_err(|_| anyhow!("PORT must be a TCP port number"))?;
            self.api.addr = format!("0.0.0.0:{}", port);
        }
        if let Some(addr) = env_value("FOOD_DETECT_API_ADDR") {
            self.api.addr = addr;
        }
        if let Some(path) = env_value("FOOD_DETECT_DB_PATH") {
            self.db_path = path;
        }
        if let Some(backend) = env_value("FOOD_DETECT_BACKEND") {
            self.detector.backend = backend.parse()?;
        }
        if let Some(path) = env_value("FOOD_DETECT_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env_value("FOOD_DETECT_LABELS_PATH") {
            self.detector.labels_path = Some(PathBuf::from(path));
        }
        if let Some(confidence) = env_value("FOOD_DETECT_CONFIDENCE") {
            self.detector.confidence_threshold = confidence
                .parse()
                .map_err(|_| anyhow!("FOOD_DETECT_CONFIDENCE must be a number"))?;
        }
        if let Some(timeout) = env_value("FOOD_DETECT_RESOLVER_TIMEOUT_MS") {
            let millis: u64 = timeout.parse().map_err(|_| {
                anyhow!("FOOD_DETECT_RESOLVER_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            self.resolver.timeout = Duration::from_millis(millis);
        }
        if let Some(policy) = env_value("FOOD_DETECT_RESOLVER_ON_FAILURE") {
            self.resolver.on_failure = policy.parse()?;
        }
        if let Some(path) = env_value("FOOD_DETECT_FONT_PATH") {
            self.annotation.font_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        check_unit_interval("detector.confidence_threshold", self.detector.confidence_threshold)?;
        check_unit_interval("detector.iou_threshold", self.detector.iou_threshold)?;
        if self.detector.input_size == 0 || self.detector.input_size % 32 != 0 {
            return Err(anyhow!(
                "detector.input_size must be a positive multiple of 32, got {}",
                self.detector.input_size
            ));
        }
        if !(1..=100).contains(&self.annotation.jpeg_quality) {
            return Err(anyhow!("annotation.jpeg_quality must be within 1..=100"));
        }
        if !(self.annotation.font_size > 0.0) {
            return Err(anyhow!("annotation.font_size must be greater than zero"));
        }
        if self.resolver.timeout.is_zero() {
            return Err(anyhow!("resolver.timeout_ms must be greater than zero"));
        }
        if self.api.read_timeout.is_zero() {
            return Err(anyhow!("api.read_timeout_ms must be greater than zero"));
        }
        if self.api.max_body_bytes == 0 {
            return Err(anyhow!("api.max_body_bytes must be greater than zero"));
        }
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        Ok(())
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn check_unit_interval(name: &str, value: f32) -> Result<()> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(anyhow!("{} must be within (0, 1], got {}", name, value))
    }
}

fn read_config_file(path: &Path) -> Result<ServiceConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
