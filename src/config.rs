use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::capture::{FrameEncoder, DEFAULT_ENCODE_WIDTH, DEFAULT_JPEG_QUALITY};
use crate::geometry::Size;
use crate::ingest::{CameraConfig, FileVideoConfig};
use crate::overlay::LabelFont;
use crate::session::SessionSettings;

const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8000/api/v1/ws/realtime-detect";
const DEFAULT_CONFIDENCE: f32 = 0.5;
const DEFAULT_FRESHNESS_MS: u64 = 500;
const DEFAULT_DISPLAY_WIDTH: u32 = 1280;
const DEFAULT_DISPLAY_HEIGHT: u32 = 720;
const DEFAULT_FILE_FPS: u32 = 30;

#[derive(Debug, Deserialize, Default)]
struct ClientConfigFile {
    server: Option<ServerConfigFile>,
    capture: Option<CaptureConfigFile>,
    display: Option<DisplayConfigFile>,
    camera: Option<CameraConfigFile>,
    file: Option<FileConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerConfigFile {
    endpoint: Option<String>,
    token: Option<String>,
    token_path: Option<PathBuf>,
    confidence: Option<f32>,
    model: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    encode_width: Option<u32>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct DisplayConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    freshness_ms: Option<u64>,
    font_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct FileConfigFile {
    fps: Option<u32>,
}

/// Detector the server runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionModel {
    Yolo,
    FasterRcnn,
}

impl DetectionModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Yolo => "yolo",
            Self::FasterRcnn => "fasterrcnn",
        }
    }
}

impl std::str::FromStr for DetectionModel {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "yolo" => Ok(Self::Yolo),
            "fasterrcnn" => Ok(Self::FasterRcnn),
            other => Err(anyhow!(
                "unknown model '{}' (expected yolo or fasterrcnn)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: String,
    pub token: Option<String>,
    pub token_path: Option<PathBuf>,
    pub confidence: f32,
    pub model: DetectionModel,
    pub encode_width: u32,
    pub jpeg_quality: u8,
    pub display: Size,
    pub freshness: Duration,
    /// TrueType font for overlay labels. Common system fonts are tried when unset.
    pub font_path: Option<PathBuf>,
    pub camera: CameraConfig,
    pub file_fps: u32,
}

impl ClientConfig {
    /// Defaults, then the file named by `WEAPON_WATCH_CONFIG`, then
    /// `WEAPON_WATCH_*` environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("WEAPON_WATCH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ClientConfigFile) -> Result<Self> {
        let server = file.server.unwrap_or_default();
        let model = match server.model.as_deref() {
            Some(model) => model.parse()?,
            None => DetectionModel::Yolo,
        };
        let capture = file.capture.unwrap_or_default();
        let display = file.display.unwrap_or_default();
        let camera_file = file.camera.unwrap_or_default();
        let camera_defaults = CameraConfig::default();
        let camera = CameraConfig {
            device: camera_file.device.unwrap_or(camera_defaults.device),
            width: camera_file.width.unwrap_or(camera_defaults.width),
            height: camera_file.height.unwrap_or(camera_defaults.height),
            target_fps: camera_file.target_fps.unwrap_or(camera_defaults.target_fps),
        };
        Ok(Self {
            endpoint: server
                .endpoint
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            token: server.token,
            token_path: server.token_path,
            confidence: server.confidence.unwrap_or(DEFAULT_CONFIDENCE),
            model,
            encode_width: capture.encode_width.unwrap_or(DEFAULT_ENCODE_WIDTH),
            jpeg_quality: capture.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            display: Size::new(
                display.width.unwrap_or(DEFAULT_DISPLAY_WIDTH),
                display.height.unwrap_or(DEFAULT_DISPLAY_HEIGHT),
            ),
            freshness: Duration::from_millis(
                display.freshness_ms.unwrap_or(DEFAULT_FRESHNESS_MS),
            ),
            font_path: display.font_path,
            camera,
            file_fps: file
                .file
                .and_then(|file| file.fps)
                .unwrap_or(DEFAULT_FILE_FPS),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(endpoint) = std::env::var("WEAPON_WATCH_ENDPOINT") {
            if !endpoint.trim().is_empty() {
                self.endpoint = endpoint.trim().to_string();
            }
        }
        if let Ok(token) = std::env::var("WEAPON_WATCH_TOKEN") {
            if !token.trim().is_empty() {
                self.token = Some(token.trim().to_string());
            }
        }
        if let Ok(path) = std::env::var("WEAPON_WATCH_TOKEN_PATH") {
            if !path.trim().is_empty() {
                self.token_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(confidence) = std::env::var("WEAPON_WATCH_CONFIDENCE") {
            self.confidence = confidence.trim().parse().map_err(|_| {
                anyhow!("WEAPON_WATCH_CONFIDENCE must be a number between 0 and 1")
            })?;
        }
        if let Ok(model) = std::env::var("WEAPON_WATCH_MODEL") {
            if !model.trim().is_empty() {
                self.model = model.parse()?;
            }
        }
        if let Ok(path) = std::env::var("WEAPON_WATCH_FONT") {
            if !path.trim().is_empty() {
                self.font_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(device) = std::env::var("WEAPON_WATCH_CAMERA") {
            if !device.trim().is_empty() {
                self.camera.device = device;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(anyhow!(
                "confidence must be within [0, 1], got {}",
                self.confidence
            ));
        }
        let endpoint = self.endpoint_url()?;
        if endpoint.scheme() != "ws" {
            return Err(anyhow!(
                "endpoint must use ws://, got {}",
                endpoint.scheme()
            ));
        }
        if self.encode_width == 0 {
            return Err(anyhow!("capture.encode_width must be greater than zero"));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(anyhow!(
                "capture.jpeg_quality must be within 1..=100, got {}",
                self.jpeg_quality
            ));
        }
        if self.display.is_degenerate() {
            return Err(anyhow!("display size must be non-zero, got {}", self.display));
        }
        if self.freshness.is_zero() {
            return Err(anyhow!("display.freshness_ms must be greater than zero"));
        }
        if self.camera.device.trim().is_empty() {
            return Err(anyhow!("camera.device must not be empty"));
        }
        Ok(())
    }

    pub fn endpoint_url(&self) -> Result<Url> {
        Url::parse(&self.endpoint).with_context(|| format!("invalid endpoint {}", self.endpoint))
    }

    /// Inline token wins over a token file.
    pub fn resolve_token(&self) -> Result<Option<String>> {
        if let Some(token) = &self.token {
            return Ok(Some(token.clone()));
        }
        let Some(path) = &self.token_path else {
            return Ok(None);
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read token file {}", path.display()))?;
        let token = raw.trim();
        if token.is_empty() {
            return Err(anyhow!("token file {} is empty", path.display()));
        }
        Ok(Some(token.to_string()))
    }

    pub fn file_source(&self, path: impl Into<String>) -> FileVideoConfig {
        FileVideoConfig {
            path: path.into(),
            fps: self.file_fps,
        }
    }

    pub fn session_settings(&self) -> Result<SessionSettings> {
        let mut settings = SessionSettings::new(self.endpoint_url()?);
        settings.confidence = self.confidence;
        settings.model = self.model.as_str().to_string();
        settings.token = self.resolve_token()?;
        settings.display = self.display;
        settings.freshness = self.freshness;
        settings.encoder = FrameEncoder::new(self.encode_width, self.jpeg_quality);
        settings.font = match &self.font_path {
            Some(path) => Some(LabelFont::load(path)?),
            None => {
                let font = LabelFont::discover();
                if font.is_none() {
                    log::warn!("no label font found; overlay labels are drawn without text");
                }
                font
            }
        };
        Ok(settings)
    }
}

fn read_config_file(path: &Path) -> Result<ClientConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let mut cfg = ClientConfig::from_file(ClientConfigFile::default()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(cfg.model, DetectionModel::Yolo);
        assert_eq!(cfg.freshness, Duration::from_millis(500));
        assert_eq!(cfg.camera.device, "/dev/video0");
    }

    #[test]
    fn model_names_parse_case_insensitively() {
        assert_eq!("FasterRCNN".parse::<DetectionModel>().unwrap(), DetectionModel::FasterRcnn);
        assert!("ssd".parse::<DetectionModel>().is_err());
    }

    #[test]
    fn confidence_outside_unit_range_is_rejected() {
        let mut cfg = ClientConfig::from_file(ClientConfigFile::default()).unwrap();
        cfg.confidence = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_font_file_fails_session_settings() {
        let mut cfg = ClientConfig::from_file(ClientConfigFile::default()).unwrap();
        cfg.font_path = Some(PathBuf::from("/nonexistent/label-font.ttf"));
        let err = cfg.session_settings().unwrap_err();
        assert!(format!("{:#}", err).contains("label-font.ttf"));
    }

    #[test]
    fn non_websocket_endpoint_is_rejected() {
        let mut cfg = ClientConfig::from_file(ClientConfigFile::default()).unwrap();
        cfg.endpoint = "http://127.0.0.1:8000/api/v1/detect".to_string();
        assert!(cfg.validate().is_err());
    }
}
