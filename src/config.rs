use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use crate::engine::EngineSettings;
use crate::frame::{DEFAULT_JPEG_QUALITY, MAX_FRAME_WIDTH};
use crate::ingest::SourceConfig;
use crate::notify::{TelegramConfig, DEFAULT_API_BASE, DEFAULT_COOLDOWN};
use crate::store::DEFAULT_LOG_CAPACITY;

const DEFAULT_API_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_SOURCE: &str = "file:stub://demo";
const DEFAULT_MEDIA_DIR: &str = "media";
const DEFAULT_TARGET_CLASS: &str = "head";
const DEFAULT_MODEL_PATH: &str = "models/helmet.onnx";
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_CONFIDENCE: f32 = 0.25;
const DEFAULT_CLASS_NAMES: [&str; 3] = ["head", "helmet", "person"];

#[derive(Debug, Deserialize, Default)]
struct AppConfigFile {
    api: Option<ApiConfigFile>,
    source: Option<String>,
    media_dir: Option<PathBuf>,
    detector: Option<DetectorConfigFile>,
    notifier: Option<NotifierConfigFile>,
    video: Option<VideoConfigFile>,
    logs: Option<LogsConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<DetectorKind>,
    model_path: Option<PathBuf>,
    target_class: Option<String>,
    class_names: Option<Vec<String>>,
    input_size: Option<u32>,
    confidence: Option<f32>,
    active_on_start: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct NotifierConfigFile {
    bot_token: Option<String>,
    chat_id: Option<String>,
    cooldown_secs: Option<u64>,
    api_base: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct VideoConfigFile {
    max_width: Option<u32>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct LogsConfigFile {
    capacity: Option<usize>,
}

/// Which detector backend to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    Stub,
    #[serde(alias = "onnx")]
    Tract,
}

impl std::str::FromStr for DetectorKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stub" => Ok(DetectorKind::Stub),
            "tract" | "onnx" => Ok(DetectorKind::Tract),
            other => Err(anyhow!("unknown detector backend '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: DetectorKind,
    pub model_path: PathBuf,
    pub target_class: String,
    pub class_names: Vec<String>,
    pub input_size: u32,
    pub confidence_threshold: f32,
    /// Whether violation accounting is enabled when the first pipeline starts.
    pub active_on_start: bool,
}

#[derive(Debug, Clone)]
pub struct NotifierSettings {
    pub bot_token: Option<String>,
    pub chat_id: String,
    pub cooldown: Duration,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// File the configuration was read from; selections are persisted there.
    pub config_path: Option<PathBuf>,
    pub api_addr: String,
    pub source: SourceConfig,
    pub media_dir: PathBuf,
    pub detector: DetectorSettings,
    pub notifier: NotifierSettings,
    pub max_frame_width: u32,
    pub jpeg_quality: u8,
    pub log_capacity: usize,
}

impl AppConfig {
    /// Load from `HELMET_CONFIG` (if set), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("HELMET_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => AppConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.config_path = path.map(Path::to_path_buf);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: AppConfigFile) -> Result<Self> {
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let source = SourceConfig::parse(file.source.as_deref().unwrap_or(DEFAULT_SOURCE))
            .map_err(|err| anyhow!("invalid source in config file: {err}"))?;
        let media_dir = file
            .media_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MEDIA_DIR));

        let detector_file = file.detector.unwrap_or_default();
        let detector = DetectorSettings {
            backend: detector_file.backend.unwrap_or(DetectorKind::Stub),
            model_path: detector_file
                .model_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
            target_class: detector_file
                .target_class
                .unwrap_or_else(|| DEFAULT_TARGET_CLASS.to_string()),
            class_names: detector_file.class_names.unwrap_or_else(|| {
                DEFAULT_CLASS_NAMES.iter().map(|name| name.to_string()).collect()
            }),
            input_size: detector_file.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
            confidence_threshold: detector_file.confidence.unwrap_or(DEFAULT_CONFIDENCE),
            active_on_start: detector_file.active_on_start.unwrap_or(false),
        };

        let notifier_file = file.notifier.unwrap_or_default();
        let notifier = NotifierSettings {
            bot_token: notifier_file.bot_token.filter(|token| !token.trim().is_empty()),
            chat_id: notifier_file.chat_id.unwrap_or_default().trim().to_string(),
            cooldown: notifier_file
                .cooldown_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_COOLDOWN),
            api_base: notifier_file
                .api_base
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
        };

        let video = file.video.unwrap_or_default();
        Ok(Self {
            config_path: None,
            api_addr,
            source,
            media_dir,
            detector,
            notifier,
            max_frame_width: video.max_width.unwrap_or(MAX_FRAME_WIDTH),
            jpeg_quality: video.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            log_capacity: file
                .logs
                .and_then(|logs| logs.capacity)
                .unwrap_or(DEFAULT_LOG_CAPACITY),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_value("HELMET_API_ADDR") {
            self.api_addr = addr;
        } else if env_value("PORT").is_some() || env_value("HOST").is_some() {
            let (host, port) = self
                .api_addr
                .rsplit_once(':')
                .map(|(host, port)| (host.to_string(), port.to_string()))
                .unwrap_or_else(|| (self.api_addr.clone(), "5000".to_string()));
            let host = env_value("HOST").unwrap_or(host);
            let port = env_value("PORT").unwrap_or(port);
            self.api_addr = format!("{host}:{port}");
        }
        if let Some(source) = env_value("HELMET_SOURCE") {
            self.source = SourceConfig::parse(&source)
                .map_err(|err| anyhow!("HELMET_SOURCE is invalid: {err}"))?;
        }
        if let Some(backend) = env_value("HELMET_DETECTOR") {
            self.detector.backend = backend.parse().context("HELMET_DETECTOR")?;
        }
        if let Some(path) = env_value("HELMET_MODEL_PATH") {
            self.detector.model_path = PathBuf::from(path);
        }
        if let Some(class) = env_value("HELMET_TARGET_CLASS") {
            self.detector.target_class = class;
        }
        if let Some(token) = env_value("BOT_TOKEN") {
            self.notifier.bot_token = Some(token);
        }
        if let Some(chat_id) = env_value("CHAT_ID") {
            self.notifier.chat_id = chat_id;
        }
        if let Some(cooldown) = env_value("HELMET_COOLDOWN_SECS") {
            let seconds: u64 = cooldown.parse().map_err(|_| {
                anyhow!("HELMET_COOLDOWN_SECS must be an integer number of seconds")
            })?;
            self.notifier.cooldown = Duration::from_secs(seconds);
        }
        if let Some(dir) = env_value("HELMET_MEDIA_DIR") {
            self.media_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.api_addr
            .parse::<SocketAddr>()
            .map_err(|_| anyhow!("api addr '{}' is not a valid socket address", self.api_addr))?;

        self.detector.target_class = self.detector.target_class.trim().to_string();
        if self.detector.target_class.is_empty() {
            return Err(anyhow!("detector target_class must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.detector.confidence_threshold) {
            return Err(anyhow!("detector confidence must be between 0 and 1"));
        }
        if self.detector.backend == DetectorKind::Tract {
            if self.detector.input_size == 0 {
                return Err(anyhow!("detector input_size must be greater than zero"));
            }
            if !self
                .detector
                .class_names
                .iter()
                .any(|name| name == &self.detector.target_class)
            {
                return Err(anyhow!(
                    "target class '{}' is not one of the model's class_names",
                    self.detector.target_class
                ));
            }
        }

        if !self.notifier.chat_id.is_empty() && !is_valid_chat_id(&self.notifier.chat_id) {
            return Err(anyhow!(
                "chat id '{}' must be numeric or an @channel name",
                self.notifier.chat_id
            ));
        }
        if self.max_frame_width == 0 {
            return Err(anyhow!("video max_width must be greater than zero"));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(anyhow!("video jpeg_quality must be between 1 and 100"));
        }
        if self.log_capacity == 0 {
            return Err(anyhow!("logs capacity must be greater than zero"));
        }
        Ok(())
    }

    /// Telegram transport settings, or `None` when no bot token is configured.
    pub fn telegram(&self) -> Option<TelegramConfig> {
        self.notifier.bot_token.as_ref().map(|token| TelegramConfig {
            api_base: self.notifier.api_base.clone(),
            ..TelegramConfig::new(token.clone())
        })
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            target_class: self.detector.target_class.clone(),
            cooldown: self.notifier.cooldown,
            max_frame_width: self.max_frame_width,
            jpeg_quality: self.jpeg_quality,
            ..EngineSettings::default()
        }
    }
}

/// Chat ids are signed integers (users, groups) or `@channel` usernames.
pub fn is_valid_chat_id(chat_id: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^(-?\d+|@[A-Za-z0-9_]{5,})$").ok())
        .as_ref()
        .map(|re| re.is_match(chat_id))
        .unwrap_or(false)
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn is_toml(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false)
}

fn read_config_file(path: &Path) -> Result<AppConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = if is_toml(path) {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

// ----------------------------------------------------------------------------
// Persistence of operator selections
// ----------------------------------------------------------------------------

/// Persists operator choices made through the control surface.
pub trait ConfigWriter: Send {
    fn set_active_destination(&mut self, chat_id: &str) -> Result<()>;
    fn set_active_source(&mut self, source: &SourceConfig) -> Result<()>;
}

/// Used when the process was started without a config file.
#[derive(Debug, Default)]
pub struct NoopConfigWriter;

impl ConfigWriter for NoopConfigWriter {
    fn set_active_destination(&mut self, _chat_id: &str) -> Result<()> {
        Ok(())
    }

    fn set_active_source(&mut self, _source: &SourceConfig) -> Result<()> {
        Ok(())
    }
}

/// Rewrites the config file in place, keeping unrelated keys, after copying
/// the previous version to `<name>.backup-<YYYYmmdd_HHMMSS>`.
#[derive(Debug)]
pub struct FileConfigWriter {
    path: PathBuf,
}

impl FileConfigWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn update(&self, section: Option<&str>, key: &str, value: &str) -> Result<()> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => Some(raw),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(anyhow!(
                    "failed to read config file {}: {}",
                    self.path.display(),
                    err
                ))
            }
        };
        if raw.is_some() {
            self.backup()?;
        }
        let raw = raw.unwrap_or_default();

        let rendered = if is_toml(&self.path) {
            let mut doc: toml::Table = if raw.trim().is_empty() {
                toml::Table::new()
            } else {
                toml::from_str(&raw).context("parse config file for update")?
            };
            let table = match section {
                Some(section) => doc
                    .entry(section.to_string())
                    .or_insert(toml::Value::Table(toml::Table::new()))
                    .as_table_mut()
                    .ok_or_else(|| anyhow!("config key '{section}' is not a table"))?,
                None => &mut doc,
            };
            table.insert(key.to_string(), toml::Value::String(value.to_string()));
            toml::to_string_pretty(&doc).context("render config file")?
        } else {
            let mut doc: serde_json::Value = if raw.trim().is_empty() {
                serde_json::Value::Object(serde_json::Map::new())
            } else {
                serde_json::from_str(&raw).context("parse config file for update")?
            };
            let root = doc
                .as_object_mut()
                .ok_or_else(|| anyhow!("config file root is not an object"))?;
            let object = match section {
                Some(section) => root
                    .entry(section.to_string())
                    .or_insert(serde_json::Value::Object(serde_json::Map::new()))
                    .as_object_mut()
                    .ok_or_else(|| anyhow!("config key '{section}' is not an object"))?,
                None => root,
            };
            object.insert(key.to_string(), serde_json::Value::String(value.to_string()));
            let mut rendered = serde_json::to_string_pretty(&doc).context("render config file")?;
            rendered.push('\n');
            rendered
        };

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, rendered)
            .with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }

    fn backup(&self) -> Result<PathBuf> {
        let file_name = self
            .path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| anyhow!("config path {} has no file name", self.path.display()))?;
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let backup = self
            .path
            .with_file_name(format!("{file_name}.backup-{stamp}"));
        std::fs::copy(&self.path, &backup)
            .with_context(|| format!("back up config to {}", backup.display()))?;
        log::debug!("config backed up to {}", backup.display());
        Ok(backup)
    }
}

impl ConfigWriter for FileConfigWriter {
    fn set_active_destination(&mut self, chat_id: &str) -> Result<()> {
        self.update(Some("notifier"), "chat_id", chat_id)
    }

    fn set_active_source(&mut self, source: &SourceConfig) -> Result<()> {
        self.update(None, "source", &source.to_string())
    }
}

/// Writer matching how `config` was loaded.
pub fn config_writer(config: &AppConfig) -> Box<dyn ConfigWriter> {
    match &config.config_path {
        Some(path) => Box::new(FileConfigWriter::new(path.clone())),
        None => Box::new(NoopConfigWriter),
    }
}
