use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::clip::ClipConfig;
use crate::crossing::{AnchorPoint, CrossingConfig, DirectionFilter};
use crate::detect::{BoxLimits, ObjectClass};
use crate::filter::MotionFilterConfig;
use crate::ingest::StreamConfig;
use crate::registry::RegistryOptions;
use crate::segment::format::DEFAULT_JPEG_QUALITY;
use crate::segment::{FrameCodec, SegmentWriterConfig};

const DEFAULT_DB_PATH: &str = "finishline.db";
const DEFAULT_EVENT_ID: &str = "default";
const DEFAULT_STORAGE_ROOT: &str = "finishline-data";
const DEFAULT_STREAM_URL: &str = "stub://finish_line";
const DEFAULT_FPS: u32 = 10;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_SEGMENT_SECS: u64 = 15;
const DEFAULT_MAX_READ_ERRORS: u32 = 10;
const DEFAULT_BACKEND: &str = "threshold";
const DEFAULT_FILTER_THRESHOLD: f64 = 0.1;
const DEFAULT_CONFIDENCE: f32 = 0.6;
const DEFAULT_ROLL_MS: u64 = 2_000;
const DEFAULT_TRIGGER_LINE: [f64; 4] = [0.5, 0.0, 0.5, 1.0];
const DEFAULT_MATCH_DISTANCE_PX: f64 = 80.0;
const DEFAULT_TRACK_TIMEOUT_FRAMES: u32 = 5;
const DEFAULT_COOLDOWN_MS: u64 = 1_000;
const DEFAULT_CLIP_MARGIN_MS: u64 = 5_000;
const DEFAULT_LEASE_SECS: u64 = 300;
const DEFAULT_POLL_MS: u64 = 5_000;
const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    db_path: Option<String>,
    event_id: Option<String>,
    storage: Option<StorageConfigFile>,
    capture: Option<CaptureConfigFile>,
    filter: Option<FilterConfigFile>,
    detect: Option<DetectConfigFile>,
    clip: Option<ClipConfigFile>,
    worker: Option<WorkerConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    mode: Option<StorageMode>,
    root: Option<PathBuf>,
    base_url: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    segment_secs: Option<u64>,
    max_consecutive_errors: Option<u32>,
    frame_codec: Option<FrameCodecName>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct FilterConfigFile {
    enabled: Option<bool>,
    backend: Option<String>,
    threshold: Option<f64>,
    min_confidence: Option<f32>,
    class: Option<ObjectClass>,
    pre_roll_ms: Option<u64>,
    post_roll_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectConfigFile {
    backend: Option<String>,
    min_confidence: Option<f32>,
    class: Option<ObjectClass>,
    trigger_line: Option<[f64; 4]>,
    direction: Option<DirectionFilter>,
    anchor: Option<AnchorPoint>,
    max_match_distance_px: Option<f64>,
    track_timeout_frames: Option<u32>,
    cooldown_ms: Option<u64>,
    box_limits: Option<BoxLimits>,
    model_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct ClipConfigFile {
    lead_ms: Option<u64>,
    trail_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct WorkerConfigFile {
    lease_secs: Option<u64>,
    poll_interval_ms: Option<u64>,
    max_retries: Option<u32>,
    assemble_after_detect: Option<bool>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    #[default]
    Local,
    Memory,
    Http,
}

impl FromStr for StorageMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(StorageMode::Local),
            "memory" => Ok(StorageMode::Memory),
            "http" => Ok(StorageMode::Http),
            other => Err(anyhow!("unknown storage mode `{other}`")),
        }
    }
}

/// Frame coding for stored segments, as named in config files and the environment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameCodecName {
    #[default]
    Jpeg,
    Raw,
}

impl FromStr for FrameCodecName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "mjpeg" => Ok(FrameCodecName::Jpeg),
            "raw" => Ok(FrameCodecName::Raw),
            other => Err(anyhow!("unknown frame codec `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub mode: StorageMode,
    pub root: PathBuf,
    pub base_url: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub url: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
    pub segment_duration: Duration,
    pub max_consecutive_errors: u32,
    pub frame_codec: FrameCodecName,
    /// 1 to 100; only used by the jpeg codec.
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct FilterSettings {
    pub enabled: bool,
    pub backend: String,
    pub threshold: f64,
    pub min_confidence: f32,
    pub class: ObjectClass,
    pub pre_roll: Duration,
    pub post_roll: Duration,
}

#[derive(Debug, Clone)]
pub struct DetectSettings {
    pub backend: String,
    pub min_confidence: f32,
    pub class: ObjectClass,
    pub trigger_line: [f64; 4],
    pub direction: DirectionFilter,
    pub anchor: AnchorPoint,
    pub max_match_distance_px: f64,
    pub track_timeout_frames: u32,
    pub cooldown: Duration,
    pub box_limits: BoxLimits,
    pub model_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ClipSettings {
    pub lead: Duration,
    pub trail: Duration,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub lease: Duration,
    pub poll_interval: Duration,
    pub max_retries: u32,
    /// The detect worker assembles clips right after detection.
    pub assemble_after_detect: bool,
}

/// Configuration shared by every worker mode and the operator tool.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub db_path: String,
    pub event_id: String,
    pub storage: StorageSettings,
    pub capture: CaptureSettings,
    pub filter: FilterSettings,
    pub detect: DetectSettings,
    pub clip: ClipSettings,
    pub worker: WorkerSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        // Every file field is optional, so an empty file yields the defaults.
        Self::from_file(PipelineConfigFile::default())
    }
}

impl PipelineConfig {
    /// Load from `FINISHLINE_CONFIG` (if set), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FINISHLINE_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Self {
        let storage = file.storage.unwrap_or_default();
        let capture = file.capture.unwrap_or_default();
        let filter = file.filter.unwrap_or_default();
        let detect = file.detect.unwrap_or_default();
        let clip = file.clip.unwrap_or_default();
        let worker = file.worker.unwrap_or_default();

        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            event_id: file
                .event_id
                .unwrap_or_else(|| DEFAULT_EVENT_ID.to_string()),
            storage: StorageSettings {
                mode: storage.mode.unwrap_or_default(),
                root: storage
                    .root
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_ROOT)),
                base_url: storage.base_url,
                token: storage.token,
            },
            capture: CaptureSettings {
                url: capture
                    .url
                    .unwrap_or_else(|| DEFAULT_STREAM_URL.to_string()),
                target_fps: capture.target_fps.unwrap_or(DEFAULT_FPS),
                width: capture.width.unwrap_or(DEFAULT_WIDTH),
                height: capture.height.unwrap_or(DEFAULT_HEIGHT),
                segment_duration: Duration::from_secs(
                    capture.segment_secs.unwrap_or(DEFAULT_SEGMENT_SECS),
                ),
                max_consecutive_errors: capture
                    .max_consecutive_errors
                    .unwrap_or(DEFAULT_MAX_READ_ERRORS),
                frame_codec: capture.frame_codec.unwrap_or_default(),
                jpeg_quality: capture.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            },
            filter: FilterSettings {
                enabled: filter.enabled.unwrap_or(true),
                backend: filter
                    .backend
                    .unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
                threshold: filter.threshold.unwrap_or(DEFAULT_FILTER_THRESHOLD),
                min_confidence: filter.min_confidence.unwrap_or(DEFAULT_CONFIDENCE),
                class: filter.class.unwrap_or(ObjectClass::Person),
                pre_roll: Duration::from_millis(filter.pre_roll_ms.unwrap_or(DEFAULT_ROLL_MS)),
                post_roll: Duration::from_millis(filter.post_roll_ms.unwrap_or(DEFAULT_ROLL_MS)),
            },
            detect: DetectSettings {
                backend: detect
                    .backend
                    .unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
                min_confidence: detect.min_confidence.unwrap_or(DEFAULT_CONFIDENCE),
                class: detect.class.unwrap_or(ObjectClass::Person),
                trigger_line: detect.trigger_line.unwrap_or(DEFAULT_TRIGGER_LINE),
                direction: detect.direction.unwrap_or_default(),
                anchor: detect.anchor.unwrap_or_default(),
                max_match_distance_px: detect
                    .max_match_distance_px
                    .unwrap_or(DEFAULT_MATCH_DISTANCE_PX),
                track_timeout_frames: detect
                    .track_timeout_frames
                    .unwrap_or(DEFAULT_TRACK_TIMEOUT_FRAMES),
                cooldown: Duration::from_millis(detect.cooldown_ms.unwrap_or(DEFAULT_COOLDOWN_MS)),
                box_limits: detect.box_limits.unwrap_or_default(),
                model_path: detect.model_path,
            },
            clip: ClipSettings {
                lead: Duration::from_millis(clip.lead_ms.unwrap_or(DEFAULT_CLIP_MARGIN_MS)),
                trail: Duration::from_millis(clip.trail_ms.unwrap_or(DEFAULT_CLIP_MARGIN_MS)),
            },
            worker: WorkerSettings {
                lease: Duration::from_secs(worker.lease_secs.unwrap_or(DEFAULT_LEASE_SECS)),
                poll_interval: Duration::from_millis(
                    worker.poll_interval_ms.unwrap_or(DEFAULT_POLL_MS),
                ),
                max_retries: worker.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
                assemble_after_detect: worker.assemble_after_detect.unwrap_or(true),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_value("FINISHLINE_DB_PATH") {
            self.db_path = path;
        }
        if let Some(event_id) = env_value("FINISHLINE_EVENT_ID") {
            self.event_id = event_id;
        }
        if let Some(url) = env_value("FINISHLINE_STREAM_URL") {
            self.capture.url = url;
        }
        if let Some(codec) = env_value("FINISHLINE_FRAME_CODEC") {
            self.capture.frame_codec = codec.parse()?;
        }
        if let Some(mode) = env_value("FINISHLINE_STORAGE_MODE") {
            self.storage.mode = mode.parse()?;
        }
        if let Some(root) = env_value("FINISHLINE_STORAGE_ROOT") {
            self.storage.root = PathBuf::from(root);
        }
        if let Some(url) = env_value("FINISHLINE_STORAGE_URL") {
            self.storage.base_url = Some(url);
        }
        if let Some(enabled) = env_value("FINISHLINE_FILTER_ENABLED") {
            self.filter.enabled = parse_bool(&enabled)
                .ok_or_else(|| anyhow!("FINISHLINE_FILTER_ENABLED must be true or false"))?;
        }
        if let Some(line) = env_value("FINISHLINE_TRIGGER_LINE") {
            self.detect.trigger_line = parse_trigger_line(&line)?;
        }
        if let Some(lease) = env_value("FINISHLINE_LEASE_SECS") {
            let seconds: u64 = lease.parse().map_err(|_| {
                anyhow!("FINISHLINE_LEASE_SECS must be an integer number of seconds")
            })?;
            self.worker.lease = Duration::from_secs(seconds);
        }
        if let Some(retries) = env_value("FINISHLINE_MAX_RETRIES") {
            self.worker.max_retries = retries
                .parse()
                .map_err(|_| anyhow!("FINISHLINE_MAX_RETRIES must be a non-negative integer"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        crate::validate_event_id(&self.event_id)?;

        let line = self.detect.trigger_line;
        if line.iter().any(|v| !(0.0..=1.0).contains(v)) {
            return Err(anyhow!("trigger line coordinates must be within [0, 1]"));
        }
        if (line[2] - line[0]).hypot(line[3] - line[1]) <= f64::EPSILON {
            return Err(anyhow!("trigger line must have non-zero length"));
        }
        if !(0.0..=1.0).contains(&self.filter.threshold) {
            return Err(anyhow!("filter threshold must be within [0, 1]"));
        }
        for confidence in [self.filter.min_confidence, self.detect.min_confidence] {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(anyhow!("confidence thresholds must be within [0, 1]"));
            }
        }
        if self.capture.target_fps == 0 || self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("capture fps and frame size must be greater than zero"));
        }
        if self.capture.segment_duration.is_zero() {
            return Err(anyhow!("segment duration must be greater than zero"));
        }
        if !(1..=100).contains(&self.capture.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be within [1, 100]"));
        }
        if self.capture.max_consecutive_errors == 0 {
            return Err(anyhow!("max_consecutive_errors must be greater than zero"));
        }
        if self.worker.lease.is_zero() {
            return Err(anyhow!("lease must be greater than zero"));
        }
        if self.worker.lease <= self.capture.segment_duration {
            return Err(anyhow!(
                "lease ({}s) must be longer than the segment duration ({}s)",
                self.worker.lease.as_secs(),
                self.capture.segment_duration.as_secs()
            ));
        }
        if self.detect.max_match_distance_px <= 0.0 {
            return Err(anyhow!("max_match_distance_px must be greater than zero"));
        }
        if self.storage.mode == StorageMode::Http && self.storage.base_url.is_none() {
            return Err(anyhow!("http storage requires storage.base_url"));
        }
        Ok(())
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            filter_enabled: self.filter.enabled,
            max_retries: self.worker.max_retries,
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            url: self.capture.url.clone(),
            target_fps: self.capture.target_fps,
            width: self.capture.width,
            height: self.capture.height,
        }
    }

    pub fn writer_config(&self) -> SegmentWriterConfig {
        SegmentWriterConfig {
            event_id: self.event_id.clone(),
            segment_duration: self.capture.segment_duration,
            frame_rate: self.capture.target_fps as f64,
            lease: self.worker.lease,
            codec: self.frame_codec(),
        }
    }

    pub fn frame_codec(&self) -> FrameCodec {
        match self.capture.frame_codec {
            FrameCodecName::Jpeg => FrameCodec::Jpeg {
                quality: self.capture.jpeg_quality,
            },
            FrameCodecName::Raw => FrameCodec::Raw,
        }
    }

    pub fn filter_config(&self) -> MotionFilterConfig {
        MotionFilterConfig {
            threshold: self.filter.threshold,
            min_confidence: self.filter.min_confidence,
            class: self.filter.class,
            pre_roll_us: duration_us(self.filter.pre_roll),
            post_roll_us: duration_us(self.filter.post_roll),
            box_limits: self.detect.box_limits,
        }
    }

    pub fn crossing_config(&self) -> CrossingConfig {
        CrossingConfig {
            line: self.detect.trigger_line,
            direction: self.detect.direction,
            anchor: self.detect.anchor,
            class: self.detect.class,
            min_confidence: self.detect.min_confidence,
            box_limits: self.detect.box_limits,
            max_match_distance_px: self.detect.max_match_distance_px,
            track_timeout_frames: self.detect.track_timeout_frames,
            cooldown_us: duration_us(self.detect.cooldown),
        }
    }

    pub fn clip_config(&self) -> ClipConfig {
        ClipConfig {
            lead_us: duration_us(self.clip.lead),
            trail_us: duration_us(self.clip.trail),
        }
    }
}

pub(crate) fn duration_us(duration: Duration) -> i64 {
    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
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

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// `x1:y1:x2:y2`, normalised to the frame.
fn parse_trigger_line(value: &str) -> Result<[f64; 4]> {
    let parts: Vec<f64> = value
        .split(':')
        .map(|part| part.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|_| anyhow!("trigger line must be four numbers x1:y1:x2:y2"))?;
    <[f64; 4]>::try_from(parts)
        .map_err(|_| anyhow!("trigger line must be four numbers x1:y1:x2:y2"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.capture.segment_duration, Duration::from_secs(15));
        assert_eq!(cfg.worker.lease, Duration::from_secs(300));
        assert_eq!(cfg.detect.trigger_line, DEFAULT_TRIGGER_LINE);
        assert!(cfg.filter.enabled);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.clip_config().lead_us, 5_000_000);
        assert_eq!(cfg.writer_config().codec, FrameCodec::Jpeg { quality: 90 });
    }

    #[test]
    fn raw_frame_codec_is_selectable() {
        let file: PipelineConfigFile =
            toml::from_str("[capture]\nframe_codec = \"raw\"\n").unwrap();
        let cfg = PipelineConfig::from_file(file);
        assert_eq!(cfg.writer_config().codec, FrameCodec::Raw);
        assert_eq!("MJPEG".parse::<FrameCodecName>().unwrap(), FrameCodecName::Jpeg);
        assert!("h264".parse::<FrameCodecName>().is_err());
    }

    #[test]
    fn trigger_line_parses_colon_separated() {
        assert_eq!(
            parse_trigger_line("0.1:0.2:0.3:0.4").unwrap(),
            [0.1, 0.2, 0.3, 0.4]
        );
        assert!(parse_trigger_line("0.1:0.2:0.3").is_err());
        assert!(parse_trigger_line("a:b:c:d").is_err());
    }

    #[test]
    fn validate_rejects_degenerate_settings() {
        let mut cfg = PipelineConfig::default();
        cfg.detect.trigger_line = [0.5, 0.5, 0.5, 0.5];
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.worker.lease = Duration::from_secs(10);
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.event_id = "bad id".into();
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.capture.jpeg_quality = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.storage.mode = StorageMode::Http;
        assert!(cfg.validate().is_err());
    }
}
