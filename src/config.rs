//! Relay configuration.
//!
//! Settings are layered: built-in defaults, an optional JSON file
//! (`--config` or `RELAY_CONFIG`), `RELAY_*` environment variables, then
//! command-line values. `validate()` checks the merged result.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::{default_thresholds, GrpcSettings, LabelThresholds};
use crate::encode::{DetectEncoder, PayloadFormat, DEFAULT_DETECT_SIZE};
use crate::frame::DEFAULT_REGION_SIZE;
use crate::publish::{normalize_listen_addr, DEFAULT_JPEG_QUALITY};

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RelayConfigFile {
    source: Option<String>,
    listen_addr: Option<String>,
    detector: Option<DetectorConfigFile>,
    encode: Option<EncodeConfigFile>,
    output: Option<OutputConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectorConfigFile {
    addr: Option<String>,
    name: Option<String>,
    auth_key: Option<String>,
    connect_timeout_secs: Option<u64>,
    thresholds: Option<LabelThresholds>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct EncodeConfigFile {
    region_size: Option<u32>,
    detect_size: Option<u32>,
    payload_format: Option<PayloadFormat>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct OutputConfigFile {
    jpeg_quality: Option<u8>,
    font_path: Option<PathBuf>,
}

/// Merged relay configuration.
///
/// The four positional settings (`source`, `listen_addr`, detector `addr` and
/// `name`) stay optional here; the binary prints usage when any is missing.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub source: Option<String>,
    pub listen_addr: Option<String>,
    pub detector: DetectorSettings,
    pub region_size: u32,
    pub detect_size: u32,
    pub payload_format: PayloadFormat,
    pub jpeg_quality: u8,
    pub font_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub addr: Option<String>,
    pub name: Option<String>,
    pub auth_key: Option<String>,
    pub connect_timeout: Duration,
    pub thresholds: LabelThresholds,
}

/// Command-line values; `None` leaves the lower layers alone.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub source: Option<String>,
    pub listen_addr: Option<String>,
    pub detector_addr: Option<String>,
    pub detector_name: Option<String>,
    /// `LABEL=PCT` entries. When present they replace the configured thresholds.
    pub thresholds: Vec<String>,
    pub region_size: Option<u32>,
    pub detect_size: Option<u32>,
    pub payload_format: Option<PayloadFormat>,
    pub jpeg_quality: Option<u8>,
    pub font_path: Option<PathBuf>,
    pub auth_key: Option<String>,
    pub connect_timeout_secs: Option<u64>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            source: None,
            listen_addr: None,
            detector: DetectorSettings {
                addr: None,
                name: None,
                auth_key: None,
                connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
                thresholds: default_thresholds(),
            },
            region_size: DEFAULT_REGION_SIZE,
            detect_size: DEFAULT_DETECT_SIZE,
            payload_format: PayloadFormat::default(),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            font_path: None,
        }
    }
}

impl RelayConfig {
    /// Defaults, then the JSON file (`path`, else `RELAY_CONFIG`), then `RELAY_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("RELAY_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        let file_cfg = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => read_config_file(&path)?,
            None => RelayConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        Ok(cfg)
    }

    /// Every layer including the command line, validated.
    pub fn load_with(path: Option<&Path>, overrides: ConfigOverrides) -> Result<Self> {
        let mut cfg = Self::load(path)?;
        cfg.apply_overrides(overrides)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RelayConfigFile) -> Self {
        let defaults = Self::default();
        let detector = file.detector.unwrap_or_default();
        let encode = file.encode.unwrap_or_default();
        let output = file.output.unwrap_or_default();
        Self {
            source: file.source,
            listen_addr: file.listen_addr,
            detector: DetectorSettings {
                addr: detector.addr,
                name: detector.name,
                auth_key: detector.auth_key,
                connect_timeout: detector
                    .connect_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.detector.connect_timeout),
                thresholds: detector
                    .thresholds
                    .unwrap_or(defaults.detector.thresholds),
            },
            region_size: encode.region_size.unwrap_or(defaults.region_size),
            detect_size: encode.detect_size.unwrap_or(defaults.detect_size),
            payload_format: encode.payload_format.unwrap_or(defaults.payload_format),
            jpeg_quality: output.jpeg_quality.unwrap_or(defaults.jpeg_quality),
            font_path: output.font_path,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(source) = non_empty_env("RELAY_SOURCE") {
            self.source = Some(source);
        }
        if let Some(addr) = non_empty_env("RELAY_LISTEN_ADDR") {
            self.listen_addr = Some(addr);
        }
        if let Some(addr) = non_empty_env("RELAY_DETECTOR_ADDR") {
            self.detector.addr = Some(addr);
        }
        if let Some(name) = non_empty_env("RELAY_DETECTOR_NAME") {
            self.detector.name = Some(name);
        }
        if let Some(thresholds) = non_empty_env("RELAY_THRESHOLDS") {
            self.detector.thresholds = parse_thresholds(&thresholds)
                .map_err(|e| anyhow!("RELAY_THRESHOLDS: {}", e))?;
        }
        if let Some(path) = non_empty_env("RELAY_FONT_PATH") {
            self.font_path = Some(PathBuf::from(path));
        }
        if let Some(key) = non_empty_env("RELAY_AUTH_KEY") {
            self.detector.auth_key = Some(key);
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) -> Result<()> {
        if overrides.source.is_some() {
            self.source = overrides.source;
        }
        if overrides.listen_addr.is_some() {
            self.listen_addr = overrides.listen_addr;
        }
        if overrides.detector_addr.is_some() {
            self.detector.addr = overrides.detector_addr;
        }
        if overrides.detector_name.is_some() {
            self.detector.name = overrides.detector_name;
        }
        if !overrides.thresholds.is_empty() {
            let mut thresholds = LabelThresholds::new();
            for entry in &overrides.thresholds {
                let (label, pct) = parse_threshold(entry)?;
                thresholds.insert(label, pct);
            }
            self.detector.thresholds = thresholds;
        }
        if let Some(size) = overrides.region_size {
            self.region_size = size;
        }
        if let Some(size) = overrides.detect_size {
            self.detect_size = size;
        }
        if let Some(format) = overrides.payload_format {
            self.payload_format = format;
        }
        if let Some(quality) = overrides.jpeg_quality {
            self.jpeg_quality = quality;
        }
        if overrides.font_path.is_some() {
            self.font_path = overrides.font_path;
        }
        if overrides.auth_key.is_some() {
            self.detector.auth_key = overrides.auth_key;
        }
        if let Some(secs) = overrides.connect_timeout_secs {
            self.detector.connect_timeout = Duration::from_secs(secs);
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<()> {
        if self.detector.thresholds.is_empty() {
            return Err(anyhow!("at least one detection threshold is required"));
        }
        for (label, pct) in &self.detector.thresholds {
            if label.trim().is_empty() {
                return Err(anyhow!("threshold label must not be empty"));
            }
            if !(0.0..=100.0).contains(pct) {
                return Err(anyhow!(
                    "threshold for '{}' must be between 0 and 100, got {}",
                    label,
                    pct
                ));
            }
        }
        if self.region_size == 0 {
            return Err(anyhow!("region size must be greater than zero"));
        }
        if self.detect_size == 0 {
            return Err(anyhow!("detect size must be greater than zero"));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(anyhow!(
                "jpeg quality must be between 1 and 100, got {}",
                self.jpeg_quality
            ));
        }
        if self.detector.connect_timeout.is_zero() {
            return Err(anyhow!("connect timeout must be greater than zero"));
        }
        if let Some(addr) = &self.listen_addr {
            let normalized = normalize_listen_addr(addr);
            if !is_host_port(&normalized) {
                return Err(anyhow!("invalid listen address '{}', expected host:port", addr));
            }
            self.listen_addr = Some(normalized);
        }
        Ok(())
    }

    /// Names of the positional settings still unset.
    pub fn missing_required(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.source.is_none() {
            missing.push("source");
        }
        if self.listen_addr.is_none() {
            missing.push("host:port");
        }
        if self.detector.addr.is_none() {
            missing.push("detector-server-address");
        }
        if self.detector.name.is_none() {
            missing.push("detector-name");
        }
        missing
    }

    pub fn encoder(&self) -> DetectEncoder {
        DetectEncoder::new(self.region_size, self.detect_size, self.payload_format)
    }

    pub fn grpc_settings(&self) -> Result<GrpcSettings> {
        let addr = self
            .detector
            .addr
            .clone()
            .ok_or_else(|| anyhow!("detector address is not configured"))?;
        Ok(GrpcSettings {
            addr,
            connect_timeout: self.detector.connect_timeout,
            auth_key: self.detector.auth_key.clone(),
        })
    }
}

/// Parse `label=pct,label=pct`.
pub fn parse_thresholds(value: &str) -> Result<LabelThresholds> {
    let mut thresholds = LabelThresholds::new();
    for entry in split_csv(value) {
        let (label, pct) = parse_threshold(&entry)?;
        thresholds.insert(label, pct);
    }
    if thresholds.is_empty() {
        return Err(anyhow!("no thresholds in '{}'", value));
    }
    Ok(thresholds)
}

/// Parse one `label=pct` entry.
pub fn parse_threshold(entry: &str) -> Result<(String, f32)> {
    let (label, pct) = entry
        .split_once('=')
        .ok_or_else(|| anyhow!("threshold '{}' must look like LABEL=PCT", entry))?;
    let label = label.trim();
    if label.is_empty() {
        return Err(anyhow!("threshold '{}' has an empty label", entry));
    }
    let pct: f32 = pct
        .trim()
        .parse()
        .map_err(|_| anyhow!("threshold '{}' has a non-numeric percentage", entry))?;
    Ok((label.to_string(), pct))
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<RelayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

/// `host:port` with a non-empty host (name, IPv4 or bracketed IPv6) and a
/// numeric port. Names are resolved when the server binds.
fn is_host_port(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}
