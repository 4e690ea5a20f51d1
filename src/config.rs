//! Configuration parsing and validation.
//!
//! `provctl` is configured via a TOML file (default `config/provctl.toml`).
//! The config covers the database path, default OCR provider mode,
//! pipeline concurrency, embedding batch size/device, and image
//! optimization tuning for the VLM pipeline (§6 "Configuration").

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub default_ocr_mode: OcrModeConfig,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_embedding_batch_size")]
    pub embedding_batch_size: usize,
    #[serde(default)]
    pub embedding_device: Option<String>,
    #[serde(default)]
    pub image_optimization: ImageOptimizationConfig,
    #[serde(default = "default_storage_path")]
    pub default_storage_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Mirrors [`crate::models::OcrMode`] but kept independent so config
/// parsing doesn't fail on an unrecognized mode before validation runs.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OcrModeConfig {
    Fast,
    Balanced,
    Accurate,
}

impl Default for OcrModeConfig {
    fn default() -> Self {
        OcrModeConfig::Balanced
    }
}

impl OcrModeConfig {
    pub fn as_str(self) -> &'static str {
        match self {
            OcrModeConfig::Fast => "fast",
            OcrModeConfig::Balanced => "balanced",
            OcrModeConfig::Accurate => "accurate",
        }
    }
}

fn default_max_concurrent() -> usize {
    3
}

fn default_embedding_batch_size() -> usize {
    32
}

fn default_storage_path() -> PathBuf {
    dirs_default()
}

fn dirs_default() -> PathBuf {
    std::env::var_os("HOME")
        .map(|h| PathBuf::from(h).join(".provenance-store"))
        .unwrap_or_else(|| PathBuf::from(".provenance-store"))
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImageOptimizationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_vlm_max_dimension")]
    pub vlm_max_dimension: u32,
    #[serde(default = "default_vlm_skip_below_size")]
    pub vlm_skip_below_size: u32,
    #[serde(default = "default_vlm_min_relevance")]
    pub vlm_min_relevance: f64,
    #[serde(default = "default_true")]
    pub vlm_skip_logos_icons: bool,
}

impl Default for ImageOptimizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            vlm_max_dimension: default_vlm_max_dimension(),
            vlm_skip_below_size: default_vlm_skip_below_size(),
            vlm_min_relevance: default_vlm_min_relevance(),
            vlm_skip_logos_icons: true,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_vlm_max_dimension() -> u32 {
    1536
}
fn default_vlm_skip_below_size() -> u32 {
    64
}
fn default_vlm_min_relevance() -> f64 {
    0.3
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let config: Config =
        toml::from_str(&content).with_context(|| "failed to parse config file")?;

    if config.max_concurrent < 1 {
        anyhow::bail!("max_concurrent must be >= 1");
    }
    if config.embedding_batch_size < 1 {
        anyhow::bail!("embedding_batch_size must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.image_optimization.vlm_min_relevance) {
        anyhow::bail!("image_optimization.vlm_min_relevance must be in [0.0, 1.0]");
    }

    Ok(config)
}

#[cfg(test)]
impl Config {
    /// Build a minimal config pointed at `db_path`, for use in tests that
    /// need a real database but no TOML file on disk.
    pub fn for_test(db_path: PathBuf) -> Self {
        Config {
            db: DbConfig { path: db_path },
            default_ocr_mode: OcrModeConfig::Balanced,
            max_concurrent: default_max_concurrent(),
            embedding_batch_size: default_embedding_batch_size(),
            embedding_device: None,
            image_optimization: ImageOptimizationConfig::default(),
            default_storage_path: default_storage_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_config_rejects_bad_max_concurrent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.toml");
        std::fs::write(&path, "max_concurrent = 0\n[db]\npath = \"x.db\"\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("max_concurrent"));
    }

    #[test]
    fn load_config_applies_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.toml");
        std::fs::write(&path, "[db]\npath = \"x.db\"\n").unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.max_concurrent, 3);
        assert_eq!(cfg.default_ocr_mode, OcrModeConfig::Balanced);
        assert!(cfg.image_optimization.enabled);
    }
}
