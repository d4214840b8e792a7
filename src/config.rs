// Copyright 2024-2026 basecall-runtime Contributors
// Licensed under the Apache License, Version 2.0

//! Runtime configuration loading from environment variables.
//!
//! All configuration values are loaded from `BASECALL_*` environment variables
//! with sensible defaults. Invalid values fall back to defaults without crashing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `BASECALL_DEVICE` | cpu | Device identifier (`cpu`, `cuda:N`, `metal`) |
//! | `BASECALL_BATCH_SIZE` | 0 | Batch size (0 = size from memory budget) |
//! | `BASECALL_CHUNK_SIZE` | 0 | Chunk size in samples (0 = model default) |
//! | `BASECALL_MEMORY_FRACTION` | 0.9 | Share of device memory, clamped to (0, 1] |
//! | `BASECALL_EXCLUSIVE_GPU` | false | Claim the device exclusively |
//! | `BASECALL_RUNNERS` | 0 | Runner threads (0 = one per CPU) |
//! | `BASECALL_MAX_RETRIES` | 2 | Sub-batch halvings on memory exhaustion |
//! | `BASECALL_CPU_MEMORY` | 8589934592 | Host memory offered to the cpu device (bytes) |
//! | `BASECALL_MODEL_CONFIG` | unset | Path to a model TOML file |
//! | `BASECALL_LOG_FORMAT` | json | `json` or `pretty` |
//! | `BASECALL_LOG_LEVEL` | info | Log filter directive |
//! | `BASECALL_LOG_FILE` | unset | Log to this file instead of stderr |

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::caller::CallerConfig;
use crate::model::{ModelConfig, ModelConfigError};
use crate::telemetry::{LogConfig, LogFormat};

const DEFAULT_CPU_MEMORY: u64 = 8 * 1024 * 1024 * 1024; // 8 GiB
const MIN_CPU_MEMORY: u64 = 16 * 1024 * 1024; // floor: 16 MiB
const DEFAULT_MEMORY_FRACTION: f32 = 0.9;
const MIN_MEMORY_FRACTION: f32 = 0.01;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Model(#[from] ModelConfigError),
}

/// Effective runtime configuration summary (serializable).
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub device: String,
    pub batch_size: usize,
    pub chunk_size: usize,
    pub memory_fraction: f32,
    pub exclusive_gpu: bool,
    pub runners: usize,
    pub max_retries: u32,
    pub cpu_memory: u64,
    pub model_config: Option<String>,
    pub log_format: String,
    pub log_level: String,
}

/// All runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub device: String,
    pub batch_size: usize,
    pub chunk_size: usize,
    pub memory_fraction: f32,
    pub exclusive_gpu: bool,
    pub runners: usize,
    pub max_retries: u32,
    pub cpu_memory: u64,
    pub model_config_path: Option<PathBuf>,
    pub log: LogConfig,
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u32` env var, returning `default` on missing or invalid.
fn parse_u32(key: &str, default: u32) -> u32 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u32>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_f32(key: &str, default: f32) -> f32 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<f32>().ok().filter(|v| v.is_finite()).unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn parse_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty()).map(PathBuf::from)
}

/// Load logging configuration from environment.
fn load_log_config() -> LogConfig {
    let format = std::env::var("BASECALL_LOG_FORMAT")
        .ok()
        .and_then(|v| v.parse::<LogFormat>().ok())
        .unwrap_or_default();
    let level = std::env::var("BASECALL_LOG_LEVEL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "info".to_string());
    LogConfig { format, level, output_path: parse_path("BASECALL_LOG_FILE") }
}

/// Load all configuration from environment variables.
///
/// Missing or invalid values fall back to safe defaults without panicking.
pub fn load() -> EnvConfig {
    let device = std::env::var("BASECALL_DEVICE")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "cpu".to_string());
    let memory_fraction = parse_f32("BASECALL_MEMORY_FRACTION", DEFAULT_MEMORY_FRACTION);
    let memory_fraction = memory_fraction.clamp(MIN_MEMORY_FRACTION, 1.0);
    let runners = match parse_usize("BASECALL_RUNNERS", 0) {
        0 => num_cpus::get(),
        n => n,
    };
    let cpu_memory = parse_u64("BASECALL_CPU_MEMORY", DEFAULT_CPU_MEMORY).max(MIN_CPU_MEMORY);

    EnvConfig {
        device,
        batch_size: parse_usize("BASECALL_BATCH_SIZE", 0),
        chunk_size: parse_usize("BASECALL_CHUNK_SIZE", 0),
        memory_fraction,
        exclusive_gpu: parse_bool("BASECALL_EXCLUSIVE_GPU", false),
        runners: runners.max(1),
        max_retries: parse_u32("BASECALL_MAX_RETRIES", 2),
        cpu_memory,
        model_config_path: parse_path("BASECALL_MODEL_CONFIG"),
        log: load_log_config(),
    }
}

/// Model used when no model file is configured.
pub fn default_model_config() -> ModelConfig {
    ModelConfig {
        name: "reference_fast".to_string(),
        chunk_size: 2000,
        stride: 5,
        channels: 1,
        num_states: 5,
        batch_shapes: Vec::new(),
        batch_timeout_ms: 100,
        seed: 0,
    }
}

impl EnvConfig {
    /// Caller parameters for this configuration.
    pub fn to_caller_config(&self) -> CallerConfig {
        CallerConfig {
            chunk_size: self.chunk_size,
            batch_size: self.batch_size,
            device: self.device.clone(),
            memory_limit_fraction: self.memory_fraction,
            exclusive_gpu_access: self.exclusive_gpu,
            expected_runners: self.runners,
        }
    }

    /// Load the configured model file, or the built-in reference model.
    pub fn model_config(&self) -> Result<ModelConfig, ConfigError> {
        match &self.model_config_path {
            Some(path) => Ok(ModelConfig::load(path)?),
            None => Ok(default_model_config()),
        }
    }

    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            device: self.device.clone(),
            batch_size: self.batch_size,
            chunk_size: self.chunk_size,
            memory_fraction: self.memory_fraction,
            exclusive_gpu: self.exclusive_gpu,
            runners: self.runners,
            max_retries: self.max_retries,
            cpu_memory: self.cpu_memory,
            model_config: self.model_config_path.as_ref().map(|p| p.display().to_string()),
            log_format: self.log.format.as_str().to_string(),
            log_level: self.log.level.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serialize env-mutating tests to avoid cross-test pollution.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "BASECALL_DEVICE",
        "BASECALL_BATCH_SIZE",
        "BASECALL_CHUNK_SIZE",
        "BASECALL_MEMORY_FRACTION",
        "BASECALL_EXCLUSIVE_GPU",
        "BASECALL_RUNNERS",
        "BASECALL_MAX_RETRIES",
        "BASECALL_CPU_MEMORY",
        "BASECALL_MODEL_CONFIG",
        "BASECALL_LOG_FORMAT",
        "BASECALL_LOG_LEVEL",
        "BASECALL_LOG_FILE",
    ];

    fn clear_env_vars() {
        for k in ENV_KEYS {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn test_defaults_are_sensible() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let cfg = load();
        assert_eq!(cfg.device, "cpu");
        assert_eq!(cfg.batch_size, 0);
        assert_eq!(cfg.chunk_size, 0);
        assert_eq!(cfg.memory_fraction, 0.9);
        assert!(!cfg.exclusive_gpu);
        assert_eq!(cfg.runners, num_cpus::get().max(1));
        assert_eq!(cfg.max_retries, 2);
        assert_eq!(cfg.cpu_memory, DEFAULT_CPU_MEMORY);
        assert!(cfg.model_config_path.is_none());
        assert_eq!(cfg.log.format, LogFormat::Json);
        assert_eq!(cfg.log.level, "info");
    }

    #[test]
    fn test_env_vars_override_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("BASECALL_DEVICE", "cuda:1");
        std::env::set_var("BASECALL_BATCH_SIZE", "256");
        std::env::set_var("BASECALL_CHUNK_SIZE", "5000");
        std::env::set_var("BASECALL_MEMORY_FRACTION", "0.5");
        std::env::set_var("BASECALL_EXCLUSIVE_GPU", "true");
        std::env::set_var("BASECALL_RUNNERS", "3");
        std::env::set_var("BASECALL_LOG_FORMAT", "pretty");
        let cfg = load();
        let caller = cfg.to_caller_config();
        assert_eq!(caller.device, "cuda:1");
        assert_eq!(caller.batch_size, 256);
        assert_eq!(caller.chunk_size, 5000);
        assert_eq!(caller.memory_limit_fraction, 0.5);
        assert!(caller.exclusive_gpu_access);
        assert_eq!(caller.expected_runners, 3);
        assert_eq!(cfg.log.format, LogFormat::Pretty);
        clear_env_vars();
    }

    #[test]
    fn test_invalid_env_falls_back_to_default() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("BASECALL_BATCH_SIZE", "lots");
        std::env::set_var("BASECALL_MEMORY_FRACTION", "NaN");
        std::env::set_var("BASECALL_EXCLUSIVE_GPU", "maybe");
        std::env::set_var("BASECALL_LOG_FORMAT", "xml");
        let cfg = load();
        assert_eq!(cfg.batch_size, 0);
        assert_eq!(cfg.memory_fraction, 0.9);
        assert!(!cfg.exclusive_gpu);
        assert_eq!(cfg.log.format, LogFormat::Json);
        clear_env_vars();
    }

    #[test]
    fn test_memory_fraction_clamped() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("BASECALL_MEMORY_FRACTION", "0");
        assert!(load().memory_fraction > 0.0, "fraction must stay positive");

        std::env::set_var("BASECALL_MEMORY_FRACTION", "3.5");
        assert_eq!(load().memory_fraction, 1.0);
        clear_env_vars();
    }

    #[test]
    fn test_cpu_memory_floor() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("BASECALL_CPU_MEMORY", "1");
        assert_eq!(load().cpu_memory, MIN_CPU_MEMORY);
        clear_env_vars();
    }

    #[test]
    fn test_model_config_from_file() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.toml");
        std::fs::write(&path, "name = \"hac\"\nchunk_size = 600\nstride = 6\n").unwrap();
        std::env::set_var("BASECALL_MODEL_CONFIG", &path);

        let cfg = load();
        let model = cfg.model_config().unwrap();
        assert_eq!(model.name, "hac");
        assert_eq!(model.stride, 6);

        std::env::set_var("BASECALL_MODEL_CONFIG", dir.path().join("missing.toml"));
        assert!(load().model_config().is_err());
        clear_env_vars();
    }

    #[test]
    fn test_default_model_config_is_valid() {
        assert!(default_model_config().validate().is_ok());
    }

    #[test]
    fn test_effective_config_serializes() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let eff = load().effective_config();
        let json = serde_json::to_value(&eff).unwrap();
        assert_eq!(json["device"], "cpu");
        assert_eq!(json["log_format"], "json");
        assert!(json["model_config"].is_null());
    }
}
