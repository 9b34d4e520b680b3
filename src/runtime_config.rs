//! Ambient runtime configuration: HTTP port/bind address, decoder
//! buffering knobs, and log level — distinct from the `<WeekSchedule>`
//! XML config, which lives in [`crate::config`]. Follows the teacher's
//! `config.rs`/`app_runtime.rs` defaults-and-create-if-missing idiom.

use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub buffering: BufferingConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub bind_address: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BufferingConfig {
    #[serde(default = "default_decoder_period_frames")]
    pub decoder_period_frames: u32,
    #[serde(default = "default_resampler_quality")]
    pub resampler_quality: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            http: HttpConfig::default(),
            buffering: BufferingConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            port: default_port(),
            bind_address: None,
        }
    }
}

impl Default for BufferingConfig {
    fn default() -> Self {
        BufferingConfig {
            decoder_period_frames: default_decoder_period_frames(),
            resampler_quality: default_resampler_quality(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_decoder_period_frames() -> u32 {
    4096
}

fn default_resampler_quality() -> String {
    "high".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RuntimeConfig {
    /// The conventional path: `$XDG_CONFIG_HOME/clipsched/runtime.toml`
    /// (or platform equivalent via `dirs::config_dir()`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("clipsched").join("runtime.toml"))
    }

    /// Loads `path` if present and parses as TOML; otherwise returns
    /// built-in defaults without writing anything to disk — unlike the
    /// teacher's `AppRuntime::build`, this file is optional, not
    /// required scaffolding for a GUI's first run.
    pub fn load_or_default(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => match toml::from_str(&text) {
                Ok(cfg) => {
                    info!("loaded runtime config from {}", path.display());
                    cfg
                }
                Err(e) => {
                    warn!("runtime config {} is malformed ({e}), using defaults", path.display());
                    RuntimeConfig::default()
                }
            },
            Err(_) => RuntimeConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = RuntimeConfig::load_or_default(Path::new("/nonexistent/clipsched-runtime.toml"));
        assert_eq!(cfg.http.port, 8080);
        assert_eq!(cfg.buffering.decoder_period_frames, 4096);
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn partial_toml_fills_in_missing_fields_with_defaults() {
        let partial = "[http]\nport = 9100\n";
        let cfg: RuntimeConfig = toml::from_str(partial).unwrap();
        assert_eq!(cfg.http.port, 9100);
        assert!(cfg.http.bind_address.is_none());
        assert_eq!(cfg.buffering.decoder_period_frames, 4096);
    }
}
