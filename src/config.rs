/*
 * Created on Thu Jan 02 2025
 *
 * This file is a part of cfgtreed
 * cfgtreed is a persistent, hierarchical configuration store for
 * multi-process devices written to let clients publish, read and update
 * typed settings in a tree of named nodes, transactionally, with
 * change-notification for watchers of any path.
 *
 * Copyright (c) 2025, Config Tree Daemon Contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! Ambient daemon configuration (spec.md SPEC_FULL §6): a YAML file overlaid
//! with `CFGTREED_*` environment variables, the way the teacher's server
//! layers `config/cfgfile.rs` under `config/cfgenv.rs` — env wins when both
//! are set.

use serde::Deserialize;
use std::env::{self, VarError};
use std::fs;
use std::path::{Path, PathBuf};

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_max_name_len() -> usize {
    64
}
fn default_max_path_len() -> usize {
    512
}
fn default_max_string_len() -> usize {
    4096
}
fn default_max_binary_len() -> usize {
    8192
}
fn default_log_level() -> String {
    "info".to_owned()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_max_name_len")]
    pub max_name_len: usize,
    #[serde(default = "default_max_path_len")]
    pub max_path_len: usize,
    #[serde(default = "default_max_string_len")]
    pub max_string_len: usize,
    #[serde(default = "default_max_binary_len")]
    pub max_binary_len: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            data_dir: default_data_dir(),
            max_name_len: default_max_name_len(),
            max_path_len: default_max_path_len(),
            max_string_len: default_max_string_len(),
            max_binary_len: default_max_binary_len(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    BadEnvValue { var: &'static str, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "could not read config file: {msg}"),
            Self::Parse(msg) => write!(f, "could not parse config file: {msg}"),
            Self::BadEnvValue { var, reason } => write!(f, "bad value for {var}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Loads `path` (if it exists) as the base configuration, then overlays any
/// `CFGTREED_*` environment variables present. A missing file is not an
/// error — it just means "use the built-in defaults" before the env overlay.
pub fn load(path: &Path) -> Result<DaemonConfig, ConfigError> {
    let mut cfg = if path.exists() {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?
    } else {
        DaemonConfig::default()
    };
    apply_env_overlay(&mut cfg)?;
    Ok(cfg)
}

fn getenv(var: &'static str) -> Result<Option<String>, ConfigError> {
    match env::var(var) {
        Ok(v) => Ok(Some(v)),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => {
            Err(ConfigError::BadEnvValue { var, reason: "value is not valid unicode".into() })
        }
    }
}

fn getenv_parsed<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match getenv(var)? {
        Some(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::BadEnvValue { var, reason: e.to_string() }),
        None => Ok(None),
    }
}

fn apply_env_overlay(cfg: &mut DaemonConfig) -> Result<(), ConfigError> {
    if let Some(v) = getenv("CFGTREED_DATA_DIR")? {
        cfg.data_dir = PathBuf::from(v);
    }
    if let Some(v) = getenv_parsed::<usize>("CFGTREED_MAX_NAME_LEN")? {
        cfg.max_name_len = v;
    }
    if let Some(v) = getenv_parsed::<usize>("CFGTREED_MAX_PATH_LEN")? {
        cfg.max_path_len = v;
    }
    if let Some(v) = getenv_parsed::<usize>("CFGTREED_MAX_STRING_LEN")? {
        cfg.max_string_len = v;
    }
    if let Some(v) = getenv_parsed::<usize>("CFGTREED_MAX_BINARY_LEN")? {
        cfg.max_binary_len = v;
    }
    if let Some(v) = getenv("CFGTREED_LOG")? {
        cfg.log_level = v;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_file_is_absent() {
        let cfg = load(Path::new("/nonexistent/cfgtreed.yaml")).unwrap();
        assert_eq!(cfg.max_name_len, 64);
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        let dir = std::env::temp_dir().join("cfgtreed-config-test-yaml");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cfgtreed.yaml");
        std::fs::write(&path, "max_name_len: 32\nlog_level: debug\n").unwrap();
        let cfg = load(&path).unwrap();
        assert_eq!(cfg.max_name_len, 32);
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.max_path_len, 512);
    }
}
