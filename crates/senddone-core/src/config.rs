//! 应用配置和持久化
//!
//! 提供对端 ID、端口、下载目录等设置的存储和读取。

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::logging::LogLevel;
use crate::transfer::TransferOptions;

/// 默认监听端口
pub const DEFAULT_PORT: u16 = 47823;

/// 指向其它配置文件的环境变量
pub const CONFIG_ENV: &str = "SENDDONE_CONFIG";

/// 应用设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// 本机 ID（在对端的请求/应答中显示）
    pub peer_id: String,
    /// 监听地址未指定端口时使用
    pub port: u16,
    /// 接受传输时的默认目标目录
    pub download_dir: PathBuf,
    /// 网络列表是否包含 IPv6 地址
    pub include_ipv6: bool,
    pub connect_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    /// `RUST_LOG` 未设置时 senddone_core 的日志级别
    pub log_level: LogLevel,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            peer_id: default_peer_id(),
            port: DEFAULT_PORT,
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            include_ipv6: false,
            connect_timeout_secs: 10,
            handshake_timeout_secs: 30,
            log_level: LogLevel::Info,
        }
    }
}

impl AppSettings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("senddone")
            .join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    /// 传输引擎参数
    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs.max(1)),
            ..TransferOptions::default()
        }
    }
}

/// 获取默认对端 ID（主机名）
pub fn default_peer_id() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "SendDone".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = AppSettings::default();
        assert_eq!(settings.port, DEFAULT_PORT);
        assert!(!settings.include_ipv6);
        assert!(!settings.peer_id.is_empty());
        assert_eq!(settings.log_level, LogLevel::Info);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.toml");
        let settings = AppSettings {
            peer_id: "laptop".to_string(),
            port: 9000,
            include_ipv6: true,
            log_level: LogLevel::Debug,
            ..Default::default()
        };

        settings.save_to(&path).unwrap();
        assert_eq!(AppSettings::load_from(&path), settings);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "peer_id = \"desk\"\n").unwrap();

        let settings = AppSettings::load_from(&path);
        assert_eq!(settings.peer_id, "desk");
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.handshake_timeout_secs, 30);
    }

    #[test]
    fn test_invalid_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "port = \"not a number\"").unwrap();
        assert_eq!(AppSettings::load_from(&path).port, DEFAULT_PORT);

        assert_eq!(
            AppSettings::load_from(&dir.path().join("missing.toml")).port,
            DEFAULT_PORT
        );
    }

    #[test]
    fn test_transfer_options() {
        let settings = AppSettings {
            connect_timeout_secs: 3,
            handshake_timeout_secs: 0,
            ..Default::default()
        };
        let options = settings.transfer_options();
        assert_eq!(options.connect_timeout, Duration::from_secs(3));
        assert_eq!(options.handshake_timeout, Duration::from_secs(1));
    }
}
