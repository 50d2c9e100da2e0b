use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::process::CommandSpec;

/// テストツールの起動と監視の設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// 実行するコマンドライン（シェルを通さず引数に分割して実行）
    #[serde(default = "default_command")]
    pub command: String,
    /// stderr もログに流す
    #[serde(default = "default_merge_stderr")]
    pub merge_stderr: bool,
    /// ポーリング間隔（ミリ秒）
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// 1回の読み込みの最大バイト数
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    /// 1行の最大長
    #[serde(default = "default_max_line_len")]
    pub max_line_len: usize,
    /// ログの最大保持行数（0で無制限）
    #[serde(default = "default_max_log_lines")]
    pub max_log_lines: usize,
    /// SIGTERM から SIGKILL までの猶予（ミリ秒）
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
    /// 開始時にログを消去
    #[serde(default)]
    pub clear_log_on_start: bool,
    /// テスト終了でアプリも終了
    #[serde(default)]
    pub exit_when_done: bool,
}

fn default_command() -> String {
    "../tpm2-algtest/build/tpm2_algtest -s perf".to_string()
}

fn default_merge_stderr() -> bool {
    true
}

fn default_tick_interval_ms() -> u64 {
    30
}

fn default_read_chunk_size() -> usize {
    4096
}

fn default_max_line_len() -> usize {
    64 * 1024
}

fn default_max_log_lines() -> usize {
    500
}

fn default_terminate_grace_ms() -> u64 {
    500
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            merge_stderr: default_merge_stderr(),
            tick_interval_ms: default_tick_interval_ms(),
            read_chunk_size: default_read_chunk_size(),
            max_line_len: default_max_line_len(),
            max_log_lines: default_max_log_lines(),
            terminate_grace_ms: default_terminate_grace_ms(),
            clear_log_on_start: false,
            exit_when_done: false,
        }
    }
}

impl MonitorConfig {
    pub fn command_spec(&self) -> CommandSpec {
        CommandSpec::new(self.command.clone()).with_merged_stderr(self.merge_stderr)
    }

    pub fn tick_interval(&self) -> Duration {
        // 0 だと入力待ちが空回りする
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// ログレベル
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// テストツール設定
    #[serde(default)]
    pub monitor: MonitorConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl Config {
    /// 設定ファイルから読み込み
    /// （存在しない場合はデフォルトを作成して保存）
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// 指定パスから読み込み
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .map_err(|e| anyhow::anyhow!("Failed to parse config {}: {}", path.display(), e))?;
            Ok(config)
        } else {
            // 初回起動時はデフォルト設定をファイルに保存
            let config = Self::default();
            if let Err(e) = config.save_to(path) {
                tracing::warn!("Failed to save default config: {}", e);
            }
            Ok(config)
        }
    }

    /// 設定ファイルパスを取得
    pub fn config_path() -> Result<PathBuf> {
        // ~/.config/algtest-monitor/config.toml を使用
        let base_dirs = directories::BaseDirs::new()
            .ok_or_else(|| anyhow::anyhow!("Failed to determine home directory"))?;
        Ok(base_dirs.home_dir().join(".config/algtest-monitor/config.toml"))
    }

    /// 現在の設定をファイルに保存
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, self.to_toml()?)?;

        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
