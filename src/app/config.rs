use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// ログレベル
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// ブローカー設定
    #[serde(default)]
    pub broker: BrokerConfig,
    /// リスナー設定
    #[serde(default)]
    pub listener: ListenerConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            broker: BrokerConfig::default(),
            listener: ListenerConfig::default(),
        }
    }
}

/// ブローカー（HTTP + WebSocket サーバー）設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// バインドアドレス
    #[serde(default = "default_host")]
    pub host: String,
    /// `/notify`・`/health`・WebSocket で共有する固定ポート
    #[serde(default = "default_port")]
    pub port: u16,
    /// リスナーが一つも接続していない状態がこの時間続いたら終了
    #[serde(default = "default_idle_shutdown")]
    pub idle_shutdown_secs: u64,
    /// この時間何も送ってこないリスナーは切断
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_secs: u64,
    /// ソケットへの1回の書き込みの上限時間
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    /// リスナーごとの送信キュー長（満杯ならそのイベントはスキップ）
    #[serde(default = "default_send_queue")]
    pub send_queue: usize,
    /// 起動時に書き込み、正常終了時に削除するPIDファイル
    #[serde(default = "crate::notify::pid_file_path")]
    pub pid_file: PathBuf,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3099
}

fn default_idle_shutdown() -> u64 {
    300 // 5分
}

fn default_keepalive_timeout() -> u64 {
    60 // クライアントは20秒ごとにping
}

fn default_write_timeout() -> u64 {
    5
}

fn default_send_queue() -> usize {
    32
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            idle_shutdown_secs: default_idle_shutdown(),
            keepalive_timeout_secs: default_keepalive_timeout(),
            write_timeout_secs: default_write_timeout(),
            send_queue: default_send_queue(),
            pid_file: crate::notify::pid_file_path(),
        }
    }
}

impl BrokerConfig {
    /// バインド用の `host:port`
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// 送信側とヘルスチェックが使うベースURL
    pub fn http_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn idle_shutdown(&self) -> Duration {
        Duration::from_secs(self.idle_shutdown_secs)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

/// リスナー（通知クライアント）設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// ブローカーの WebSocket URL
    #[serde(default = "default_listener_url")]
    pub url: String,
    /// キープアライブ ping の間隔
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// 最初の失敗後の再接続待ち時間
    #[serde(default = "default_reconnect_floor")]
    pub reconnect_floor_ms: u64,
    /// 再接続待ち時間の上限
    #[serde(default = "default_reconnect_ceiling")]
    pub reconnect_ceiling_ms: u64,
    /// 非永続通知を自動で閉じるまでの時間
    #[serde(default = "default_notification_timeout")]
    pub notification_timeout_secs: u64,
    /// UI 向けに保持する最近の通知の件数
    #[serde(default = "default_recent_capacity")]
    pub recent_capacity: usize,
    /// 設定と最後の接続状態を保存するキーバリューストア
    #[serde(default = "crate::notify::store_path")]
    pub store_path: PathBuf,
}

fn default_listener_url() -> String {
    format!("ws://{}:{}", default_host(), default_port())
}

fn default_ping_interval() -> u64 {
    20
}

fn default_reconnect_floor() -> u64 {
    1_000
}

fn default_reconnect_ceiling() -> u64 {
    30_000
}

fn default_notification_timeout() -> u64 {
    5
}

fn default_recent_capacity() -> usize {
    10
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            url: default_listener_url(),
            ping_interval_secs: default_ping_interval(),
            reconnect_floor_ms: default_reconnect_floor(),
            reconnect_ceiling_ms: default_reconnect_ceiling(),
            notification_timeout_secs: default_notification_timeout(),
            recent_capacity: default_recent_capacity(),
            store_path: crate::notify::store_path(),
        }
    }
}

impl ListenerConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn reconnect_floor(&self) -> Duration {
        Duration::from_millis(self.reconnect_floor_ms)
    }

    pub fn reconnect_ceiling(&self) -> Duration {
        Duration::from_millis(self.reconnect_ceiling_ms)
    }

    pub fn notification_timeout(&self) -> Duration {
        Duration::from_secs(self.notification_timeout_secs)
    }
}

impl Config {
    /// 設定ファイルから読み込み（存在しない場合はデフォルトを作成して保存）
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            Self::from_toml(&content)
        } else {
            // 初回起動時はデフォルト設定をファイルに保存
            let config = Self::default();
            if let Err(e) = config.save() {
                tracing::warn!("Failed to save default config: {}", e);
            }
            Ok(config)
        }
    }

    /// TOML文字列からパース（欠けている項目はデフォルト値）
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))
    }

    /// 設定ファイルパスを取得
    pub fn config_path() -> Result<PathBuf> {
        // ~/.config/claude-notify-bridge/config.toml を使用
        let base_dirs = directories::BaseDirs::new()
            .ok_or_else(|| anyhow::anyhow!("Failed to determine home directory"))?;
        Ok(base_dirs
            .home_dir()
            .join(".config/claude-notify-bridge/config.toml"))
    }

    /// 現在の設定をファイルに保存
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_constants() {
        let config = Config::default();
        assert_eq!(config.broker.port, 3099);
        assert_eq!(config.broker.idle_shutdown(), Duration::from_secs(300));
        assert_eq!(config.listener.ping_interval(), Duration::from_secs(20));
        assert_eq!(config.listener.reconnect_floor(), Duration::from_secs(1));
        assert_eq!(config.listener.reconnect_ceiling(), Duration::from_secs(30));
        assert_eq!(config.listener.recent_capacity, 10);
        assert_eq!(config.listener.url, "ws://127.0.0.1:3099");
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = Config::from_toml(
            r#"
            log_level = "debug"

            [broker]
            port = 4000
            "#,
        )
        .unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.broker.port, 4000);
        assert_eq!(config.broker.host, "127.0.0.1");
        assert_eq!(config.broker.idle_shutdown_secs, 300);
        assert_eq!(config.listener.ping_interval_secs, 20);
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed = Config::from_toml(&text).unwrap();
        assert_eq!(parsed.broker.bind_addr(), "127.0.0.1:3099");
        assert_eq!(parsed.broker.http_url(), "http://127.0.0.1:3099");
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(Config::from_toml("broker = 3").is_err());
    }
}
