//! K线聚合服务配置模块

use serde::{Deserialize, Serialize};
use std::path::Path;
use crate::klcommon::{AppError, Result};
use crate::klcommon::timeframe::TimeframeSet;

/// 系统配置常量
pub mod constants {
    /// 默认配置文件路径
    pub const DEFAULT_CONFIG_PATH: &str = "config/KlineAggregatorConfig.toml";

    /// 默认基础周期
    pub const DEFAULT_BASE_INTERVAL: &str = "1m";

    /// 默认派生周期
    pub const DEFAULT_TIMEFRAMES: &[&str] = &["5m", "15m", "1h", "4h", "1d", "1w"];

    /// 币安 klines 接口单页上限
    pub const MAX_PAGE_LIMIT: usize = 1000;
}

use constants::*;

fn default_base_interval() -> String {
    DEFAULT_BASE_INTERVAL.to_string()
}

fn default_timeframes() -> Vec<String> {
    DEFAULT_TIMEFRAMES.iter().map(|s| s.to_string()).collect()
}

fn default_true() -> bool {
    true
}

/// K线聚合服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// 订阅的交易对
    pub symbols: Vec<String>,

    /// 基础周期
    #[serde(default = "default_base_interval")]
    pub base_interval: String,

    /// 派生周期列表
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<String>,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub backfill: BackfillConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub refresh: RefreshConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub publisher: PublisherConfig,

    #[serde(default)]
    pub web: WebConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// 数据库文件路径
    pub database_path: String,

    /// 连接池大小
    pub pool_size: u32,

    /// SQLite 忙等待超时（毫秒）
    pub busy_timeout_ms: u64,
}

/// 缺口补齐配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// 启动时是否执行补齐
    pub enabled: bool,

    /// 最大回溯时长（小时），没有任何数据时从 now - horizon 开始
    pub horizon_hours: u64,

    /// 历史数据源地址
    pub api_url: String,

    /// 单次请求的K线根数上限
    pub page_limit: usize,

    /// 相邻分页请求之间的间隔（毫秒）
    pub chunk_delay_ms: u64,

    /// 单个分页请求的超时（秒）
    pub request_timeout_secs: u64,

    /// 传输层错误的最大重试次数
    pub max_retries: usize,

    /// 重试间隔（毫秒）
    pub retry_delay_ms: u64,
}

/// 数据保留配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub enabled: bool,

    /// 基础表保留天数
    pub retention_days: u64,

    /// 清理任务执行间隔（小时）
    pub interval_hours: u64,
}

/// 派生视图刷新配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub enabled: bool,

    /// 刷新间隔（分钟）
    pub interval_minutes: u64,
}

/// 周期任务失败后的退避策略
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

/// 发布通道配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// 广播通道容量，慢订阅者超出后会丢失旧消息
    pub channel_capacity: usize,
}

/// 订阅网关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,
    pub listen_addr: String,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别 (trace, debug, info, warn, error)
    pub log_level: String,

    /// 日志文件目录
    pub log_dir: String,

    /// 日志文件名前缀
    pub file_prefix: String,

    /// 是否同时输出到控制台
    #[serde(default = "default_true")]
    pub console: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_path: "./data/klines.db".to_string(),
            pool_size: 10,
            busy_timeout_ms: 5000,
        }
    }
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            horizon_hours: 24 * 30,
            api_url: "https://api.binance.com".to_string(),
            page_limit: MAX_PAGE_LIMIT,
            chunk_delay_ms: 100,
            request_timeout_secs: 30,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 7,
            interval_hours: 24,
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 5,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            initial_backoff_secs: 60,
            max_backoff_secs: 3600,
        }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self { channel_capacity: 4096 }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:9090".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "logs".to_string(),
            file_prefix: "kline_aggregator.log".to_string(),
            console: true,
        }
    }
}

impl ServiceConfig {
    /// 从文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// 从TOML文本解析配置，并应用环境变量覆盖
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// 解析配置文件路径：命令行参数 > CONFIG_PATH 环境变量 > 默认路径
    pub fn resolve_path(cli_path: Option<&str>) -> String {
        cli_path
            .map(|p| p.to_string())
            .or_else(|| std::env::var("CONFIG_PATH").ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
    }

    /// SYMBOLS 环境变量（逗号分隔）覆盖配置文件中的交易对
    fn apply_env_overrides(&mut self) {
        if let Ok(symbols) = std::env::var("SYMBOLS") {
            let symbols: Vec<String> = symbols
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !symbols.is_empty() {
                self.symbols = symbols;
            }
        }
        for symbol in &mut self.symbols {
            *symbol = symbol.trim().to_uppercase();
        }
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            return Err(AppError::ConfigError("交易对列表不能为空".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for symbol in &self.symbols {
            if symbol.is_empty() || !seen.insert(symbol.as_str()) {
                return Err(AppError::ConfigError(format!("无效或重复的交易对: '{}'", symbol)));
            }
        }

        // 周期格式、倍数关系、重复项都在这里校验
        self.timeframe_set()?;

        if self.database.pool_size == 0 {
            return Err(AppError::ConfigError("数据库连接池大小必须大于0".to_string()));
        }

        if self.backfill.horizon_hours == 0 {
            return Err(AppError::ConfigError("补齐回溯时长必须大于0".to_string()));
        }

        if self.backfill.page_limit == 0 || self.backfill.page_limit > MAX_PAGE_LIMIT {
            return Err(AppError::ConfigError(format!(
                "单页K线数量必须在 1..={} 之间", MAX_PAGE_LIMIT
            )));
        }

        if self.backfill.request_timeout_secs == 0 {
            return Err(AppError::ConfigError("请求超时必须大于0".to_string()));
        }

        if self.retention.retention_days == 0 || self.retention.interval_hours == 0 {
            return Err(AppError::ConfigError("保留天数和清理间隔必须大于0".to_string()));
        }

        if self.refresh.interval_minutes == 0 {
            return Err(AppError::ConfigError("视图刷新间隔必须大于0".to_string()));
        }

        if self.scheduler.initial_backoff_secs == 0
            || self.scheduler.max_backoff_secs < self.scheduler.initial_backoff_secs
        {
            return Err(AppError::ConfigError(
                "退避时间必须大于0，且最大退避不能小于初始退避".to_string()
            ));
        }

        if self.publisher.channel_capacity == 0 {
            return Err(AppError::ConfigError("发布通道容量必须大于0".to_string()));
        }

        if self.web.enabled {
            self.web.listen_addr.parse::<std::net::SocketAddr>()?;
        }

        Ok(())
    }

    pub fn timeframe_set(&self) -> Result<TimeframeSet> {
        TimeframeSet::from_names(&self.base_interval, &self.timeframes)
    }

    pub fn backfill_horizon_ms(&self) -> i64 {
        self.backfill.horizon_hours as i64 * 60 * 60 * 1000
    }

    pub fn retention_horizon_ms(&self) -> i64 {
        self.retention.retention_days as i64 * 24 * 60 * 60 * 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        symbols = ["btcusdt", "ETHUSDT"]
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = ServiceConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.base_interval, "1m");
        assert_eq!(config.timeframes.len(), 6);
        assert_eq!(config.backfill.page_limit, 1000);
        assert_eq!(config.retention_horizon_ms(), 7 * 24 * 60 * 60 * 1000);
        assert_eq!(config.backfill_horizon_ms(), 720 * 60 * 60 * 1000);
        assert!(config.symbols.contains(&"BTCUSDT".to_string()));
    }

    #[test]
    fn test_rejects_invalid_timeframes() {
        let bad = r#"
            symbols = ["BTCUSDT"]
            timeframes = ["5m", "7x"]
        "#;
        assert!(matches!(ServiceConfig::from_toml_str(bad), Err(AppError::ConfigError(_))));

        let not_multiple = r#"
            symbols = ["BTCUSDT"]
            base_interval = "2m"
            timeframes = ["5m"]
        "#;
        assert!(ServiceConfig::from_toml_str(not_multiple).is_err());
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let page = r#"
            symbols = ["BTCUSDT"]
            [backfill]
            page_limit = 1500
        "#;
        assert!(ServiceConfig::from_toml_str(page).is_err());

        let backoff = r#"
            symbols = ["BTCUSDT"]
            [scheduler]
            initial_backoff_secs = 100
            max_backoff_secs = 10
        "#;
        assert!(ServiceConfig::from_toml_str(backoff).is_err());

        let addr = r#"
            symbols = ["BTCUSDT"]
            [web]
            listen_addr = "not-an-address"
        "#;
        assert!(ServiceConfig::from_toml_str(addr).is_err());
    }
}
