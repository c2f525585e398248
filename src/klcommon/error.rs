use thiserror::Error;
use std::net::AddrParseError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("Timeout: {0}")]
    TimeoutError(String),

    #[error("Publish error: {0}")]
    PublishError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Address parse error: {0}")]
    AddrParseError(#[from] AddrParseError),

    #[error("Web server error: {0}")]
    WebServerError(String),
}

impl AppError {
    /// 获取错误类型的简洁摘要，作为日志中的 `error.summary` 字段
    ///
    /// 返回稳定的业务导向分类字符串，便于按类别聚合错误
    pub fn get_error_type_summary(&self) -> &'static str {
        match self {
            // K线数据获取
            AppError::ApiError(_) => "kline_data_acquisition_failed",
            AppError::HttpError(_) => "market_data_connection_failed",
            AppError::TimeoutError(_) => "market_data_request_timeout",

            // K线数据处理
            AppError::JsonError(_) => "kline_data_parsing_failed",
            AppError::CsvError(_) => "kline_replay_parsing_failed",
            AppError::DataError(_) => "kline_data_validation_failed",

            // K线数据存储
            AppError::DatabaseError(_) => "kline_data_persistence_failed",
            AppError::SqliteError(_) => "kline_storage_operation_failed",
            AppError::PoolError(_) => "kline_storage_pool_exhausted",

            // 下游发布
            AppError::PublishError(_) => "kline_publish_failed",
            AppError::WebServerError(_) => "kline_subscriber_gateway_failed",

            // 系统资源
            AppError::IoError(_) => "kline_file_operation_failed",
            AppError::ChannelError(_) => "kline_processing_pipeline_failed",

            // 配置
            AppError::ConfigError(_) |
            AppError::TomlError(_) |
            AppError::AddrParseError(_) => "kline_service_configuration_invalid",
        }
    }

    /// 检查错误是否为可重试类型
    ///
    /// 只有传输层的临时性错误才会被 REST 客户端有限次重试
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::HttpError(e) => {
                // 4xx 属于请求本身的问题，重试没有意义
                !e.status().map(|s| s.is_client_error()).unwrap_or(false)
            },
            AppError::ApiError(_) |
            AppError::TimeoutError(_) => true,

            AppError::DatabaseError(msg) => {
                msg.contains("locked") || msg.contains("busy")
            },
            AppError::PoolError(_) => true,

            AppError::IoError(_) |
            AppError::JsonError(_) |
            AppError::CsvError(_) |
            AppError::TomlError(_) |
            AppError::ConfigError(_) |
            AppError::DataError(_) |
            AppError::SqliteError(_) |
            AppError::PublishError(_) |
            AppError::ChannelError(_) |
            AppError::AddrParseError(_) |
            AppError::WebServerError(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
