//! 统一日志系统初始化模块
//!
//! 两个二进制共用：控制台输出 + 按天滚动的文件日志。

use crate::klcommon::config::LoggingConfig;
use crate::klcommon::{AppError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// 构造业务日志过滤器，RUST_LOG 优先于配置文件
pub fn build_filter_directives(config: &LoggingConfig) -> String {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    format!("{},hyper=warn,reqwest=warn,rusqlite=warn,r2d2=warn", log_level)
}

/// 初始化日志系统
///
/// 返回的 guard 必须由 main 持有到进程结束，否则文件日志会丢失尾部内容。
pub fn init_logging(config: &LoggingConfig) -> Result<WorkerGuard> {
    if let Err(e) = std::fs::create_dir_all(&config.log_dir) {
        eprintln!("警告：无法创建日志目录 {}: {}", config.log_dir, e);
    }

    let directives = build_filter_directives(config);

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, &config.file_prefix);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .with_filter(EnvFilter::new(&directives));

    let console_layer = if config.console {
        Some(
            fmt::layer()
                .with_target(true)
                .with_filter(EnvFilter::new(&directives)),
        )
    } else {
        None
    };

    Registry::default()
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| AppError::ConfigError(format!("日志系统初始化失败: {}", e)))?;

    tracing::info!(target: "logging", log_type = "low_freq", log_dir = %config.log_dir, "统一日志系统初始化完成");
    Ok(guard)
}
