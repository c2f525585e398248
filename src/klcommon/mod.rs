// 导出共享模块
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod logging_setup;
pub mod models;
pub mod publisher;
pub mod registry;
pub mod timeframe;

// 重新导出常用类型，方便使用
pub use api::{BinanceApi, DownloadTask, HistoricalSource};
pub use config::ServiceConfig;
pub use db::Database;
pub use error::{AppError, Result};
pub use models::{Candle, CandleMessage, CandleMessageType, ClosedAggregate, FeedEvent, Kline, PriceTick, TableStats};
pub use publisher::{BroadcastPublisher, Publisher};
pub use registry::SymbolRegistry;
pub use timeframe::{bucket_start, Timeframe, TimeframeSet};
