// 导出数据服务相关模块
pub mod aggregator;
pub mod backfill;
pub mod ingest;
pub mod refresher;
pub mod replay;
pub mod retention;
pub mod scheduler;

// 重新导出常用类型，方便使用
pub use aggregator::{AggregationReport, KlineAggregator, LiveCandleCache};
pub use backfill::{BackfillOptions, BackfillReport, BackfillStatus, KlineBackfiller};
pub use ingest::FeedDispatcher;
pub use refresher::{RefreshReport, ViewRefresher};
pub use retention::{RetentionManager, RetentionReport};
pub use scheduler::{run_periodic, Backoff};
