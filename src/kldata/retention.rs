//! 基础表数据保留
//!
//! 删除 `timestamp < now - 保留时长` 的基础K线，派生视图不受影响。

use crate::klcommon::{Database, Result, TableStats};
use std::sync::Arc;
use tracing::{info, instrument, warn};

#[derive(Debug)]
pub struct RetentionReport {
    pub cutoff_ms: i64,
    pub deleted: usize,
    pub before: Option<TableStats>,
    pub after: Option<TableStats>,
}

pub struct RetentionManager {
    db: Arc<Database>,
    horizon_ms: i64,
}

impl RetentionManager {
    pub fn new(db: Arc<Database>, horizon_ms: i64) -> Self {
        Self { db, horizon_ms }
    }

    pub fn cutoff(&self, now_ms: i64) -> i64 {
        now_ms - self.horizon_ms
    }

    /// 执行一次清理；统计信息读取失败只记日志，删除失败返回错误
    #[instrument(target = "retention", skip(self), err)]
    pub async fn run_once(&self, now_ms: i64) -> Result<RetentionReport> {
        let cutoff_ms = self.cutoff(now_ms);

        let before = self.stats("清理前").await;
        let deleted = self.db.delete_klines_before(cutoff_ms).await?;
        let after = self.stats("清理后").await;

        info!(
            target: "retention",
            log_type = "low_freq",
            cutoff_ms,
            deleted,
            rows_after = after.as_ref().map(|s| s.total_rows),
            days_after = after.as_ref().map(|s| s.days_of_data()),
            "🧹 基础表过期数据清理完成"
        );

        Ok(RetentionReport { cutoff_ms, deleted, before, after })
    }

    async fn stats(&self, stage: &str) -> Option<TableStats> {
        match self.db.get_table_stats().await {
            Ok(stats) => {
                info!(
                    target: "retention",
                    stage,
                    total_rows = stats.total_rows,
                    total_symbols = stats.total_symbols,
                    oldest = ?stats.oldest_timestamp,
                    newest = ?stats.newest_timestamp,
                    size_mb = stats.size_bytes as f64 / (1024.0 * 1024.0),
                    "基础表统计"
                );
                Some(stats)
            }
            Err(e) => {
                warn!(
                    target: "retention",
                    stage,
                    error.summary = e.get_error_type_summary(),
                    error.details = %e,
                    "读取基础表统计失败"
                );
                None
            }
        }
    }
}
