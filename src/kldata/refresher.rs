//! 派生周期视图刷新
//!
//! 每个派生周期对应一张 `candle_data_{周期}` 表，从基础表按桶重新聚合后 upsert。
//! 各视图独立刷新，一个失败不阻塞其他视图。

use crate::klcommon::{AppError, Database, Result, Timeframe};
use std::sync::Arc;
use tracing::{error, info, instrument};

#[derive(Debug, Default)]
pub struct RefreshReport {
    /// (视图名, 刷新后的行数)
    pub refreshed: Vec<(String, i64)>,
    pub failures: Vec<(String, AppError)>,
}

impl RefreshReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// 转为调度器使用的结果：只要有视图失败就视为本轮失败
    pub fn into_result(self) -> Result<()> {
        match self.failures.into_iter().next() {
            None => Ok(()),
            Some((view, e)) => Err(AppError::DatabaseError(format!("视图 {} 刷新失败: {}", view, e))),
        }
    }
}

pub struct ViewRefresher {
    db: Arc<Database>,
    timeframes: Vec<Timeframe>,
}

impl ViewRefresher {
    pub fn new(db: Arc<Database>) -> Self {
        let timeframes = db.timeframes().derived().to_vec();
        Self { db, timeframes }
    }

    #[instrument(target = "refresher", skip(self), fields(view_count = self.timeframes.len()))]
    pub async fn run_once(&self) -> RefreshReport {
        let mut report = RefreshReport::default();

        for timeframe in &self.timeframes {
            let view = timeframe.view_name();
            match self.db.refresh_view(timeframe).await {
                Ok(rows) => {
                    info!(target: "refresher", view = %view, rows, "🔄 视图刷新完成");
                    report.refreshed.push((view, rows));
                }
                Err(e) => {
                    error!(
                        target: "refresher",
                        view = %view,
                        error.summary = e.get_error_type_summary(),
                        error.details = %e,
                        "视图刷新失败"
                    );
                    report.failures.push((view, e));
                }
            }
        }

        info!(
            target: "refresher",
            log_type = "low_freq",
            refreshed = report.refreshed.len(),
            failed = report.failures.len(),
            "派生视图刷新轮次结束"
        );
        report
    }
}
