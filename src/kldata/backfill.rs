//! 启动时的缺口补齐
//!
//! 每个交易对独立计算缺口 `[最新已存时间 + 1个基础周期, now)`，按分页从历史数据源
//! 拉取已收盘K线并幂等写入基础表。交易对之间并发执行，单个失败不影响其他交易对。

use crate::klcommon::config::BackfillConfig;
use crate::klcommon::{
    AppError, Database, DownloadTask, HistoricalSource, Kline, Result, SymbolRegistry, Timeframe,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn, Instrument};

/// 需要补齐的时间区间，`[start_ms, end_ms)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl Gap {
    /// 区间内最后一根已收盘基础K线的开盘时间
    pub fn last_closed_bucket(&self, unit_ms: i64) -> i64 {
        crate::klcommon::bucket_start(self.end_ms, unit_ms) - unit_ms
    }
}

/// 计算缺口
///
/// 不足一个基础周期时返回 None。
pub fn compute_gap(latest_ms: Option<i64>, now_ms: i64, horizon_ms: i64, unit_ms: i64) -> Option<Gap> {
    let start_ms = match latest_ms {
        Some(latest) => latest + unit_ms,
        None => crate::klcommon::bucket_start(now_ms - horizon_ms, unit_ms),
    };

    if now_ms - start_ms < unit_ms {
        return None;
    }

    Some(Gap { start_ms, end_ms: now_ms })
}

/// 把 `[first_bucket, last_bucket]`（两端包含）切成每页 `page_limit` 根的分页
pub fn plan_chunks(first_bucket: i64, last_bucket: i64, unit_ms: i64, page_limit: usize) -> Vec<(i64, i64)> {
    let page_span = (page_limit.max(1) as i64 - 1) * unit_ms;
    let mut chunks = Vec::new();
    let mut cursor = first_bucket;
    while cursor <= last_bucket {
        let chunk_end = (cursor + page_span).min(last_bucket);
        chunks.push((cursor, chunk_end));
        cursor = chunk_end + unit_ms;
    }
    chunks
}

/// 单个交易对的补齐结果
#[derive(Debug)]
pub enum BackfillStatus {
    /// 没有缺口
    UpToDate,
    /// 缺口全部补齐
    Complete,
    /// 数据源提前返回空页，缺口只补了一部分
    Partial { stopped_at: i64 },
    Failed(AppError),
}

#[derive(Debug)]
pub struct SymbolBackfill {
    pub symbol: String,
    pub gap: Option<Gap>,
    pub chunks: usize,
    pub inserted: usize,
    pub status: BackfillStatus,
}

impl SymbolBackfill {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, BackfillStatus::Failed(_))
    }
}

#[derive(Debug, Default)]
pub struct BackfillReport {
    pub results: Vec<SymbolBackfill>,
}

impl BackfillReport {
    pub fn total_inserted(&self) -> usize {
        self.results.iter().map(|r| r.inserted).sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &SymbolBackfill> {
        self.results.iter().filter(|r| r.is_failed())
    }

    pub fn get(&self, symbol: &str) -> Option<&SymbolBackfill> {
        self.results.iter().find(|r| r.symbol == symbol)
    }
}

/// 补齐运行参数
#[derive(Debug, Clone)]
pub struct BackfillOptions {
    pub horizon_ms: i64,
    pub chunk_delay: Duration,
    pub chunk_timeout: Duration,
}

impl BackfillOptions {
    pub fn from_config(config: &BackfillConfig) -> Self {
        // 单页超时要覆盖数据源内部的全部重试
        let attempts = config.max_retries as u64 + 1;
        let chunk_timeout = Duration::from_secs(config.request_timeout_secs * attempts)
            + Duration::from_millis(config.retry_delay_ms * config.max_retries as u64);

        Self {
            horizon_ms: config.horizon_hours as i64 * 60 * 60 * 1000,
            chunk_delay: Duration::from_millis(config.chunk_delay_ms),
            chunk_timeout,
        }
    }
}

/// 缺口补齐器
pub struct KlineBackfiller {
    db: Arc<Database>,
    registry: Arc<SymbolRegistry>,
    source: Arc<dyn HistoricalSource>,
    base: Timeframe,
    options: BackfillOptions,
}

impl KlineBackfiller {
    pub fn new(
        db: Arc<Database>,
        registry: Arc<SymbolRegistry>,
        source: Arc<dyn HistoricalSource>,
        options: BackfillOptions,
    ) -> Self {
        let base = db.timeframes().base().clone();
        Self { db, registry, source, base, options }
    }

    /// 对所有注册的交易对并发执行一次补齐
    #[instrument(target = "backfill", skip(self), fields(symbol_count = self.registry.len()))]
    pub async fn run_once(self: &Arc<Self>, now_ms: i64) -> BackfillReport {
        info!(target: "backfill", log_type = "module", "开始补齐K线缺口...");

        let mut handles = Vec::with_capacity(self.registry.len());
        for symbol in self.registry.symbols() {
            let this = Arc::clone(self);
            let task_symbol = symbol.clone();
            let span = tracing::info_span!("backfill_symbol", symbol = %symbol);
            let handle = tokio::spawn(
                async move { this.backfill_symbol(&task_symbol, now_ms).await }.instrument(span),
            );
            handles.push((symbol.clone(), handle));
        }

        let mut report = BackfillReport::default();
        for (symbol, handle) in handles {
            match handle.await {
                Ok(result) => report.results.push(result),
                Err(join_err) => {
                    error!(target: "backfill", symbol = %symbol, "补齐任务异常退出: {}", join_err);
                    report.results.push(SymbolBackfill {
                        symbol,
                        gap: None,
                        chunks: 0,
                        inserted: 0,
                        status: BackfillStatus::Failed(AppError::DataError(format!("补齐任务异常退出: {}", join_err))),
                    });
                }
            }
        }

        let failed = report.failures().count();
        info!(
            target: "backfill",
            log_type = "module",
            total_inserted = report.total_inserted(),
            symbol_count = report.results.len(),
            failed_count = failed,
            "✅ 补齐流程结束"
        );
        for failure in report.failures() {
            if let BackfillStatus::Failed(e) = &failure.status {
                warn!(
                    target: "backfill",
                    symbol = %failure.symbol,
                    inserted = failure.inserted,
                    error.summary = e.get_error_type_summary(),
                    error.details = %e,
                    "交易对补齐失败"
                );
            }
        }
        report
    }

    /// 补齐单个交易对，错误都收敛到返回的 `SymbolBackfill` 里
    pub async fn backfill_symbol(&self, symbol: &str, now_ms: i64) -> SymbolBackfill {
        let mut outcome = SymbolBackfill {
            symbol: symbol.to_string(),
            gap: None,
            chunks: 0,
            inserted: 0,
            status: BackfillStatus::UpToDate,
        };

        if let Err(e) = self.fill_gap(symbol, now_ms, &mut outcome).await {
            outcome.status = BackfillStatus::Failed(e);
        }
        outcome
    }

    async fn fill_gap(&self, symbol: &str, now_ms: i64, outcome: &mut SymbolBackfill) -> Result<()> {
        let coin_id = self.registry.require(symbol)?;
        let unit = self.base.duration_ms;

        let latest = self.db.get_latest_timestamp(coin_id).await?;
        let gap = match compute_gap(latest, now_ms, self.options.horizon_ms, unit) {
            Some(gap) => gap,
            None => {
                debug!(target: "backfill", symbol, decision = "up_to_date", ?latest, "没有需要补齐的缺口");
                return Ok(());
            }
        };
        outcome.gap = Some(gap);

        let last_bucket = gap.last_closed_bucket(unit);
        let chunks = plan_chunks(gap.start_ms, last_bucket, unit, self.source.page_limit());
        info!(
            target: "backfill",
            symbol,
            gap_start = gap.start_ms,
            gap_end = gap.end_ms,
            chunk_count = chunks.len(),
            "发现缺口，开始分页补齐"
        );

        for (index, (chunk_start, chunk_end)) in chunks.iter().copied().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.options.chunk_delay).await;
            }

            let task = DownloadTask {
                symbol: symbol.to_string(),
                interval: self.base.name.clone(),
                start_time: chunk_start,
                end_time: chunk_end,
                limit: self.source.page_limit(),
            };

            let klines = tokio::time::timeout(self.options.chunk_timeout, self.source.download_klines(&task))
                .await
                .map_err(|_| {
                    AppError::TimeoutError(format!(
                        "{}: 分页 [{}, {}] 超过 {:?} 未返回",
                        symbol, chunk_start, chunk_end, self.options.chunk_timeout
                    ))
                })??;
            outcome.chunks += 1;

            // 只保留本页范围内、按基础周期对齐的K线
            let klines: Vec<Kline> = klines
                .into_iter()
                .filter(|k| k.open_time >= chunk_start && k.open_time <= chunk_end && k.open_time.rem_euclid(unit) == 0)
                .collect();

            if klines.is_empty() {
                warn!(
                    target: "backfill",
                    symbol,
                    decision = "stop_on_empty_page",
                    chunk_start,
                    chunk_end,
                    "数据源返回空页，停止该交易对的补齐"
                );
                outcome.status = BackfillStatus::Partial { stopped_at: chunk_start };
                return Ok(());
            }

            outcome.inserted += self.db.upsert_klines(coin_id, klines).await?;
        }

        outcome.status = BackfillStatus::Complete;
        info!(target: "backfill", symbol, inserted = outcome.inserted, "交易对补齐完成");
        Ok(())
    }
}
