//! 行情事件分发
//!
//! 每个交易对一个 worker task 和一个有界 mpsc 通道：同一交易对的事件严格串行处理，
//! 不同交易对之间并行。worker 在处理前用 `SequenceGuard` 过滤乱序和重复的事件，
//! 事件处理完成后才推进 guard 的状态。

use crate::kldata::aggregator::{validate_event, KlineAggregator};
use crate::klcommon::{AppError, FeedEvent, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// 单个交易对的事件顺序检查结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceDecision {
    Accept,
    /// 基础桶早于已接受的最新桶
    Stale,
    /// 同一个桶已经收到过收盘事件
    DuplicateClose,
}

/// 记录每个交易对最新处理完成的基础桶
///
/// 同一桶的未收盘更新可以重复到达，收盘K线落库成功之后该桶的任何事件都被丢弃。
#[derive(Debug, Default)]
pub struct SequenceGuard {
    last_bucket: Option<i64>,
    last_closed: bool,
}

impl SequenceGuard {
    pub fn check(&self, bucket: i64) -> SequenceDecision {
        match self.last_bucket {
            Some(last) if bucket < last => SequenceDecision::Stale,
            Some(last) if bucket == last && self.last_closed => SequenceDecision::DuplicateClose,
            _ => SequenceDecision::Accept,
        }
    }

    /// 记录已处理的事件；`closed_persisted` 只有在收盘K线成功落库时为 true
    pub fn record(&mut self, bucket: i64, closed_persisted: bool) {
        self.last_bucket = Some(bucket);
        self.last_closed = closed_persisted;
    }
}

/// 按交易对分发事件到各自的 worker
pub struct FeedDispatcher {
    senders: HashMap<String, mpsc::Sender<FeedEvent>>,
    handles: Vec<JoinHandle<()>>,
}

impl FeedDispatcher {
    /// 为每个交易对启动一个 worker
    pub fn start(aggregator: Arc<KlineAggregator>, symbols: &[String], capacity: usize) -> Self {
        let mut senders = HashMap::with_capacity(symbols.len());
        let mut handles = Vec::with_capacity(symbols.len());

        for symbol in symbols {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            let span = tracing::info_span!("symbol_worker", symbol = %symbol);
            let handle = tokio::spawn(run_symbol_worker(Arc::clone(&aggregator), rx).instrument(span));
            senders.insert(symbol.clone(), tx);
            handles.push(handle);
        }

        info!(target: "ingest", log_type = "module", worker_count = handles.len(), "行情分发器启动");
        Self { senders, handles }
    }

    /// 投递一个事件；未注册交易对或 worker 已退出时报错
    pub async fn dispatch(&self, event: FeedEvent) -> Result<()> {
        let sender = self
            .senders
            .get(&event.symbol)
            .ok_or_else(|| AppError::DataError(format!("未注册的交易对: {}", event.symbol)))?;

        sender
            .send(event)
            .await
            .map_err(|e| AppError::ChannelError(format!("{} 的 worker 已退出", e.0.symbol)))
    }

    /// 从外部行情通道持续读取并分发，通道关闭后返回
    pub async fn run_feed(&self, mut feed: mpsc::Receiver<FeedEvent>) {
        while let Some(event) = feed.recv().await {
            if let Err(e) = self.dispatch(event).await {
                warn!(
                    target: "ingest",
                    message = "行情事件分发失败",
                    error.summary = e.get_error_type_summary(),
                    error.details = %e
                );
            }
        }
        info!(target: "ingest", log_type = "module", "行情通道已关闭");
    }

    /// 关闭所有通道并等待 worker 处理完剩余事件
    pub async fn shutdown(self) {
        drop(self.senders);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(target: "ingest", "worker 异常退出: {}", e);
            }
        }
    }
}

async fn run_symbol_worker(aggregator: Arc<KlineAggregator>, mut rx: mpsc::Receiver<FeedEvent>) {
    let mut guard = SequenceGuard::default();
    let base = aggregator.timeframes().base().clone();

    while let Some(event) = rx.recv().await {
        let bucket = base.bucket_start(event.timestamp_ms);

        // 无效事件不推进 guard，修正后的重发仍可被接受
        if let Err(e) = validate_event(&event) {
            warn!(
                target: "ingest",
                message = "行情事件校验失败",
                bucket,
                error.summary = e.get_error_type_summary(),
                error.details = %e
            );
            continue;
        }

        let decision = guard.check(bucket);
        if decision != SequenceDecision::Accept {
            debug!(target: "ingest", ?decision, bucket, closed = event.closed, "丢弃乱序或重复的事件");
            continue;
        }

        match aggregator.process_event(&event).await {
            Ok(report) => {
                // 落库失败的收盘K线按未收盘记录，重投时会再次写入
                let closed_persisted = matches!(report.persisted, Some(Ok(_)));
                guard.record(bucket, closed_persisted);

                let failures = report.failure_count();
                if failures > 0 {
                    warn!(target: "ingest", bucket, failures, "部分周期处理失败");
                }
            }
            Err(e) => {
                error!(
                    target: "ingest",
                    bucket,
                    error.summary = e.get_error_type_summary(),
                    error.details = %e,
                    "行情事件被拒绝"
                );
            }
        }
    }
}
