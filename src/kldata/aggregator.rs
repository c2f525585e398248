//! 多周期K线合成
//!
//! 每来一根基础周期K线（无论是否收盘），对每个派生周期：
//! 从库里查询本桶内**已收盘**的基础K线聚合值，再与当前这根合并，得到该周期的当前K线。
//! 不在内存里维护累加器，进程重启后从库里重算得到完全相同的结果。

use crate::klcommon::publisher::{candle_channel, price_channel};
use crate::klcommon::{
    AppError, Candle, CandleMessage, CandleMessageType, ClosedAggregate, Database, FeedEvent, Kline,
    PriceTick, Publisher, Result, SymbolRegistry, Timeframe, TimeframeSet,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// 实时K线缓存的额外存活时间，超过周期时长 + 该值后视为过期
const LIVE_CACHE_GRACE: Duration = Duration::from_secs(60);

/// 价格推送的数据来源标识
const PRICE_SOURCE: &str = "binance";

/// 合并桶内已收盘基础K线与当前基础K线
///
/// `units_per_bucket` 为该周期一个桶需要的基础K线根数。当前K线收盘、且
/// 已收盘根数 + 1 恰好等于该值时，合成K线收盘。
pub fn merge_candle(
    event: &FeedEvent,
    timeframe: &Timeframe,
    bucket_start: i64,
    closed_rows: Option<&ClosedAggregate>,
    units_per_bucket: i64,
) -> Candle {
    let (open, high, low, volume, base_count) = match closed_rows {
        Some(rows) if rows.count > 0 => (
            rows.first_open,
            rows.max_high.max(event.high),
            rows.min_low.min(event.low),
            rows.total_volume + event.volume,
            rows.count,
        ),
        _ => (event.open, event.high, event.low, event.volume, 0),
    };

    Candle {
        symbol: event.symbol.clone(),
        timeframe: timeframe.name.clone(),
        bucket_start,
        open,
        high,
        low,
        // 收盘价永远取最新一根基础K线
        close: event.close,
        volume,
        closed: event.closed && base_count + 1 == units_per_bucket,
    }
}

/// 校验行情事件的数值
pub(crate) fn validate_event(event: &FeedEvent) -> Result<()> {
    let prices = [event.open, event.high, event.low, event.close];
    if prices.iter().any(|p| !p.is_finite()) || !event.volume.is_finite() {
        return Err(AppError::DataError(format!("{}: K线包含非有限数值", event.symbol)));
    }
    if event.volume < 0.0 {
        return Err(AppError::DataError(format!("{}: 成交量为负: {}", event.symbol, event.volume)));
    }
    if event.high < event.low {
        return Err(AppError::DataError(format!(
            "{}: 最高价 {} 低于最低价 {}", event.symbol, event.high, event.low
        )));
    }
    Ok(())
}

struct LiveEntry {
    candle: Candle,
    expires_at: Instant,
}

/// 每个 (symbol, timeframe) 当前未收盘K线的缓存
///
/// 只用于给新订阅者发送快照；合成本身从不读它。收盘时条目被删除。
#[derive(Default)]
pub struct LiveCandleCache {
    entries: RwLock<HashMap<(String, String), LiveEntry>>,
}

impl LiveCandleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, candle: &Candle, ttl: Duration) {
        let key = (candle.symbol.clone(), candle.timeframe.clone());
        let entry = LiveEntry {
            candle: candle.clone(),
            expires_at: Instant::now() + ttl,
        };
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, entry);
    }

    pub fn get(&self, symbol: &str, timeframe: &str) -> Option<Candle> {
        let entries = self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries
            .get(&(symbol.to_string(), timeframe.to_string()))
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.candle.clone())
    }

    pub fn invalidate(&self, symbol: &str, timeframe: &str) {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&(symbol.to_string(), timeframe.to_string()));
    }

    /// 清理过期条目，返回清理数量
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 一次合成的结果，按周期分别记录成功或失败
#[derive(Debug)]
pub struct AggregationReport {
    pub symbol: String,
    pub base_bucket: i64,
    /// 基础K线收盘时的落库结果；未收盘时为 None
    pub persisted: Option<Result<usize>>,
    /// (周期名, 合成结果)，包含基础周期本身
    pub outcomes: Vec<(String, Result<Candle>)>,
}

impl AggregationReport {
    pub fn candle(&self, timeframe: &str) -> Option<&Candle> {
        self.outcomes
            .iter()
            .find(|(name, _)| name == timeframe)
            .and_then(|(_, result)| result.as_ref().ok())
    }

    pub fn failure_count(&self) -> usize {
        let persist_failed = matches!(self.persisted, Some(Err(_))) as usize;
        persist_failed + self.outcomes.iter().filter(|(_, r)| r.is_err()).count()
    }
}

/// K线合成引擎
pub struct KlineAggregator {
    db: Arc<Database>,
    registry: Arc<SymbolRegistry>,
    publisher: Arc<dyn Publisher>,
    timeframes: TimeframeSet,
    live_cache: Arc<LiveCandleCache>,
}

impl KlineAggregator {
    pub fn new(
        db: Arc<Database>,
        registry: Arc<SymbolRegistry>,
        publisher: Arc<dyn Publisher>,
        timeframes: TimeframeSet,
        live_cache: Arc<LiveCandleCache>,
    ) -> Self {
        Self { db, registry, publisher, timeframes, live_cache }
    }

    pub fn live_cache(&self) -> &Arc<LiveCandleCache> {
        &self.live_cache
    }

    pub fn timeframes(&self) -> &TimeframeSet {
        &self.timeframes
    }

    /// 处理一根基础周期K线
    ///
    /// 只有事件本身无效（未注册的交易对、非法数值）时返回 Err；
    /// 单个周期的失败记录在报告里，不影响其他周期。
    #[instrument(target = "aggregator", skip_all, fields(symbol = %event.symbol, timestamp = event.timestamp_ms, closed = event.closed))]
    pub async fn process_event(&self, event: &FeedEvent) -> Result<AggregationReport> {
        validate_event(event)?;
        let coin_id = self.registry.require(&event.symbol)?;

        let base = self.timeframes.base();
        let base_bucket = base.bucket_start(event.timestamp_ms);

        let persisted = if event.closed {
            let mut kline = Kline::from(event);
            kline.open_time = base_bucket;
            let result = self.db.upsert_klines(coin_id, vec![kline]).await;
            if let Err(e) = &result {
                error!(
                    target: "aggregator",
                    message = "基础K线落库失败",
                    error.summary = e.get_error_type_summary(),
                    error.details = %e
                );
            }
            Some(result)
        } else {
            None
        };

        self.publish_price(event).await;

        let mut outcomes = Vec::with_capacity(self.timeframes.derived().len() + 1);

        // 基础周期本身
        let base_candle = merge_candle(event, base, base_bucket, None, 1);
        let base_result = self.emit(&base_candle, base).await.map(|_| base_candle);
        outcomes.push((base.name.clone(), base_result));

        for timeframe in self.timeframes.derived() {
            let result = self.aggregate_timeframe(coin_id, event, base_bucket, timeframe).await;
            if let Err(e) = &result {
                error!(
                    target: "aggregator",
                    message = "周期K线合成失败",
                    timeframe = %timeframe,
                    error.summary = e.get_error_type_summary(),
                    error.details = %e
                );
            }
            outcomes.push((timeframe.name.clone(), result));
        }

        Ok(AggregationReport {
            symbol: event.symbol.clone(),
            base_bucket,
            persisted,
            outcomes,
        })
    }

    /// 合成单个派生周期
    async fn aggregate_timeframe(
        &self,
        coin_id: i64,
        event: &FeedEvent,
        base_bucket: i64,
        timeframe: &Timeframe,
    ) -> Result<Candle> {
        let bucket_start = timeframe.bucket_start(base_bucket);

        // 区间上界是当前基础K线的桶起点，当前这根无论是否收盘都不会被重复计入
        let closed_rows = self.db.get_closed_aggregate(coin_id, bucket_start, base_bucket).await?;

        let units = self.timeframes.base_units_per(timeframe);
        let candle = merge_candle(event, timeframe, bucket_start, closed_rows.as_ref(), units);

        debug!(
            target: "aggregator",
            timeframe = %timeframe,
            bucket_start,
            observed = closed_rows.map(|r| r.count).unwrap_or(0) + 1,
            required = units,
            closed = candle.closed,
            "周期K线合成完成"
        );

        self.emit(&candle, timeframe).await?;
        Ok(candle)
    }

    /// 推送实时更新；收盘时额外推送收盘事件并删除缓存
    async fn emit(&self, candle: &Candle, timeframe: &Timeframe) -> Result<()> {
        let channel = candle_channel(&candle.symbol, &timeframe.name);

        let live = serde_json::to_string(&CandleMessage::new(CandleMessageType::Live, candle))?;
        self.publisher.publish(&channel, &live).await?;

        if candle.closed {
            let closed = serde_json::to_string(&CandleMessage::new(CandleMessageType::Closed, candle))?;
            self.publisher.publish(&channel, &closed).await?;
            self.live_cache.invalidate(&candle.symbol, &timeframe.name);
            info!(
                target: "aggregator",
                symbol = %candle.symbol,
                timeframe = %timeframe,
                bucket_start = candle.bucket_start,
                "✅ K线收盘"
            );
        } else {
            let ttl = Duration::from_millis(timeframe.duration_ms as u64) + LIVE_CACHE_GRACE;
            self.live_cache.put(candle, ttl);
        }
        Ok(())
    }

    async fn publish_price(&self, event: &FeedEvent) {
        let tick = PriceTick {
            symbol: event.symbol.clone(),
            price: event.close,
            timestamp: event.timestamp_ms,
            source: PRICE_SOURCE.to_string(),
        };
        let result = match serde_json::to_string(&tick) {
            Ok(payload) => self.publisher.publish(&price_channel(&event.symbol), &payload).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(
                target: "aggregator",
                message = "价格推送失败",
                error.summary = e.get_error_type_summary(),
                error.details = %e
            );
        }
    }
}
