use serde::{Deserialize, Serialize};

/// 行情源推送的一根基础周期K线事件（可能尚未收盘）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEvent {
    pub symbol: String,
    pub timestamp_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub closed: bool,
}

/// 持久化的基础周期K线 - 数据库存储格式，唯一键 `(symbol, timestamp)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    /// K线开盘时间（毫秒）
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Kline {
    /// 从币安REST原始K线数组创建K线对象
    ///
    /// 格式: `[open_time, "open", "high", "low", "close", "volume", ...]`，
    /// 价格既可能是字符串也可能是数字
    pub fn from_raw_kline(raw: &[serde_json::Value]) -> Option<Self> {
        if raw.len() < 6 {
            return None;
        }

        fn number(value: &serde_json::Value) -> Option<f64> {
            match value {
                serde_json::Value::String(s) => s.parse().ok(),
                other => other.as_f64(),
            }
        }

        Some(Self {
            open_time: raw[0].as_i64()?,
            open: number(&raw[1])?,
            high: number(&raw[2])?,
            low: number(&raw[3])?,
            close: number(&raw[4])?,
            volume: number(&raw[5])?,
        })
    }
}

impl From<&FeedEvent> for Kline {
    fn from(event: &FeedEvent) -> Self {
        Self {
            open_time: event.timestamp_ms,
            open: event.open,
            high: event.high,
            low: event.low,
            close: event.close,
            volume: event.volume,
        }
    }
}

/// 某个周期的K线（合成结果），`bucket_start` 总是对齐到周期时长
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: String,
    pub bucket_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub closed: bool,
}

/// 桶内已收盘基础K线的聚合结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClosedAggregate {
    pub first_open: f64,
    pub max_high: f64,
    pub min_low: f64,
    pub total_volume: f64,
    pub count: i64,
}

/// 推送消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandleMessageType {
    #[serde(rename = "candle")]
    Live,
    #[serde(rename = "candle_closed")]
    Closed,
}

/// `candle:{symbol}:{timeframe}` 频道上的消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleMessage {
    #[serde(rename = "type")]
    pub kind: CandleMessageType,
    pub symbol: String,
    pub timeframe: String,
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_closed: bool,
}

impl CandleMessage {
    pub fn new(kind: CandleMessageType, candle: &Candle) -> Self {
        Self {
            kind,
            symbol: candle.symbol.clone(),
            timeframe: candle.timeframe.clone(),
            timestamp: candle.bucket_start,
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
            is_closed: candle.closed,
        }
    }
}

/// `price:{symbol}` 频道上的最新价
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: String,
    pub price: f64,
    pub timestamp: i64,
    pub source: String,
}

/// 基础表统计信息
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TableStats {
    pub total_rows: i64,
    pub oldest_timestamp: Option<i64>,
    pub newest_timestamp: Option<i64>,
    pub total_symbols: i64,
    pub size_bytes: i64,
}

impl TableStats {
    pub fn days_of_data(&self) -> i64 {
        match (self.oldest_timestamp, self.newest_timestamp) {
            (Some(oldest), Some(newest)) => (newest - oldest) / (24 * 60 * 60 * 1000),
            _ => 0,
        }
    }
}
