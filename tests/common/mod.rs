#![allow(dead_code)]

use async_trait::async_trait;
use kline_aggregator::klcommon::config::DatabaseConfig;
use kline_aggregator::klcommon::{
    AppError, Database, DownloadTask, FeedEvent, HistoricalSource, Kline, Publisher, Result,
    SymbolRegistry, TimeframeSet,
};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const MINUTE: i64 = 60_000;

/// 2023-11-14 22:10:00 UTC，对齐到 5m / 15m / 1h
pub const T0: i64 = 1_700_000_000_000 - 1_700_000_000_000 % (60 * MINUTE);

pub fn test_db_path(name: &str) -> PathBuf {
    PathBuf::from("./target/test_dbs").join(format!("{}.db", name))
}

// 每个测试使用独立的数据库文件
pub fn setup_test_db(name: &str, timeframes: &[&str]) -> Arc<Database> {
    setup_test_db_with_timeout(name, timeframes, 5000)
}

/// `busy_timeout_ms` 调小后，被其他连接锁住的写入会很快失败
pub fn setup_test_db_with_timeout(name: &str, timeframes: &[&str], busy_timeout_ms: u64) -> Arc<Database> {
    let db_path = test_db_path(name);
    if let Some(dir) = db_path.parent() {
        std::fs::create_dir_all(dir).unwrap();
    }

    for suffix in ["", "-wal", "-shm"] {
        let path = PathBuf::from(format!("{}{}", db_path.display(), suffix));
        if path.exists() {
            std::fs::remove_file(&path).unwrap();
        }
    }

    let config = DatabaseConfig {
        database_path: db_path.to_string_lossy().to_string(),
        pool_size: 4,
        busy_timeout_ms,
    };
    let derived: Vec<String> = timeframes.iter().map(|s| s.to_string()).collect();
    let timeframes = TimeframeSet::from_names("1m", &derived).unwrap();
    Arc::new(Database::open(&config, &timeframes).unwrap())
}

/// 用独立连接持有写锁，直到返回的连接被 drop
pub fn hold_write_lock(name: &str) -> rusqlite::Connection {
    let conn = rusqlite::Connection::open(test_db_path(name)).unwrap();
    conn.execute_batch("BEGIN IMMEDIATE").unwrap();
    conn
}

/// 轮询等待条件成立，最多5秒
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("等待条件超时");
}

pub fn setup_registry(db: &Database, symbols: &[&str]) -> Arc<SymbolRegistry> {
    let symbols: Vec<String> = symbols.iter().map(|s| s.to_string()).collect();
    Arc::new(SymbolRegistry::load(db, &symbols).unwrap())
}

pub fn kline(open_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Kline {
    Kline { open_time, open, high, low, close, volume }
}

/// 所有价格都等于 close 的简单K线
pub fn flat_kline(open_time: i64, close: f64) -> Kline {
    kline(open_time, close, close, close, close, 1.0)
}

pub fn feed_event(symbol: &str, timestamp_ms: i64, k: &Kline, closed: bool) -> FeedEvent {
    FeedEvent {
        symbol: symbol.to_string(),
        timestamp_ms,
        open: k.open,
        high: k.high,
        low: k.low,
        close: k.close,
        volume: k.volume,
        closed,
    }
}

/// 记录所有发布消息的发布器
#[derive(Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<(String, serde_json::Value)>>,
    /// 这些频道的发布会失败
    failing_channels: Vec<String>,
}

impl RecordingPublisher {
    pub fn failing_on(channels: &[&str]) -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            failing_channels: channels.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn messages(&self) -> Vec<(String, serde_json::Value)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn on_channel(&self, channel: &str) -> Vec<serde_json::Value> {
        self.messages()
            .into_iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, v)| v)
            .collect()
    }

    pub fn of_type(&self, channel: &str, kind: &str) -> Vec<serde_json::Value> {
        self.on_channel(channel)
            .into_iter()
            .filter(|v| v["type"] == kind)
            .collect()
    }

    pub fn clear(&self) {
        self.messages.lock().unwrap().clear();
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        if self.failing_channels.iter().any(|c| c == channel) {
            return Err(AppError::PublishError(format!("频道 {} 不可用", channel)));
        }
        let value = serde_json::from_str(message)?;
        self.messages.lock().unwrap().push((channel.to_string(), value));
        Ok(())
    }
}

/// 按脚本依次返回结果的历史数据源，同时记录收到的请求
pub struct ScriptedSource {
    page_limit: usize,
    responses: Mutex<VecDeque<Result<Vec<Kline>>>>,
    pub requests: Mutex<Vec<DownloadTask>>,
    /// 脚本耗尽后是否按请求区间自动生成K线
    generate_when_exhausted: bool,
}

impl ScriptedSource {
    pub fn new(page_limit: usize, responses: Vec<Result<Vec<Kline>>>) -> Self {
        Self {
            page_limit,
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            generate_when_exhausted: false,
        }
    }

    /// 对任意请求返回区间内完整的K线
    pub fn generating(page_limit: usize) -> Self {
        Self {
            generate_when_exhausted: true,
            ..Self::new(page_limit, Vec::new())
        }
    }

    pub fn requests(&self) -> Vec<DownloadTask> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HistoricalSource for ScriptedSource {
    fn page_limit(&self) -> usize {
        self.page_limit
    }

    async fn download_klines(&self, task: &DownloadTask) -> Result<Vec<Kline>> {
        self.requests.lock().unwrap().push(task.clone());
        if let Some(response) = self.responses.lock().unwrap().pop_front() {
            return response;
        }
        if self.generate_when_exhausted {
            let mut klines = Vec::new();
            let mut t = task.start_time;
            while t <= task.end_time && klines.len() < task.limit {
                klines.push(flat_kline(t, 100.0 + (t / MINUTE % 10) as f64));
                t += MINUTE;
            }
            return Ok(klines);
        }
        Ok(Vec::new())
    }
}
