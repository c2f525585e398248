//! CSV 行情回放
//!
//! 列：`symbol,timestamp_ms,open,high,low,close,volume,closed`。
//! 用于在没有实时行情连接时驱动合成引擎，也用于离线验证。

use crate::klcommon::{AppError, FeedEvent, Result};
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// 从任意 reader 读取回放事件
pub fn read_events<R: Read>(reader: R) -> Result<Vec<FeedEvent>> {
    let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);

    let mut events = Vec::new();
    for (line, record) in csv_reader.deserialize::<FeedEvent>().enumerate() {
        let mut event = record.map_err(|e| {
            AppError::DataError(format!("回放文件第 {} 条记录解析失败: {}", line + 1, e))
        })?;
        event.symbol = event.symbol.to_uppercase();
        events.push(event);
    }
    Ok(events)
}

pub fn load_events<P: AsRef<Path>>(path: P) -> Result<Vec<FeedEvent>> {
    let file = std::fs::File::open(path.as_ref())?;
    let events = read_events(file)?;
    info!(
        target: "replay",
        log_type = "module",
        path = %path.as_ref().display(),
        event_count = events.len(),
        "回放文件加载完成"
    );
    Ok(events)
}

/// 按给定间隔把事件送入行情通道
pub async fn replay_into(events: Vec<FeedEvent>, feed: mpsc::Sender<FeedEvent>, pace: Duration) -> usize {
    let mut sent = 0;
    for event in events {
        if feed.send(event).await.is_err() {
            warn!(target: "replay", sent, "行情通道已关闭，回放提前结束");
            break;
        }
        sent += 1;
        if !pace.is_zero() {
            tokio::time::sleep(pace).await;
        }
    }
    info!(target: "replay", log_type = "module", sent, "回放结束");
    sent
}
