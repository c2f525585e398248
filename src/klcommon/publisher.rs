//! 发布通道
//!
//! 核心只依赖 `publish(channel, message)` 这一约定；默认实现是进程内的
//! broadcast 广播中心，订阅网关从这里按频道过滤转发。

use crate::klcommon::{AppError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

/// `candle:{symbol}:{timeframe}`
pub fn candle_channel(symbol: &str, timeframe: &str) -> String {
    format!("candle:{}:{}", symbol, timeframe)
}

/// `price:{symbol}`
pub fn price_channel(symbol: &str) -> String {
    format!("price:{}", symbol)
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, channel: &str, message: &str) -> Result<()>;
}

/// 广播中心上传递的一条消息
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub channel: String,
    pub payload: String,
}

/// 基于 tokio broadcast 的进程内发布中心
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<Arc<PublishedMessage>>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<PublishedMessage>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl Publisher for BroadcastPublisher {
    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        if channel.is_empty() {
            return Err(AppError::PublishError("频道名不能为空".to_string()));
        }

        let message = Arc::new(PublishedMessage {
            channel: channel.to_string(),
            payload: message.to_string(),
        });

        // 没有订阅者时 send 返回 Err，这不是失败
        if self.sender.send(message).is_err() {
            tracing::trace!(target: "publisher", channel, "当前没有订阅者，消息被丢弃");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names() {
        assert_eq!(candle_channel("BTCUSDT", "5m"), "candle:BTCUSDT:5m");
        assert_eq!(price_channel("ETHUSDT"), "price:ETHUSDT");
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_all_subscribers() {
        let publisher = BroadcastPublisher::new(16);
        let mut first = publisher.subscribe();
        let mut second = publisher.subscribe();
        assert_eq!(publisher.subscriber_count(), 2);

        publisher.publish("price:BTCUSDT", "{\"price\":1.0}").await.unwrap();

        let a = first.recv().await.unwrap();
        let b = second.recv().await.unwrap();
        assert_eq!(a.channel, "price:BTCUSDT");
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let publisher = BroadcastPublisher::new(4);
        assert!(publisher.publish("candle:BTCUSDT:5m", "{}").await.is_ok());
        assert!(publisher.publish("", "{}").await.is_err());
    }
}
