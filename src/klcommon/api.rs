use crate::klcommon::config::BackfillConfig;
use crate::klcommon::{AppError, Kline, Result};
use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn, Instrument};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

/// 日志中保留的响应正文字符数
const RESPONSE_PREVIEW_CHARS: usize = 200;

/// 按字符截取响应正文，避免在多字节字符中间切断
fn response_preview(text: &str) -> String {
    text.chars().take(RESPONSE_PREVIEW_CHARS).collect()
}

/// 一次分页下载请求，时间区间两端均包含
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadTask {
    pub symbol: String,
    pub interval: String,
    pub start_time: i64,
    pub end_time: i64,
    pub limit: usize,
}

/// 历史K线数据源
///
/// 返回的K线按开盘时间升序；空结果表示该区间没有数据。
#[async_trait]
pub trait HistoricalSource: Send + Sync {
    /// 单次请求允许的最大K线根数
    fn page_limit(&self) -> usize;

    async fn download_klines(&self, task: &DownloadTask) -> Result<Vec<Kline>>;
}

/// 币安现货REST API客户端
#[derive(Clone, Debug)]
pub struct BinanceApi {
    api_url: String,
    client: Client,
    page_limit: usize,
    max_retries: usize,
    retry_delay: Duration,
}

impl BinanceApi {
    /// 创建新的API客户端实例
    #[instrument(target = "api", skip_all, fields(api_url = %config.api_url), err)]
    pub fn new(config: &BackfillConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::ApiError(format!("创建HTTP客户端失败: {}", e)))?;

        info!(target: "api", log_type = "module", "🌐 初始化币安API客户端，端点: {}", config.api_url);
        Ok(Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            client,
            page_limit: config.page_limit,
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        })
    }

    /// 单次请求，不做重试
    async fn download_once(&self, task: &DownloadTask) -> Result<Vec<Kline>> {
        let url = format!("{}/api/v3/klines", self.api_url);

        let response = self.client
            .get(&url)
            .query(&[
                ("symbol", task.symbol.clone()),
                ("interval", task.interval.clone()),
                ("startTime", task.start_time.to_string()),
                ("endTime", task.end_time.to_string()),
                ("limit", task.limit.to_string()),
            ])
            .send()
            .await?;

        let status_check = response.error_for_status_ref().map(|_| ());
        if let Err(status_error) = status_check {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            error!(target: "api", log_type = "module", "下载 {} 的K线失败: {} - {}", task.symbol, status, text);
            return Err(AppError::HttpError(status_error));
        }

        let response_text = response.text().await?;
        let raw_klines: Vec<Vec<Value>> = serde_json::from_str(&response_text).map_err(|e| {
            error!(
                target: "api",
                "{}: 解析K线JSON失败: {}, 响应前200个字符: {}",
                task.symbol, e, response_preview(&response_text)
            );
            AppError::JsonError(e)
        })?;

        let klines: Vec<Kline> = raw_klines
            .iter()
            .filter_map(|raw| Kline::from_raw_kline(raw))
            .collect();

        if klines.len() != raw_klines.len() {
            warn!(
                target: "api",
                symbol = %task.symbol,
                parsed_count = klines.len(),
                raw_count = raw_klines.len(),
                "部分K线数据解析失败，可能存在格式问题"
            );
        }

        Ok(klines)
    }
}

#[async_trait]
impl HistoricalSource for BinanceApi {
    fn page_limit(&self) -> usize {
        self.page_limit
    }

    /// 下载一页K线，传输层的临时性错误按固定间隔有限次重试
    #[instrument(target = "api", skip(self, task), fields(symbol = %task.symbol, start_time = task.start_time, end_time = task.end_time), err)]
    async fn download_klines(&self, task: &DownloadTask) -> Result<Vec<Kline>> {
        let attempts = self.max_retries + 1;
        let retry_loop_span = tracing::info_span!(
            "kline_download_retry_loop",
            iterator_type = "retry_attempt",
            task_count = attempts,
            concurrency = 1
        );

        async {
            let mut attempt = 1;
            loop {
                match self.download_once(task).await {
                    Ok(klines) => {
                        debug!(target: "api", decision = "download_success", attempt, kline_count = klines.len(), "K线下载成功");
                        return Ok(klines);
                    }
                    Err(e) if e.is_retryable() && attempt < attempts => {
                        warn!(
                            target: "api",
                            attempt,
                            max_attempts = attempts,
                            error.summary = e.get_error_type_summary(),
                            error.details = %e,
                            "K线下载失败，等待后重试"
                        );
                        tokio::time::sleep(self.retry_delay).await;
                        attempt += 1;
                    }
                    Err(e) => {
                        error!(
                            target: "api",
                            attempt,
                            error.summary = e.get_error_type_summary(),
                            error.details = %e,
                            "K线下载最终失败"
                        );
                        return Err(e);
                    }
                }
            }
        }
        .instrument(retry_loop_span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_preview_keeps_char_boundaries() {
        // 每个汉字3字节，第200字节落在字符中间
        let body = "网关错误".repeat(100);
        let preview = response_preview(&body);
        assert_eq!(preview.chars().count(), RESPONSE_PREVIEW_CHARS);
        assert!(body.starts_with(&preview));

        assert_eq!(response_preview("[]"), "[]");
    }
}
