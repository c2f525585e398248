// 订阅网关：按频道转发发布中心的消息
use crate::kldata::LiveCandleCache;
use crate::klcommon::{AppError, BroadcastPublisher, Result};
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

use super::handlers;

/// 网关共享状态
#[derive(Clone)]
pub struct GatewayState {
    pub publisher: BroadcastPublisher,
    pub live_cache: Arc<LiveCandleCache>,
}

pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", get(handlers::ws_handler))
        .route("/health", get(handlers::health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// 在已绑定的监听器上运行网关，测试中可绑定到随机端口
pub async fn serve(listener: tokio::net::TcpListener, state: GatewayState) -> Result<()> {
    let app = build_router(state);
    axum::serve(listener, app).await.map_err(|e| {
        error!(target: "WebServer", error = ?e, "订阅网关遇到致命错误");
        AppError::WebServerError(format!("Web服务器错误: {}", e))
    })
}

/// 绑定配置的地址并启动网关
#[instrument(target = "WebServer", skip(state))]
pub async fn start_web_server(listen_addr: &str, state: GatewayState) -> Result<()> {
    let addr: SocketAddr = listen_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::WebServerError(format!("绑定地址 {} 失败: {}", addr, e)))?;

    info!(target: "WebServer", log_type = "low_freq", addr = %addr, "订阅网关已启动");
    serve(listener, state).await
}
