// 导出服务器相关模块
pub mod web;

pub use web::{start_web_server, GatewayState};
