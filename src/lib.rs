// 导出模块
pub mod klcommon;
pub mod kldata;
pub mod klserver;

pub use klcommon::error::AppError;
