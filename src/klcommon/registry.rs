//! 交易对注册表
//!
//! 启动时构建一次 symbol -> coin_id 映射，之后以 `Arc<SymbolRegistry>` 只读共享。

use crate::klcommon::{AppError, Database, Result};
use std::collections::HashMap;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct SymbolRegistry {
    ids: HashMap<String, i64>,
    /// 保持配置中的顺序，便于稳定地遍历
    symbols: Vec<String>,
}

impl SymbolRegistry {
    /// 为每个配置的交易对确保 coins 行存在，并缓存其 id
    pub fn load(db: &Database, symbols: &[String]) -> Result<Self> {
        let mut ids = HashMap::with_capacity(symbols.len());
        for symbol in symbols {
            let id = db.ensure_coin(symbol)?;
            ids.insert(symbol.clone(), id);
        }

        info!(target: "registry", log_type = "module", symbol_count = ids.len(), "交易对注册表加载完成");
        Ok(Self {
            ids,
            symbols: symbols.to_vec(),
        })
    }

    pub fn coin_id(&self, symbol: &str) -> Option<i64> {
        self.ids.get(symbol).copied()
    }

    /// 与 `coin_id` 相同，但未注册时返回 `DataError`
    pub fn require(&self, symbol: &str) -> Result<i64> {
        self.coin_id(symbol)
            .ok_or_else(|| AppError::DataError(format!("未注册的交易对: {}", symbol)))
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}
