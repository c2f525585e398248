// 一次性K线补齐工具：补齐基础表缺口，可选地随后刷新派生视图
use clap::Parser;
use kline_aggregator::kldata::{BackfillOptions, KlineBackfiller, ViewRefresher};
use kline_aggregator::klcommon::logging_setup::init_logging;
use kline_aggregator::klcommon::{
    AppError, BinanceApi, Database, Result, ServiceConfig, SymbolRegistry,
};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "kline_backfill", about = "一次性补齐基础周期K线缺口")]
struct Cli {
    /// 配置文件路径
    #[arg(long)]
    config: Option<String>,

    /// 覆盖配置中的回溯时长（小时）
    #[arg(long)]
    horizon_hours: Option<u64>,

    /// 补齐完成后刷新派生视图
    #[arg(long)]
    refresh: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ServiceConfig::from_file(ServiceConfig::resolve_path(cli.config.as_deref()))?;
    if let Some(hours) = cli.horizon_hours {
        config.backfill.horizon_hours = hours;
    }

    let _log_guard = init_logging(&config.logging)?;
    run_app(cli.refresh, config).await
}

async fn run_app(refresh: bool, config: ServiceConfig) -> Result<()> {
    info!(target: "app", log_type = "low_freq", horizon_hours = config.backfill.horizon_hours, "开始一次性补齐");

    let timeframes = config.timeframe_set()?;
    let db = Arc::new(Database::open(&config.database, &timeframes)?);
    let registry = Arc::new(SymbolRegistry::load(&db, &config.symbols)?);
    let source = Arc::new(BinanceApi::new(&config.backfill)?);

    let backfiller = Arc::new(KlineBackfiller::new(
        db.clone(),
        registry,
        source,
        BackfillOptions::from_config(&config.backfill),
    ));
    let report = backfiller.run_once(chrono::Utc::now().timestamp_millis()).await;

    if refresh {
        ViewRefresher::new(db).run_once().await.into_result()?;
    }

    let failed: Vec<&str> = report.failures().map(|r| r.symbol.as_str()).collect();
    if !failed.is_empty() {
        return Err(AppError::DataError(format!("以下交易对补齐失败: {}", failed.join(", "))));
    }

    info!(target: "app", log_type = "low_freq", total_inserted = report.total_inserted(), "补齐完成");
    Ok(())
}
