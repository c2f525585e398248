// K线合成服务主程序：启动补齐 -> 合成引擎 + 数据保留 + 视图刷新 + 订阅网关
use clap::Parser;
use kline_aggregator::kldata::replay::{load_events, replay_into};
use kline_aggregator::kldata::{
    run_periodic, BackfillOptions, Backoff, FeedDispatcher, KlineAggregator, KlineBackfiller,
    LiveCandleCache, RetentionManager, ViewRefresher,
};
use kline_aggregator::klcommon::logging_setup::init_logging;
use kline_aggregator::klcommon::{
    BinanceApi, BroadcastPublisher, Database, Result, ServiceConfig, SymbolRegistry,
};
use kline_aggregator::klserver::{start_web_server, GatewayState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// 每个交易对 worker 的事件队列长度
const WORKER_QUEUE_CAPACITY: usize = 1024;

/// 外部行情通道长度
const FEED_CAPACITY: usize = 4096;

/// 实时K线缓存过期清理间隔
const LIVE_CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "kline_aggregate_service", about = "多周期K线合成服务")]
struct Cli {
    /// 配置文件路径，未指定时读取 CONFIG_PATH 环境变量或默认路径
    #[arg(long)]
    config: Option<String>,

    /// 从 CSV 文件回放行情事件
    #[arg(long)]
    replay: Option<PathBuf>,

    /// 回放时相邻事件的间隔（毫秒）
    #[arg(long, default_value_t = 0)]
    replay_pace_ms: u64,

    /// 跳过启动时的缺口补齐
    #[arg(long)]
    skip_backfill: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = ServiceConfig::resolve_path(cli.config.as_deref());
    let config = ServiceConfig::from_file(&config_path).map_err(|e| {
        eprintln!("加载配置文件 {} 失败: {}", config_path, e);
        e
    })?;

    // 持有 guard，直到 main 函数结束，确保文件被正确写入
    let _log_guard = init_logging(&config.logging)?;

    let result = run_app(cli, config).await;
    if let Err(e) = &result {
        error!(
            target: "app",
            log_type = "low_freq",
            error.summary = e.get_error_type_summary(),
            error.details = %e,
            "服务异常退出"
        );
    }
    result
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 应用程序的核心业务逻辑
async fn run_app(cli: Cli, config: ServiceConfig) -> Result<()> {
    info!(target: "app", log_type = "low_freq", symbols = ?config.symbols, timeframes = ?config.timeframes, "核心应用逻辑开始执行");

    let timeframes = config.timeframe_set()?;
    let db = Arc::new(Database::open(&config.database, &timeframes)?);
    let registry = Arc::new(SymbolRegistry::load(&db, &config.symbols)?);
    let publisher = BroadcastPublisher::new(config.publisher.channel_capacity);
    let live_cache = Arc::new(LiveCandleCache::new());

    // 1. 启动补齐，失败只影响对应交易对
    if config.backfill.enabled && !cli.skip_backfill {
        let source = Arc::new(BinanceApi::new(&config.backfill)?);
        let backfiller = Arc::new(KlineBackfiller::new(
            db.clone(),
            registry.clone(),
            source,
            BackfillOptions::from_config(&config.backfill),
        ));
        backfiller.run_once(now_ms()).await;
    } else {
        info!(target: "app", decision = "skip_backfill", "跳过启动补齐");
    }

    // 2. 合成引擎 + 按交易对分发
    let aggregator = Arc::new(KlineAggregator::new(
        db.clone(),
        registry.clone(),
        Arc::new(publisher.clone()),
        timeframes,
        live_cache.clone(),
    ));
    let dispatcher = FeedDispatcher::start(aggregator, registry.symbols(), WORKER_QUEUE_CAPACITY);

    // 3. 后台周期任务
    if config.retention.enabled {
        let retention = Arc::new(RetentionManager::new(db.clone(), config.retention_horizon_ms()));
        tokio::spawn(run_periodic(
            "retention",
            Duration::from_secs(config.retention.interval_hours * 3600),
            Backoff::from_config(&config.scheduler),
            move || {
                let retention = retention.clone();
                async move { retention.run_once(now_ms()).await.map(|_| ()) }
            },
        ));
    }

    if config.refresh.enabled {
        let refresher = Arc::new(ViewRefresher::new(db.clone()));
        tokio::spawn(run_periodic(
            "view_refresh",
            Duration::from_secs(config.refresh.interval_minutes * 60),
            Backoff::from_config(&config.scheduler),
            move || {
                let refresher = refresher.clone();
                async move { refresher.run_once().await.into_result() }
            },
        ));
    }

    {
        let live_cache = live_cache.clone();
        tokio::spawn(run_periodic(
            "live_cache_purge",
            LIVE_CACHE_PURGE_INTERVAL,
            Backoff::from_config(&config.scheduler),
            move || {
                let live_cache = live_cache.clone();
                async move {
                    live_cache.purge_expired();
                    Ok(())
                }
            },
        ));
    }

    // 4. 订阅网关
    if config.web.enabled {
        let state = GatewayState {
            publisher: publisher.clone(),
            live_cache: live_cache.clone(),
        };
        let listen_addr = config.web.listen_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = start_web_server(&listen_addr, state).await {
                error!(target: "app", message = "订阅网关退出", error.details = %e);
            }
        });
    }

    // 5. 行情输入
    let (feed_tx, feed_rx) = mpsc::channel(FEED_CAPACITY);
    let _idle_feed = match &cli.replay {
        Some(path) => {
            let events = load_events(path)?;
            tokio::spawn(replay_into(events, feed_tx, Duration::from_millis(cli.replay_pace_ms)));
            None
        }
        None => {
            warn!(target: "app", "未指定行情输入，仅运行后台任务");
            Some(feed_tx)
        }
    };

    tokio::select! {
        _ = dispatcher.run_feed(feed_rx) => {
            info!(target: "app", log_type = "low_freq", "行情输入结束，等待退出信号");
            tokio::signal::ctrl_c().await?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
        }
    }

    info!(target: "app", log_type = "low_freq", "收到退出信号，等待 worker 处理完剩余事件");
    dispatcher.shutdown().await;
    info!(target: "app", log_type = "low_freq", "核心应用逻辑成功完成");
    Ok(())
}
