mod common;

use common::*;
use kline_aggregator::kldata::{FeedDispatcher, KlineAggregator, LiveCandleCache};
use kline_aggregator::klcommon::{Publisher, TimeframeSet};
use std::sync::Arc;

fn build_aggregator(
    name: &str,
    publisher: Arc<RecordingPublisher>,
) -> (Arc<KlineAggregator>, Arc<kline_aggregator::klcommon::Database>) {
    let db = setup_test_db(name, &["5m", "15m", "1h"]);
    let registry = setup_registry(&db, &["BTCUSDT", "ETHUSDT"]);
    let timeframes: TimeframeSet = db.timeframes().clone();
    let publisher: Arc<dyn Publisher> = publisher;
    let aggregator = KlineAggregator::new(
        db.clone(),
        registry,
        publisher,
        timeframes,
        Arc::new(LiveCandleCache::new()),
    );
    (Arc::new(aggregator), db)
}

#[tokio::test]
async fn test_five_closed_minutes_close_one_five_minute_candle() {
    let publisher = Arc::new(RecordingPublisher::default());
    let (aggregator, _db) = build_aggregator("agg_five_minutes", publisher.clone());

    let closes = [100.0, 101.0, 99.0, 102.0, 103.0];
    for (i, close) in closes.iter().enumerate() {
        let t = T0 + i as i64 * MINUTE;
        let k = flat_kline(t, *close);
        // 先来一条未收盘更新，再来收盘事件
        aggregator.process_event(&feed_event("BTCUSDT", t, &k, false)).await.unwrap();
        let report = aggregator.process_event(&feed_event("BTCUSDT", t, &k, true)).await.unwrap();
        assert_eq!(report.failure_count(), 0, "第 {} 根K线处理出现失败", i + 1);

        let five = report.candle("5m").unwrap();
        assert_eq!(five.bucket_start, T0);
        assert_eq!(five.closed, i == 4, "5m K线只应在第5根收盘时收盘");
    }

    let closed = publisher.of_type("candle:BTCUSDT:5m", "candle_closed");
    assert_eq!(closed.len(), 1, "5m 收盘事件应恰好推送一次");
    let candle = &closed[0];
    assert_eq!(candle["symbol"], "BTCUSDT");
    assert_eq!(candle["timeframe"], "5m");
    assert_eq!(candle["timestamp"], T0);
    assert_eq!(candle["open"], 100.0);
    assert_eq!(candle["high"], 103.0);
    assert_eq!(candle["low"], 99.0);
    assert_eq!(candle["close"], 103.0);
    assert_eq!(candle["volume"], 5.0);
    assert_eq!(candle["is_closed"], true);

    // 每个事件都有一条实时更新
    assert_eq!(publisher.of_type("candle:BTCUSDT:5m", "candle").len(), 10);
    assert!(publisher.of_type("candle:BTCUSDT:15m", "candle_closed").is_empty());
    assert!(publisher.of_type("candle:BTCUSDT:1h", "candle_closed").is_empty());

    // 收盘后缓存被删除，未收盘的周期仍在缓存中
    assert!(aggregator.live_cache().get("BTCUSDT", "5m").is_none());
    let hour = aggregator.live_cache().get("BTCUSDT", "1h").unwrap();
    assert_eq!(hour.volume, 5.0);
    assert_eq!(hour.close, 103.0);
}

#[tokio::test]
async fn test_merge_with_persisted_closed_rows() {
    let publisher = Arc::new(RecordingPublisher::default());
    let (aggregator, db) = build_aggregator("agg_merge", publisher.clone());
    let coin_id = db.ensure_coin("BTCUSDT").unwrap();

    db.upsert_klines(
        coin_id,
        vec![
            kline(T0, 10.0, 10.0, 10.0, 10.0, 1.0),
            kline(T0 + MINUTE, 10.0, 12.0, 12.0, 12.0, 2.0),
            kline(T0 + 2 * MINUTE, 12.0, 9.0, 9.0, 9.0, 3.0),
        ],
    )
    .await
    .unwrap();

    let incoming = kline(T0 + 3 * MINUTE, 9.0, 11.0, 8.0, 10.5, 0.5);
    let report = aggregator
        .process_event(&feed_event("BTCUSDT", T0 + 3 * MINUTE + 15_000, &incoming, false))
        .await
        .unwrap();

    let five = report.candle("5m").unwrap();
    assert_eq!(five.open, 10.0);
    assert_eq!(five.high, 12.0);
    assert_eq!(five.low, 8.0);
    assert_eq!(five.close, 10.5);
    assert_eq!(five.volume, 6.5);
    assert!(!five.closed);

    // 未收盘的基础K线不落库
    assert!(report.persisted.is_none());
    let rows = db.get_klines_in_range(coin_id, T0, T0 + 5 * MINUTE).await.unwrap();
    assert_eq!(rows.len(), 3);
}

#[tokio::test]
async fn test_first_event_after_restart_does_not_close_early() {
    let publisher = Arc::new(RecordingPublisher::default());
    let (aggregator, _db) = build_aggregator("agg_restart", publisher.clone());

    // 库里没有本桶的前4根，收到桶内最后一分钟的收盘事件
    let t = T0 + 4 * MINUTE;
    let report = aggregator
        .process_event(&feed_event("BTCUSDT", t, &flat_kline(t, 50.0), true))
        .await
        .unwrap();

    assert!(report.candle("1m").unwrap().closed);
    assert!(!report.candle("5m").unwrap().closed, "根数不足时不能提前收盘");
    assert!(publisher.of_type("candle:BTCUSDT:5m", "candle_closed").is_empty());
}

#[tokio::test]
async fn test_failure_on_one_timeframe_is_isolated() {
    let publisher = Arc::new(RecordingPublisher::failing_on(&["candle:BTCUSDT:15m"]));
    let (aggregator, db) = build_aggregator("agg_isolation", publisher.clone());

    let k = flat_kline(T0, 42.0);
    let report = aggregator.process_event(&feed_event("BTCUSDT", T0, &k, true)).await.unwrap();

    let outcome = |name: &str| report.outcomes.iter().find(|(tf, _)| tf == name).unwrap();
    assert!(outcome("15m").1.is_err());
    assert!(outcome("5m").1.is_ok());
    assert!(outcome("1h").1.is_ok());
    assert_eq!(report.failure_count(), 1);

    assert_eq!(publisher.on_channel("candle:BTCUSDT:5m").len(), 1);
    assert_eq!(publisher.on_channel("candle:BTCUSDT:1h").len(), 1);
    assert_eq!(publisher.on_channel("price:BTCUSDT").len(), 1);

    // 其他交易对不受影响
    let report = aggregator.process_event(&feed_event("ETHUSDT", T0, &k, true)).await.unwrap();
    assert_eq!(report.failure_count(), 0);

    // 基础K线照常落库
    let coin_id = db.ensure_coin("BTCUSDT").unwrap();
    assert_eq!(db.get_latest_timestamp(coin_id).await.unwrap(), Some(T0));
}

#[tokio::test]
async fn test_price_tick_and_base_candle_are_published() {
    let publisher = Arc::new(RecordingPublisher::default());
    let (aggregator, _db) = build_aggregator("agg_price_tick", publisher.clone());

    let k = kline(T0, 1.0, 2.0, 0.5, 1.5, 3.0);
    aggregator.process_event(&feed_event("BTCUSDT", T0 + 30_000, &k, false)).await.unwrap();

    let ticks = publisher.on_channel("price:BTCUSDT");
    assert_eq!(ticks.len(), 1);
    assert_eq!(ticks[0]["price"], 1.5);
    assert_eq!(ticks[0]["source"], "binance");
    assert_eq!(ticks[0]["timestamp"], T0 + 30_000);

    let base = publisher.of_type("candle:BTCUSDT:1m", "candle");
    assert_eq!(base.len(), 1);
    assert_eq!(base[0]["timestamp"], T0);
    assert_eq!(base[0]["is_closed"], false);
}

#[tokio::test]
async fn test_invalid_events_are_rejected() {
    let publisher = Arc::new(RecordingPublisher::default());
    let (aggregator, _db) = build_aggregator("agg_invalid", publisher.clone());

    let k = flat_kline(T0, 1.0);
    assert!(aggregator.process_event(&feed_event("DOGEUSDT", T0, &k, true)).await.is_err());

    let mut bad = feed_event("BTCUSDT", T0, &k, true);
    bad.volume = -1.0;
    assert!(aggregator.process_event(&bad).await.is_err());
    assert!(publisher.messages().is_empty(), "被拒绝的事件不应产生任何推送");
}

#[tokio::test]
async fn test_dispatcher_drops_duplicate_and_stale_events() {
    let publisher = Arc::new(RecordingPublisher::default());
    let (aggregator, db) = build_aggregator("agg_dispatcher", publisher.clone());
    let symbols = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
    let dispatcher = FeedDispatcher::start(aggregator, &symbols, 16);

    for i in 0..5 {
        let t = T0 + i * MINUTE;
        let k = flat_kline(t, 100.0 + i as f64);
        dispatcher.dispatch(feed_event("BTCUSDT", t, &k, true)).await.unwrap();
        // 重复的收盘事件
        dispatcher.dispatch(feed_event("BTCUSDT", t, &k, true)).await.unwrap();
    }
    // 过期事件
    let stale = flat_kline(T0, 1.0);
    dispatcher.dispatch(feed_event("BTCUSDT", T0, &stale, true)).await.unwrap();

    assert!(dispatcher.dispatch(feed_event("DOGEUSDT", T0, &stale, true)).await.is_err());
    dispatcher.shutdown().await;

    assert_eq!(publisher.of_type("candle:BTCUSDT:5m", "candle_closed").len(), 1);
    assert_eq!(publisher.of_type("candle:BTCUSDT:5m", "candle").len(), 5);

    let coin_id = db.ensure_coin("BTCUSDT").unwrap();
    let rows = db.get_klines_in_range(coin_id, T0, T0 + 5 * MINUTE).await.unwrap();
    assert_eq!(rows.len(), 5);
    assert_eq!(rows[0].close, 100.0, "过期事件不应覆盖已收盘的数据");
}

#[tokio::test]
async fn test_close_redelivered_after_failed_write_is_persisted() {
    let name = "agg_redeliver_after_lock";
    let db = setup_test_db_with_timeout(name, &["5m"], 100);
    let registry = setup_registry(&db, &["BTCUSDT"]);
    let publisher = Arc::new(RecordingPublisher::default());
    let aggregator = Arc::new(KlineAggregator::new(
        db.clone(),
        registry.clone(),
        publisher.clone(),
        db.timeframes().clone(),
        Arc::new(LiveCandleCache::new()),
    ));
    let dispatcher = FeedDispatcher::start(aggregator, &["BTCUSDT".to_string()], 16);

    // 第一次投递时数据库被锁，落库失败
    let first = flat_kline(T0, 100.0);
    let lock = hold_write_lock(name);
    dispatcher.dispatch(feed_event("BTCUSDT", T0, &first, true)).await.unwrap();
    // 价格推送发生在落库尝试之后
    wait_until(|| !publisher.on_channel("price:BTCUSDT").is_empty()).await;
    drop(lock);

    // 重投同一根收盘K线，再送完桶内剩余4根
    dispatcher.dispatch(feed_event("BTCUSDT", T0, &first, true)).await.unwrap();
    for i in 1..5 {
        let t = T0 + i * MINUTE;
        let k = flat_kline(t, 100.0 + i as f64);
        dispatcher.dispatch(feed_event("BTCUSDT", t, &k, true)).await.unwrap();
    }
    dispatcher.shutdown().await;

    let coin_id = registry.coin_id("BTCUSDT").unwrap();
    let rows = db.get_klines_in_range(coin_id, T0, T0 + 5 * MINUTE).await.unwrap();
    assert_eq!(rows.len(), 5, "重投的收盘K线应被写入");
    assert_eq!(rows[0].close, 100.0);

    let closed = publisher.of_type("candle:BTCUSDT:5m", "candle_closed");
    assert_eq!(closed.len(), 1, "5m K线应正常收盘");
    assert_eq!(closed[0]["open"], 100.0);
}

#[tokio::test]
async fn test_corrected_resend_after_invalid_event_is_accepted() {
    let publisher = Arc::new(RecordingPublisher::default());
    let (aggregator, db) = build_aggregator("agg_invalid_then_corrected", publisher.clone());
    let dispatcher = FeedDispatcher::start(aggregator, &["BTCUSDT".to_string()], 16);

    // high < low 的错误数据
    let broken = kline(T0, 100.0, 90.0, 110.0, 100.0, 1.0);
    dispatcher.dispatch(feed_event("BTCUSDT", T0, &broken, true)).await.unwrap();
    let corrected = kline(T0, 100.0, 110.0, 90.0, 105.0, 1.0);
    dispatcher.dispatch(feed_event("BTCUSDT", T0, &corrected, true)).await.unwrap();
    dispatcher.shutdown().await;

    let coin_id = db.ensure_coin("BTCUSDT").unwrap();
    let rows = db.get_klines_in_range(coin_id, T0, T0 + MINUTE).await.unwrap();
    assert_eq!(rows.len(), 1, "修正后的K线应被写入");
    assert_eq!(rows[0].close, 105.0);
    assert_eq!(rows[0].high, 110.0);
}
