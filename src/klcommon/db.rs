use crate::klcommon::config::DatabaseConfig;
use crate::klcommon::error::{AppError, Result};
use crate::klcommon::models::{ClosedAggregate, Kline, TableStats};
use crate::klcommon::timeframe::{Timeframe, TimeframeSet};
use tracing::{debug, error, info, instrument};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tokio::task;

// 数据库连接池类型
pub type DbPool = Pool<SqliteConnectionManager>;

/// 基础周期K线的唯一事实表 + 按周期派生的视图表
///
/// 基础表唯一键为 `(coin_id, timestamp)`，所有写入都走同一个 upsert，
/// 因此实时写入与补齐写入可以任意交错。
#[derive(Debug)]
pub struct Database {
    pool: DbPool,
    base_table: String,
    timeframes: TimeframeSet,
}

impl Database {
    /// 打开（或创建）数据库，启用 WAL 并初始化所有表
    #[instrument(target = "db", skip_all, fields(db_path = %config.database_path), err)]
    pub fn open(config: &DatabaseConfig, timeframes: &TimeframeSet) -> Result<Self> {
        let db_path = Path::new(&config.database_path);

        // Ensure parent directory exists for database
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!(target: "db", log_type = "module", "使用SQLite数据库: {}", db_path.display());

        let busy_timeout_ms = config.busy_timeout_ms;
        let manager = SqliteConnectionManager::file(db_path).with_init(move |conn| {
            conn.execute_batch(&format!("
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA temp_store = MEMORY;
                PRAGMA busy_timeout = {busy_timeout_ms};
            "))
        });

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .build(manager)
            .map_err(|e| {
                let pool_error = AppError::DatabaseError(format!("创建连接池失败: {}", e));
                error!(
                    target: "db",
                    message = "创建连接池失败",
                    db_path = %db_path.display(),
                    error.summary = pool_error.get_error_type_summary(),
                    error.details = %pool_error
                );
                pool_error
            })?;

        let db = Self {
            pool,
            base_table: timeframes.base().view_name(),
            timeframes: timeframes.clone(),
        };

        db.init_db()?;
        info!(target: "db", log_type = "module", "✅ SQLite数据库初始化成功, 基础表: {}", db.base_table);
        Ok(db)
    }

    /// 创建 coins 表、基础表和全部派生视图表
    fn init_db(&self) -> Result<()> {
        let conn = self.pool.get()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS coins (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL UNIQUE,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            );",
        )?;

        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{table}\" (
                coin_id INTEGER NOT NULL REFERENCES coins(id),
                timestamp INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                PRIMARY KEY (coin_id, timestamp)
            );
            CREATE INDEX IF NOT EXISTS \"idx_{table}_timestamp\" ON \"{table}\" (timestamp);",
            table = self.base_table
        ))?;

        for tf in self.timeframes.derived() {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS \"{view}\" (
                    coin_id INTEGER NOT NULL REFERENCES coins(id),
                    timestamp INTEGER NOT NULL,
                    open REAL NOT NULL,
                    high REAL NOT NULL,
                    low REAL NOT NULL,
                    close REAL NOT NULL,
                    volume REAL NOT NULL,
                    candle_count INTEGER NOT NULL,
                    PRIMARY KEY (coin_id, timestamp)
                );",
                view = tf.view_name()
            ))?;
        }

        debug!(target: "db", decision = "init_db_complete", derived_views = self.timeframes.derived().len(), "数据库表初始化完成");
        Ok(())
    }

    pub fn timeframes(&self) -> &TimeframeSet {
        &self.timeframes
    }

    /// 在阻塞线程池中执行数据库操作，并保持当前 span 上下文
    async fn with_conn<F, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        let parent_span = tracing::Span::current();

        task::spawn_blocking(move || {
            parent_span.in_scope(|| {
                let mut conn = pool.get()?;
                op(&mut conn)
            })
        })
        .await
        .map_err(|join_error| AppError::DatabaseError(format!("数据库任务 panic: {:?}", join_error)))?
    }

    /// 确保交易对在 coins 表中存在，返回其 id
    pub fn ensure_coin(&self, symbol: &str) -> Result<i64> {
        let conn = self.pool.get()?;
        conn.execute("INSERT OR IGNORE INTO coins (symbol) VALUES (?1)", params![symbol])?;
        let id: i64 = conn.query_row(
            "SELECT id FROM coins WHERE symbol = ?1",
            params![symbol],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// 幂等写入基础K线：冲突时覆盖全部数值列
    #[instrument(target = "db", skip(self, klines), fields(kline_count = klines.len()), err)]
    pub async fn upsert_klines(&self, coin_id: i64, klines: Vec<Kline>) -> Result<usize> {
        if klines.is_empty() {
            return Ok(0);
        }
        let table = self.base_table.clone();
        self.with_conn(move |conn| upsert_klines_static(conn, &table, coin_id, &klines)).await
    }

    /// 获取某交易对最新的基础K线时间戳
    pub async fn get_latest_timestamp(&self, coin_id: i64) -> Result<Option<i64>> {
        let table = self.base_table.clone();
        self.with_conn(move |conn| {
            let latest: Option<i64> = conn.query_row(
                &format!("SELECT MAX(timestamp) FROM \"{table}\" WHERE coin_id = ?1"),
                params![coin_id],
                |row| row.get(0),
            )?;
            Ok(latest)
        })
        .await
    }

    /// 聚合 `[start, end)` 区间内已收盘的基础K线
    ///
    /// 区间内没有任何行时返回 `None`
    pub async fn get_closed_aggregate(&self, coin_id: i64, start: i64, end: i64) -> Result<Option<ClosedAggregate>> {
        let table = self.base_table.clone();
        self.with_conn(move |conn| closed_aggregate_static(conn, &table, coin_id, start, end)).await
    }

    /// 查询 `[start, end)` 区间内的基础K线，按时间升序
    pub async fn get_klines_in_range(&self, coin_id: i64, start: i64, end: i64) -> Result<Vec<Kline>> {
        let table = self.base_table.clone();
        self.with_conn(move |conn| select_klines(conn, &table, coin_id, start, end)).await
    }

    /// 在一个事务中删除 `timestamp < cutoff` 的所有基础K线
    ///
    /// 失败时事务随 drop 回滚
    #[instrument(target = "db", skip(self), err)]
    pub async fn delete_klines_before(&self, cutoff: i64) -> Result<usize> {
        let table = self.base_table.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let deleted = tx.execute(
                &format!("DELETE FROM \"{table}\" WHERE timestamp < ?1"),
                params![cutoff],
            )?;
            tx.commit()?;
            Ok(deleted)
        })
        .await
    }

    /// 基础表统计信息
    pub async fn get_table_stats(&self) -> Result<TableStats> {
        let table = self.base_table.clone();
        self.with_conn(move |conn| {
            let (total_rows, oldest_timestamp, newest_timestamp, total_symbols) = conn.query_row(
                &format!(
                    "SELECT COUNT(*), MIN(timestamp), MAX(timestamp), COUNT(DISTINCT coin_id) FROM \"{table}\""
                ),
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )?;
            let size_bytes: i64 = conn.query_row(
                "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
                [],
                |row| row.get(0),
            )?;
            Ok(TableStats {
                total_rows,
                oldest_timestamp,
                newest_timestamp,
                total_symbols,
                size_bytes,
            })
        })
        .await
    }

    /// 从基础表重新物化一个派生周期视图，返回刷新后视图的行数
    ///
    /// 必须在自动提交模式下执行：连接上若残留未结束的事务则直接报错。
    #[instrument(target = "db", skip(self), fields(view = %timeframe.view_name()), err)]
    pub async fn refresh_view(&self, timeframe: &Timeframe) -> Result<i64> {
        if self.timeframes.derived().iter().all(|tf| tf != timeframe) {
            return Err(AppError::DatabaseError(format!("未配置的派生周期: {}", timeframe)));
        }
        let table = self.base_table.clone();
        let view = timeframe.view_name();
        let duration_ms = timeframe.duration_ms;
        self.with_conn(move |conn| {
            if !conn.is_autocommit() {
                return Err(AppError::DatabaseError(format!("刷新 {} 时连接处于事务中", view)));
            }
            refresh_view_static(conn, &table, &view, duration_ms)?;
            let rows: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM \"{view}\""), [], |row| row.get(0))?;
            Ok(rows)
        })
        .await
    }

    /// 读取派生视图中 `[start, end)` 区间的K线（`open_time` 为桶起始时间）
    pub async fn get_view_klines(&self, timeframe: &Timeframe, coin_id: i64, start: i64, end: i64) -> Result<Vec<Kline>> {
        let view = timeframe.view_name();
        self.with_conn(move |conn| select_klines(conn, &view, coin_id, start, end)).await
    }
}

fn upsert_klines_static(conn: &mut Connection, table: &str, coin_id: i64, klines: &[Kline]) -> Result<usize> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(&format!(
            "INSERT INTO \"{table}\" (coin_id, timestamp, open, high, low, close, volume)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(coin_id, timestamp) DO UPDATE SET
                open = excluded.open,
                high = excluded.high,
                low = excluded.low,
                close = excluded.close,
                volume = excluded.volume"
        ))?;
        for kline in klines {
            stmt.execute(params![
                coin_id,
                kline.open_time,
                kline.open,
                kline.high,
                kline.low,
                kline.close,
                kline.volume
            ])?;
        }
    }
    tx.commit()?;
    debug!(target: "db", decision = "upsert_complete", coin_id, kline_count = klines.len(), "基础K线写入完成");
    Ok(klines.len())
}

fn closed_aggregate_static(conn: &Connection, table: &str, coin_id: i64, start: i64, end: i64) -> Result<Option<ClosedAggregate>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT
                    (SELECT open FROM \"{table}\"
                      WHERE coin_id = ?1 AND timestamp >= ?2 AND timestamp < ?3
                      ORDER BY timestamp ASC LIMIT 1),
                    MAX(high), MIN(low), SUM(volume), COUNT(*)
                 FROM \"{table}\"
                 WHERE coin_id = ?1 AND timestamp >= ?2 AND timestamp < ?3"
            ),
            params![coin_id, start, end],
            |row| {
                Ok((
                    row.get::<_, Option<f64>>(0)?,
                    row.get::<_, Option<f64>>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )
        .optional()?;

    match row {
        Some((Some(first_open), Some(max_high), Some(min_low), Some(total_volume), count)) if count > 0 => {
            Ok(Some(ClosedAggregate { first_open, max_high, min_low, total_volume, count }))
        }
        _ => Ok(None),
    }
}

fn select_klines(conn: &Connection, table: &str, coin_id: i64, start: i64, end: i64) -> Result<Vec<Kline>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT timestamp, open, high, low, close, volume FROM \"{table}\"
         WHERE coin_id = ?1 AND timestamp >= ?2 AND timestamp < ?3
         ORDER BY timestamp ASC"
    ))?;
    let rows = stmt.query_map(params![coin_id, start, end], |row| {
        Ok(Kline {
            open_time: row.get(0)?,
            open: row.get(1)?,
            high: row.get(2)?,
            low: row.get(3)?,
            close: row.get(4)?,
            volume: row.get(5)?,
        })
    })?;
    let mut klines = Vec::new();
    for row in rows {
        klines.push(row?);
    }
    Ok(klines)
}

/// 单条语句完成整张视图的重算：按桶分组，开盘取桶内最早一根，收盘取最晚一根
///
/// 桶起点早于该交易对基础表最早时间戳时，桶的前半段已被清理；
/// 这类桶若视图中已有行则保留原值，不用残缺数据覆盖。
fn refresh_view_static(conn: &Connection, table: &str, view: &str, duration_ms: i64) -> Result<usize> {
    let affected = conn.execute(
        &format!(
            "WITH buckets AS (
                SELECT coin_id,
                       (timestamp / ?1) * ?1 AS bucket,
                       MIN(timestamp) AS first_ts,
                       MAX(timestamp) AS last_ts,
                       MAX(high) AS high,
                       MIN(low) AS low,
                       SUM(volume) AS volume,
                       COUNT(*) AS candle_count
                FROM \"{table}\"
                GROUP BY coin_id, bucket
            ),
            coin_start AS (
                SELECT coin_id, MIN(timestamp) AS earliest
                FROM \"{table}\"
                GROUP BY coin_id
            )
            INSERT INTO \"{view}\" (coin_id, timestamp, open, high, low, close, volume, candle_count)
            SELECT b.coin_id, b.bucket, o.open, b.high, b.low, c.close, b.volume, b.candle_count
            FROM buckets b
            JOIN coin_start s ON s.coin_id = b.coin_id
            JOIN \"{table}\" o ON o.coin_id = b.coin_id AND o.timestamp = b.first_ts
            JOIN \"{table}\" c ON c.coin_id = b.coin_id AND c.timestamp = b.last_ts
            WHERE b.bucket >= s.earliest
               OR NOT EXISTS (
                    SELECT 1 FROM \"{view}\" v
                    WHERE v.coin_id = b.coin_id AND v.timestamp = b.bucket
               )
            ON CONFLICT(coin_id, timestamp) DO UPDATE SET
                open = excluded.open,
                high = excluded.high,
                low = excluded.low,
                close = excluded.close,
                volume = excluded.volume,
                candle_count = excluded.candle_count"
        ),
        params![duration_ms],
    )?;
    Ok(affected)
}
