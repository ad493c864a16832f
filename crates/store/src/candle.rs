use async_trait::async_trait;
use klinefeed_core::common::Interval;
use klinefeed_core::market::entity::Candle;
use klinefeed_core::store::error::StoreError;
use klinefeed_core::store::port::{CandleStore, Page};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

type CandleRow = (i64, f64, f64, f64, f64, f64, i64, f64, i64, f64, f64);

/// CandleStore 的 SQLite 实现，采用 "一库一对" 策略。
///
/// # Summary
/// 每个交易对与周期对应一个独立的 SQLite 数据库文件 `{SYMBOL}_{interval}.db`。
///
/// # Invariants
/// * 以开盘时间为主键，重复写入覆盖旧值。
/// * 数据库文件在首次打开时自动创建。
pub struct SqliteCandleStore {
    path: PathBuf,
    pool: SqlitePool,
}

impl SqliteCandleStore {
    /// 打开 (或创建) 指定交易对与周期的数据库。
    ///
    /// # Logic
    /// 1. 确保数据目录存在。
    /// 2. 配置 SQLite 连接选项，开启 `create_if_missing`。
    /// 3. 创建连接池并运行初始化建表 SQL。
    ///
    /// # Arguments
    /// * `data_dir` - 数据根目录。
    /// * `symbol` - 交易对代码。
    /// * `interval` - K 线周期。
    ///
    /// # Returns
    /// * `Result<Self, StoreError>` - 存储实例或错误。
    pub async fn open(
        data_dir: impl AsRef<Path>,
        symbol: &str,
        interval: Interval,
    ) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref();
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir).map_err(|e| StoreError::InitError(e.to_string()))?;
        }
        let path = data_dir.join(format!("{}_{}.db", symbol.to_uppercase(), interval.as_str()));

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(|e| StoreError::InitError(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS klines (
                open_time INTEGER PRIMARY KEY,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                close_time INTEGER NOT NULL,
                quote_asset_volume REAL NOT NULL,
                trade_count INTEGER NOT NULL,
                taker_buy_base_volume REAL NOT NULL,
                taker_buy_quote_volume REAL NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| StoreError::InitError(e.to_string()))?;

        info!(path = %path.display(), "candle store opened");
        Ok(Self { path, pool })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn to_i64(v: u64) -> Result<i64, StoreError> {
    i64::try_from(v).map_err(|e| StoreError::Database(e.to_string()))
}

#[async_trait]
impl CandleStore for SqliteCandleStore {
    /// # Summary
    /// 批量保存 K 线数据。
    ///
    /// # Logic
    /// 在单个事务中逐条执行 `INSERT OR REPLACE`。
    async fn save_candles(&self, candles: &[Candle]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for candle in candles {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO klines (open_time, open, high, low, close, volume, close_time,
                    quote_asset_volume, trade_count, taker_buy_base_volume, taker_buy_quote_volume)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(candle.open_time)
            .bind(candle.open)
            .bind(candle.high)
            .bind(candle.low)
            .bind(candle.close)
            .bind(candle.volume)
            .bind(candle.close_time)
            .bind(candle.quote_asset_volume)
            .bind(candle.trade_count)
            .bind(candle.taker_buy_base_volume)
            .bind(candle.taker_buy_quote_volume)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        debug!(count = candles.len(), "candles saved");
        Ok(())
    }

    /// # Summary
    /// 按开盘时间闭区间查询 K 线。
    ///
    /// # Logic
    /// 1. 按开盘时间升序筛选区间内的记录。
    /// 2. 提供分页参数时追加 `LIMIT/OFFSET`。
    async fn query_candles(
        &self,
        start: i64,
        end: i64,
        page: Option<Page>,
    ) -> Result<Vec<Candle>, StoreError> {
        let base = r#"
            SELECT open_time, open, high, low, close, volume, close_time,
                quote_asset_volume, trade_count, taker_buy_base_volume, taker_buy_quote_volume
            FROM klines
            WHERE open_time >= ? AND open_time <= ?
            ORDER BY open_time ASC
        "#;

        let records: Vec<CandleRow> = match page {
            Some(p) => {
                let sql = format!("{} LIMIT ? OFFSET ?", base);
                sqlx::query_as(&sql)
                    .bind(start)
                    .bind(end)
                    .bind(to_i64(p.size)?)
                    .bind(to_i64(p.offset)?)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(db_err)?
            }
            None => sqlx::query_as(base)
                .bind(start)
                .bind(end)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?,
        };

        Ok(records
            .into_iter()
            .map(|r| Candle {
                open_time: r.0,
                open: r.1,
                high: r.2,
                low: r.3,
                close: r.4,
                volume: r.5,
                close_time: r.6,
                quote_asset_volume: r.7,
                trade_count: r.8,
                taker_buy_base_volume: r.9,
                taker_buy_quote_volume: r.10,
            })
            .collect())
    }

    async fn count_candles(&self, start: i64, end: i64) -> Result<u64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM klines WHERE open_time >= ? AND open_time <= ?")
                .bind(start)
                .bind(end)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        u64::try_from(count).map_err(|e| StoreError::Database(e.to_string()))
    }
}
