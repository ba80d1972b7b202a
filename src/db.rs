use std::path::Path;
use std::str::FromStr;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::debug;

use crate::error::Result;
use crate::models::{ContentKey, ObservationSet, RiskSeries};

/// Content-addressed store of observation sets and the risk series computed
/// from them. Cloning shares the underlying pool.
#[derive(Debug, Clone)]
pub struct Cache {
    pool: SqlitePool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub observation_sets: i64,
    pub risk_series: i64,
}

impl Cache {
    /// Opens (creating if missing) the store at `path` and applies the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let cache = Self { pool };
        cache.init_db().await?;
        Ok(cache)
    }

    /// Opens a store from a sqlx connection URL such as `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // An in-memory database lives and dies with its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let cache = Self { pool };
        cache.init_db().await?;
        Ok(cache)
    }

    pub async fn init_db(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Stores `set` under its fingerprint. Storing content that is already
    /// present leaves the existing row untouched.
    pub async fn store_observations(&self, set: &ObservationSet) -> Result<ContentKey> {
        let key = set.fingerprint();
        let now = Utc::now().to_rfc3339();
        let start_time = set
            .first()
            .map(|p| p.timestamp.to_rfc3339())
            .unwrap_or_else(|| now.clone());
        let end_time = set
            .last()
            .map(|p| p.timestamp.to_rfc3339())
            .unwrap_or_else(|| now.clone());
        let data_json = serde_json::to_string(set)?;

        let result = sqlx::query(
            r#"
            INSERT INTO observation_sets
            (content_key, start_time, end_time, point_count, data_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (content_key) DO NOTHING
            "#,
        )
        .bind(key.as_str())
        .bind(start_time)
        .bind(end_time)
        .bind(set.len() as i64)
        .bind(data_json)
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!(
            key = key.short(),
            inserted = result.rows_affected() > 0,
            "stored observation set"
        );
        Ok(key)
    }

    /// Appends a risk series for `key`. Earlier rows for the same key stay.
    pub async fn store_risk(&self, key: &ContentKey, series: &RiskSeries) -> Result<()> {
        let series_json = serde_json::to_string(series)?;
        debug!(key = key.short(), points = series.len(), "storing risk series");

        sqlx::query(
            r#"
            INSERT INTO risk_series (content_key, series_json, created_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(key.as_str())
        .bind(series_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_observations(&self, key: &ContentKey) -> Result<Option<ObservationSet>> {
        let row = sqlx::query("SELECT data_json FROM observation_sets WHERE content_key = ?")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let data_json: String = row.get("data_json");
                Ok(Some(serde_json::from_str(&data_json)?))
            }
            None => Ok(None),
        }
    }

    /// Newest risk series stored for `key`.
    pub async fn get_risk(&self, key: &ContentKey) -> Result<Option<RiskSeries>> {
        let row = sqlx::query(
            r#"
            SELECT series_json FROM risk_series
            WHERE content_key = ?
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let series_json: String = row.get("series_json");
                Ok(Some(serde_json::from_str(&series_json)?))
            }
            None => Ok(None),
        }
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM observation_sets) AS observation_sets,
                (SELECT COUNT(*) FROM risk_series) AS risk_series
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(CacheStats {
            observation_sets: row.get("observation_sets"),
            risk_series: row.get("risk_series"),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
