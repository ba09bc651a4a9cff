//! PostgreSQL implementation of PoolRepository.
//!
//! Slot acquisition is a single guarded UPDATE, so it is atomic with
//! respect to any number of concurrent schedulers; the row-count result
//! tells the caller whether a slot was won.

use async_trait::async_trait;
use skein_core::pool::Pool;
use skein_core::ports::PoolRepository;
use skein_core::{Error, Result};
use sqlx::{PgPool, Row};

/// PostgreSQL implementation of PoolRepository.
pub struct PgPoolRepository {
    pool: PgPool,
}

impl PgPoolRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_pool(r: &sqlx::postgres::PgRow) -> Pool {
        Pool {
            name: r.get("name"),
            total_slots: r.get::<i32, _>("total_slots") as u32,
            used_slots: r.get::<i32, _>("used_slots") as u32,
        }
    }
}

#[async_trait]
impl PoolRepository for PgPoolRepository {
    async fn upsert(&self, pool: &Pool) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO pools (name, total_slots, used_slots)
               VALUES ($1, $2, $3)
               ON CONFLICT (name) DO UPDATE SET total_slots = EXCLUDED.total_slots"#,
        )
        .bind(&pool.name)
        .bind(pool.total_slots as i32)
        .bind(pool.used_slots as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Pool>> {
        let row = sqlx::query("SELECT name, total_slots, used_slots FROM pools WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.map(|r| Self::row_to_pool(&r)))
    }

    async fn list(&self) -> Result<Vec<Pool>> {
        let rows =
            sqlx::query("SELECT name, total_slots, used_slots FROM pools ORDER BY name ASC")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.iter().map(Self::row_to_pool).collect())
    }

    async fn try_acquire(&self, name: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE pools SET used_slots = used_slots + 1
             WHERE name = $1 AND used_slots < total_slots",
        )
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, name: &str) -> Result<()> {
        sqlx::query(
            "UPDATE pools SET used_slots = GREATEST(used_slots - 1, 0) WHERE name = $1",
        )
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }
}
