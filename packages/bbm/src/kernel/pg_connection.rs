//! Postgres-backed connection used by batching strategies and job classes.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;

use crate::common::sql::{key_array, key_tuple, order_by, placeholders, quote_table};
use crate::common::Cursor;
use crate::kernel::BaseConnection;

#[derive(Clone)]
pub struct PgConnection {
    pool: PgPool,
}

impl PgConnection {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// WHERE clause for `key >= from [AND key <= upper]`, binds start at `$1`
    fn range_predicate(columns: &[String], upper: bool) -> String {
        let key = key_tuple(columns);
        let width = columns.len();
        let mut predicate = format!("{} >= {}", key, placeholders(1, width));
        if upper {
            predicate.push_str(&format!(" AND {} <= {}", key, placeholders(width + 1, width)));
        }
        predicate
    }

    async fn fetch_key(
        &self,
        sql: &str,
        from: &Cursor,
        upper: Option<&Cursor>,
    ) -> Result<Option<Cursor>> {
        let mut query = sqlx::query_scalar::<_, Vec<i64>>(sql);
        for value in from.values() {
            query = query.bind(*value);
        }
        if let Some(upper) = upper {
            for value in upper.values() {
                query = query.bind(*value);
            }
        }

        let key = query.fetch_optional(&self.pool).await?;
        Ok(key.map(Cursor::new))
    }

    async fn edge_key(&self, table: &str, columns: &[String], descending: bool) -> Result<Option<Cursor>> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY {} LIMIT 1",
            key_array(columns),
            quote_table(table),
            order_by(columns, descending)
        );
        let key = sqlx::query_scalar::<_, Vec<i64>>(&sql)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to read key bounds of {}", table))?;
        Ok(key.map(Cursor::new))
    }
}

#[async_trait]
impl BaseConnection for PgConnection {
    async fn key_window(
        &self,
        table: &str,
        columns: &[String],
        from: &Cursor,
        upper: Option<&Cursor>,
        size: i64,
    ) -> Result<Option<(Cursor, Cursor)>> {
        let predicate = Self::range_predicate(columns, upper.is_some());
        let select = key_array(columns);
        let table_sql = quote_table(table);

        let first_sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY {} LIMIT 1",
            select,
            table_sql,
            predicate,
            order_by(columns, false)
        );
        let Some(first) = self.fetch_key(&first_sql, from, upper).await? else {
            return Ok(None);
        };

        let offset = size.max(1) - 1;
        let last_sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY {} OFFSET {} LIMIT 1",
            select,
            table_sql,
            predicate,
            order_by(columns, false),
            offset
        );
        let last = match self.fetch_key(&last_sql, &first, upper).await? {
            Some(last) => last,
            None => {
                let tail_sql = format!(
                    "SELECT {} FROM {} WHERE {} ORDER BY {} LIMIT 1",
                    select,
                    table_sql,
                    predicate,
                    order_by(columns, true)
                );
                self.fetch_key(&tail_sql, &first, upper)
                    .await?
                    .unwrap_or_else(|| first.clone())
            }
        };

        Ok(Some((first, last)))
    }

    async fn min_key(&self, table: &str, columns: &[String]) -> Result<Option<Cursor>> {
        self.edge_key(table, columns, false).await
    }

    async fn max_key(&self, table: &str, columns: &[String]) -> Result<Option<Cursor>> {
        self.edge_key(table, columns, true).await
    }

    async fn estimate_row_count(&self, table: &str) -> Result<i64> {
        let estimate = sqlx::query_scalar::<_, i64>(
            "SELECT GREATEST(reltuples, 0)::bigint FROM pg_class WHERE oid = $1::regclass",
        )
        .bind(table)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to estimate row count of {}", table))?;

        Ok(estimate.unwrap_or(0))
    }

    fn pg_pool(&self) -> Option<&PgPool> {
        Some(&self.pool)
    }
}
