//! `team_posteriors` table backend.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use tracing::debug;

use crate::error::Result;
use crate::posterior::PosteriorBackend;

/// Posterior documents stored as JSONB, one row per team.
#[derive(Debug, Clone)]
pub struct PgPosteriorBackend {
    pool: PgPool,
}

impl PgPosteriorBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PosteriorBackend for PgPosteriorBackend {
    async fn load(&self, team_id: &str) -> Result<Option<Value>> {
        let row: Option<(Value,)> =
            sqlx::query_as("SELECT posterior FROM team_posteriors WHERE team_id = $1")
                .bind(team_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(doc,)| doc))
    }

    async fn load_many(&self, team_ids: &[String]) -> Result<HashMap<String, Value>> {
        if team_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<(String, Value)> = sqlx::query_as(
            "SELECT team_id, posterior FROM team_posteriors WHERE team_id = ANY($1)",
        )
        .bind(team_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn save_many(&self, documents: &[(String, Value)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (team_id, doc) in documents {
            sqlx::query(
                r#"
                INSERT INTO team_posteriors (team_id, posterior, updated_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (team_id) DO UPDATE SET
                    posterior = EXCLUDED.posterior,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(team_id)
            .bind(doc)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(count = documents.len(), "Posteriors written");
        Ok(())
    }
}
