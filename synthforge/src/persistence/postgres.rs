use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::config::PersistenceConfig;
use crate::model::{Algorithm, DatasetId, DatasetRef, Model, ModelId, ModelRecord, ModelStatus};
use crate::repository::ModelRepository;

const SELECT_COLUMNS: &str = r#"
    SELECT id, dataset_id, project_id, dataset_name, dataset_file, algorithm,
           status, artifact_path, hyperparameters, failure, created_at, updated_at
    FROM synthforge_models
"#;

/// PostgreSQL-backed model repository.
///
/// One row per model. The table enforces the artifact invariant itself, so
/// a row can never claim `COMPLETED` without an artifact path.
#[derive(Debug, Clone)]
pub struct PostgresModelRepository {
    pool: PgPool,
}

impl PostgresModelRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool with the settings in `config`.
    pub async fn connect(config: &PersistenceConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.connection_string)
            .await?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the models table and its index if they do not exist yet.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS synthforge_models (
                id UUID PRIMARY KEY,
                dataset_id UUID NOT NULL,
                project_id UUID NOT NULL,
                dataset_name TEXT NOT NULL,
                dataset_file TEXT NOT NULL,
                algorithm TEXT NOT NULL,
                status TEXT NOT NULL
                    CHECK (status IN ('PENDING','TRAINING','COMPLETED','FAILED')),
                artifact_path TEXT,
                hyperparameters JSONB NOT NULL,
                failure JSONB,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                CHECK ((status = 'COMPLETED') = (artifact_path IS NOT NULL))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS synthforge_models_dataset_idx
                ON synthforge_models (dataset_id, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_model(row: &PgRow) -> anyhow::Result<Model> {
        let algorithm: String = row.try_get("algorithm")?;
        let status: String = row.try_get("status")?;
        let artifact_path: Option<String> = row.try_get("artifact_path")?;
        let failure: Option<serde_json::Value> = row.try_get("failure")?;
        let dataset_file: String = row.try_get("dataset_file")?;

        let record = ModelRecord {
            id: ModelId(row.try_get::<Uuid, _>("id")?),
            dataset: DatasetRef {
                id: DatasetId(row.try_get::<Uuid, _>("dataset_id")?),
                project_id: row.try_get::<Uuid, _>("project_id")?.into(),
                name: row.try_get("dataset_name")?,
                file_path: PathBuf::from(dataset_file),
            },
            algorithm: algorithm.parse::<Algorithm>()?,
            status: status.parse::<ModelStatus>()?,
            artifact_path: artifact_path.map(PathBuf::from),
            hyperparameters: row.try_get("hyperparameters")?,
            failure: failure.map(serde_json::from_value).transpose()?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        };
        Model::try_from(record)
    }

    fn path_text(path: Option<&std::path::Path>) -> Option<String> {
        path.map(|p| p.to_string_lossy().into_owned())
    }
}

#[async_trait]
impl ModelRepository for PostgresModelRepository {
    async fn insert(&self, model: &Model) -> anyhow::Result<()> {
        let failure = model.failure().map(serde_json::to_value).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO synthforge_models (
                id, dataset_id, project_id, dataset_name, dataset_file, algorithm,
                status, artifact_path, hyperparameters, failure, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(model.id().as_uuid())
        .bind(model.dataset().id.as_uuid())
        .bind(model.dataset().project_id.as_uuid())
        .bind(&model.dataset().name)
        .bind(model.dataset().file_key())
        .bind(model.algorithm().as_str())
        .bind(model.status().as_str())
        .bind(Self::path_text(model.artifact_path()))
        .bind(model.hyperparameters())
        .bind(failure)
        .bind(model.created_at())
        .bind(model.updated_at())
        .execute(&self.pool)
        .await?;

        debug!(model_id = %model.id(), "inserted model row");
        Ok(())
    }

    async fn get(&self, id: ModelId) -> anyhow::Result<Option<Model>> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_model).transpose()
    }

    async fn update(&self, model: &Model, expected: ModelStatus) -> anyhow::Result<bool> {
        let failure = model.failure().map(serde_json::to_value).transpose()?;
        let result = sqlx::query(
            r#"
            UPDATE synthforge_models
            SET status = $2,
                artifact_path = $3,
                failure = $4,
                updated_at = $5
            WHERE id = $1 AND status = $6
            "#,
        )
        .bind(model.id().as_uuid())
        .bind(model.status().as_str())
        .bind(Self::path_text(model.artifact_path()))
        .bind(failure)
        .bind(model.updated_at())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_by_dataset(&self, dataset_id: DatasetId) -> anyhow::Result<Vec<Model>> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE dataset_id = $1 ORDER BY created_at ASC, id ASC"
        ))
        .bind(dataset_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_model).collect()
    }
}
