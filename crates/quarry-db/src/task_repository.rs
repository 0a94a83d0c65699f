use chrono::{DateTime, Duration, Utc};
use quarry_core::config::TaskConfig;
use quarry_core::error::AppError;
use quarry_core::task::{TaskRecord, TaskStatus, TaskUpdate};
use quarry_core::traits::TaskStore;
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

/// PostgreSQL-backed [`TaskStore`].
#[derive(Clone)]
pub struct TaskRepository {
    pool: Pool<Postgres>,
}

impl TaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    url: String,
    product_name: Option<String>,
    status: String,
    config: serde_json::Value,
    result_summary: Option<serde_json::Value>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<TaskRow> for TaskRecord {
    fn from(row: TaskRow) -> Self {
        TaskRecord {
            id: row.id,
            url: row.url,
            product_name: row.product_name,
            status: row.status.parse().unwrap_or(TaskStatus::Failed),
            created_at: row.created_at,
            completed_at: row.completed_at,
            result_summary: row.result_summary,
            error_message: row.error_message,
            config: row.config,
        }
    }
}

const COLUMNS: &str =
    "id, url, product_name, status, config, result_summary, error_message, created_at, completed_at";

fn db_error(e: sqlx::Error) -> AppError {
    AppError::DatabaseError(e.to_string())
}

impl TaskRepository {
    /// Newest first, optionally filtered by status.
    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, AppError> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            SELECT {COLUMNS} FROM tasks
            WHERE ($1::varchar IS NULL OR status = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Delete tasks created more than `days` days ago. Returns how many
    /// rows went.
    pub async fn delete_older_than(&self, days: u32) -> Result<u64, AppError> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let result = sqlx::query("DELETE FROM tasks WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        tracing::info!(days, deleted = result.rows_affected(), "Old tasks removed");
        Ok(result.rows_affected())
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }
}

impl TaskStore for TaskRepository {
    async fn create_task(&self, url: &str, config: &TaskConfig) -> Result<Uuid, AppError> {
        let config = serde_json::to_value(config)?;
        let row: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO tasks (url, config)
            VALUES ($1, $2)
            RETURNING id
            "#,
        )
        .bind(url)
        .bind(&config)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.0)
    }

    async fn update_task(&self, id: Uuid, update: &TaskUpdate) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET
                status = COALESCE($2::varchar, status),
                product_name = COALESCE($3, product_name),
                result_summary = COALESCE($4, result_summary),
                error_message = COALESCE($5, error_message),
                updated_at = NOW(),
                completed_at = CASE
                    WHEN $2::varchar IN ('completed', 'failed') THEN NOW()
                    ELSE completed_at
                END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.product_name.as_deref())
        .bind(update.result_summary.as_ref())
        .bind(update.error.as_deref())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(AppError::DatabaseError(format!("no task {id}")));
        }
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>, AppError> {
        let row = sqlx::query_as::<_, TaskRow>(&format!("SELECT {COLUMNS} FROM tasks WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(row.map(Into::into))
    }
}
