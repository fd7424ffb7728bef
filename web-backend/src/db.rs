use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use scanward_core::{ProjectId, ProjectStore, Scan, ScanId, ScanQuery, ScanStore, StoreError};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: String,
}

#[derive(FromRow)]
struct ScanRow {
    id: String,
    project_id: String,
    scan_type: String,
    status: String,
    progress: i64,
    notes: Option<String>,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    findings_count: Option<i64>,
    failure_reason: Option<String>,
    retried_from: Option<String>,
}

const SCAN_COLUMNS: &str = "id, project_id, scan_type, status, progress, notes, created_at, \
     started_at, finished_at, findings_count, failure_reason, retried_from";

/// SQLite 持久化：项目 CRUD + 扫描记录
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub async fn open(db_path: &Path) -> anyhow::Result<Self> {
        tracing::info!("Database path: {}", db_path.display());

        // 使用 SqliteConnectOptions 来确保数据库文件可以被创建
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;

        Self::init(pool).await
    }

    /// 内存数据库，只保留一个连接，否则每个连接各自是一个空库
    pub async fn in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::init(pool).await
    }

    async fn init(pool: Pool<Sqlite>) -> anyhow::Result<Self> {
        // 创建表
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS scans (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                scan_type TEXT NOT NULL,
                status TEXT NOT NULL,
                progress INTEGER NOT NULL DEFAULT 0,
                notes TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                findings_count INTEGER,
                failure_reason TEXT,
                retried_from TEXT,
                FOREIGN KEY(project_id) REFERENCES projects(id)
            );

            CREATE INDEX IF NOT EXISTS idx_scans_project ON scans(project_id);
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create tables: {}", e))?;

        tracing::info!("Database initialized successfully");

        Ok(Self { pool })
    }

    pub async fn create_project(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<Project, StoreError> {
        let project = Project {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.map(str::to_string),
            created_at: timestamp(Utc::now()),
        };

        sqlx::query("INSERT INTO projects (id, name, description, created_at) VALUES (?, ?, ?, ?)")
            .bind(&project.id)
            .bind(&project.name)
            .bind(&project.description)
            .bind(&project.created_at)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        Ok(project)
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        sqlx::query_as::<_, Project>(
            "SELECT id, name, description, created_at FROM projects ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Option<Project>, StoreError> {
        sqlx::query_as::<_, Project>(
            "SELECT id, name, description, created_at FROM projects WHERE id = ?",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)
    }

    /// 删除项目，项目不存在时返回 false
    ///
    /// 扫描记录需先通过生命周期管理器清理，残留记录由外键拒绝删除。
    pub async fn delete_project(&self, project_id: &str) -> Result<bool, StoreError> {
        let deleted = sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(project_id)
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.is_foreign_key_violation() => {
                    StoreError::Conflict(format!("project {} still has scans", project_id))
                }
                other => backend(other),
            })?;

        tracing::info!("Deleted project {}", project_id);
        Ok(deleted.rows_affected() > 0)
    }
}

#[async_trait]
impl ProjectStore for SqliteStore {
    async fn project_exists(&self, project_id: &ProjectId) -> Result<bool, StoreError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM projects WHERE id = ?")
            .bind(project_id)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        Ok(count > 0)
    }
}

#[async_trait]
impl ScanStore for SqliteStore {
    async fn insert_scan(&self, scan: &Scan) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO scans ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            SCAN_COLUMNS
        );
        sqlx::query(&sql)
            .bind(scan.id.to_string())
            .bind(&scan.project_id)
            .bind(scan.scan_type.as_str())
            .bind(scan.status.as_str())
            .bind(i64::from(scan.progress))
            .bind(&scan.notes)
            .bind(timestamp(scan.created_at))
            .bind(scan.started_at.map(timestamp))
            .bind(scan.finished_at.map(timestamp))
            .bind(scan.findings_count.map(i64::from))
            .bind(&scan.failure_reason)
            .bind(scan.retried_from.map(|id| id.to_string()))
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                    StoreError::Conflict(format!("scan {} already exists", scan.id))
                }
                sqlx::Error::Database(ref db) if db.is_foreign_key_violation() => {
                    StoreError::NotFound(format!("project {}", scan.project_id))
                }
                other => backend(other),
            })?;
        Ok(())
    }

    async fn get_scan(&self, scan_id: ScanId) -> Result<Option<Scan>, StoreError> {
        let sql = format!("SELECT {} FROM scans WHERE id = ?", SCAN_COLUMNS);
        let row = sqlx::query_as::<_, ScanRow>(&sql)
            .bind(scan_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(Scan::try_from).transpose()
    }

    async fn update_scan(&self, scan: &Scan) -> Result<(), StoreError> {
        // id、project_id、scan_type、created_at 创建后不变
        let result = sqlx::query(
            "UPDATE scans
             SET status = ?,
                 progress = ?,
                 notes = ?,
                 started_at = ?,
                 finished_at = ?,
                 findings_count = ?,
                 failure_reason = ?,
                 retried_from = ?
             WHERE id = ?",
        )
        .bind(scan.status.as_str())
        .bind(i64::from(scan.progress))
        .bind(&scan.notes)
        .bind(scan.started_at.map(timestamp))
        .bind(scan.finished_at.map(timestamp))
        .bind(scan.findings_count.map(i64::from))
        .bind(&scan.failure_reason)
        .bind(scan.retried_from.map(|id| id.to_string()))
        .bind(scan.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("scan {}", scan.id)));
        }
        Ok(())
    }

    async fn list_scans(&self, query: &ScanQuery) -> Result<Vec<Scan>, StoreError> {
        let sql = format!(
            "SELECT {} FROM scans
             WHERE (?1 IS NULL OR project_id = ?1)
               AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC",
            SCAN_COLUMNS
        );
        let rows = sqlx::query_as::<_, ScanRow>(&sql)
            .bind(query.project_id.as_deref())
            .bind(query.status.map(|s| s.as_str()))
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(Scan::try_from).collect()
    }

    async fn delete_finished_scans(&self, project_id: &ProjectId) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM scans WHERE project_id = ? AND status IN ('completed', 'failed')",
        )
        .bind(project_id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected())
    }
}

impl TryFrom<ScanRow> for Scan {
    type Error = StoreError;

    fn try_from(row: ScanRow) -> Result<Self, Self::Error> {
        Ok(Scan {
            id: parse_uuid(&row.id)?,
            project_id: row.project_id,
            scan_type: row.scan_type.parse().map_err(StoreError::Backend)?,
            status: row.status.parse().map_err(StoreError::Backend)?,
            progress: u8::try_from(row.progress)
                .map_err(|_| StoreError::Backend(format!("invalid progress: {}", row.progress)))?,
            notes: row.notes,
            created_at: parse_timestamp(&row.created_at)?,
            started_at: row.started_at.as_deref().map(parse_timestamp).transpose()?,
            finished_at: row.finished_at.as_deref().map(parse_timestamp).transpose()?,
            findings_count: row
                .findings_count
                .map(|n| {
                    u32::try_from(n)
                        .map_err(|_| StoreError::Backend(format!("invalid findings count: {}", n)))
                })
                .transpose()?,
            failure_reason: row.failure_reason,
            retried_from: row.retried_from.as_deref().map(parse_uuid).transpose()?,
        })
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    tracing::error!("Database error: {}", e);
    StoreError::Backend(e.to_string())
}

/// 固定宽度的 RFC 3339，保证按文本排序即按时间排序
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("invalid timestamp {}: {}", value, e)))
}

fn parse_uuid(value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|e| StoreError::Backend(format!("invalid id {}: {}", value, e)))
}
