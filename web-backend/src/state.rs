use scanward_core::ScanLifecycleManager;
use std::sync::Arc;

use crate::config::Config;
use crate::db::SqliteStore;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqliteStore>,
    pub scans: ScanLifecycleManager,
}

impl AppState {
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        // 初始化数据库，":memory:" 表示不落盘
        let db = if config.database_path.as_os_str() == ":memory:" {
            tracing::warn!("Using in-memory database, data will not survive restarts");
            SqliteStore::in_memory().await?
        } else {
            SqliteStore::open(&config.database_path).await?
        };

        Ok(Self::with_store(Arc::new(db), config.event_buffer))
    }

    pub fn with_store(db: Arc<SqliteStore>, event_buffer: usize) -> Self {
        // 同一个 SQLite 存储同时负责项目和扫描记录
        let scans = ScanLifecycleManager::with_event_buffer(db.clone(), db.clone(), event_buffer);
        Self { db, scans }
    }
}
