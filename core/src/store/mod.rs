// Store module - 持久化接口
// 生命周期管理器只通过这些 trait 访问项目和扫描记录

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::scan::{ProjectId, Scan, ScanId, ScanStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record conflict: {0}")]
    Conflict(String),

    /// 后端错误（数据库连接、序列化等）
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// 扫描列表过滤条件，字段为 None 表示不过滤
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanQuery {
    pub project_id: Option<ProjectId>,
    pub status: Option<ScanStatus>,
}

impl ScanQuery {
    pub fn for_project(project_id: impl Into<ProjectId>) -> Self {
        Self {
            project_id: Some(project_id.into()),
            status: None,
        }
    }

    pub fn with_status(mut self, status: ScanStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, scan: &Scan) -> bool {
        self.project_id
            .as_ref()
            .map_or(true, |id| &scan.project_id == id)
            && self.status.map_or(true, |status| scan.status == status)
    }
}

/// 项目存在性检查（项目 CRUD 由外部负责）
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn project_exists(&self, project_id: &ProjectId) -> Result<bool, StoreError>;
}

/// 扫描记录存储
#[async_trait]
pub trait ScanStore: Send + Sync {
    /// 插入新记录，id 已存在时返回 `Conflict`，所属项目不存在时返回 `NotFound`
    async fn insert_scan(&self, scan: &Scan) -> Result<(), StoreError>;

    async fn get_scan(&self, scan_id: ScanId) -> Result<Option<Scan>, StoreError>;

    /// 覆盖已有记录，不存在时返回 `NotFound`
    async fn update_scan(&self, scan: &Scan) -> Result<(), StoreError>;

    /// 按 created_at 倒序返回
    async fn list_scans(&self, query: &ScanQuery) -> Result<Vec<Scan>, StoreError>;

    /// 删除项目下所有终态扫描，Queued/Running 记录保留
    async fn delete_finished_scans(&self, project_id: &ProjectId) -> Result<u64, StoreError>;
}
