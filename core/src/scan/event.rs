use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ProjectId, ScanId, ScanStatus};

/// 状态变更通知
///
/// `previous_status` 只在扫描记录刚创建时为 None。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub scan_id: ScanId,
    pub project_id: ProjectId,
    pub previous_status: Option<ScanStatus>,
    pub new_status: ScanStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanEvent {
    StatusChanged(StatusChange),
    Progress {
        scan_id: ScanId,
        progress: u8,
        timestamp: DateTime<Utc>,
    },
}

impl ScanEvent {
    pub fn scan_id(&self) -> ScanId {
        match self {
            ScanEvent::StatusChanged(change) => change.scan_id,
            ScanEvent::Progress { scan_id, .. } => *scan_id,
        }
    }

    /// SSE 事件名
    pub fn name(&self) -> &'static str {
        match self {
            ScanEvent::StatusChanged(_) => "status",
            ScanEvent::Progress { .. } => "progress",
        }
    }
}
