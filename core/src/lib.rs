// Scanward Core Library
// 扫描生命周期核心库：状态机、变更通知和存储接口

mod scan;
mod store;

// 重新导出常用类型
pub use scan::event::{ScanEvent, StatusChange};
pub use scan::manager::{ProgressOutcome, ScanLifecycleManager, DEFAULT_EVENT_BUFFER};
pub use scan::{format_duration, ProjectId, Scan, ScanId, ScanStatus, ScanSummary, ScanType};

// 存储接口
pub use store::{memory::MemoryStore, ProjectStore, ScanQuery, ScanStore, StoreError};

pub mod error {
    use thiserror::Error;

    use crate::scan::{ProjectId, ScanId, ScanStatus};
    use crate::store::StoreError;

    #[derive(Error, Debug)]
    pub enum CoreError {
        #[error("Project not found: {0}")]
        InvalidProject(ProjectId),

        #[error("Scan not found: {0}")]
        ScanNotFound(ScanId),

        #[error("Cannot {action} scan {scan_id} while it is {from}")]
        InvalidTransition {
            scan_id: ScanId,
            from: ScanStatus,
            action: &'static str,
        },

        #[error("Progress must be between 0 and 100, got {0}")]
        InvalidProgress(u8),

        #[error("Project {project_id} still has {active} queued or running scans")]
        ProjectBusy { project_id: ProjectId, active: usize },

        #[error("Store error: {0}")]
        Store(#[from] StoreError),
    }

    pub type Result<T> = std::result::Result<T, CoreError>;
}
