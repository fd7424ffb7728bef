// Scan module - 扫描生命周期模块
// 定义扫描记录、状态和派生视图

pub mod event;
pub mod manager;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type ScanId = Uuid;
pub type ProjectId = String;

/// 扫描类型，创建后不可修改
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanType {
    Full,
    Quick,
    Custom,
}

impl ScanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanType::Full => "full",
            ScanType::Quick => "quick",
            ScanType::Custom => "custom",
        }
    }

    /// 前端展示名称
    pub fn display_name(&self) -> &'static str {
        match self {
            ScanType::Full => "Full Scan",
            ScanType::Quick => "Quick Scan",
            ScanType::Custom => "Custom Scan",
        }
    }
}

impl fmt::Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for ScanType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "full" | "full scan" => Ok(ScanType::Full),
            "quick" | "quick scan" => Ok(ScanType::Quick),
            "custom" | "custom scan" => Ok(ScanType::Custom),
            other => Err(format!("unknown scan type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Queued => "queued",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        }
    }

    /// Completed 和 Failed 是终态，之后不允许任何状态变更
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanStatus::Completed | ScanStatus::Failed)
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "queued" => Ok(ScanStatus::Queued),
            "running" => Ok(ScanStatus::Running),
            "completed" => Ok(ScanStatus::Completed),
            "failed" => Ok(ScanStatus::Failed),
            other => Err(format!("unknown scan status: {}", other)),
        }
    }
}

/// 单次安全扫描记录
///
/// 只有 `ScanLifecycleManager` 会修改状态相关字段：
/// - `finished_at` 在离开 Running 之前始终为空
/// - `findings_count` 只在 Completed 时存在
/// - `failure_reason` 只在 Failed 时存在
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scan {
    pub id: ScanId,
    pub project_id: ProjectId,
    pub scan_type: ScanType,
    pub status: ScanStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub findings_count: Option<u32>,
    pub failure_reason: Option<String>,
    /// 重试来源（失败的原扫描）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retried_from: Option<ScanId>,
}

impl Scan {
    pub(crate) fn queued(
        project_id: ProjectId,
        scan_type: ScanType,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            scan_type,
            status: ScanStatus::Queued,
            progress: 0,
            notes,
            created_at: now,
            started_at: None,
            finished_at: None,
            findings_count: None,
            failure_reason: None,
            retried_from: None,
        }
    }

    /// 已运行时长：Running 时计算到 `now`，终态时为实际耗时，排队中为 None
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<Duration> {
        let started = self.started_at?;
        let end = match self.status {
            ScanStatus::Running => now,
            _ => self.finished_at?,
        };
        Some((end - started).max(Duration::zero()))
    }
}

/// 格式化时长，例如 "1h 23m 4s"、"5m 18s"、"42s"
pub fn format_duration(duration: Duration) -> String {
    let total = duration.num_seconds().max(0);
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// 各状态的扫描数量（仪表盘统计）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl ScanSummary {
    pub fn from_scans<'a>(scans: impl IntoIterator<Item = &'a Scan>) -> Self {
        let mut summary = Self::default();
        for scan in scans {
            summary.total += 1;
            match scan.status {
                ScanStatus::Queued => summary.queued += 1,
                ScanStatus::Running => summary.running += 1,
                ScanStatus::Completed => summary.completed += 1,
                ScanStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }
}
