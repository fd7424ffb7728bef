use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};

use super::event::{ScanEvent, StatusChange};
use super::{ProjectId, Scan, ScanId, ScanStatus, ScanSummary, ScanType};
use crate::error::{CoreError, Result};
use crate::store::{ProjectStore, ScanQuery, ScanStore, StoreError};

pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// 进度上报结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressOutcome {
    Applied,
    /// 百分比不高于当前值（重复或乱序投递），不修改状态也不发事件
    Stale,
}

/// 扫描生命周期管理器
///
/// 状态机：`Queued -> Running -> {Completed | Failed}`，失败的扫描只能通过
/// `retry` 生成新记录重新进入队列。
///
/// 同一扫描的所有变更操作都在该扫描的锁内完成（读取、校验、写回、发事件），
/// 因此事件顺序与状态变更顺序一致；不同扫描之间互不阻塞。
#[derive(Clone)]
pub struct ScanLifecycleManager {
    projects: Arc<dyn ProjectStore>,
    scans: Arc<dyn ScanStore>,
    locks: Arc<Mutex<HashMap<ScanId, Arc<Mutex<()>>>>>,
    events: broadcast::Sender<ScanEvent>,
}

impl ScanLifecycleManager {
    pub fn new(projects: Arc<dyn ProjectStore>, scans: Arc<dyn ScanStore>) -> Self {
        Self::with_event_buffer(projects, scans, DEFAULT_EVENT_BUFFER)
    }

    pub fn with_event_buffer(
        projects: Arc<dyn ProjectStore>,
        scans: Arc<dyn ScanStore>,
        buffer: usize,
    ) -> Self {
        let (events, _rx) = broadcast::channel(buffer.max(1));
        Self {
            projects,
            scans,
            locks: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    pub async fn create(
        &self,
        project_id: impl Into<ProjectId>,
        scan_type: ScanType,
        notes: Option<String>,
    ) -> Result<Scan> {
        let project_id = project_id.into();
        self.ensure_project(&project_id).await?;

        let scan = Scan::queued(project_id, scan_type, normalize_notes(notes), Utc::now());
        let guard = self.insert_queued(&scan).await?;

        tracing::info!(
            scan_id = %scan.id,
            project_id = %scan.project_id,
            scan_type = scan.scan_type.as_str(),
            "Scan queued"
        );
        self.emit_status(&scan, None);
        drop(guard);
        Ok(scan)
    }

    pub async fn start(&self, scan_id: ScanId) -> Result<Scan> {
        let (_guard, mut scan) = self.acquire(scan_id, "start").await?;
        if scan.status != ScanStatus::Queued {
            return Err(rejected(&scan, "start"));
        }

        let previous = scan.status;
        scan.status = ScanStatus::Running;
        scan.started_at = Some(Utc::now());
        self.scans.update_scan(&scan).await?;

        tracing::info!(scan_id = %scan.id, "Scan started");
        self.emit_status(&scan, Some(previous));
        Ok(scan)
    }

    /// 上报进度；相同或更低的百分比视为重复投递，返回 `Stale`
    pub async fn report_progress(&self, scan_id: ScanId, percent: u8) -> Result<ProgressOutcome> {
        if percent > 100 {
            return Err(CoreError::InvalidProgress(percent));
        }

        let (_guard, mut scan) = self.acquire(scan_id, "report progress for").await?;
        if scan.status != ScanStatus::Running {
            return Err(rejected(&scan, "report progress for"));
        }

        if percent <= scan.progress {
            tracing::debug!(
                scan_id = %scan.id,
                current = scan.progress,
                reported = percent,
                "Ignoring stale progress"
            );
            return Ok(ProgressOutcome::Stale);
        }

        scan.progress = percent;
        self.scans.update_scan(&scan).await?;

        tracing::debug!(scan_id = %scan.id, progress = percent, "Scan progress");
        let _ = self.events.send(ScanEvent::Progress {
            scan_id: scan.id,
            progress: percent,
            timestamp: Utc::now(),
        });
        Ok(ProgressOutcome::Applied)
    }

    pub async fn complete(&self, scan_id: ScanId, findings_count: u32) -> Result<Scan> {
        self.finish(scan_id, "complete", |scan| {
            scan.status = ScanStatus::Completed;
            scan.progress = 100;
            scan.findings_count = Some(findings_count);
        })
        .await
    }

    pub async fn fail(&self, scan_id: ScanId, reason: impl Into<String>) -> Result<Scan> {
        let reason = reason.into();
        self.finish(scan_id, "fail", |scan| {
            scan.status = ScanStatus::Failed;
            scan.failure_reason = Some(reason);
        })
        .await
    }

    /// 为失败的扫描创建新的排队记录，原记录保持不变
    pub async fn retry(&self, scan_id: ScanId) -> Result<Scan> {
        // Failed 是终态，读取原记录无需加锁
        let source = self.load(scan_id).await?;
        if source.status != ScanStatus::Failed {
            return Err(rejected(&source, "retry"));
        }
        self.ensure_project(&source.project_id).await?;

        let mut scan = Scan::queued(
            source.project_id.clone(),
            source.scan_type,
            source.notes.clone(),
            Utc::now(),
        );
        scan.retried_from = Some(source.id);
        let guard = self.insert_queued(&scan).await?;

        tracing::info!(
            scan_id = %scan.id,
            retried_from = %source.id,
            project_id = %scan.project_id,
            "Scan retried"
        );
        self.emit_status(&scan, None);
        drop(guard);
        Ok(scan)
    }

    /// 删除项目前清理其扫描记录，返回删除的数量
    ///
    /// 仍有 Queued 或 Running 扫描时拒绝，只删除终态记录。
    pub async fn clear_project_scans(&self, project_id: &ProjectId) -> Result<u64> {
        let query = ScanQuery::for_project(project_id.clone());
        let active = self
            .scans
            .list_scans(&query)
            .await?
            .iter()
            .filter(|scan| !scan.status.is_terminal())
            .count();
        if active > 0 {
            tracing::warn!(
                project_id = %project_id,
                active,
                "Rejected project cleanup with active scans"
            );
            return Err(CoreError::ProjectBusy {
                project_id: project_id.clone(),
                active,
            });
        }

        let removed = self.scans.delete_finished_scans(project_id).await?;
        tracing::info!(project_id = %project_id, removed, "Project scans cleared");
        Ok(removed)
    }

    pub async fn get(&self, scan_id: ScanId) -> Result<Scan> {
        self.load(scan_id).await
    }

    pub async fn list(&self, query: &ScanQuery) -> Result<Vec<Scan>> {
        Ok(self.scans.list_scans(query).await?)
    }

    pub async fn summary(&self, project_id: Option<ProjectId>) -> Result<ScanSummary> {
        let query = ScanQuery {
            project_id,
            status: None,
        };
        let scans = self.scans.list_scans(&query).await?;
        Ok(ScanSummary::from_scans(&scans))
    }

    /// Running -> 终态
    async fn finish<F>(&self, scan_id: ScanId, action: &'static str, apply: F) -> Result<Scan>
    where
        F: FnOnce(&mut Scan),
    {
        let (guard, mut scan) = self.acquire(scan_id, action).await?;
        if scan.status != ScanStatus::Running {
            return Err(rejected(&scan, action));
        }

        let previous = scan.status;
        apply(&mut scan);
        scan.finished_at = Some(Utc::now());
        self.scans.update_scan(&scan).await?;

        match scan.status {
            ScanStatus::Failed => tracing::info!(
                scan_id = %scan.id,
                reason = scan.failure_reason.as_deref().unwrap_or_default(),
                "Scan failed"
            ),
            _ => tracing::info!(
                scan_id = %scan.id,
                findings = scan.findings_count.unwrap_or_default(),
                "Scan completed"
            ),
        }
        self.emit_status(&scan, Some(previous));

        drop(guard);
        self.release_lock(scan_id).await;
        Ok(scan)
    }

    async fn ensure_project(&self, project_id: &ProjectId) -> Result<()> {
        if self.projects.project_exists(project_id).await? {
            Ok(())
        } else {
            tracing::warn!(project_id = %project_id, "Rejected scan for unknown project");
            Err(CoreError::InvalidProject(project_id.clone()))
        }
    }

    async fn load(&self, scan_id: ScanId) -> Result<Scan> {
        self.scans
            .get_scan(scan_id)
            .await?
            .ok_or(CoreError::ScanNotFound(scan_id))
    }

    /// 新记录在锁内写入，创建事件发出前其他操作无法修改它
    async fn insert_queued(&self, scan: &Scan) -> Result<OwnedMutexGuard<()>> {
        let guard = self.lock_for(scan.id).await.lock_owned().await;
        match self.scans.insert_scan(scan).await {
            Ok(()) => Ok(guard),
            Err(e) => {
                drop(guard);
                self.release_lock(scan.id).await;
                match e {
                    // 插入期间项目被删除
                    StoreError::NotFound(_) => {
                        tracing::warn!(
                            project_id = %scan.project_id,
                            "Project removed before scan insert"
                        );
                        Err(CoreError::InvalidProject(scan.project_id.clone()))
                    }
                    other => Err(other.into()),
                }
            }
        }
    }

    /// 获取扫描锁并在锁内读取最新记录，终态扫描直接拒绝
    async fn acquire(
        &self,
        scan_id: ScanId,
        action: &'static str,
    ) -> Result<(OwnedMutexGuard<()>, Scan)> {
        let guard = self.lock_for(scan_id).await.lock_owned().await;
        let result = match self.scans.get_scan(scan_id).await {
            Ok(Some(scan)) if !scan.status.is_terminal() => return Ok((guard, scan)),
            Ok(Some(scan)) => Err(rejected(&scan, action)),
            Ok(None) => Err(CoreError::ScanNotFound(scan_id)),
            Err(e) => Err(e.into()),
        };

        drop(guard);
        self.release_lock(scan_id).await;
        result
    }

    async fn lock_for(&self, scan_id: ScanId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(scan_id).or_default().clone()
    }

    /// 终态或不存在的扫描不再需要锁表项；仍有任务在等待时保留
    async fn release_lock(&self, scan_id: ScanId) {
        let mut locks = self.locks.lock().await;
        if locks
            .get(&scan_id)
            .map_or(false, |lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&scan_id);
        }
    }

    fn emit_status(&self, scan: &Scan, previous_status: Option<ScanStatus>) {
        // 没有订阅者时发送失败，忽略即可
        let _ = self.events.send(ScanEvent::StatusChanged(StatusChange {
            scan_id: scan.id,
            project_id: scan.project_id.clone(),
            previous_status,
            new_status: scan.status,
            timestamp: Utc::now(),
        }));
    }
}

fn rejected(scan: &Scan, action: &'static str) -> CoreError {
    tracing::warn!(
        scan_id = %scan.id,
        status = scan.status.as_str(),
        action,
        "Rejected scan transition"
    );
    CoreError::InvalidTransition {
        scan_id: scan.id,
        from: scan.status,
        action,
    }
}

fn normalize_notes(notes: Option<String>) -> Option<String> {
    notes
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use tokio::sync::broadcast::error::TryRecvError;

    fn manager_with(projects: &[&str]) -> (ScanLifecycleManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::with_projects(projects.iter().copied()));
        let manager = ScanLifecycleManager::new(store.clone(), store.clone());
        (manager, store)
    }

    async fn running_scan(manager: &ScanLifecycleManager) -> Scan {
        let scan = manager.create("P1", ScanType::Full, None).await.unwrap();
        manager.start(scan.id).await.unwrap()
    }

    #[tokio::test]
    async fn create_requires_known_project() {
        let (manager, _) = manager_with(&["P1"]);
        let err = manager.create("missing", ScanType::Quick, None).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidProject(id) if id == "missing"));
        assert!(manager.list(&ScanQuery::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_trims_blank_notes() {
        let (manager, _) = manager_with(&["P1"]);
        let scan = manager
            .create("P1", ScanType::Custom, Some("   ".into()))
            .await
            .unwrap();
        assert_eq!(scan.notes, None);

        let scan = manager
            .create("P1", ScanType::Custom, Some(" api only ".into()))
            .await
            .unwrap();
        assert_eq!(scan.notes.as_deref(), Some("api only"));
    }

    #[tokio::test]
    async fn unknown_scan_is_reported() {
        let (manager, _) = manager_with(&["P1"]);
        let id = uuid::Uuid::new_v4();
        assert!(matches!(
            manager.start(id).await,
            Err(CoreError::ScanNotFound(missing)) if missing == id
        ));
        assert!(matches!(
            manager.report_progress(id, 10).await,
            Err(CoreError::ScanNotFound(_))
        ));
    }

    #[tokio::test]
    async fn progress_above_hundred_is_rejected() {
        let (manager, _) = manager_with(&["P1"]);
        let scan = running_scan(&manager).await;
        assert!(matches!(
            manager.report_progress(scan.id, 101).await,
            Err(CoreError::InvalidProgress(101))
        ));
        assert_eq!(manager.get(scan.id).await.unwrap().progress, 0);
    }

    #[tokio::test]
    async fn repeated_progress_is_a_silent_no_op() {
        let (manager, _) = manager_with(&["P1"]);
        let scan = running_scan(&manager).await;
        let mut rx = manager.subscribe();

        assert_eq!(
            manager.report_progress(scan.id, 40).await.unwrap(),
            ProgressOutcome::Applied
        );
        assert_eq!(
            manager.report_progress(scan.id, 40).await.unwrap(),
            ProgressOutcome::Stale
        );
        assert_eq!(
            manager.report_progress(scan.id, 20).await.unwrap(),
            ProgressOutcome::Stale
        );

        assert!(matches!(
            rx.try_recv(),
            Ok(ScanEvent::Progress { progress: 40, .. })
        ));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn progress_requires_running() {
        let (manager, _) = manager_with(&["P1"]);
        let scan = manager.create("P1", ScanType::Quick, None).await.unwrap();
        assert!(matches!(
            manager.report_progress(scan.id, 10).await,
            Err(CoreError::InvalidTransition { from: ScanStatus::Queued, .. })
        ));
    }

    #[tokio::test]
    async fn complete_sets_terminal_fields() {
        let (manager, _) = manager_with(&["P1"]);
        let scan = running_scan(&manager).await;
        manager.report_progress(scan.id, 60).await.unwrap();

        let done = manager.complete(scan.id, 7).await.unwrap();
        assert_eq!(done.status, ScanStatus::Completed);
        assert_eq!(done.progress, 100);
        assert_eq!(done.findings_count, Some(7));
        assert_eq!(done.failure_reason, None);
        assert!(done.finished_at.is_some());
        assert!(done.finished_at >= done.started_at);
    }

    #[tokio::test]
    async fn fail_keeps_last_progress() {
        let (manager, _) = manager_with(&["P1"]);
        let scan = running_scan(&manager).await;
        manager.report_progress(scan.id, 35).await.unwrap();

        let failed = manager.fail(scan.id, "Configuration error").await.unwrap();
        assert_eq!(failed.status, ScanStatus::Failed);
        assert_eq!(failed.progress, 35);
        assert_eq!(failed.findings_count, None);
        assert_eq!(failed.failure_reason.as_deref(), Some("Configuration error"));
    }

    #[tokio::test]
    async fn rejected_transitions_emit_nothing() {
        let (manager, _) = manager_with(&["P1"]);
        let scan = manager.create("P1", ScanType::Quick, None).await.unwrap();
        let mut rx = manager.subscribe();

        assert!(manager.complete(scan.id, 1).await.is_err());
        assert!(manager.fail(scan.id, "nope").await.is_err());
        assert!(manager.retry(scan.id).await.is_err());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        let unchanged = manager.get(scan.id).await.unwrap();
        assert_eq!(unchanged, scan);
    }

    #[tokio::test]
    async fn retry_copies_type_and_notes() {
        let (manager, _) = manager_with(&["P1"]);
        let scan = manager
            .create("P1", ScanType::Custom, Some("auth endpoints".into()))
            .await
            .unwrap();
        manager.start(scan.id).await.unwrap();
        manager.fail(scan.id, "timeout").await.unwrap();

        let retried = manager.retry(scan.id).await.unwrap();
        assert_eq!(retried.scan_type, ScanType::Custom);
        assert_eq!(retried.notes.as_deref(), Some("auth endpoints"));
        assert_eq!(retried.retried_from, Some(scan.id));

        // 可以多次重试同一个失败扫描
        let again = manager.retry(scan.id).await.unwrap();
        assert_ne!(again.id, retried.id);
    }

    #[tokio::test]
    async fn retry_rechecks_project() {
        let (manager, store) = manager_with(&["P1"]);
        let scan = running_scan(&manager).await;
        manager.fail(scan.id, "timeout").await.unwrap();

        store.remove_project(&"P1".to_string()).await;
        assert!(matches!(
            manager.retry(scan.id).await,
            Err(CoreError::InvalidProject(_))
        ));
    }

    #[tokio::test]
    async fn terminal_transition_releases_lock_entry() {
        let (manager, _) = manager_with(&["P1"]);
        let scan = running_scan(&manager).await;
        assert!(manager.locks.lock().await.contains_key(&scan.id));

        manager.complete(scan.id, 0).await.unwrap();
        assert!(!manager.locks.lock().await.contains_key(&scan.id));

        assert!(manager.start(scan.id).await.is_err());
        assert!(manager.start(uuid::Uuid::new_v4()).await.is_err());
        assert!(manager.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn summary_is_scoped_by_project() {
        let (manager, _) = manager_with(&["P1", "P2"]);
        running_scan(&manager).await;
        manager.create("P1", ScanType::Quick, None).await.unwrap();
        manager.create("P2", ScanType::Quick, None).await.unwrap();

        let p1 = manager.summary(Some("P1".into())).await.unwrap();
        assert_eq!(p1.total, 2);
        assert_eq!(p1.running, 1);
        assert_eq!(p1.queued, 1);

        let all = manager.summary(None).await.unwrap();
        assert_eq!(all.total, 3);
    }

    struct BrokenStore;

    #[async_trait::async_trait]
    impl ProjectStore for BrokenStore {
        async fn project_exists(&self, _: &ProjectId) -> std::result::Result<bool, StoreError> {
            Err(StoreError::Backend("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn store_errors_propagate() {
        let scans = Arc::new(MemoryStore::new());
        let manager = ScanLifecycleManager::new(Arc::new(BrokenStore), scans);
        assert!(matches!(
            manager.create("P1", ScanType::Full, None).await,
            Err(CoreError::Store(StoreError::Backend(_)))
        ));
    }

    /// 项目在检查之后被删除（插入时外键失败），读取时后端不可用
    struct FailingScans;

    #[async_trait::async_trait]
    impl ScanStore for FailingScans {
        async fn insert_scan(&self, scan: &Scan) -> std::result::Result<(), StoreError> {
            Err(StoreError::NotFound(format!("project {}", scan.project_id)))
        }

        async fn get_scan(&self, _: ScanId) -> std::result::Result<Option<Scan>, StoreError> {
            Err(StoreError::Backend("disk I/O error".into()))
        }

        async fn update_scan(&self, _: &Scan) -> std::result::Result<(), StoreError> {
            Err(StoreError::Backend("disk I/O error".into()))
        }

        async fn list_scans(&self, _: &ScanQuery) -> std::result::Result<Vec<Scan>, StoreError> {
            Ok(Vec::new())
        }

        async fn delete_finished_scans(
            &self,
            _: &ProjectId,
        ) -> std::result::Result<u64, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn insert_for_removed_project_is_invalid_project() {
        let projects = Arc::new(MemoryStore::with_projects(["P1"]));
        let manager = ScanLifecycleManager::new(projects, Arc::new(FailingScans));
        let mut rx = manager.subscribe();

        assert!(matches!(
            manager.create("P1", ScanType::Quick, None).await,
            Err(CoreError::InvalidProject(id)) if id == "P1"
        ));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert!(manager.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn failed_read_releases_lock_entry() {
        let projects = Arc::new(MemoryStore::new());
        let manager = ScanLifecycleManager::new(projects, Arc::new(FailingScans));

        let id = uuid::Uuid::new_v4();
        assert!(matches!(
            manager.start(id).await,
            Err(CoreError::Store(StoreError::Backend(_)))
        ));
        assert!(matches!(
            manager.complete(id, 1).await,
            Err(CoreError::Store(StoreError::Backend(_)))
        ));
        assert!(manager.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn lock_entry_survives_while_another_task_waits() {
        let (manager, _) = manager_with(&["P1"]);
        let scan = running_scan(&manager).await;

        let lock = manager.lock_for(scan.id).await;
        let held = lock.clone().lock_owned().await;
        manager.release_lock(scan.id).await;
        assert!(manager.locks.lock().await.contains_key(&scan.id));

        drop(held);
        drop(lock);
        manager.release_lock(scan.id).await;
        assert!(manager.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn clearing_project_scans_requires_finished_scans() {
        let (manager, _) = manager_with(&["P1", "P2"]);
        let running = running_scan(&manager).await;
        let failed = running_scan(&manager).await;
        manager.fail(failed.id, "timeout").await.unwrap();
        let other = manager.create("P2", ScanType::Quick, None).await.unwrap();

        assert!(matches!(
            manager.clear_project_scans(&"P1".to_string()).await,
            Err(CoreError::ProjectBusy { active: 1, .. })
        ));
        assert!(manager.get(failed.id).await.is_ok());

        manager.complete(running.id, 2).await.unwrap();
        assert_eq!(
            manager.clear_project_scans(&"P1".to_string()).await.unwrap(),
            2
        );
        assert!(manager
            .list(&ScanQuery::for_project("P1"))
            .await
            .unwrap()
            .is_empty());
        assert!(manager.get(other.id).await.is_ok());
    }
}
