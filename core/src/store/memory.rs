use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

use super::{ProjectStore, ScanQuery, ScanStore, StoreError};
use crate::scan::{ProjectId, Scan, ScanId};

#[derive(Default)]
struct Tables {
    projects: HashSet<ProjectId>,
    scans: HashMap<ScanId, Scan>,
    by_project: HashMap<ProjectId, Vec<ScanId>>,
}

/// 内存存储，按扫描 id 和项目 id 建立索引
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_projects<I, P>(projects: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<ProjectId>,
    {
        let tables = Tables {
            projects: projects.into_iter().map(Into::into).collect(),
            ..Tables::default()
        };
        Self {
            tables: RwLock::new(tables),
        }
    }

    pub async fn add_project(&self, project_id: impl Into<ProjectId>) {
        self.tables.write().await.projects.insert(project_id.into());
    }

    pub async fn remove_project(&self, project_id: &ProjectId) -> bool {
        self.tables.write().await.projects.remove(project_id)
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn project_exists(&self, project_id: &ProjectId) -> Result<bool, StoreError> {
        Ok(self.tables.read().await.projects.contains(project_id))
    }
}

#[async_trait]
impl ScanStore for MemoryStore {
    async fn insert_scan(&self, scan: &Scan) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.scans.contains_key(&scan.id) {
            return Err(StoreError::Conflict(format!("scan {} already exists", scan.id)));
        }
        tables
            .by_project
            .entry(scan.project_id.clone())
            .or_default()
            .push(scan.id);
        tables.scans.insert(scan.id, scan.clone());
        Ok(())
    }

    async fn get_scan(&self, scan_id: ScanId) -> Result<Option<Scan>, StoreError> {
        Ok(self.tables.read().await.scans.get(&scan_id).cloned())
    }

    async fn update_scan(&self, scan: &Scan) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        match tables.scans.get_mut(&scan.id) {
            Some(existing) => {
                *existing = scan.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("scan {}", scan.id))),
        }
    }

    async fn list_scans(&self, query: &ScanQuery) -> Result<Vec<Scan>, StoreError> {
        let tables = self.tables.read().await;
        let mut scans: Vec<Scan> = match &query.project_id {
            Some(project_id) => tables
                .by_project
                .get(project_id)
                .into_iter()
                .flatten()
                .filter_map(|id| tables.scans.get(id))
                .filter(|scan| query.matches(scan))
                .cloned()
                .collect(),
            None => tables
                .scans
                .values()
                .filter(|scan| query.matches(scan))
                .cloned()
                .collect(),
        };
        scans.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(scans)
    }

    async fn delete_finished_scans(&self, project_id: &ProjectId) -> Result<u64, StoreError> {
        let mut tables = self.tables.write().await;
        let Tables {
            scans, by_project, ..
        } = &mut *tables;

        let Some(ids) = by_project.get_mut(project_id) else {
            return Ok(0);
        };
        let before = ids.len();
        ids.retain(|id| match scans.get(id).map(|scan| scan.status.is_terminal()) {
            Some(true) => {
                scans.remove(id);
                false
            }
            Some(false) => true,
            None => false,
        });
        let removed = (before - ids.len()) as u64;
        if ids.is_empty() {
            by_project.remove(project_id);
        }
        Ok(removed)
    }
}
