use scanward_core::{ScanEvent, StatusChange};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

/// 通知分发：订阅生命周期事件并记录每次状态变更
///
/// 返回的任务在事件通道关闭后结束，结果为处理过的状态变更数量。
pub fn spawn_dispatcher(mut rx: broadcast::Receiver<ScanEvent>) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut dispatched = 0;
        loop {
            match rx.recv().await {
                Ok(ScanEvent::StatusChanged(change)) => {
                    dispatch(&change);
                    dispatched += 1;
                }
                Ok(ScanEvent::Progress { .. }) => {}
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("Notification dispatcher lagged, {} events dropped", missed);
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::debug!("Notification dispatcher stopped after {} events", dispatched);
        dispatched
    })
}

fn dispatch(change: &StatusChange) {
    match change.previous_status {
        Some(previous) => tracing::info!(
            scan_id = %change.scan_id,
            project_id = %change.project_id,
            "Scan {} -> {}",
            previous,
            change.new_status
        ),
        None => tracing::info!(
            scan_id = %change.scan_id,
            project_id = %change.project_id,
            "Scan {}",
            change.new_status
        ),
    }
}
