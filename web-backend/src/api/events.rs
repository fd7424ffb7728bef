use actix_web::{web, HttpResponse};
use futures_util::stream;
use scanward_core::ScanEvent;
use serde::Deserialize;
use std::convert::Infallible;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::state::AppState;

#[derive(Deserialize)]
pub struct EventParams {
    /// 只订阅某个扫描的事件
    pub scan_id: Option<Uuid>,
}

/// Server-Sent Events：推送扫描状态变更和进度
pub async fn scan_events(
    state: web::Data<AppState>,
    params: web::Query<EventParams>,
) -> HttpResponse {
    let rx = state.scans.subscribe();
    let filter = params.into_inner().scan_id;

    let events = stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if filter.map_or(true, |id| event.scan_id() == id) {
                        let frame = web::Bytes::from(sse_frame(&event));
                        return Some((Ok::<_, Infallible>(frame), rx));
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("Event subscriber lagged, {} events dropped", missed);
                    let frame = web::Bytes::from(lagged_frame(missed));
                    return Some((Ok(frame), rx));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(events)
}

fn sse_frame(event: &ScanEvent) -> String {
    match serde_json::to_string(event) {
        Ok(data) => format!("event: {}\ndata: {}\n\n", event.name(), data),
        Err(e) => {
            tracing::error!("Failed to serialize scan event: {}", e);
            format!(": serialization error for scan {}\n\n", event.scan_id())
        }
    }
}

fn lagged_frame(missed: u64) -> String {
    format!("event: lagged\ndata: {{\"missed\":{}}}\n\n", missed)
}
