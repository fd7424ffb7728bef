use actix_web::{web, HttpResponse, Responder};
use chrono::Utc;
use scanward_core::{format_duration, ProgressOutcome, Scan, ScanQuery, ScanStatus, ScanType};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{core_error_response, error_body};
use crate::state::AppState;

#[derive(Serialize, Deserialize)]
pub struct CreateScanRequest {
    pub project_id: String,
    pub scan_type: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct ProgressRequest {
    pub percent: u8,
}

#[derive(Serialize, Deserialize)]
pub struct CompleteRequest {
    pub findings_count: u32,
}

#[derive(Serialize, Deserialize)]
pub struct FailRequest {
    pub reason: String,
}

#[derive(Deserialize)]
pub struct ListScansParams {
    pub project_id: Option<String>,
    /// all | queued | running | completed | failed
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub struct SummaryParams {
    pub project_id: Option<String>,
}

/// 返回给前端的扫描记录，附带格式化后的耗时
#[derive(Serialize, Deserialize)]
pub struct ScanResponse {
    #[serde(flatten)]
    pub scan: Scan,
    pub scan_type_label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<String>,
}

impl From<Scan> for ScanResponse {
    fn from(scan: Scan) -> Self {
        let elapsed = scan.elapsed(Utc::now()).map(format_duration);
        ScanResponse {
            scan_type_label: scan.scan_type.display_name().to_string(),
            elapsed,
            scan,
        }
    }
}

pub fn configure_scan_routes(cfg: &mut web::ServiceConfig) {
    cfg
        .route("", web::post().to(create_scan))
        .route("", web::get().to(list_scans))
        .route("/summary", web::get().to(scan_summary))
        .route("/events", web::get().to(super::events::scan_events))
        .route("/{scan_id}", web::get().to(get_scan))
        .route("/{scan_id}/start", web::post().to(start_scan))
        .route("/{scan_id}/progress", web::post().to(report_progress))
        .route("/{scan_id}/complete", web::post().to(complete_scan))
        .route("/{scan_id}/fail", web::post().to(fail_scan))
        .route("/{scan_id}/retry", web::post().to(retry_scan));
}

fn scan_response(result: scanward_core::error::Result<Scan>) -> HttpResponse {
    match result {
        Ok(scan) => HttpResponse::Ok().json(ScanResponse::from(scan)),
        Err(e) => core_error_response(&e),
    }
}

async fn create_scan(
    state: web::Data<AppState>,
    req: web::Json<CreateScanRequest>,
) -> impl Responder {
    let req = req.into_inner();
    let scan_type = match req.scan_type.parse::<ScanType>() {
        Ok(scan_type) => scan_type,
        Err(e) => return HttpResponse::BadRequest().json(error_body(e)),
    };

    match state.scans.create(req.project_id, scan_type, req.notes).await {
        Ok(scan) => HttpResponse::Created().json(ScanResponse::from(scan)),
        Err(e) => core_error_response(&e),
    }
}

async fn list_scans(
    state: web::Data<AppState>,
    params: web::Query<ListScansParams>,
) -> impl Responder {
    let params = params.into_inner();
    // 前端筛选项 "All" 等价于不过滤
    let status = match params.status.as_deref() {
        None => None,
        Some(s) if s.eq_ignore_ascii_case("all") => None,
        Some(s) => match s.parse::<ScanStatus>() {
            Ok(status) => Some(status),
            Err(e) => return HttpResponse::BadRequest().json(error_body(e)),
        },
    };

    let query = ScanQuery {
        project_id: params.project_id,
        status,
    };
    match state.scans.list(&query).await {
        Ok(scans) => {
            let scans: Vec<ScanResponse> = scans.into_iter().map(ScanResponse::from).collect();
            HttpResponse::Ok().json(scans)
        }
        Err(e) => core_error_response(&e),
    }
}

async fn scan_summary(
    state: web::Data<AppState>,
    params: web::Query<SummaryParams>,
) -> impl Responder {
    match state.scans.summary(params.into_inner().project_id).await {
        Ok(summary) => HttpResponse::Ok().json(summary),
        Err(e) => core_error_response(&e),
    }
}

async fn get_scan(state: web::Data<AppState>, path: web::Path<Uuid>) -> impl Responder {
    scan_response(state.scans.get(path.into_inner()).await)
}

async fn start_scan(state: web::Data<AppState>, path: web::Path<Uuid>) -> impl Responder {
    scan_response(state.scans.start(path.into_inner()).await)
}

async fn report_progress(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    req: web::Json<ProgressRequest>,
) -> impl Responder {
    match state.scans.report_progress(path.into_inner(), req.percent).await {
        Ok(outcome) => HttpResponse::Ok().json(serde_json::json!({
            "applied": outcome == ProgressOutcome::Applied
        })),
        Err(e) => core_error_response(&e),
    }
}

async fn complete_scan(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    req: web::Json<CompleteRequest>,
) -> impl Responder {
    scan_response(state.scans.complete(path.into_inner(), req.findings_count).await)
}

async fn fail_scan(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    req: web::Json<FailRequest>,
) -> impl Responder {
    let reason = req.into_inner().reason;
    if reason.trim().is_empty() {
        return HttpResponse::BadRequest().json(error_body("Failure reason is required"));
    }
    scan_response(state.scans.fail(path.into_inner(), reason).await)
}

async fn retry_scan(state: web::Data<AppState>, path: web::Path<Uuid>) -> impl Responder {
    match state.scans.retry(path.into_inner()).await {
        Ok(scan) => HttpResponse::Created().json(ScanResponse::from(scan)),
        Err(e) => core_error_response(&e),
    }
}
