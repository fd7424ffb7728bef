use actix_web::error::InternalError;
use actix_web::{web, HttpResponse, Scope};
use scanward_core::error::CoreError;
use scanward_core::StoreError;

pub mod events;
pub mod project;
pub mod scan;

pub fn create_api_router() -> Scope {
    web::scope("/api")
        .app_data(json_config())
        .service(project_routes())
        .service(scan_routes())
}

fn project_routes() -> Scope {
    web::scope("/projects")
        .configure(project::configure_project_routes)
}

fn scan_routes() -> Scope {
    web::scope("/scans")
        .configure(scan::configure_scan_routes)
}

/// 请求体解析失败时同样返回 `{"error": ...}`
fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _req| {
        tracing::debug!("Rejected request body: {}", err);
        let response = HttpResponse::BadRequest().json(error_body(&err));
        InternalError::from_response(err, response).into()
    })
}

pub(crate) fn error_body(message: impl std::fmt::Display) -> serde_json::Value {
    serde_json::json!({ "error": message.to_string() })
}

/// 生命周期错误到 HTTP 状态码的映射
pub(crate) fn core_error_response(err: &CoreError) -> HttpResponse {
    match err {
        CoreError::InvalidProject(_) | CoreError::InvalidProgress(_) => {
            HttpResponse::UnprocessableEntity().json(error_body(err))
        }
        CoreError::ScanNotFound(_) => HttpResponse::NotFound().json(error_body(err)),
        CoreError::InvalidTransition { .. } | CoreError::ProjectBusy { .. } => {
            HttpResponse::Conflict().json(error_body(err))
        }
        CoreError::Store(store) => store_error_response(store),
    }
}

pub(crate) fn store_error_response(err: &StoreError) -> HttpResponse {
    match err {
        StoreError::NotFound(_) => HttpResponse::NotFound().json(error_body(err)),
        StoreError::Conflict(_) => HttpResponse::Conflict().json(error_body(err)),
        StoreError::Backend(_) => {
            tracing::error!("Storage failure: {}", err);
            HttpResponse::InternalServerError().json(error_body(err))
        }
    }
}
