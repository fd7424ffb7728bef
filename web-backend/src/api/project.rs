use actix_web::{web, HttpResponse, Responder};
use serde::Deserialize;

use super::{core_error_response, error_body, store_error_response};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

pub fn configure_project_routes(cfg: &mut web::ServiceConfig) {
    cfg
        // RESTful 风格路由
        .route("", web::post().to(create_project))           // POST /api/projects
        .route("", web::get().to(list_projects))             // GET /api/projects
        .route("/{id}", web::get().to(get_project))          // GET /api/projects/{id}
        .route("/{id}", web::delete().to(delete_project));   // DELETE /api/projects/{id}
}

async fn create_project(
    state: web::Data<AppState>,
    req: web::Json<CreateProjectRequest>,
) -> impl Responder {
    let name = req.name.trim();
    if name.is_empty() {
        return HttpResponse::BadRequest().json(error_body("Project name is required"));
    }
    let description = req
        .description
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty());

    match state.db.create_project(name, description).await {
        Ok(project) => {
            tracing::info!("Project created: {} ({})", project.name, project.id);
            HttpResponse::Created().json(project)
        }
        Err(e) => store_error_response(&e),
    }
}

async fn list_projects(state: web::Data<AppState>) -> impl Responder {
    match state.db.list_projects().await {
        Ok(projects) => HttpResponse::Ok().json(projects),
        Err(e) => store_error_response(&e),
    }
}

async fn get_project(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let id = path.into_inner();
    match state.db.get_project(&id).await {
        Ok(Some(project)) => HttpResponse::Ok().json(project),
        Ok(None) => HttpResponse::NotFound().json(error_body(format!("Project not found: {}", id))),
        Err(e) => store_error_response(&e),
    }
}

async fn delete_project(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let id = path.into_inner();
    // 扫描记录只能经由生命周期管理器删除，未结束的扫描会阻止删除
    if let Err(e) = state.scans.clear_project_scans(&id).await {
        return core_error_response(&e);
    }

    match state.db.delete_project(&id).await {
        Ok(true) => HttpResponse::Ok().json(serde_json::json!({
            "message": "Project deleted successfully"
        })),
        Ok(false) => {
            tracing::warn!("Project {} not found, nothing to delete", id);
            HttpResponse::NotFound().json(error_body(format!("Project not found: {}", id)))
        }
        Err(e) => store_error_response(&e),
    }
}
