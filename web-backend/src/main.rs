use actix_cors::Cors;
use actix_files::Files;
use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use anyhow::Result;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod db;
mod notify;
mod state;

use api::create_api_router;
use config::Config;
use state::AppState;

async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[actix_web::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "scanward_web=debug,scanward_core=info,actix_web=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    // 初始化状态
    let state = AppState::new(&config).await?;

    // 状态变更通知
    notify::spawn_dispatcher(state.scans.subscribe());

    let bind_address = config.bind_address.clone();
    let static_dir = config.static_dir.clone();
    tracing::info!("Scanward server listening on {}", bind_address);

    HttpServer::new(move || {
        let app = App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(Cors::permissive())
            .wrap(TracingLogger::default())
            // API 路由
            .service(create_api_router())
            // 健康检查
            .route("/health", web::get().to(health_check));

        // 静态文件服务（前端构建产物）
        match &static_dir {
            Some(dir) => app.service(Files::new("/", dir).index_file("index.html")),
            None => app,
        }
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}
