//! Document-processing service: accepts upload jobs over a thin HTTP surface,
//! drives the two queue consumers (archive extraction and per-file
//! normalisation), and runs the periodic GX upload and lifecycle schedulers.

mod file_worker;
mod handlers;
mod lifecycle;
mod model;
mod orchestration;
mod pdfops;
mod post_commit;
mod process;
mod repo;
mod schedulers;
mod zip_worker;

use actix_cors::Cors;
use actix_web::{http::header, middleware::Logger, web, App, HttpServer};
use deadpool_postgres::Pool;
use tracing::{error, info, warn};

use shared::config::Settings;
use shared::gx::GxClient;
use shared::queue::{run_consumer, QueueClient};
use shared::storage::StorageService;

use crate::handlers::HandlerRegistry;
use crate::lifecycle::JobLifecycleManager;
use crate::post_commit::UploadPool;

#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub pool: Pool,
    pub storage: StorageService,
    pub queue: QueueClient,
    pub gx: GxClient,
    pub registry: HandlerRegistry,
    pub lifecycle: JobLifecycleManager,
    pub uploads: UploadPool,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    info!("starting doc-processor service");

    let settings = match Settings::new() {
        Ok(settings) => settings,
        Err(err) => {
            error!(error = %err, "failed to load settings");
            std::process::exit(1);
        }
    };

    let pool = shared::db::build_pool(&settings.database_url).map_err(|err| {
        error!(error = %err, "failed to build postgres pool");
        std::io::Error::new(std::io::ErrorKind::Other, "db-pool")
    })?;
    info!("created postgres pool");

    {
        let client = pool.get().await.map_err(|err| {
            error!(error = %err, "failed to get connection from pool");
            std::io::Error::new(std::io::ErrorKind::Other, "db-pool-get")
        })?;
        repo::ensure_schema(&client).await.map_err(|err| {
            error!(error = %err, "failed to ensure schema");
            std::io::Error::new(std::io::ErrorKind::Other, "db-schema")
        })?;
    }
    info!("database schema ensured");

    let storage = StorageService::from_settings(&settings).await;
    let queue = QueueClient::from_settings(&settings.queues).await;
    let gx = GxClient::from_settings(&settings.gx).map_err(|err| {
        error!(error = %err, "failed to build gx client");
        std::io::Error::new(std::io::ErrorKind::Other, "gx-client")
    })?;
    let registry = HandlerRegistry::from_settings(&settings);
    let lifecycle = JobLifecycleManager::new(pool.clone());
    let uploads = UploadPool::new(settings.zip_handler.concurrency_limit);

    let state = AppState {
        settings,
        pool,
        storage,
        queue,
        gx,
        registry,
        lifecycle,
        uploads,
    };

    let zip_state = state.clone();
    tokio::spawn(run_consumer(
        state.queue.clone(),
        state.settings.queues.zip_queue_url.clone(),
        state.settings.queues.clone(),
        "zip-consumer",
        move |body| {
            let state = zip_state.clone();
            async move { zip_worker::handle_zip_message(state, body).await }
        },
    ));

    let file_state = state.clone();
    tokio::spawn(run_consumer(
        state.queue.clone(),
        state.settings.queues.file_queue_url.clone(),
        state.settings.queues.clone(),
        "file-consumer",
        move |body| {
            let state = file_state.clone();
            async move { file_worker::handle_file_message(state, body).await }
        },
    ));

    let gx_state = state.clone();
    schedulers::spawn_cron(
        "gx-doc-upload",
        state.settings.schedulers.gx_doc_upload.clone(),
        move || {
            let state = gx_state.clone();
            async move { schedulers::gx_upload_tick(&state).await }
        },
    );

    let lifecycle_state = state.clone();
    schedulers::spawn_cron(
        "lifecycle",
        state.settings.schedulers.lifecycle.clone(),
        move || {
            let state = lifecycle_state.clone();
            async move { schedulers::lifecycle_tick(&state).await }
        },
    );

    let bind_addr = format!("{}:{}", state.settings.http_bind, state.settings.http_port);
    info!(%bind_addr, "starting http server");

    let server_state = state.clone();
    HttpServer::new(move || {
        let app_state = server_state.clone();
        let origins = app_state.settings.allowed_origins();
        let mut cors = Cors::default()
            .allowed_methods(vec!["GET", "POST"])
            .allowed_headers(vec![header::CONTENT_TYPE, header::AUTHORIZATION])
            .max_age(3600);
        if origins.is_empty() {
            warn!("CORS_ALLOWED_ORIGINS not set; allowing any origin");
            cors = cors.allow_any_origin();
        } else {
            for origin in &origins {
                cors = cors.allowed_origin(origin);
            }
        }

        App::new()
            .app_data(web::Data::new(app_state))
            .wrap(Logger::default())
            .wrap(cors)
            .configure(orchestration::configure)
    })
    .bind(bind_addr)?
    .run()
    .await
}
