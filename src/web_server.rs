use crate::config::AppConfig;
use crate::error::AppError;
use crate::orchestrator::IndexOrchestrator;
use crate::store::clamp_random_limit;
use crate::uploads::UploadedImage;
use actix_files::NamedFile;
use actix_multipart::Multipart;
use actix_web::{web, App, HttpResponse, HttpServer};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

const IMAGE_FIELD: &str = "image";
const DEFAULT_RANDOM_LIMIT: usize = 12;

#[derive(Serialize)]
struct Envelope<T: Serialize> {
    ok: bool,
    data: T,
}

fn ok<T: Serialize>(data: T) -> HttpResponse {
    HttpResponse::Ok().json(Envelope { ok: true, data })
}

#[derive(Deserialize, Debug)]
struct CountQuery {
    count: Option<i64>,
}

#[derive(Deserialize, Debug)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn index(app_config: web::Data<AppConfig>) -> Result<NamedFile, AppError> {
    let page = Path::new(&app_config.static_directory).join("index.html");
    NamedFile::open_async(&page).await.map_err(|e| {
        log::error!("Error serving {:?}: {}", page, e);
        AppError::Io(e)
    })
}

async fn health(orchestrator: web::Data<IndexOrchestrator>) -> Result<HttpResponse, AppError> {
    Ok(ok(orchestrator.health().await?))
}

async fn init_db(orchestrator: web::Data<IndexOrchestrator>) -> Result<HttpResponse, AppError> {
    Ok(ok(orchestrator.init().await?))
}

async fn reset_db(orchestrator: web::Data<IndexOrchestrator>) -> Result<HttpResponse, AppError> {
    Ok(ok(orchestrator.reset().await?))
}

async fn methods(orchestrator: web::Data<IndexOrchestrator>) -> Result<HttpResponse, AppError> {
    Ok(ok(orchestrator.remote_methods().await?))
}

async fn add_image(
    orchestrator: web::Data<IndexOrchestrator>,
    payload: Multipart,
) -> Result<HttpResponse, AppError> {
    let upload = read_image_field(payload, orchestrator.max_upload_bytes()).await?;
    let added = orchestrator.add_image(&upload).await?;
    Ok(HttpResponse::Created().json(Envelope { ok: true, data: added }))
}

async fn search_by_upload(
    orchestrator: web::Data<IndexOrchestrator>,
    query: web::Query<CountQuery>,
    payload: Multipart,
) -> Result<HttpResponse, AppError> {
    let upload = read_image_field(payload, orchestrator.max_upload_bytes()).await?;
    Ok(ok(orchestrator.search_by_upload(&upload, query.count).await?))
}

async fn random_images(
    orchestrator: web::Data<IndexOrchestrator>,
    query: web::Query<LimitQuery>,
) -> Result<HttpResponse, AppError> {
    let limit = clamp_random_limit(query.limit.unwrap_or(DEFAULT_RANDOM_LIMIT));
    Ok(ok(orchestrator.random_images(limit).await?))
}

async fn get_image(
    orchestrator: web::Data<IndexOrchestrator>,
    path: web::Path<i64>,
) -> Result<HttpResponse, AppError> {
    Ok(ok(orchestrator.image(path.into_inner()).await?))
}

async fn delete_image(
    orchestrator: web::Data<IndexOrchestrator>,
    path: web::Path<i64>,
) -> Result<HttpResponse, AppError> {
    Ok(ok(orchestrator.delete_by_id(path.into_inner()).await?))
}

async fn image_matches(
    orchestrator: web::Data<IndexOrchestrator>,
    path: web::Path<i64>,
    query: web::Query<CountQuery>,
) -> Result<HttpResponse, AppError> {
    log::debug!("Matches requested for {} with {:?}", path, query);
    Ok(ok(orchestrator.matches_by_id(path.into_inner(), query.count).await?))
}

/// Pulls the `image` field out of a multipart body, refusing to buffer more
/// than `max_bytes`.
async fn read_image_field(mut payload: Multipart, max_bytes: usize) -> Result<UploadedImage, AppError> {
    while let Some(mut field) = payload.try_next().await.map_err(malformed)? {
        let disposition = field.content_disposition();
        if disposition.get_name() != Some(IMAGE_FIELD) {
            log::trace!("Skipping multipart field {:?}", disposition.get_name());
            continue;
        }
        let original_name = disposition.get_filename().unwrap_or_default().to_string();
        let content_type = field.content_type().map(|m| m.to_string());

        let mut bytes = Vec::new();
        while let Some(chunk) = field.try_next().await.map_err(malformed)? {
            if bytes.len() + chunk.len() > max_bytes {
                return Err(AppError::Validation(format!(
                    "uploaded image exceeds the {} byte limit",
                    max_bytes
                )));
            }
            bytes.extend_from_slice(&chunk);
        }
        return Ok(UploadedImage {
            original_name,
            content_type,
            bytes,
        });
    }
    Err(AppError::Validation(format!("multipart field '{}' is missing", IMAGE_FIELD)))
}

fn malformed(e: actix_multipart::MultipartError) -> AppError {
    AppError::Validation(format!("malformed multipart body: {}", e))
}

/// API routes, shared by the server and the tests.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(
        web::QueryConfig::default()
            .error_handler(|err, _| AppError::Validation(err.to_string()).into()),
    )
    .app_data(
        web::PathConfig::default()
            .error_handler(|err, _| AppError::Validation(err.to_string()).into()),
    )
    .service(web::resource("/api/health").route(web::get().to(health)))
    .service(web::resource("/api/init").route(web::post().to(init_db)))
    .service(web::resource("/api/reset").route(web::post().to(reset_db)))
    .service(web::resource("/api/methods").route(web::get().to(methods)))
    .service(web::resource("/api/search").route(web::post().to(search_by_upload)))
    .service(web::resource("/api/images").route(web::post().to(add_image)))
    .service(web::resource("/api/images/random").route(web::get().to(random_images)))
    .service(
        web::resource("/api/images/{id}")
            .route(web::get().to(get_image))
            .route(web::delete().to(delete_image)),
    )
    .service(web::resource("/api/images/{id}/matches").route(web::get().to(image_matches)));
}

pub async fn start_web_server(
    config: Arc<AppConfig>,
    orchestrator: Arc<IndexOrchestrator>,
) -> std::io::Result<()> {
    let port = config.web_port;
    let static_dir = config.static_directory.clone();
    let upload_dir = orchestrator.uploads().upload_dir();
    let upload_mount = format!("/{}", orchestrator.uploads().subdir());
    std::fs::create_dir_all(&upload_dir)?;

    let config_data = web::Data::from(config);
    let orchestrator_data = web::Data::from(orchestrator);

    log::info!("Starting web server on port: {}", port);
    log::debug!("Serving uploads from {:?} at {}", upload_dir, upload_mount);

    HttpServer::new(move || {
        App::new()
            .app_data(config_data.clone())
            .app_data(orchestrator_data.clone())
            .configure(configure)
            .service(actix_files::Files::new(&upload_mount, &upload_dir))
            .service(actix_files::Files::new("/static", &static_dir).show_files_listing())
            .default_service(web::to(index))
    })
    .bind(format!("0.0.0.0:{}", port))?
    .run()
    .await
}
