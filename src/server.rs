use crate::config::AppConfig;
use crate::dispatcher::Dispatcher;
use crate::io_struct::{ChatMode, ChatRequest};
use actix_web::http::header::{CacheControl, CacheDirective};
use actix_web::{Error, HttpRequest, HttpResponse, HttpServer, error, get, post, web};
use futures::StreamExt;
use log::error;
use serde_json::json;
use std::convert::Infallible;
use std::io::Write;

fn json_error_handler(err: error::JsonPayloadError, _req: &HttpRequest) -> Error {
    error!("JSON payload error: {:?}", err);
    match &err {
        error::JsonPayloadError::OverflowKnownLength { length, limit } => error::ErrorPayloadTooLarge(
            format!("Payload too large: {} bytes exceeds limit of {} bytes", length, limit),
        ),
        error::JsonPayloadError::Overflow { limit } => {
            error::ErrorPayloadTooLarge(format!("Payload exceeds limit of {} bytes", limit))
        }
        _ => error::ErrorBadRequest(format!("Invalid JSON payload: {}", err)),
    }
}

pub fn json_config(max_payload_size: usize) -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(max_payload_size)
        .error_handler(json_error_handler)
}

#[get("/health")]
pub async fn health(_req: HttpRequest) -> HttpResponse {
    HttpResponse::Ok().body("Ok")
}

#[get("/v1/chat/modes")]
pub async fn chat_modes(_req: HttpRequest) -> HttpResponse {
    let modes: Vec<&str> = ChatMode::ALL.iter().map(ChatMode::as_str).collect();
    HttpResponse::Ok().json(json!({ "success": true, "data": modes }))
}

/// Routing failures come back as a JSON failure body; anything later is part of the stream.
#[post("/api/v1/chat/completions")]
pub async fn chat_completions(
    _req: HttpRequest,
    req: web::Json<ChatRequest>,
    dispatcher: web::Data<Dispatcher>,
) -> Result<HttpResponse, Error> {
    let frames = dispatcher.dispatch(req.into_inner()).await?;
    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(CacheControl(vec![CacheDirective::NoCache]))
        .streaming(frames.map(Ok::<_, Infallible>)))
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(chat_modes)
        .service(chat_completions);
}

pub fn init_logging(level: &str) {
    let filter = level.parse().unwrap_or(log::LevelFilter::Info);
    let _ = env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, filter)
        .try_init();
}

pub async fn startup(config: AppConfig, dispatcher: Dispatcher) -> std::io::Result<()> {
    let dispatcher = web::Data::new(dispatcher);
    let max_payload_size = config.server.max_payload_size;

    log::info!("Starting server at {}:{}", config.server.host, config.server.port);

    HttpServer::new(move || {
        actix_web::App::new()
            .wrap(actix_web::middleware::Logger::default())
            .app_data(dispatcher.clone())
            .app_data(json_config(max_payload_size))
            .configure(routes)
    })
    .bind((config.server.host, config.server.port))?
    .run()
    .await
}
