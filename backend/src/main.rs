use actix_cors::Cors;
use actix_web::{App, HttpServer, web};
use derm_backend::config::AppConfig;
use derm_backend::model::Model;
use derm_backend::pipeline::Analyzer;
use derm_backend::routes::configure_routes;
use std::env;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    if let Ok(current_dir) = env::current_dir() {
        log::info!("Current working directory: {}", current_dir.display());
    }

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {}", e);
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Configuration error: {e}"),
            ));
        }
    };

    let model = match Model::load(&config.model) {
        Ok(model) => model,
        Err(e) => {
            log::error!("Failed to load model at startup: {}", e);
            return Err(std::io::Error::other(format!("Model loading failed: {e}")));
        }
    };
    if model.is_degraded() {
        log::warn!("Serving in degraded mode: every result will be marked unreliable");
    }

    let analyzer = web::Data::new(Analyzer::new(model, &config));
    let bind_address = format!("0.0.0.0:{}", config.server.port);
    log::info!("Starting server on {}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allowed_methods(vec!["GET", "POST", "OPTIONS"])
            .allowed_headers(vec![
                actix_web::http::header::ACCEPT,
                actix_web::http::header::CONTENT_TYPE,
            ])
            .max_age(3600);

        App::new()
            .wrap(cors)
            .app_data(analyzer.clone())
            .configure(configure_routes)
    })
    .bind(&bind_address)?
    .run()
    .await
}
