//! Host binary. Wires config, tracing, the store clients, and every
//! crate's public entry point into one `actix-web` process.

use std::path::PathBuf;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::middleware::{Condition, Logger};
use actix_web::{web, App, HttpServer};
use actix_web_httpauth::middleware::HttpAuthentication;
use clap::Parser;
use tracing_actix_web::TracingLogger;

use vizql_core::Catalog;
use vizql_router::{HttpOlapClient, PgStreamClient, RedisKvClient};
use vizql_types::config::VizqlConfig;

use vizql_server::acl::StaticAclProvider;
use vizql_server::auth;
use vizql_server::routes;
use vizql_server::state::AppState;
use vizql_server::widget_store::InMemoryWidgetStore;
use vizql_server::ws;

#[derive(Parser, Debug)]
#[command(name = "vizql-server", about = "Compiles and serves interactive analytics previews")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config/vizql.yaml")]
    config: PathBuf,

    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value_t = 8080)]
    port: u16,
}

struct NoopCatalogSource;

#[async_trait::async_trait]
impl vizql_core::CatalogSource for NoopCatalogSource {
    async fn fetch_tables(&self, _tenant: &vizql_types::TenantId) -> Vec<vizql_types::TableSchema> {
        Vec::new()
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let args = Args::parse();

    let config = match VizqlConfig::from_yaml_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config at {:?}, using defaults: {e}", args.config);
            VizqlConfig::default()
        }
    };
    if let Err(e) = config.validate() {
        panic!("invalid configuration: {e}");
    }

    let tracing_config = vizql_tracing::TracingConfig {
        service_name: "vizql-server".to_string(),
        env_filter: "info".to_string(),
        json: !config.development.enabled,
        otlp_endpoint: None,
    };
    let _tracing_guard = vizql_tracing::init(&tracing_config).expect("failed to install tracing");

    let catalog = Arc::new(Catalog::new(Arc::new(NoopCatalogSource), std::time::Duration::from_secs(60)));
    let acl = Arc::new(StaticAclProvider::new(StaticAclProvider::default_policy()));
    let widgets = Arc::new(InMemoryWidgetStore::new());

    let olap = Arc::new(HttpOlapClient::new(config.stores.olap_http_url.clone()));
    let stream = Arc::new(PgStreamClient::new(config.stores.stream_pg_url.clone()));
    let kv: Arc<dyn vizql_router::KvClient> = match RedisKvClient::connect(&config.stores.kv_url) {
        Ok(client) => Arc::new(client),
        Err(e) => panic!("failed to construct redis kv client for {}: {e}", config.stores.kv_url),
    };

    let bus_subscriber: Arc<dyn vizql_gateway::BusSubscriber> =
        match vizql_gateway::RedisBusSubscriber::connect(&config.stores.kv_url) {
            Ok(sub) => Arc::new(sub),
            Err(e) => panic!("failed to construct redis bus subscriber: {e}"),
        };

    let state = web::Data::new(AppState::new(
        config.clone(),
        catalog,
        acl,
        widgets,
        olap,
        stream,
        kv,
        bus_subscriber.clone(),
    ));

    let heartbeat_index = state.session_index.clone();
    let heartbeat_interval = std::time::Duration::from_secs(config.heartbeat_interval_s);
    tokio::spawn(vizql_gateway::run_heartbeat_loop(
        heartbeat_index,
        bus_subscriber,
        heartbeat_interval,
    ));

    let fan_out = state.fan_out.clone();
    tokio::spawn(async move { fan_out.run().await });

    let host = args.host.clone();
    let port = args.port;
    tracing::info!(host = %host, port, "starting vizql-server");

    HttpServer::new(move || {
        let development_mode = state.config.development.enabled;
        let auth_middleware = Condition::new(!development_mode, HttpAuthentication::bearer(auth::validate));
        let cors = if development_mode {
            Cors::permissive()
        } else {
            Cors::default()
        };

        App::new()
            .app_data(state.clone())
            .wrap(Logger::default())
            .wrap(TracingLogger::default())
            .route("/healthz", web::get().to(routes::healthz))
            .route("/readyz", web::get().to(routes::readyz))
            .service(
                web::scope("")
                    .route("/preview", web::post().to(routes::preview))
                    .route("/widgets/{widget_id}/data", web::get().to(routes::widget_data))
                    .route("/ws/dashboard/{dashboard_id}", web::get().to(ws::dashboard_ws))
                    .wrap(auth_middleware),
            )
            .wrap(cors)
    })
    .bind((host.as_str(), port))?
    .run()
    .await
}
