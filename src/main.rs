use actix_web::middleware::from_fn;
use actix_web::{web, App, HttpServer};
use analysis_gateway::analyze::{self, AnalysisState};
use analysis_gateway::auth::{Authenticator, StaticTokenAuthenticator};
use analysis_gateway::backend::memory::InMemoryBackend;
use analysis_gateway::backend::IdentityInputBuilder;
use analysis_gateway::completion::ChatCompletionClient;
use analysis_gateway::config::Args;
use analysis_gateway::storage::{InMemoryStore, QuotaTracker};
use analysis_gateway::RateLimiter;
use clap::Parser;
use std::io;
use std::sync::Arc;

#[actix_web::main]
async fn main() -> io::Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let args = Args::parse();

    let authenticator = StaticTokenAuthenticator::parse(&args.tokens)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    if authenticator.is_empty() {
        log::warn!("No tokens configured, every analysis request will be rejected");
    }
    let authenticator: Arc<dyn Authenticator> = Arc::new(authenticator);

    let completion = ChatCompletionClient::builder(&args.api_key)
        .base_url(&args.upstream_url)
        .model(&args.model)
        .system_prompt(args.system_prompt.as_deref())
        .timeout(args.upstream_timeout())
        .build()
        .map_err(io::Error::other)?;

    let history = QuotaTracker::builder(InMemoryStore::new())
        .hard_cap(args.history_cap)
        .cleanup_threshold(args.cleanup_threshold)
        .build();
    let state = web::Data::new(AnalysisState::new(Arc::new(completion)).with_history(history));
    let backend = InMemoryBackend::builder().build();

    log::info!(
        "Listening on port {} with {} requests per {}s",
        args.port,
        args.rate_limit,
        args.rate_window
    );

    let port = args.port;
    let authenticator = web::Data::from(authenticator);
    HttpServer::new(move || {
        let input = IdentityInputBuilder::new(authenticator.clone().into_inner())
            .interval(args.rate_window())
            .max_requests(args.rate_limit)
            .build();
        let limiter = RateLimiter::builder(backend.clone(), input)
            .add_headers()
            .rollback_rejected_requests()
            .build();
        App::new()
            .app_data(authenticator.clone())
            .app_data(state.clone())
            .route("/health", web::get().to(analyze::health))
            .route("/history", web::get().to(analyze::history::<InMemoryStore>))
            .service(
                web::resource("/analyze")
                    .wrap(limiter)
                    .wrap(from_fn(analyze::reject_foreign_user))
                    .route(web::post().to(analyze::analyze::<InMemoryStore>)),
            )
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
