//! The analysis edge function.
//!
//! `POST /analyze` forwards the caller's prompt to the completion API and relays the JSON it
//! answers with. Authentication and rate limiting happen in front of the handler, in the
//! [RateLimiter](crate::RateLimiter) middleware, so by the time the handler runs the caller is
//! known and has quota left. Wrap the limiter in [reject_foreign_user] so that requests made on
//! behalf of someone else are refused before they reach it.

use crate::auth::Identity;
use crate::completion::{CompletionClient, CompletionError};
use crate::storage::{now_millis, KeyValueStore, QuotaTracker, StorageError};
use actix_web::body::{EitherBody, MessageBody};
use actix_web::dev::{Payload, ServiceRequest, ServiceResponse};
use actix_web::http::StatusCode;
use actix_web::middleware::Next;
use actix_web::{web, FromRequest, HttpResponse, ResponseError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

const HISTORY_PREFIX: &str = "analysis";

#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error("Prompt must not be empty")]
    EmptyPrompt,
    #[error("Request user does not match the authenticated user")]
    IdentityMismatch,
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ResponseError for AnalyzeError {
    fn status_code(&self) -> StatusCode {
        match self {
            AnalyzeError::EmptyPrompt => StatusCode::BAD_REQUEST,
            AnalyzeError::IdentityMismatch => StatusCode::FORBIDDEN,
            AnalyzeError::Completion(_) | AnalyzeError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = match self {
            AnalyzeError::Completion(CompletionError::Upstream { status, body }) => {
                serde_json::json!({
                    "error": self.to_string(),
                    "upstreamStatus": status,
                    "details": body,
                })
            }
            _ => serde_json::json!({ "error": self.to_string() }),
        };
        HttpResponse::build(self.status_code()).json(body)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    pub prompt: String,
    /// When present, must name the authenticated user.
    #[serde(default)]
    pub user_id: Option<String>,
}

/// The part of an [AnalyzeRequest] the user guard looks at.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserClaim {
    #[serde(default)]
    user_id: Option<String>,
}

fn check_user(identity: &Identity, user_id: Option<&str>) -> Result<(), AnalyzeError> {
    match user_id {
        Some(user_id) if user_id != identity.subject() => {
            log::warn!("{identity} attempted to analyse on behalf of {user_id}");
            Err(AnalyzeError::IdentityMismatch)
        }
        _ => Ok(()),
    }
}

/// Middleware refusing with 403 any request whose JSON body names a `userId` other than the
/// authenticated caller.
///
/// Register it outside the [RateLimiter](crate::RateLimiter) (with `wrap` after the limiter's) so
/// the refusal happens before any quota is consumed. Requests that fail authentication, or whose
/// body is not a JSON object, are passed on untouched for the limiter and handler to answer.
pub async fn reject_foreign_user<B: MessageBody + 'static>(
    mut req: ServiceRequest,
    next: Next<B>,
) -> Result<ServiceResponse<EitherBody<B>>, actix_web::Error> {
    let body = req.extract::<web::Bytes>().await?;
    let claim = serde_json::from_slice::<UserClaim>(&body).ok();
    req.set_payload(Payload::from(body));

    if let Some(user_id) = claim.and_then(|c| c.user_id) {
        if let Ok(identity) = Identity::extract(req.request()).await {
            if let Err(e) = check_user(&identity, Some(&user_id)) {
                return Ok(req.into_response(e.error_response()).map_into_right_body());
            }
        }
    }
    next.call(req).await.map(ServiceResponse::map_into_left_body)
}

/// A stored analysis, as kept in the history store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    /// Unix milliseconds, also the eviction recency signal.
    pub timestamp: i64,
    pub subject: String,
    pub result: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub analyses: Vec<AnalysisRecord>,
}

/// Shared state of the analysis routes.
pub struct AnalysisState<S> {
    completion: Arc<dyn CompletionClient + Send + Sync>,
    history: Option<QuotaTracker<S>>,
    sequence: AtomicU64,
}

impl<S: KeyValueStore> AnalysisState<S> {
    pub fn new(completion: Arc<dyn CompletionClient + Send + Sync>) -> Self {
        Self {
            completion,
            history: None,
            sequence: AtomicU64::new(0),
        }
    }

    /// Keep every successful analysis in a quota managed store.
    pub fn with_history(mut self, history: QuotaTracker<S>) -> Self {
        self.history = Some(history);
        self
    }

    async fn record(&self, identity: &Identity, result: &serde_json::Value) {
        let Some(history) = &self.history else { return };
        let record = AnalysisRecord {
            timestamp: now_millis(),
            subject: identity.subject().to_owned(),
            result: result.clone(),
        };
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let key = format!(
            "{}{:013}-{sequence}",
            history_prefix(identity),
            record.timestamp
        );
        let value = match serde_json::to_string(&record) {
            Ok(value) => value,
            Err(e) => {
                log::error!("Unable to serialise analysis for {identity}: {e}");
                return;
            }
        };
        if let Err(e) = history.set(&key, value).await {
            log::error!("Unable to store analysis for {identity}: {e}");
        }
    }

    async fn history(&self, identity: &Identity) -> Result<Vec<AnalysisRecord>, StorageError> {
        let Some(history) = &self.history else {
            return Ok(Vec::new());
        };
        let store = history.store();
        let prefix = history_prefix(identity);
        let keys = store.list_keys().await.map_err(StorageError::list)?;
        let mut records = Vec::new();
        for key in keys.iter().filter(|k| k.starts_with(&prefix)) {
            let Some(value) = store
                .get(key)
                .await
                .map_err(|e| StorageError::read(key, e))?
            else {
                continue;
            };
            match serde_json::from_str::<AnalysisRecord>(&value) {
                Ok(record) => records.push(record),
                Err(e) => log::warn!("Skipping unreadable history entry {key:?}: {e}"),
            }
        }
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(records)
    }
}

fn history_prefix(identity: &Identity) -> String {
    format!("{HISTORY_PREFIX}:{}:", identity.subject())
}

/// `POST /analyze`
pub async fn analyze<S: KeyValueStore + 'static>(
    state: web::Data<AnalysisState<S>>,
    identity: Identity,
    body: web::Json<AnalyzeRequest>,
) -> Result<HttpResponse, AnalyzeError> {
    let request = body.into_inner();
    check_user(&identity, request.user_id.as_deref())?;
    let prompt = request.prompt.trim();
    if prompt.is_empty() {
        return Err(AnalyzeError::EmptyPrompt);
    }

    let result = state.completion.complete(prompt).await.map_err(|e| {
        log::error!("Analysis for {identity} failed: {e}");
        e
    })?;
    state.record(&identity, &result).await;
    Ok(HttpResponse::Ok().json(result))
}

/// `GET /history`
pub async fn history<S: KeyValueStore + 'static>(
    state: web::Data<AnalysisState<S>>,
    identity: Identity,
) -> Result<HttpResponse, AnalyzeError> {
    let analyses = state.history(&identity).await?;
    Ok(HttpResponse::Ok().json(HistoryResponse { analyses }))
}

/// `GET /health`
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "healthy" }))
}

#[cfg(all(test, feature = "dashmap"))]
mod tests {
    use super::*;
    use crate::auth::{Authenticator, StaticTokenAuthenticator};
    use crate::backend::memory::InMemoryBackend;
    use crate::backend::IdentityInputBuilder;
    use crate::storage::InMemoryStore;
    use crate::RateLimiter;
    use actix_web::http::header::AUTHORIZATION;
    use actix_web::test::{self, read_body_json, TestRequest};
    use actix_web::middleware::from_fn;
    use actix_web::App;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Answers with queued results and remembers the prompts it was given.
    #[derive(Default)]
    struct MockCompletion {
        prompts: Mutex<Vec<String>>,
        failure: Option<(u16, String)>,
    }

    #[async_trait(?Send)]
    impl CompletionClient for MockCompletion {
        async fn complete(&self, prompt: &str) -> Result<serde_json::Value, CompletionError> {
            self.prompts.lock().unwrap().push(prompt.to_owned());
            match &self.failure {
                Some((status, body)) => Err(CompletionError::Upstream {
                    status: *status,
                    body: body.clone(),
                }),
                None => Ok(json!({ "skinType": "combination", "prompt": prompt })),
            }
        }
    }

    struct Fixture {
        completion: Arc<MockCompletion>,
        store: InMemoryStore,
        backend: InMemoryBackend,
    }

    impl Fixture {
        fn new(completion: MockCompletion) -> Self {
            Self {
                completion: Arc::new(completion),
                store: InMemoryStore::new(),
                backend: InMemoryBackend::builder().with_gc_interval(None).build(),
            }
        }
    }

    macro_rules! init_app {
        ($fixture:expr, $max_requests:expr) => {{
            let authenticator: Arc<dyn Authenticator> = Arc::new(
                StaticTokenAuthenticator::new()
                    .with_token("u1", "t1")
                    .with_token("u2", "t2"),
            );
            let input = IdentityInputBuilder::new(authenticator.clone())
                .max_requests($max_requests)
                .build();
            let limiter = RateLimiter::builder($fixture.backend.clone(), input)
                .add_headers()
                .rollback_rejected_requests()
                .build();
            let tracker = QuotaTracker::builder($fixture.store.clone()).build();
            let state = AnalysisState::new($fixture.completion.clone()).with_history(tracker);
            test::init_service(
                App::new()
                    .app_data(web::Data::from(authenticator))
                    .app_data(web::Data::new(state))
                    .route("/history", web::get().to(history::<InMemoryStore>))
                    .service(
                        web::resource("/analyze")
                            .wrap(limiter)
                            .wrap(from_fn(reject_foreign_user))
                            .route(web::post().to(analyze::<InMemoryStore>)),
                    ),
            )
            .await
        }};
    }

    fn analyze_request(token: &str, body: serde_json::Value) -> TestRequest {
        TestRequest::post()
            .uri("/analyze")
            .insert_header((AUTHORIZATION, format!("Bearer {token}")))
            .set_json(body)
    }

    macro_rules! post_analyze {
        ($app:expr, $token:expr, $body:expr) => {
            test::call_service(&$app, analyze_request($token, $body).to_request()).await
        };
    }

    #[actix_web::test]
    async fn test_analysis_is_relayed_and_recorded() {
        let fixture = Fixture::new(MockCompletion::default());
        let app = init_app!(fixture, 10);

        let response = post_analyze!(app, "t1", json!({"prompt": " oily? "}));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "9");
        let body: serde_json::Value = read_body_json(response).await;
        assert_eq!(body, json!({ "skinType": "combination", "prompt": "oily?" }));
        assert_eq!(*fixture.completion.prompts.lock().unwrap(), vec!["oily?"]);

        let keys = fixture.store.list_keys().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].starts_with("analysis:u1:"));

        let response = test::call_service(
            &app,
            TestRequest::get()
                .uri("/history")
                .insert_header((AUTHORIZATION, "Bearer t1"))
                .to_request(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = read_body_json(response).await;
        assert_eq!(body["analyses"][0]["subject"], "u1");
        assert_eq!(body["analyses"][0]["result"]["skinType"], "combination");

        // Other users only see their own history
        let response = test::call_service(
            &app,
            TestRequest::get()
                .uri("/history")
                .insert_header((AUTHORIZATION, "Bearer t2"))
                .to_request(),
        )
        .await;
        let body: serde_json::Value = read_body_json(response).await;
        assert_eq!(body["analyses"], json!([]));
    }

    #[actix_web::test]
    async fn test_unauthenticated_requests_are_rejected_first() {
        let fixture = Fixture::new(MockCompletion::default());
        let app = init_app!(fixture, 10);

        let response = test::call_service(
            &app,
            TestRequest::post()
                .uri("/analyze")
                .set_json(json!({"prompt": "hi"}))
                .to_request(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response = post_analyze!(app, "nope", json!({"prompt": "hi"}));
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        assert!(fixture.backend.is_empty());
        assert!(fixture.completion.prompts.lock().unwrap().is_empty());

        let response =
            test::call_service(&app, TestRequest::get().uri("/history").to_request()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    async fn test_rate_limit_denies_without_calling_downstream() {
        let fixture = Fixture::new(MockCompletion::default());
        let app = init_app!(fixture, 2);

        for _ in 0..2 {
            let response = post_analyze!(app, "t1", json!({"prompt": "hi"}));
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = post_analyze!(app, "t1", json!({"prompt": "hi"}));
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));
        let body: serde_json::Value = read_body_json(response).await;
        assert!(body["retryAfter"].as_u64().is_some());
        assert_eq!(fixture.completion.prompts.lock().unwrap().len(), 2);

        // Another identity has its own window
        let response = post_analyze!(app, "t2", json!({"prompt": "hi"}));
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn test_rejected_requests_do_not_consume_quota() {
        let fixture = Fixture::new(MockCompletion::default());
        let app = init_app!(fixture, 1);

        let response = post_analyze!(app, "t1", json!({"prompt": "hi", "userId": "u2"}));
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let response = post_analyze!(app, "t1", json!({"prompt": "   "}));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = read_body_json(response).await;
        assert_eq!(body["error"], "Prompt must not be empty");
        assert!(fixture.completion.prompts.lock().unwrap().is_empty());

        // The single admission is still available
        let response = post_analyze!(app, "t1", json!({"prompt": "hi", "userId": "u1"}));
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn test_foreign_user_refused_even_when_limited() {
        let fixture = Fixture::new(MockCompletion::default());
        let app = init_app!(fixture, 1);

        let response = post_analyze!(app, "t1", json!({"prompt": "hi"}));
        assert_eq!(response.status(), StatusCode::OK);

        // The window is full, but acting for someone else is refused first
        let response = post_analyze!(app, "t1", json!({"prompt": "hi", "userId": "u2"}));
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(!response.headers().contains_key("retry-after"));
        let body: serde_json::Value = read_body_json(response).await;
        assert_eq!(body["error"], "Request user does not match the authenticated user");

        // Naming yourself is still subject to the limit
        let response = post_analyze!(app, "t1", json!({"prompt": "hi", "userId": "u1"}));
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(fixture.completion.prompts.lock().unwrap().len(), 1);
    }

    #[actix_web::test]
    async fn test_foreign_user_consumes_nothing() {
        let fixture = Fixture::new(MockCompletion::default());
        let app = init_app!(fixture, 1);

        let response = post_analyze!(app, "t1", json!({"prompt": "hi", "userId": "u2"}));
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        // Refused before the limiter, so no window was opened
        assert!(fixture.backend.is_empty());

        // Bad credentials are still answered by the limiter's authentication
        let response = post_analyze!(app, "nope", json!({"prompt": "hi", "userId": "u2"}));
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    async fn test_upstream_failure_is_surfaced() {
        let fixture = Fixture::new(MockCompletion {
            failure: Some((503, "overloaded".to_string())),
            ..MockCompletion::default()
        });
        let app = init_app!(fixture, 10);

        let response = post_analyze!(app, "t1", json!({"prompt": "hi"}));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value = read_body_json(response).await;
        assert_eq!(body["upstreamStatus"], 503);
        assert_eq!(body["details"], "overloaded");
        assert!(body["error"].as_str().unwrap().contains("503"));
        // Nothing was recorded
        assert!(fixture.store.is_empty());
    }

    #[actix_web::test]
    async fn test_health() {
        let app = test::init_service(App::new().route("/health", web::get().to(health))).await;
        let response =
            test::call_service(&app, TestRequest::get().uri("/health").to_request()).await;
        let body: serde_json::Value = read_body_json(response).await;
        assert_eq!(body["status"], "healthy");
    }
}
