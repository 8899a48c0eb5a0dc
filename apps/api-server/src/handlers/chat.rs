//! The admission pipeline: parse → estimate → admit → upstream → reconcile.
//!
//! Every path out of this handler settles the reservation exactly once. The
//! happy path commits with measured usage; upstream failure and timeout
//! release explicitly; a dropped future (client disconnect) releases through
//! the guard.

use actix_web::{HttpResponse, HttpResponseBuilder, web};

use tollgate_core::QuotaError;
use tollgate_core::engine::{AdmissionGuard, Decision, QuotaHeaders};
use tollgate_shared::ErrorBody;
use tollgate_shared::chat::ChatCompletionRequest;

use crate::middleware::auth::KeyIdentity;
use crate::middleware::error::ApiError;
use crate::observability::RequestTrace;
use crate::state::AppState;
use crate::upstream::Upstream;

/// POST /v1/chat/completions
pub async fn chat_completions(
    state: web::Data<AppState>,
    identity: KeyIdentity,
    trace: RequestTrace,
    body: web::Json<ChatCompletionRequest>,
) -> Result<HttpResponse, ApiError> {
    let request = body.into_inner();
    validate(&request)?;

    let prompt_estimate = state.estimator.estimate_prompt(&request);
    let decision = state
        .engine
        .admit(
            &identity.api_key,
            &identity.limits,
            prompt_estimate,
            request.max_tokens.map(u64::from),
        )
        .await
        .map_err(|error| match error {
            QuotaError::StoreUnavailable(source) => {
                tracing::warn!(key = %identity.api_key, error = %source, "admission unavailable");
                ApiError::StoreUnavailable
            }
            QuotaError::Invariant(detail) => ApiError::Internal(detail),
        })?;

    let (reservation, headers) = match decision {
        Decision::Rejected {
            headers,
            retry_after_secs,
        } => {
            tracing::debug!(key = %identity.api_key, retry_after_secs, "rate limit exceeded");
            return Ok(rejected_response(&headers, retry_after_secs));
        }
        Decision::Admitted {
            reservation,
            headers,
        } => (reservation, headers),
    };

    let guard = AdmissionGuard::new(state.engine.clone(), reservation);

    match tokio::time::timeout(state.upstream_timeout, state.upstream.chat(&request)).await {
        Err(_elapsed) => {
            settle_release(guard, &trace).await;
            Err(ApiError::UpstreamTimeout)
        }
        Ok(Err(error)) => {
            settle_release(guard, &trace).await;
            Err(ApiError::Upstream(error.to_string()))
        }
        Ok(Ok(response)) => {
            let (prompt_tokens, completion_tokens) = state.estimator.measure_usage(&response);
            if let Err(error) = guard.commit(prompt_tokens, completion_tokens).await {
                // The upstream call succeeded, so the client keeps its 200;
                // the sweep reconciles the counters.
                tracing::error!(
                    key = %identity.api_key,
                    request_id = %trace.as_str(),
                    %error,
                    "commit failed after upstream success"
                );
            }

            let mut builder = HttpResponse::Ok();
            apply_quota_headers(&mut builder, &headers);
            Ok(builder.json(response))
        }
    }
}

fn validate(request: &ChatCompletionRequest) -> Result<(), ApiError> {
    if request.model.is_empty() {
        return Err(ApiError::InvalidRequest("model must not be empty".into()));
    }
    if request.messages.is_empty() {
        return Err(ApiError::InvalidRequest(
            "messages must not be empty".into(),
        ));
    }
    if request.stream == Some(true) {
        return Err(ApiError::InvalidRequest(
            "streaming responses are not supported".into(),
        ));
    }
    Ok(())
}

fn apply_quota_headers(builder: &mut HttpResponseBuilder, headers: &QuotaHeaders) {
    builder
        .insert_header(("X-RateLimit-Limit-Requests", headers.limit_requests.to_string()))
        .insert_header((
            "X-RateLimit-Remaining-Requests",
            headers.remaining_requests.to_string(),
        ))
        .insert_header(("X-RateLimit-Limit-Tokens", headers.limit_tokens.to_string()))
        .insert_header((
            "X-RateLimit-Remaining-Tokens",
            headers.remaining_tokens.to_string(),
        ));
}

fn rejected_response(headers: &QuotaHeaders, retry_after_secs: u64) -> HttpResponse {
    let mut builder = HttpResponse::TooManyRequests();
    apply_quota_headers(&mut builder, headers);
    builder.insert_header(("Retry-After", retry_after_secs.to_string()));
    builder.json(ErrorBody::rate_limit_exceeded())
}

async fn settle_release(guard: AdmissionGuard, trace: &RequestTrace) {
    if let Err(error) = guard.release().await {
        tracing::warn!(
            request_id = %trace.as_str(),
            %error,
            "release failed, sweep will reclaim the reservation"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use actix_web::{App, test};
    use async_trait::async_trait;

    use tollgate_core::domain::{ApiKey, KeyLimits, KeyRegistry, WindowConfig};
    use tollgate_core::engine::{FailPolicy, QuotaEngine};
    use tollgate_core::estimator::TokenEstimator;
    use tollgate_infra::MemoryCounterStore;
    use tollgate_shared::chat::{ChatCompletionResponse, Usage};

    use crate::upstream::{Upstream, UpstreamError};

    /// Upstream answering instantly with fixed usage.
    struct FixedUpstream {
        prompt_tokens: u64,
        completion_tokens: u64,
    }

    #[async_trait]
    impl Upstream for FixedUpstream {
        async fn chat(
            &self,
            request: &ChatCompletionRequest,
        ) -> Result<ChatCompletionResponse, UpstreamError> {
            Ok(ChatCompletionResponse::assistant(
                request.model.clone(),
                "ok",
                Usage::new(self.prompt_tokens, self.completion_tokens),
            ))
        }
    }

    /// Upstream that always fails.
    struct FailingUpstream;

    #[async_trait]
    impl Upstream for FailingUpstream {
        async fn chat(
            &self,
            _request: &ChatCompletionRequest,
        ) -> Result<ChatCompletionResponse, UpstreamError> {
            Err(UpstreamError::Request("connection refused".into()))
        }
    }

    /// Upstream that never answers within any sane test deadline.
    struct StalledUpstream;

    #[async_trait]
    impl Upstream for StalledUpstream {
        async fn chat(
            &self,
            request: &ChatCompletionRequest,
        ) -> Result<ChatCompletionResponse, UpstreamError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ChatCompletionResponse::assistant(
                request.model.clone(),
                "late",
                Usage::new(1, 1),
            ))
        }
    }

    fn test_limits() -> KeyLimits {
        KeyLimits {
            input_tpm: 100,
            output_tpm: 200,
            rpm: 3,
        }
    }

    fn registry() -> KeyRegistry {
        let mut keys = HashMap::new();
        keys.insert("k1".to_string(), test_limits());
        KeyRegistry::new(keys)
    }

    fn state_with(
        upstream: Arc<dyn Upstream>,
        upstream_timeout: Duration,
    ) -> (AppState, Arc<MemoryCounterStore>) {
        let store = Arc::new(MemoryCounterStore::new(WindowConfig::default()));
        let engine = Arc::new(QuotaEngine::new(
            store.clone(),
            WindowConfig::default(),
            FailPolicy::Closed,
            50,
        ));
        let state = AppState {
            engine,
            estimator: TokenEstimator::new(),
            keys: Arc::new(registry()),
            store: store.clone(),
            upstream,
            upstream_timeout,
        };
        (state, store)
    }

    fn chat_request(
        key: &str,
        content: &str,
        max_tokens: Option<u32>,
    ) -> actix_http::Request {
        let mut body = serde_json::json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": content}],
        });
        if let Some(max_tokens) = max_tokens {
            body["max_tokens"] = max_tokens.into();
        }
        test::TestRequest::post()
            .uri("/v1/chat/completions")
            .insert_header(("Authorization", format!("Bearer {key}")))
            .set_json(&body)
            .to_request()
    }

    fn header_u64<B>(resp: &actix_web::dev::ServiceResponse<B>, name: &str) -> u64 {
        resp.headers()
            .get(name)
            .unwrap_or_else(|| panic!("missing header {name}"))
            .to_str()
            .unwrap()
            .parse()
            .unwrap()
    }

    fn prompt_estimate_for(content: &str) -> u64 {
        let request: ChatCompletionRequest = serde_json::from_value(serde_json::json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": content}],
        }))
        .unwrap();
        TokenEstimator::new().estimate_prompt(&request)
    }

    fn unix_now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    macro_rules! test_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state))
                    .app_data(
                        web::JsonConfig::default()
                            .error_handler(crate::middleware::error::json_error_handler),
                    )
                    .configure(crate::handlers::configure_routes),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn admission_reports_headers_and_reconciles_usage() {
        let (state, store) = state_with(
            Arc::new(FixedUpstream {
                prompt_tokens: 10,
                completion_tokens: 5,
            }),
            Duration::from_secs(5),
        );
        let app = test_app!(state);

        let in_est = prompt_estimate_for("Hi");
        assert!(in_est <= 10, "estimate {in_est} too large for this scenario");

        let resp = test::call_service(&app, chat_request("k1", "Hi", Some(20))).await;
        assert_eq!(resp.status(), 200);
        assert_eq!(header_u64(&resp, "X-RateLimit-Limit-Requests"), 3);
        assert_eq!(header_u64(&resp, "X-RateLimit-Remaining-Requests"), 2);
        // Output tokens bind: 20/200 reserved vs in_est/100 estimated.
        assert_eq!(header_u64(&resp, "X-RateLimit-Limit-Tokens"), 200);
        assert_eq!(header_u64(&resp, "X-RateLimit-Remaining-Tokens"), 180);

        // The commit replaced the reservation with true usage.
        let usage = store.window_usage("k1", unix_now());
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 5);
        assert_eq!(usage.requests, 1);

        // A second identical request sees the reconciled window; input is now
        // the proportionally tighter token dimension.
        let resp = test::call_service(&app, chat_request("k1", "Hi", Some(20))).await;
        assert_eq!(resp.status(), 200);
        assert_eq!(header_u64(&resp, "X-RateLimit-Remaining-Requests"), 1);
        assert_eq!(header_u64(&resp, "X-RateLimit-Limit-Tokens"), 100);
        assert_eq!(
            header_u64(&resp, "X-RateLimit-Remaining-Tokens"),
            100 - 10 - in_est
        );
    }

    #[actix_web::test]
    async fn request_ceiling_rejects_the_fourth_with_retry_hint() {
        let (state, _store) = state_with(
            Arc::new(FixedUpstream {
                prompt_tokens: 1,
                completion_tokens: 1,
            }),
            Duration::from_secs(5),
        );
        let app = test_app!(state);

        for _ in 0..3 {
            let resp = test::call_service(&app, chat_request("k1", "Hi", Some(10))).await;
            assert_eq!(resp.status(), 200);
        }

        let resp = test::call_service(&app, chat_request("k1", "Hi", Some(10))).await;
        assert_eq!(resp.status(), 429);
        let retry = header_u64(&resp, "Retry-After");
        assert!((55..=60).contains(&retry), "Retry-After was {retry}");
        assert_eq!(header_u64(&resp, "X-RateLimit-Remaining-Requests"), 0);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(
            body,
            serde_json::json!({
                "error": {
                    "message": "Rate limit exceeded",
                    "type": "rate_limit_exceeded",
                    "code": "rate_limit_exceeded"
                }
            })
        );
    }

    /// An exhausted output reservation blocks admissions until the commit
    /// shrinks it to true usage.
    #[tokio::test]
    async fn output_reservation_blocks_until_commit() {
        let store = Arc::new(MemoryCounterStore::new(WindowConfig::default()));
        let engine = QuotaEngine::new(
            store.clone(),
            WindowConfig::default(),
            FailPolicy::Closed,
            50,
        );
        let key = ApiKey::new("k1");
        let limits = test_limits();

        let first = engine
            .admit_at(&key, &limits, 1, Some(200), 0)
            .await
            .unwrap();
        let Decision::Admitted {
            reservation: Some(id),
            ..
        } = first
        else {
            panic!("first admission must succeed");
        };

        // Before reconcile the output dimension is fully reserved.
        let second = engine.admit_at(&key, &limits, 1, None, 0).await.unwrap();
        assert!(matches!(second, Decision::Rejected { .. }));

        engine.commit_at(id, 1, 5, 1).await.unwrap();

        let third = engine.admit_at(&key, &limits, 1, None, 1).await.unwrap();
        match third {
            Decision::Admitted { headers, .. } => {
                // 200 ceiling, 5 committed, 50 reserved by this admission.
                assert_eq!(headers.remaining_tokens, 145);
            }
            Decision::Rejected { .. } => panic!("capacity must be restored after commit"),
        }
    }

    #[actix_web::test]
    async fn upstream_failure_releases_the_reservation() {
        let (state, store) = state_with(Arc::new(FailingUpstream), Duration::from_secs(5));
        let app = test_app!(state);

        let resp = test::call_service(&app, chat_request("k1", "Hi", Some(200))).await;
        assert_eq!(resp.status(), 502);

        // Nothing leaked: counters back to zero, no open reservation.
        let usage = store.window_usage("k1", unix_now());
        assert_eq!(usage.requests, 0);
        assert_eq!(usage.output_tokens, 0);
        assert_eq!(store.open_reservations(), 0);
    }

    #[actix_web::test]
    async fn upstream_timeout_answers_504_and_releases() {
        let (state, store) = state_with(Arc::new(StalledUpstream), Duration::from_millis(50));
        let app = test_app!(state);

        let resp = test::call_service(&app, chat_request("k1", "Hi", Some(200))).await;
        assert_eq!(resp.status(), 504);
        assert_eq!(store.open_reservations(), 0);
        assert_eq!(store.window_usage("k1", unix_now()).requests, 0);
    }

    #[actix_web::test]
    async fn unknown_key_is_rejected_without_touching_counters() {
        let (state, store) = state_with(
            Arc::new(FixedUpstream {
                prompt_tokens: 1,
                completion_tokens: 1,
            }),
            Duration::from_secs(5),
        );
        let app = test_app!(state);

        let resp = test::call_service(&app, chat_request("nope", "Hi", None)).await;
        assert_eq!(resp.status(), 401);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "invalid_request_error");

        assert_eq!(store.window_usage("nope", unix_now()).requests, 0);
        assert_eq!(store.open_reservations(), 0);
    }

    #[actix_web::test]
    async fn missing_bearer_scheme_is_unauthorized() {
        let (state, _store) = state_with(
            Arc::new(FixedUpstream {
                prompt_tokens: 1,
                completion_tokens: 1,
            }),
            Duration::from_secs(5),
        );
        let app = test_app!(state);

        let req = test::TestRequest::post()
            .uri("/v1/chat/completions")
            .insert_header(("Authorization", "Basic abc"))
            .set_json(serde_json::json!({
                "model": "m",
                "messages": [{"role": "user", "content": "hi"}],
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 401);
    }

    #[actix_web::test]
    async fn malformed_body_is_a_client_error() {
        let (state, _store) = state_with(
            Arc::new(FixedUpstream {
                prompt_tokens: 1,
                completion_tokens: 1,
            }),
            Duration::from_secs(5),
        );
        let app = test_app!(state);

        let req = test::TestRequest::post()
            .uri("/v1/chat/completions")
            .insert_header(("Authorization", "Bearer k1"))
            .insert_header(("Content-Type", "application/json"))
            .set_payload("{not json")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400);
    }

    #[actix_web::test]
    async fn streaming_is_rejected_as_unsupported() {
        let (state, _store) = state_with(
            Arc::new(FixedUpstream {
                prompt_tokens: 1,
                completion_tokens: 1,
            }),
            Duration::from_secs(5),
        );
        let app = test_app!(state);

        let req = test::TestRequest::post()
            .uri("/v1/chat/completions")
            .insert_header(("Authorization", "Bearer k1"))
            .set_json(serde_json::json!({
                "model": "m",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true,
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400);
    }

    #[actix_web::test]
    async fn stale_reservation_is_swept_and_capacity_restored() {
        let store = Arc::new(MemoryCounterStore::new(WindowConfig::default()));
        let engine = QuotaEngine::new(
            store.clone(),
            WindowConfig::default(),
            FailPolicy::Closed,
            50,
        );
        let key = ApiKey::new("k1");
        let limits = test_limits();

        // Admit and "crash": no commit, no release.
        let decision = engine
            .admit_at(&key, &limits, 1, Some(200), 0)
            .await
            .unwrap();
        assert!(matches!(decision, Decision::Admitted { .. }));

        // Before the deadline the sweep leaves it alone.
        assert_eq!(engine.sweep_at(60).await.unwrap(), 0);

        // Past the deadline it is reclaimed and capacity comes back.
        assert_eq!(engine.sweep_at(121).await.unwrap(), 1);
        let after = engine.admit_at(&key, &limits, 1, Some(200), 121).await.unwrap();
        assert!(matches!(after, Decision::Admitted { .. }));
    }
}
