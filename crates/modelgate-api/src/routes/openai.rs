// OpenAI-compatible serving routes
//
// Every serving request runs the same pipeline: authenticate, authorize,
// rate-limit, resolve an upstream, forward, account + update the breaker.
// Bodies are forwarded byte-for-byte; the chat-template fallback is the one
// documented exception.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use futures::Stream;
use modelgate_core::openai::{
    fallback_completion_payload, is_chat_template_error, messages_to_prompt,
    normalize_completion_to_chat, UsageCounts,
};
use modelgate_core::{
    estimate_chat_prompt_tokens, GatewayError, ModelTask, UpstreamTimeouts,
};
use modelgate_storage::models::CreateUsage;
use modelgate_storage::repositories::record_usage_best_effort;
use modelgate_storage::Database;
use serde_json::{json, Value};

use crate::auth::{limiter_identifier, require_api_key, require_scope, AuthContext};
use crate::error::{ApiError, ApiResult, RequestId};
use crate::metrics::Metrics;
use crate::ratelimit::RateLimiter;
use crate::state::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/models", get(list_models))
        .route("/v1/models/status", get(models_status))
        .with_state(state)
}

async fn chat_completions(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(req_id): Extension<RequestId>,
    headers: HeaderMap,
    raw: Bytes,
) -> ApiResult<Response> {
    serve(state, addr, req_id, headers, raw, "/v1/chat/completions", ModelTask::Generate).await
}

async fn completions(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(req_id): Extension<RequestId>,
    headers: HeaderMap,
    raw: Bytes,
) -> ApiResult<Response> {
    serve(state, addr, req_id, headers, raw, "/v1/completions", ModelTask::Generate).await
}

async fn embeddings(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(req_id): Extension<RequestId>,
    headers: HeaderMap,
    raw: Bytes,
) -> ApiResult<Response> {
    serve(state, addr, req_id, headers, raw, "/v1/embeddings", ModelTask::Embed).await
}

/// Schema check on the fields the router reads; everything else passes
/// through untouched.
fn validate_shape(payload: &Value, path: &str) -> Result<(), GatewayError> {
    use modelgate_core::openai::{ChatCompletionRequest, CompletionRequest, EmbeddingsRequest};

    let invalid = |err: serde_json::Error| GatewayError::bad_request(format!("invalid request: {err}"));
    match path {
        "/v1/chat/completions" => {
            serde_json::from_value::<ChatCompletionRequest>(payload.clone()).map_err(invalid)?;
        }
        "/v1/completions" => {
            serde_json::from_value::<CompletionRequest>(payload.clone()).map_err(invalid)?;
        }
        "/v1/embeddings" => {
            serde_json::from_value::<EmbeddingsRequest>(payload.clone()).map_err(invalid)?;
        }
        _ => {}
    }
    Ok(())
}

/// Registry lookup wins; otherwise healthy round-robin over the static pool
/// for the task.
fn resolve_upstream(
    state: &AppState,
    model: &str,
    task_hint: ModelTask,
) -> Result<(String, ModelTask), GatewayError> {
    if !model.is_empty() {
        if let Some(entry) = state.registry.get(model) {
            // A registered route has no fallback pool; an open breaker means
            // the model is simply unavailable right now.
            if !state.breaker.is_available(&entry.url, Utc::now()) {
                return Err(GatewayError::NoUpstreams);
            }
            return Ok((entry.url, entry.task));
        }
    }
    let pool = match task_hint {
        ModelTask::Embed => state.settings.emb_urls(),
        ModelTask::Generate => state.settings.gen_urls(),
    };
    let url = state.balancer.choose(
        &pool,
        &state.health,
        &state.breaker,
        Utc::now(),
        state.settings.health_check_ttl_sec as i64,
    )?;
    Ok((url, task_hint))
}

async fn serve(
    state: AppState,
    addr: SocketAddr,
    req_id: RequestId,
    headers: HeaderMap,
    raw: Bytes,
    path: &'static str,
    task_hint: ModelTask,
) -> ApiResult<Response> {
    let fail = |err: GatewayError| ApiError::new(err, &req_id);

    let payload: Value = serde_json::from_slice(&raw)
        .map_err(|_| fail(GatewayError::bad_request("Invalid JSON")))?;
    validate_shape(&payload, path).map_err(fail)?;

    // 1-2: authenticate + authorize
    let auth = require_api_key(&state, &headers, Some(addr.ip()))
        .await
        .map_err(fail)?;
    require_scope(&auth, path).map_err(fail)?;

    // 3: rate limit
    let identifier = limiter_identifier(&headers, Some(addr.ip()));
    state.limiter.check(&identifier).await.map_err(fail)?;

    // 4: resolve upstream
    let model = payload
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let (base_url, task) = resolve_upstream(&state, &model, task_hint).map_err(fail)?;
    state
        .metrics
        .upstream_selected
        .with_label_values(&[path, &base_url])
        .inc();

    // 5-6: forward, account, update breaker
    let is_stream = payload.get("stream").and_then(Value::as_bool).unwrap_or(false)
        && matches!(path, "/v1/chat/completions" | "/v1/completions");
    if is_stream {
        forward_stream(state, req_id, payload, auth, identifier, base_url, path, task, model).await
    } else {
        forward_unary(state, req_id, payload, auth, base_url, path, task, model).await
    }
}

fn upstream_headers(state: &AppState, req_id: &RequestId) -> Vec<(&'static str, String)> {
    let mut headers = vec![("x-request-id", req_id.0.clone())];
    if !state.settings.internal_api_key.is_empty() {
        headers.push((
            "authorization",
            format!("Bearer {}", state.settings.internal_api_key),
        ));
    }
    headers
}

fn apply_headers(
    mut req: reqwest::RequestBuilder,
    headers: &[(&'static str, String)],
) -> reqwest::RequestBuilder {
    for (name, value) in headers {
        req = req.header(*name, value);
    }
    req
}

fn usage_record(
    auth: &AuthContext,
    model: &str,
    task: ModelTask,
    status: u16,
    started: Instant,
    req_id: &RequestId,
) -> CreateUsage {
    CreateUsage {
        org_id: auth.org_id,
        user_id: auth.user_id,
        key_id: auth.key_id,
        model_name: model.to_string(),
        task: task.as_str().to_string(),
        latency_ms: started.elapsed().as_millis() as i64,
        status_code: status as i32,
        req_id: req_id.0.clone(),
        ..Default::default()
    }
}

/// Fill token counts: upstream `usage` wins, the estimator approximates the
/// prompt side when the engine is silent. Completion tokens stay as reported
/// (zero when absent).
fn fill_tokens(
    record: &mut CreateUsage,
    counts: UsageCounts,
    payload: &Value,
    path: &str,
    estimation_enabled: bool,
) {
    let mut prompt = counts.prompt_tokens;
    let completion = counts.completion_tokens.unwrap_or(0);
    let mut total = counts.total_tokens;

    if prompt.is_none() && estimation_enabled {
        let estimate = if path.ends_with("/embeddings") {
            payload
                .get("input")
                .map(modelgate_core::tokens::estimate_prompt_tokens)
                .unwrap_or(0)
        } else if path.ends_with("/chat/completions") {
            payload
                .get("messages")
                .and_then(Value::as_array)
                .map(|messages| estimate_chat_prompt_tokens(messages))
                .unwrap_or(0)
        } else {
            payload
                .get("prompt")
                .map(modelgate_core::tokens::estimate_prompt_tokens)
                .unwrap_or(0)
        };
        prompt = Some(estimate);
    }
    let prompt = prompt.unwrap_or(0);
    if total.is_none() {
        total = Some(prompt + completion);
    }

    record.prompt_tokens = prompt as i64;
    record.completion_tokens = completion as i64;
    record.total_tokens = total.unwrap_or(0) as i64;
}

fn record_breaker_failure(state: &AppState, base_url: &str) {
    if state.breaker.record_failure(base_url, Utc::now()) {
        state
            .metrics
            .breaker_open
            .with_label_values(&[base_url])
            .inc();
    }
}

#[allow(clippy::too_many_arguments)]
async fn forward_unary(
    state: AppState,
    req_id: RequestId,
    payload: Value,
    auth: AuthContext,
    base_url: String,
    path: &'static str,
    task: ModelTask,
    model: String,
) -> ApiResult<Response> {
    let fail = |err: GatewayError| ApiError::new(err, &req_id);
    let started = Instant::now();
    let max_tokens = payload.get("max_tokens").and_then(Value::as_u64).unwrap_or(1000);
    let timeouts = UpstreamTimeouts::for_request(&model, max_tokens, false);
    let headers = upstream_headers(&state, &req_id);

    // Transient transport errors retry with linear backoff; 4xx/5xx from the
    // engine never retry.
    const RETRIES: u32 = 2;
    let mut response = None;
    for attempt in 0..=RETRIES {
        let attempt_started = Instant::now();
        let request = apply_headers(
            state.http.post(format!("{base_url}{path}")).json(&payload),
            &headers,
        )
        .timeout(timeouts.attempt_budget());

        match request.send().await {
            Ok(resp) => {
                let elapsed = attempt_started.elapsed().as_secs_f64();
                state
                    .metrics
                    .upstream_latency
                    .with_label_values(&[path])
                    .observe(elapsed);
                state
                    .metrics
                    .upstream_latency_by_upstream
                    .with_label_values(&[path, &base_url])
                    .observe(elapsed);
                response = Some(resp);
                break;
            }
            Err(err) if attempt < RETRIES && (err.is_timeout() || err.is_connect()) => {
                state
                    .metrics
                    .upstream_retries
                    .with_label_values(&[path])
                    .inc();
                tokio::time::sleep(std::time::Duration::from_millis(200 * (attempt as u64 + 1)))
                    .await;
            }
            Err(err) => {
                record_breaker_failure(&state, &base_url);
                let mut record = usage_record(&auth, &model, task, 0, started, &req_id);
                record.status_code = if err.is_timeout() { 408 } else { 502 };
                record_usage_best_effort(&state.db, record).await;
                if err.is_timeout() {
                    state
                        .metrics
                        .timeout_errors
                        .with_label_values(&[&model, "read_timeout", path])
                        .inc();
                    return Err(fail(GatewayError::ReadTimeout {
                        model: model.clone(),
                        retry_after: 30,
                    }));
                }
                return Err(fail(GatewayError::UpstreamUnreachable));
            }
        }
    }
    let response = response.ok_or_else(|| fail(GatewayError::UpstreamUnreachable))?;

    let status = response.status();
    let body = response.bytes().await.unwrap_or_default();

    if status.as_u16() >= 400 {
        let parsed: Value = serde_json::from_slice(&body)
            .unwrap_or_else(|_| json!({"error": String::from_utf8_lossy(&body)}));

        // Engines without a chat template reject the chat path with a 4xx;
        // reissue as a plain completion and normalize the shape back.
        if path == "/v1/chat/completions" && status.as_u16() < 500 && is_chat_template_error(&parsed)
        {
            if let Some(normalized) =
                chat_template_fallback(&state, &req_id, &payload, &base_url, &model).await
            {
                let mut record = usage_record(&auth, &model, task, 200, started, &req_id);
                fill_tokens(
                    &mut record,
                    UsageCounts::from_response(&normalized),
                    &payload,
                    path,
                    state.settings.token_estimation_enabled,
                );
                record_usage_best_effort(&state.db, record).await;
                state.breaker.record_success(&base_url);
                state
                    .metrics
                    .upstream_success
                    .with_label_values(&[path])
                    .inc();
                return Ok((StatusCode::OK, Json(normalized)).into_response());
            }
        }

        let record = usage_record(&auth, &model, task, status.as_u16(), started, &req_id);
        record_usage_best_effort(&state.db, record).await;
        if status.as_u16() >= 500 {
            record_breaker_failure(&state, &base_url);
        } else {
            state.breaker.record_success(&base_url);
        }
        state
            .metrics
            .upstream_error
            .with_label_values(&[path])
            .inc();
        let http_status =
            StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        return Ok((http_status, Json(parsed)).into_response());
    }

    let data: Value = serde_json::from_slice(&body)
        .map_err(|_| fail(GatewayError::bad_request("upstream returned malformed JSON")))?;

    let mut record = usage_record(&auth, &model, task, 200, started, &req_id);
    fill_tokens(
        &mut record,
        UsageCounts::from_response(&data),
        &payload,
        path,
        state.settings.token_estimation_enabled,
    );
    record_usage_best_effort(&state.db, record).await;
    state.breaker.record_success(&base_url);
    state
        .metrics
        .upstream_success
        .with_label_values(&[path])
        .inc();
    Ok((StatusCode::OK, Json(data)).into_response())
}

/// Reissue a chat request as a plain completion. Returns the normalized
/// chat-shaped body on success, None when the fallback also failed.
async fn chat_template_fallback(
    state: &AppState,
    req_id: &RequestId,
    payload: &Value,
    base_url: &str,
    model: &str,
) -> Option<Value> {
    let messages = payload.get("messages").and_then(Value::as_array)?;
    let prompt = messages_to_prompt(messages);
    let fallback_payload = fallback_completion_payload(payload, prompt);
    let max_tokens = fallback_payload
        .get("max_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(128);
    let timeouts = UpstreamTimeouts::for_request(model, max_tokens, false);

    let started = Instant::now();
    let request = apply_headers(
        state
            .http
            .post(format!("{base_url}/v1/completions"))
            .json(&fallback_payload),
        &upstream_headers(state, req_id),
    )
    .timeout(timeouts.attempt_budget());

    let response = request.send().await.ok()?;
    state
        .metrics
        .upstream_latency
        .with_label_values(&["/v1/completions"])
        .observe(started.elapsed().as_secs_f64());
    if response.status().as_u16() >= 400 {
        return None;
    }
    let completion: Value = response.json().await.ok()?;
    Some(normalize_completion_to_chat(&completion, model))
}

#[allow(clippy::too_many_arguments)]
async fn forward_stream(
    state: AppState,
    req_id: RequestId,
    payload: Value,
    auth: AuthContext,
    identifier: String,
    base_url: String,
    path: &'static str,
    task: ModelTask,
    model: String,
) -> ApiResult<Response> {
    let fail = |err: GatewayError| ApiError::new(err, &req_id);
    let started = Instant::now();

    // Concurrency slot is reserved before the upstream connection and given
    // back by the stream's single cleanup path.
    if !state.limiter.acquire_stream_slot(&identifier).await {
        return Err(fail(GatewayError::RateLimited(
            "too_many_concurrent_streams".into(),
        )));
    }

    let max_tokens = payload.get("max_tokens").and_then(Value::as_u64).unwrap_or(1000);
    let timeouts = UpstreamTimeouts::for_request(&model, max_tokens, true);
    let request = apply_headers(
        state.http.post(format!("{base_url}{path}")).json(&payload),
        &upstream_headers(&state, &req_id),
    )
    .timeout(timeouts.attempt_budget());

    let response = match request.send().await {
        Ok(resp) => resp,
        Err(err) => {
            state.limiter.release_stream_slot(&identifier).await;
            record_breaker_failure(&state, &base_url);
            let mut record = usage_record(&auth, &model, task, 502, started, &req_id);
            record.status_code = if err.is_timeout() { 408 } else { 502 };
            record_usage_best_effort(&state.db, record).await;
            return Err(fail(if err.is_timeout() {
                GatewayError::ReadTimeout {
                    model: model.clone(),
                    retry_after: 30,
                }
            } else {
                GatewayError::UpstreamUnreachable
            }));
        }
    };

    let status = response.status();
    if status.as_u16() >= 400 {
        // Error before the first chunk: materialize a unary error response
        let body = response.bytes().await.unwrap_or_default();
        state.limiter.release_stream_slot(&identifier).await;
        let record = usage_record(&auth, &model, task, status.as_u16(), started, &req_id);
        record_usage_best_effort(&state.db, record).await;
        if status.as_u16() >= 500 {
            record_breaker_failure(&state, &base_url);
            state
                .metrics
                .upstream_error
                .with_label_values(&[path])
                .inc();
        }
        let parsed: Value = serde_json::from_slice(&body)
            .unwrap_or_else(|_| json!({"error": String::from_utf8_lossy(&body)}));
        let http_status =
            StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        return Ok((http_status, Json(parsed)).into_response());
    }

    // First successful status: the breaker sees a success even if the client
    // later disconnects mid-stream.
    state.breaker.record_success(&base_url);
    state
        .metrics
        .upstream_success
        .with_label_values(&[path])
        .inc();

    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("text/event-stream")
        .to_string();

    let mut record = usage_record(&auth, &model, task, status.as_u16(), started, &req_id);
    fill_tokens(
        &mut record,
        UsageCounts::default(),
        &payload,
        path,
        state.settings.token_estimation_enabled,
    );

    let proxy = ProxyStream {
        inner: Box::pin(response.bytes_stream()),
        cleanup: Some(StreamCleanup {
            limiter: state.limiter.clone(),
            identifier,
            db: state.db.clone(),
            record,
            started,
        }),
        saw_first_chunk: false,
        started,
        metrics: state.metrics.clone(),
        path,
    };

    let response = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", content_type)
        .body(Body::from_stream(proxy))
        .map_err(|err| fail(GatewayError::Internal(err.into())))?;
    Ok(response)
}

/// Deferred bookkeeping for one stream: slot release + usage write. Runs
/// exactly once, from the stream's terminal state or its drop.
struct StreamCleanup {
    limiter: RateLimiter,
    identifier: String,
    db: Arc<Database>,
    record: CreateUsage,
    started: Instant,
}

impl StreamCleanup {
    fn run(mut self) {
        self.record.latency_ms = self.started.elapsed().as_millis() as i64;
        tokio::spawn(async move {
            self.limiter.release_stream_slot(&self.identifier).await;
            record_usage_best_effort(&self.db, self.record).await;
        });
    }
}

/// Byte-for-byte upstream passthrough with TTFT observation and a single
/// cleanup hook. Dropping the response body (client disconnect) closes the
/// upstream connection and still runs the cleanup.
struct ProxyStream {
    inner: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    cleanup: Option<StreamCleanup>,
    saw_first_chunk: bool,
    started: Instant,
    metrics: Arc<Metrics>,
    path: &'static str,
}

impl Stream for ProxyStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if !self.saw_first_chunk && !chunk.is_empty() {
                    self.saw_first_chunk = true;
                    self.metrics
                        .stream_ttft
                        .with_label_values(&[self.path])
                        .observe(self.started.elapsed().as_secs_f64());
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                if let Some(cleanup) = self.cleanup.take() {
                    cleanup.run();
                }
                Poll::Ready(Some(Err(std::io::Error::other(err))))
            }
            Poll::Ready(None) => {
                if let Some(cleanup) = self.cleanup.take() {
                    cleanup.run();
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ProxyStream {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup.run();
        }
    }
}

/// Served models visible to clients (registry view)
async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let data: Vec<Value> = state
        .registry
        .snapshot()
        .into_iter()
        .map(|(name, entry)| {
            json!({
                "id": name,
                "object": "model",
                "url": entry.url,
                "task": entry.task,
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

/// Health-derived running/down view per served model. No secrets.
async fn models_status(State(state): State<AppState>) -> Json<Value> {
    let now = Utc::now();
    let ttl = state.settings.health_check_ttl_sec as i64;
    let data: Vec<Value> = state
        .registry
        .snapshot()
        .into_iter()
        .map(|(name, entry)| {
            let ok = state.health.is_fresh_ok(&entry.url, now, ttl);
            json!({
                "name": name,
                "served_model_name": name,
                "task": entry.task,
                "engine_type": entry.engine_type,
                "state": if ok { "running" } else { "down" },
                "url": entry.url,
            })
        })
        .collect();
    Json(json!({ "data": data }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> CreateUsage {
        CreateUsage {
            model_name: "m".into(),
            task: "generate".into(),
            ..Default::default()
        }
    }

    #[test]
    fn upstream_usage_wins_over_the_estimator() {
        let mut rec = record();
        fill_tokens(
            &mut rec,
            UsageCounts {
                prompt_tokens: Some(11),
                completion_tokens: Some(22),
                total_tokens: Some(33),
            },
            &json!({"messages": [{"role": "user", "content": "x".repeat(400)}]}),
            "/v1/chat/completions",
            true,
        );
        assert_eq!(rec.prompt_tokens, 11);
        assert_eq!(rec.completion_tokens, 22);
        assert_eq!(rec.total_tokens, 33);
    }

    #[test]
    fn estimator_fills_prompt_only_when_upstream_is_silent() {
        let mut rec = record();
        fill_tokens(
            &mut rec,
            UsageCounts::default(),
            &json!({"messages": [{"role": "user", "content": "x".repeat(400)}]}),
            "/v1/chat/completions",
            true,
        );
        assert_eq!(rec.prompt_tokens, 100);
        assert_eq!(rec.completion_tokens, 0, "completion stays unreported");
        assert_eq!(rec.total_tokens, 100);
    }

    #[test]
    fn embeddings_estimate_sums_the_input_list() {
        let mut rec = record();
        fill_tokens(
            &mut rec,
            UsageCounts::default(),
            &json!({"input": ["abcd", "efghijkl"]}),
            "/v1/embeddings",
            true,
        );
        assert_eq!(rec.prompt_tokens, 3);
    }

    #[test]
    fn estimator_disabled_leaves_zeroes() {
        let mut rec = record();
        fill_tokens(
            &mut rec,
            UsageCounts::default(),
            &json!({"prompt": "x".repeat(80)}),
            "/v1/completions",
            false,
        );
        assert_eq!(rec.prompt_tokens, 0);
        assert_eq!(rec.total_tokens, 0);
    }
}
