//! Contract tests for the CoinMarketCap adapter.
//!
//! A scripted HTTP transport replays provider answers so the request shape, status mapping and
//! payload handling can be checked end to end through the batch engine.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokenfetch_core::{
    Backoff, BatchOrchestrator, CoinMarketCapSource, ErrorKind, FetchStatus, FetchWindow,
    HttpAuth, HttpClient, HttpError, HttpRequest, HttpResponse, RateLimiter, RateLimiterConfig,
    RetryConfig, RetryPolicy,
};
use tokio_util::sync::CancellationToken;

/// Transport that answers from a queue and records every request.
#[derive(Default)]
struct ScriptedHttpClient {
    responses: Mutex<VecDeque<Result<HttpResponse, HttpError>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedHttpClient {
    fn replying(responses: impl IntoIterator<Item = Result<HttpResponse, HttpError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

impl HttpClient for ScriptedHttpClient {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
        self.requests.lock().expect("requests lock").push(request);
        let response = self
            .responses
            .lock()
            .expect("responses lock")
            .pop_front()
            .unwrap_or_else(|| Ok(HttpResponse::new(503, "script exhausted")));
        Box::pin(async move { response })
    }
}

fn window() -> FetchWindow {
    FetchWindow::parse("2024-01-01", "2024-01-02").expect("valid window")
}

fn engine(http: Arc<ScriptedHttpClient>) -> BatchOrchestrator {
    let source = CoinMarketCapSource::new(http, HttpAuth::cmc_api_key("test-key"));
    let limiter = RateLimiter::new(RateLimiterConfig {
        max_requests: 30,
        window: Duration::from_secs(60),
        cooldown: Duration::from_secs(66),
        pacing: false,
    })
    .expect("valid limiter");

    BatchOrchestrator::new(Arc::new(source), Arc::new(limiter)).with_retry(RetryPolicy::new(
        RetryConfig {
            max_attempts: 3,
            max_rate_limited_attempts: 10,
            backoff: Backoff::Fixed {
                delay: Duration::from_secs(1),
            },
            attempt_timeout: Duration::from_secs(30),
        },
    ))
}

fn quotes(prices: &[(f64, f64)]) -> serde_json::Value {
    json!(prices
        .iter()
        .map(|(price, market_cap)| json!({
            "timestamp": "2024-01-01T23:59:59.999Z",
            "quote": { "USD": { "price": price, "market_cap": market_cap } }
        }))
        .collect::<Vec<_>>())
}

// =============================================================================
// Contract: Request Shape
// =============================================================================

#[tokio::test(start_paused = true)]
async fn batched_ids_share_one_historical_request() {
    let body = json!({
        "status": { "error_code": 0 },
        "data": {
            "1": { "id": 1, "symbol": "BTC", "quotes": quotes(&[(40_000.0, 7.8e11), (42_000.0, 8.2e11)]) },
            "1027": { "id": 1027, "symbol": "ETH", "quotes": [] }
        }
    });
    let http = ScriptedHttpClient::replying([Ok(HttpResponse::ok_json(body.to_string()))]);

    let report = engine(Arc::clone(&http))
        .run(
            vec![(1, "BTC"), (1027, "ETH")],
            window(),
            CancellationToken::new(),
        )
        .await
        .expect("valid batch");

    let requests = http.requests();
    assert_eq!(requests.len(), 1);
    let url = &requests[0].url;
    assert!(url.starts_with(
        "https://pro-api.coinmarketcap.com/v2/cryptocurrency/quotes/historical?"
    ));
    assert!(url.contains("id=1%2C1027"));
    assert!(url.contains("time_start=2024-01-01T00%3A00%3A00Z"));
    assert!(url.contains("time_end=2024-01-02T23%3A59%3A59Z"));
    assert!(url.contains("interval=daily"));
    assert!(url.contains("convert=USD"));
    assert_eq!(
        requests[0].headers.get("x-cmc_pro_api_key").map(String::as_str),
        Some("test-key")
    );

    assert_eq!(report.results[0].status(), FetchStatus::Ok);
    assert_eq!(report.results[0].price(), Some(42_000.0));
    assert_eq!(report.results[0].market_cap(), Some(8.2e11));
    assert_eq!(report.results[1].status(), FetchStatus::NoData);
    assert!(report.is_complete());
}

#[tokio::test(start_paused = true)]
async fn bad_price_in_a_batched_answer_fails_only_that_id() {
    let body = json!({
        "data": {
            "1": { "quotes": quotes(&[(42_000.0, 8.2e11)]) },
            "2": { "quotes": quotes(&[(-1.0, 5.0e9)]) },
            "3": { "quotes": quotes(&[(2_300.0, 2.7e11)]) }
        }
    });
    let http = ScriptedHttpClient::replying([Ok(HttpResponse::ok_json(body.to_string()))]);

    let report = engine(Arc::clone(&http))
        .run(
            vec![(1, "BTC"), (2, "BAD"), (3, "ETH"), (4, "NEW")],
            window(),
            CancellationToken::new(),
        )
        .await
        .expect("valid batch");

    assert_eq!(http.requests().len(), 1);
    let ids: Vec<i64> = report.results.iter().map(|r| r.entity().id()).collect();
    assert_eq!(ids, vec![1, 3, 4]);
    assert_eq!(report.results[0].price(), Some(42_000.0));
    assert_eq!(report.results[1].price(), Some(2_300.0));
    assert_eq!(report.results[2].status(), FetchStatus::NoData);

    assert_eq!(report.errors.len(), 1);
    let entry = &report.errors[0];
    assert_eq!(entry.entity.id(), 2);
    assert_eq!(entry.status, FetchStatus::Invalid);
    assert_eq!(entry.kind, ErrorKind::MalformedPayload);
    assert_eq!(entry.attempts, 1);
    assert_eq!(report.summary.ok, 2);
    assert_eq!(report.summary.no_data, 1);
    assert_eq!(report.summary.invalid, 1);
}

#[tokio::test(start_paused = true)]
async fn rejected_batched_request_is_retried_one_id_at_a_time() {
    let rejected = r#"{"status":{"error_code":400,"error_message":"Invalid value for \"id\": \"2\""}}"#;
    let single = |id: &str, price: f64| {
        json!({ "data": { id: { "quotes": quotes(&[(price, price * 1_000.0)]) } } }).to_string()
    };
    let http = ScriptedHttpClient::replying([
        Ok(HttpResponse::new(400, rejected)),
        Ok(HttpResponse::ok_json(single("1", 42_000.0))),
        Ok(HttpResponse::new(400, rejected)),
        Ok(HttpResponse::ok_json(single("3", 2_300.0))),
    ]);

    let report = engine(Arc::clone(&http))
        .run(
            vec![(1, "BTC"), (2, "BAD"), (3, "ETH")],
            window(),
            CancellationToken::new(),
        )
        .await
        .expect("valid batch");

    let requests = http.requests();
    assert_eq!(requests.len(), 4);
    assert!(requests[0].url.contains("id=1%2C2%2C3&"));
    assert!(requests[1].url.contains("id=1&"));
    assert!(requests[2].url.contains("id=2&"));
    assert!(requests[3].url.contains("id=3&"));

    let ids: Vec<i64> = report.results.iter().map(|r| r.entity().id()).collect();
    assert_eq!(ids, vec![1, 3]);
    assert_eq!(report.results[1].price(), Some(2_300.0));
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].entity.id(), 2);
    assert_eq!(report.errors[0].kind, ErrorKind::ClientError);
    assert_eq!(report.errors[0].status, FetchStatus::Invalid);
    assert!(report.errors[0].message.contains("Invalid value"));
}

#[tokio::test(start_paused = true)]
async fn single_entity_payload_is_accepted() {
    let body = json!({
        "data": { "id": 5426, "symbol": "SOL", "quotes": quotes(&[(101.5, 4.4e10)]) }
    });
    let http = ScriptedHttpClient::replying([Ok(HttpResponse::ok_json(body.to_string()))]);

    let report = engine(Arc::clone(&http))
        .run(vec![(5426, "SOL")], window(), CancellationToken::new())
        .await
        .expect("valid batch");

    assert_eq!(report.results[0].price(), Some(101.5));
}

// =============================================================================
// Contract: Status Mapping
// =============================================================================

#[tokio::test(start_paused = true)]
async fn too_many_requests_triggers_cooldown_then_succeeds() {
    let body = json!({ "data": { "1": { "quotes": quotes(&[(42_000.0, 8.2e11)]) } } });
    let http = ScriptedHttpClient::replying([
        Ok(HttpResponse::new(
            429,
            r#"{"status":{"error_code":1008,"error_message":"You've exceeded your API Key's HTTP request rate limit."}}"#,
        )),
        Ok(HttpResponse::ok_json(body.to_string())),
    ]);
    let engine = engine(Arc::clone(&http));

    let report = engine
        .run(vec![(1, "BTC")], window(), CancellationToken::new())
        .await
        .expect("valid batch");

    assert_eq!(http.requests().len(), 2);
    assert_eq!(report.summary.cooldowns, 1);
    assert_eq!(report.summary.ok, 1);
    assert!(report.summary.elapsed_ms >= 66_000);
}

#[tokio::test(start_paused = true)]
async fn unauthorized_is_invalid_and_keeps_provider_message() {
    let http = ScriptedHttpClient::replying([Ok(HttpResponse::new(
        401,
        r#"{"status":{"error_code":1001,"error_message":"This API Key is invalid."}}"#,
    ))]);

    let report = engine(Arc::clone(&http))
        .run(vec![(1, "BTC")], window(), CancellationToken::new())
        .await
        .expect("valid batch");

    assert_eq!(http.requests().len(), 1);
    let entry = &report.errors[0];
    assert_eq!(entry.status, FetchStatus::Invalid);
    assert_eq!(entry.kind, ErrorKind::ClientError);
    assert!(entry.message.contains("This API Key is invalid."));
}

#[tokio::test(start_paused = true)]
async fn server_errors_are_retried_up_to_the_ceiling() {
    let http = ScriptedHttpClient::replying([
        Ok(HttpResponse::new(500, "")),
        Ok(HttpResponse::new(502, "")),
        Ok(HttpResponse::new(503, "")),
    ]);

    let report = engine(Arc::clone(&http))
        .run(vec![(1, "BTC")], window(), CancellationToken::new())
        .await
        .expect("valid batch");

    assert_eq!(http.requests().len(), 3);
    let entry = &report.errors[0];
    assert_eq!(entry.status, FetchStatus::Error);
    assert_eq!(entry.kind, ErrorKind::ServerError);
    assert_eq!(entry.attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn transport_timeout_is_retried() {
    let body = json!({ "data": { "1": { "quotes": quotes(&[(1.0, 2.0)]) } } });
    let http = ScriptedHttpClient::replying([
        Err(HttpError::timeout("request timed out")),
        Ok(HttpResponse::ok_json(body.to_string())),
    ]);

    let report = engine(Arc::clone(&http))
        .run(vec![(1, "BTC")], window(), CancellationToken::new())
        .await
        .expect("valid batch");

    assert_eq!(http.requests().len(), 2);
    assert_eq!(report.summary.ok, 1);
}

// =============================================================================
// Contract: Payload Handling
// =============================================================================

#[tokio::test(start_paused = true)]
async fn non_json_body_is_malformed_and_not_retried() {
    let http = ScriptedHttpClient::replying([Ok(HttpResponse::ok_json("<html>gateway</html>"))]);

    let report = engine(Arc::clone(&http))
        .run(vec![(1, "BTC")], window(), CancellationToken::new())
        .await
        .expect("valid batch");

    assert_eq!(http.requests().len(), 1);
    assert_eq!(report.errors[0].kind, ErrorKind::MalformedPayload);
    assert_eq!(report.errors[0].status, FetchStatus::Invalid);
}

#[tokio::test(start_paused = true)]
async fn null_price_means_no_data() {
    let body = json!({
        "data": { "1": { "quotes": [ { "quote": { "USD": { "price": null } } } ] } }
    });
    let http = ScriptedHttpClient::replying([Ok(HttpResponse::ok_json(body.to_string()))]);

    let report = engine(Arc::clone(&http))
        .run(vec![(1, "BTC")], window(), CancellationToken::new())
        .await
        .expect("valid batch");

    assert_eq!(report.results[0].status(), FetchStatus::NoData);
    assert_eq!(report.results[0].price(), None);
}
