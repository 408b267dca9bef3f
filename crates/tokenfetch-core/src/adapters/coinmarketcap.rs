use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::data_source::{FetchError, QuoteBatch, QuoteRequest, QuoteSource};
use crate::domain::QuotePoint;
use crate::http_client::{HttpAuth, HttpClient, HttpError, HttpErrorKind, HttpRequest};
use crate::provider_policy::ProviderPolicy;

const DEFAULT_BASE_URL: &str = "https://pro-api.coinmarketcap.com";
const HISTORICAL_QUOTES_PATH: &str = "/v2/cryptocurrency/quotes/historical";

/// CoinMarketCap historical quotes adapter.
///
/// One call covers up to `max_ids_per_request` ids. The price and market cap of each entity come
/// from the last daily USD quote inside the window.
#[derive(Clone)]
pub struct CoinMarketCapSource {
    http_client: Arc<dyn HttpClient>,
    auth: HttpAuth,
    base_url: String,
    timeout_ms: u64,
    max_ids_per_request: usize,
}

impl CoinMarketCapSource {
    pub fn new(http_client: Arc<dyn HttpClient>, auth: HttpAuth) -> Self {
        Self::from_policy(http_client, auth, &ProviderPolicy::coinmarketcap_default())
    }

    pub fn from_policy(
        http_client: Arc<dyn HttpClient>,
        auth: HttpAuth,
        policy: &ProviderPolicy,
    ) -> Self {
        Self {
            http_client,
            auth,
            base_url: String::from(DEFAULT_BASE_URL),
            timeout_ms: policy.request_timeout.as_millis() as u64,
            max_ids_per_request: policy.max_ids_per_request.max(1),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_owned();
        self
    }

    fn build_request(&self, request: &QuoteRequest) -> HttpRequest {
        let ids = request
            .ids()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let time_start = format!("{}T00:00:00Z", request.window.start_str());
        let time_end = format!("{}T23:59:59Z", request.window.end_str());

        let url = format!(
            "{}{}?id={}&time_start={}&time_end={}&interval=daily&convert=USD",
            self.base_url,
            HISTORICAL_QUOTES_PATH,
            urlencoding::encode(&ids),
            urlencoding::encode(&time_start),
            urlencoding::encode(&time_end),
        );

        HttpRequest::get(url)
            .with_header("accept", "application/json")
            .with_auth(&self.auth)
            .with_timeout_ms(self.timeout_ms)
    }
}

impl QuoteSource for CoinMarketCapSource {
    fn name(&self) -> &'static str {
        "coinmarketcap"
    }

    fn max_ids_per_request(&self) -> usize {
        self.max_ids_per_request
    }

    fn fetch_quotes<'a>(
        &'a self,
        request: QuoteRequest,
    ) -> Pin<Box<dyn Future<Output = Result<QuoteBatch, FetchError>> + Send + 'a>> {
        Box::pin(async move {
            let http_request = self.build_request(&request);
            let response = self
                .http_client
                .execute(http_request)
                .await
                .map_err(transport_error)?;

            match response.status {
                200 => parse_historical(&response.body, &request),
                429 => Err(FetchError::rate_limited(status_message(429, &response.body))),
                408 => Err(FetchError::timeout(status_message(408, &response.body))),
                status @ 400..=499 => Err(FetchError::client_error(status_message(
                    status,
                    &response.body,
                ))),
                status => Err(FetchError::server_error(status_message(
                    status,
                    &response.body,
                ))),
            }
        })
    }
}

fn transport_error(error: HttpError) -> FetchError {
    let message = format!("coinmarketcap transport error: {}", error.message());
    match error.kind() {
        HttpErrorKind::Timeout => FetchError::timeout(message),
        HttpErrorKind::Connect | HttpErrorKind::Other => FetchError::network(message),
    }
}

/// Prefer the provider's own `status.error_message` when the body carries one.
fn status_message(status: u16, body: &str) -> String {
    let detail = serde_json::from_str::<Value>(body).ok().and_then(|value| {
        value
            .pointer("/status/error_message")
            .and_then(Value::as_str)
            .map(str::to_owned)
    });

    match detail {
        Some(detail) => format!("coinmarketcap returned status {status}: {detail}"),
        None => format!("coinmarketcap returned status {status}"),
    }
}

fn parse_historical(body: &str, request: &QuoteRequest) -> Result<QuoteBatch, FetchError> {
    let payload: Value = serde_json::from_str(body).map_err(|error| {
        FetchError::malformed_payload(format!("coinmarketcap body is not JSON: {error}"))
    })?;
    let data = payload
        .get("data")
        .and_then(Value::as_object)
        .ok_or_else(|| FetchError::malformed_payload("coinmarketcap payload has no data object"))?;

    let mut batch = QuoteBatch::new();

    if is_single_entity(data) {
        let id = data
            .get("id")
            .and_then(Value::as_i64)
            .or_else(|| single_requested_id(request));
        if let Some(id) = id.filter(|id| request.ids().any(|requested| requested == *id)) {
            if let Some(outcome) = last_quote(data, id).transpose() {
                batch.insert(id, outcome);
            }
        }
        return Ok(batch);
    }

    for id in request.ids() {
        let entry = match data.get(&id.to_string()) {
            Some(Value::Object(entry)) => Some(entry),
            Some(Value::Array(entries)) => entries.first().and_then(Value::as_object),
            _ => None,
        };
        if let Some(outcome) = entry.and_then(|entry| last_quote(entry, id).transpose()) {
            batch.insert(id, outcome);
        }
    }

    Ok(batch)
}

fn is_single_entity(data: &Map<String, Value>) -> bool {
    data.contains_key("quotes")
}

fn single_requested_id(request: &QuoteRequest) -> Option<i64> {
    match request.entities.as_slice() {
        [only] => Some(only.id()),
        _ => None,
    }
}

/// Latest USD quote of one entity, `None` when the window holds no priced quote.
fn last_quote(entry: &Map<String, Value>, id: i64) -> Result<Option<QuotePoint>, FetchError> {
    let Some(usd) = entry
        .get("quotes")
        .and_then(Value::as_array)
        .and_then(|quotes| quotes.last())
        .and_then(|quote| quote.pointer("/quote/USD"))
    else {
        return Ok(None);
    };

    let price = match usd.get("price") {
        None | Some(Value::Null) => return Ok(None),
        Some(value) => value.as_f64().ok_or_else(|| {
            FetchError::malformed_payload(format!("price for id {id} is not a number"))
        })?,
    };
    if !price.is_finite() || price < 0.0 {
        return Err(FetchError::malformed_payload(format!(
            "price for id {id} is out of range: {price}"
        )));
    }

    let market_cap = usd
        .get("market_cap")
        .and_then(Value::as_f64)
        .filter(|cap| cap.is_finite() && *cap >= 0.0);

    Ok(Some(QuotePoint { price, market_cap }))
}
