use crate::api::auth::{ApiCredentials, JwtSigner};
use crate::models::{AmountKind, OrderSide, PriceQuote, ProductInfo, QuoteCurrency};
use governor::{Quota, RateLimiter};
use reqwest::{Client, Method};
use serde::Deserialize;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

const COINBASE_API_BASE: &str = "https://api.coinbase.com";
const MAX_REQUESTS_PER_SECOND: u32 = 10;
const MAX_RETRIES: u32 = 3;
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Quote currencies tried in order when none are given explicitly. USD pairs
/// are left out: they need a USD-denominated account, which this account type
/// does not have. Callers that do have one can pass USD explicitly.
pub const DEFAULT_QUOTE_PRIORITY: &[QuoteCurrency] = &[
    QuoteCurrency::Usdc,
    QuoteCurrency::Eur,
    QuoteCurrency::Usdt,
];

// Type alias for the rate limiter to simplify signatures
type VenueRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Failure taxonomy for venue calls.
///
/// Transient failures are retried with bounded backoff; terminal failures are
/// surfaced immediately and the calling decision is abandoned for the cycle.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transient transport failure: {0}")]
    Transient(String),
    #[error("request rejected ({status}): {message}")]
    Terminal { status: u16, message: String },
    #[error("no price available for {asset} on any preferred quote")]
    NotFound { asset: String },
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("failed to sign request: {0}")]
    Signing(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Result of a market order submission.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderOutcome {
    Filled { order_id: String },
    Rejected { reason: String },
}

#[derive(Debug, Deserialize)]
struct TickerResponse {
    price: Option<String>,
    best_bid: Option<String>,
    best_ask: Option<String>,
}

impl TickerResponse {
    /// Price falls back to best ask, then best bid; only strictly positive
    /// prices count as a usable quote.
    fn into_quote(self, currency: QuoteCurrency, pair: String) -> Option<PriceQuote> {
        let parse = |v: &Option<String>| v.as_deref().and_then(|s| s.parse::<f64>().ok());

        let price = parse(&self.price)
            .filter(|p| *p > 0.0)
            .or_else(|| parse(&self.best_ask).filter(|p| *p > 0.0))
            .or_else(|| parse(&self.best_bid).filter(|p| *p > 0.0))?;

        Some(PriceQuote {
            price,
            currency,
            best_bid: parse(&self.best_bid).unwrap_or(price),
            best_ask: parse(&self.best_ask).unwrap_or(price),
            pair,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct Account {
    pub currency: String,
    pub available_balance: Balance,
}

#[derive(Debug, Deserialize)]
pub struct Balance {
    pub value: String,
}

impl Account {
    pub fn available(&self) -> f64 {
        self.available_balance.value.parse().unwrap_or(0.0)
    }
}

#[derive(Debug, Deserialize)]
struct AccountsResponse {
    #[serde(default)]
    accounts: Vec<Account>,
}

#[derive(Debug, Deserialize)]
struct ProductResponse {
    product_id: String,
    base_increment: String,
    base_min_size: String,
    base_max_size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    success: bool,
    success_response: Option<OrderSuccess>,
    error_response: Option<OrderError>,
}

#[derive(Debug, Deserialize)]
struct OrderSuccess {
    #[serde(default)]
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct OrderError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

/// Authenticated, rate-limited, retrying client for the venue's Advanced
/// Trade API.
///
/// Cloneable: all clones share the rate limiter and the product metadata
/// cache, so the request ceiling holds process-wide.
#[derive(Clone)]
pub struct CoinbaseClient {
    client: Client,
    base_url: String,
    signer: Option<Arc<JwtSigner>>,
    rate_limiter: Arc<VenueRateLimiter>,
    /// Product precision rules change rarely; cached for the process lifetime
    product_cache: Arc<RwLock<HashMap<String, ProductInfo>>>,
    initial_retry_delay: Duration,
}

impl CoinbaseClient {
    /// Create a client that signs authenticated calls with the given key.
    pub fn new(credentials: &ApiCredentials) -> anyhow::Result<Self> {
        Ok(Self::build(Some(Arc::new(JwtSigner::new(credentials)?))))
    }

    /// Public market data only; authenticated calls go out unsigned and will
    /// be rejected by the venue.
    pub fn unauthenticated() -> Self {
        Self::build(None)
    }

    fn build(signer: Option<Arc<JwtSigner>>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");

        let quota = Quota::per_second(NonZeroU32::new(MAX_REQUESTS_PER_SECOND).unwrap());

        Self {
            client,
            base_url: COINBASE_API_BASE.to_string(),
            signer,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            product_cache: Arc::new(RwLock::new(HashMap::new())),
            initial_retry_delay: INITIAL_RETRY_DELAY,
        }
    }

    /// Point the client at a different host (tests use a local mock server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Override the first backoff step so tests run with deterministic,
    /// short delays.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.initial_retry_delay = delay;
        self
    }

    /// Dispatch a request, waiting on the rate limiter and retrying transient
    /// failures with exponential backoff. Client errors (4xx) are terminal.
    /// Authenticated calls get a freshly minted token on every attempt.
    async fn request_with_retry(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        authenticated: bool,
    ) -> ApiResult<reqwest::Response> {
        let mut delay = self.initial_retry_delay;
        let mut last_error = ApiError::Transient("no attempts made".to_string());

        for attempt in 1..=MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            let url = format!("{}{}", self.base_url, path);
            let mut request = self.client.request(method.clone(), &url);

            if authenticated {
                if let Some(signer) = &self.signer {
                    let token = signer
                        .mint(method.as_str(), path)
                        .map_err(|e| ApiError::Signing(e.to_string()))?;
                    request = request.bearer_auth(token);
                }
            }

            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response);
                    }

                    let message = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "unknown error".to_string());

                    if status.is_client_error() {
                        tracing::error!(
                            "HTTP {} on {} {}: {}",
                            status.as_u16(),
                            method,
                            path,
                            message
                        );
                        return Err(ApiError::Terminal {
                            status: status.as_u16(),
                            message,
                        });
                    }

                    last_error =
                        ApiError::Transient(format!("server error {}: {}", status, message));
                }
                Err(e) => {
                    last_error = ApiError::Transient(format!("network error: {}", e));
                }
            }

            if attempt < MAX_RETRIES {
                tracing::warn!(
                    "{} {} failed ({}), retrying in {:?} (attempt {}/{})",
                    method,
                    path,
                    last_error,
                    delay,
                    attempt,
                    MAX_RETRIES
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_RETRY_DELAY);
            }
        }

        Err(last_error)
    }

    /// Get the current price for an asset, trying each preferred quote
    /// currency in order and returning the first pair that yields a strictly
    /// positive price.
    pub async fn get_price(
        &self,
        asset: &str,
        preferred_quotes: Option<&[QuoteCurrency]>,
    ) -> ApiResult<PriceQuote> {
        let quotes = preferred_quotes.unwrap_or(DEFAULT_QUOTE_PRIORITY);

        for quote_currency in quotes {
            let pair = format!("{}-{}", asset, quote_currency);
            let path = format!("/api/v3/brokerage/market/products/{}/ticker", pair);

            match self.request_with_retry(Method::GET, &path, None, false).await {
                Ok(response) => {
                    let ticker: TickerResponse = response
                        .json()
                        .await
                        .map_err(|e| ApiError::Decode(e.to_string()))?;

                    if let Some(quote) = ticker.into_quote(quote_currency.clone(), pair.clone()) {
                        tracing::debug!("got price for {}: {} {}", pair, quote.price, quote.currency);
                        return Ok(quote);
                    }
                }
                Err(e) => {
                    tracing::debug!("no usable ticker for {}: {}", pair, e);
                }
            }
        }

        tracing::warn!("could not get price for {} with any quote currency", asset);
        Err(ApiError::NotFound {
            asset: asset.to_string(),
        })
    }

    /// All account balances.
    pub async fn get_accounts(&self) -> ApiResult<Vec<Account>> {
        let response = self
            .request_with_retry(Method::GET, "/api/v3/brokerage/accounts", None, true)
            .await?;

        let parsed: AccountsResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;

        Ok(parsed.accounts)
    }

    /// Available balance for one currency; zero when no account exists.
    pub async fn get_balance(&self, currency: &str) -> ApiResult<f64> {
        let accounts = self.get_accounts().await?;
        Ok(accounts
            .iter()
            .find(|a| a.currency == currency)
            .map(Account::available)
            .unwrap_or(0.0))
    }

    /// All currencies with a positive available balance.
    pub async fn get_holdings(&self) -> ApiResult<HashMap<String, f64>> {
        let accounts = self.get_accounts().await?;

        Ok(accounts
            .into_iter()
            .filter_map(|a| {
                let balance = a.available();
                (balance > 0.0).then_some((a.currency, balance))
            })
            .collect())
    }

    /// Submit a market IOC order.
    pub async fn place_order(
        &self,
        product_id: &str,
        side: OrderSide,
        amount: f64,
        amount_kind: AmountKind,
    ) -> ApiResult<OrderOutcome> {
        let client_order_id = Uuid::new_v4().to_string();

        let mut ioc = serde_json::Map::new();
        ioc.insert(
            amount_kind.field().to_string(),
            serde_json::Value::String(amount_kind.format(amount)),
        );

        let body = serde_json::json!({
            "client_order_id": client_order_id,
            "product_id": product_id,
            "side": side.as_str(),
            "order_configuration": { "market_market_ioc": ioc },
        });

        let response = self
            .request_with_retry(Method::POST, "/api/v3/brokerage/orders", Some(&body), true)
            .await?;

        let parsed: OrderResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;

        if parsed.success {
            let order_id = parsed
                .success_response
                .map(|s| s.order_id)
                .unwrap_or_default();
            Ok(OrderOutcome::Filled { order_id })
        } else {
            let reason = parsed
                .error_response
                .map(|e| format!("{}: {}", e.error, e.message))
                .unwrap_or_else(|| "order rejected without reason".to_string());
            Ok(OrderOutcome::Rejected { reason })
        }
    }

    /// Product metadata for a trading pair, cached for the process lifetime.
    pub async fn get_product(&self, product_id: &str) -> ApiResult<ProductInfo> {
        if let Some(info) = self.product_cache.read().await.get(product_id) {
            return Ok(info.clone());
        }

        let path = format!("/api/v3/brokerage/market/products/{}", product_id);
        let response = self
            .request_with_retry(Method::GET, &path, None, false)
            .await?;

        let raw: ProductResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;

        let parse = |s: &str, field: &str| {
            s.parse::<f64>()
                .map_err(|_| ApiError::Decode(format!("bad {} for {}: {:?}", field, product_id, s)))
        };

        let info = ProductInfo {
            product_id: raw.product_id,
            base_increment: parse(&raw.base_increment, "base_increment")?,
            base_min_size: parse(&raw.base_min_size, "base_min_size")?,
            base_max_size: raw
                .base_max_size
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or(f64::MAX),
        };

        self.product_cache
            .write()
            .await
            .insert(product_id.to_string(), info.clone());

        Ok(info)
    }

    /// Round an amount to the pair's base-unit increment. SELL truncates
    /// toward zero so the rounded amount never exceeds the available balance;
    /// BUY rounds to nearest. Falls back to 8 decimals when metadata is
    /// unavailable.
    pub async fn round_to_precision(&self, amount: f64, product_id: &str, side: OrderSide) -> f64 {
        match self.get_product(product_id).await {
            Ok(product) if product.base_increment > 0.0 => {
                round_to_increment(amount, product.base_increment, side)
            }
            Ok(_) => fallback_round(amount, side),
            Err(e) => {
                tracing::warn!(
                    "no product metadata for {}, using 8-decimal fallback: {}",
                    product_id,
                    e
                );
                fallback_round(amount, side)
            }
        }
    }
}

fn round_to_increment(amount: f64, increment: f64, side: OrderSide) -> f64 {
    let steps = amount / increment;
    let steps = match side {
        // Nudge before flooring so exact multiples don't lose a step to
        // floating-point division
        OrderSide::Sell => (steps + 1e-9).floor(),
        OrderSide::Buy => steps.round(),
    };
    steps * increment
}

fn fallback_round(amount: f64, side: OrderSide) -> f64 {
    const FACTOR: f64 = 1e8;
    match side {
        OrderSide::Sell => (amount * FACTOR).floor() / FACTOR,
        OrderSide::Buy => (amount * FACTOR).round() / FACTOR,
    }
}
