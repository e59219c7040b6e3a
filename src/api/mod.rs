pub mod auth;
pub mod coinbase;

pub use auth::{ApiCredentials, JwtSigner};
pub use coinbase::{ApiError, ApiResult, CoinbaseClient, OrderOutcome, DEFAULT_QUOTE_PRIORITY};
