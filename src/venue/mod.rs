// =============================================================================
// Venue abstraction: the semantic operations the engine needs from a
// BTC-options exchange
// =============================================================================
//
// The engine talks to exactly one options venue through this trait. Endpoint
// paths, field names, and the signing scheme are the client's business; the
// rest of the engine sees only these operations and the shared order shape.
// =============================================================================

pub mod client;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use sha2::Sha256;

use crate::error::EngineError;
use crate::types::{OptionContract, OrderRequest, OrderSnapshot, TopOfBook};

pub use client::BinanceOptionsClient;

/// Authenticates a canonical query string. Pluggable so the venue's scheme
/// stays out of the engine core.
pub trait Signer: Send + Sync {
    /// Hex-encoded signature over `query`.
    fn sign(&self, query: &str) -> String;
}

/// HMAC-SHA256 signer used by the production client.
pub struct HmacSha256Signer {
    secret: String,
}

impl HmacSha256Signer {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl Signer for HmacSha256Signer {
    fn sign(&self, query: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

impl std::fmt::Debug for HmacSha256Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSha256Signer")
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// The venue surface the engine consumes.
#[async_trait]
pub trait OptionsVenue: Send + Sync {
    /// Last traded price of the underlying reference (perpetual/index).
    async fn reference_price(&self) -> Result<Decimal, EngineError>;

    /// All listed option expiry dates, ascending.
    async fn expiries(&self) -> Result<Vec<NaiveDate>, EngineError>;

    /// The full chain for one expiry.
    async fn options_chain(&self, expiry: NaiveDate) -> Result<Vec<OptionContract>, EngineError>;

    /// Best bid/ask with sizes. `depth` is an upper bound on levels fetched.
    async fn book(&self, symbol: &str, depth: u32) -> Result<TopOfBook, EngineError>;

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderSnapshot, EngineError>;

    async fn modify_order(
        &self,
        order_id: &str,
        symbol: &str,
        qty: Decimal,
        price: Decimal,
    ) -> Result<OrderSnapshot, EngineError>;

    async fn cancel_order(&self, order_id: &str, symbol: &str)
        -> Result<OrderSnapshot, EngineError>;

    async fn get_order(&self, order_id: &str, symbol: &str) -> Result<OrderSnapshot, EngineError>;
}

pub type SharedVenue = Arc<dyn OptionsVenue>;
