//! External payment gateway boundary. The core never talks to a gateway
//! except through [`PaymentGateway`]; deployments plug in a real client,
//! tests plug in [`StaticGateway`].

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use tokio::time::sleep;
use ulid::Ulid;

use crate::model::{Amount, PaymentKind, PaymentStatus};

/// Outcome of a transaction as the gateway reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStatus {
    Pending,
    Success,
    Failed,
    Cancelled,
    Expired,
    /// The gateway has no record of the reference. Definitive — treated
    /// as expired, never retried.
    NotFound,
}

/// Mapping table from gateway outcome to internal payment status.
/// `Pending` maps to `Pending` (no change); everything else is terminal.
pub fn map_gateway_status(status: GatewayStatus) -> PaymentStatus {
    match status {
        GatewayStatus::Pending => PaymentStatus::Pending,
        GatewayStatus::Success => PaymentStatus::Success,
        GatewayStatus::Failed => PaymentStatus::Failed,
        GatewayStatus::Cancelled => PaymentStatus::Cancelled,
        GatewayStatus::Expired | GatewayStatus::NotFound => PaymentStatus::Expired,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Timeout / 5xx / connection reset. Callers retry with backoff.
    Transient(String),
    /// Definitive protocol-level rejection. Never retried.
    Rejected(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::Transient(msg) => write!(f, "transient gateway error: {msg}"),
            GatewayError::Rejected(msg) => write!(f, "gateway rejected request: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}

#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub payment_id: Ulid,
    pub booking_id: Ulid,
    pub amount: Amount,
    pub kind: PaymentKind,
}

#[derive(Debug, Clone)]
pub struct GatewayCheckout {
    pub gateway_ref: String,
    pub checkout_url: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Register a transaction with the gateway and obtain a reference the
    /// customer pays against.
    async fn initiate(&self, req: &CheckoutRequest) -> Result<GatewayCheckout, GatewayError>;

    /// Fetch the latest outcome for a previously initiated transaction.
    async fn fetch_status(&self, gateway_ref: &str) -> Result<GatewayStatus, GatewayError>;
}

/// Jittered exponential backoff for transient gateway errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_pct: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay_ms: u64, max_delay_ms: u64, jitter_pct: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms: base_delay_ms.max(1),
            max_delay_ms: max_delay_ms.max(base_delay_ms.max(1)),
            jitter_pct: jitter_pct.clamp(0.0, 1.0),
        }
    }

    fn next_delay(&self, attempt: usize) -> Duration {
        let exp = 2_u64.saturating_pow(attempt as u32);
        let mut delay = self.base_delay_ms.saturating_mul(exp);
        if delay > self.max_delay_ms {
            delay = self.max_delay_ms;
        }
        if self.jitter_pct > 0.0 {
            let spread = (delay as f64 * self.jitter_pct) as i64;
            let delta = rand::thread_rng().gen_range(-spread..=spread);
            delay = delay.saturating_add_signed(delta);
        }
        Duration::from_millis(delay)
    }

    /// Retry `op` on transient errors only; rejections return immediately.
    pub async fn retry_transient<F, Fut, T>(&self, mut op: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, GatewayError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(val) => return Ok(val),
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(err);
                    }
                    sleep(self.next_delay(attempt - 1)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(4, 200, 3_000, 0.2)
    }
}

/// In-memory gateway double. Initiated transactions start `Pending`;
/// tests (or a demo deployment) script outcomes with [`StaticGateway::resolve`].
#[derive(Default)]
pub struct StaticGateway {
    statuses: DashMap<String, GatewayStatus>,
    /// When set, the next `fetch_status` fails with this error once.
    fail_next: DashMap<String, GatewayError>,
}

impl StaticGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the outcome the gateway will report for `gateway_ref`.
    pub fn resolve(&self, gateway_ref: &str, status: GatewayStatus) {
        self.statuses.insert(gateway_ref.to_string(), status);
    }

    /// Make the next status fetch for `gateway_ref` fail once.
    pub fn fail_once(&self, gateway_ref: &str, err: GatewayError) {
        self.fail_next.insert(gateway_ref.to_string(), err);
    }
}

#[async_trait]
impl PaymentGateway for StaticGateway {
    async fn initiate(&self, req: &CheckoutRequest) -> Result<GatewayCheckout, GatewayError> {
        let gateway_ref = format!("gw-{}", req.payment_id);
        self.statuses.insert(gateway_ref.clone(), GatewayStatus::Pending);
        Ok(GatewayCheckout {
            checkout_url: Some(format!("https://pay.example/checkout/{gateway_ref}")),
            gateway_ref,
        })
    }

    async fn fetch_status(&self, gateway_ref: &str) -> Result<GatewayStatus, GatewayError> {
        if let Some((_, err)) = self.fail_next.remove(gateway_ref) {
            return Err(err);
        }
        Ok(self
            .statuses
            .get(gateway_ref)
            .map(|e| *e.value())
            .unwrap_or(GatewayStatus::NotFound))
    }
}
