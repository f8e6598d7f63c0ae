use ulid::Ulid;

use crate::gateway::GatewayError;
use crate::model::{BookingStatus, PaymentStatus};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The booking's current status does not admit the requested operation.
    InvalidTransition {
        id: Ulid,
        from: BookingStatus,
        op: &'static str,
    },
    /// The requested window overlaps an existing non-cancelled booking.
    CarUnavailable {
        car: Ulid,
        conflict: Ulid,
    },
    /// Applying the delta would leave `[0, total_slots]`.
    SlotInvariantViolation {
        station: Ulid,
        available: u32,
        total: u32,
        delta: i32,
    },
    PaymentNotCompleted {
        booking: Ulid,
        latest: Option<PaymentStatus>,
    },
    RefundNotAllowed {
        payment: Ulid,
        status: PaymentStatus,
    },
    CarInactive(Ulid),
    StationInactive(Ulid),
    Validation(&'static str),
    Gateway(GatewayError),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidTransition { id, from, op } => {
                write!(f, "cannot {op} booking {id} with status: {from}")
            }
            EngineError::CarUnavailable { car, conflict } => {
                write!(f, "car {car} unavailable: window overlaps booking {conflict}")
            }
            EngineError::SlotInvariantViolation {
                station,
                available,
                total,
                delta,
            } => {
                write!(
                    f,
                    "slot adjustment {delta:+} on station {station} violates bounds ({available}/{total})"
                )
            }
            EngineError::PaymentNotCompleted { booking, latest } => match latest {
                Some(status) => write!(
                    f,
                    "booking {booking}: payment not completed (latest payment is {status})"
                ),
                None => write!(f, "booking {booking}: no payment recorded"),
            },
            EngineError::RefundNotAllowed { payment, status } => {
                write!(f, "cannot refund payment {payment} with status: {status}")
            }
            EngineError::CarInactive(id) => write!(f, "car {id} is not active"),
            EngineError::StationInactive(id) => write!(f, "station {id} is not active"),
            EngineError::Validation(msg) => write!(f, "validation failed: {msg}"),
            EngineError::Gateway(e) => write!(f, "payment gateway: {e}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<GatewayError> for EngineError {
    fn from(e: GatewayError) -> Self {
        EngineError::Gateway(e)
    }
}
