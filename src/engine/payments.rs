//! Payment lifecycle and gateway reconciliation. A payment record is
//! written once at initiation and resolved exactly once; reconciliation
//! is idempotent and safe to run from any number of sweeps.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};
use ulid::Ulid;

use crate::gateway::{CheckoutRequest, map_gateway_status};
use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::{Engine, EngineError, new_payment_record, refund_record};

/// Outcome of one reconciliation pass over a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncResult {
    pub payment_id: Ulid,
    pub status: PaymentStatus,
    pub changed: bool,
}

impl Engine {
    /// Initiate a payment against the gateway and record it Pending.
    /// Holding the booking's write lock across the gateway call serializes
    /// initiations per booking.
    pub async fn initiate_payment(
        &self,
        booking_id: Ulid,
        kind: PaymentKind,
        amount: Option<Amount>,
        now: Ms,
    ) -> Result<Payment, EngineError> {
        if kind == PaymentKind::Refund {
            return Err(EngineError::Validation("refunds go through refund_payment"));
        }
        let booking = self
            .get_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let guard = booking.write().await;

        let valid_for = match kind {
            PaymentKind::Deposit => guard.status == BookingStatus::Pending,
            PaymentKind::Rental => guard.status == BookingStatus::CheckedOut,
            PaymentKind::Extra => !guard.status.is_terminal(),
            PaymentKind::Refund => false,
        };
        if !valid_for {
            return Err(EngineError::InvalidTransition {
                id: booking_id,
                from: guard.status,
                op: "initiate payment",
            });
        }

        let amount = match amount {
            Some(a) => a,
            None => match kind {
                PaymentKind::Deposit => guard.deposit_amount,
                // Rental settles the checkout amount net of the deposit.
                PaymentKind::Rental => {
                    guard.actual_amount.unwrap_or(guard.total_amount) - guard.deposit_amount
                }
                _ => return Err(EngineError::Validation("amount required")),
            },
        };
        if amount <= 0 {
            return Err(EngineError::Validation("payment amount must be positive"));
        }

        let existing = self
            .booking_payments
            .get(&booking_id)
            .map(|v| v.len())
            .unwrap_or(0);
        if existing >= MAX_PAYMENTS_PER_BOOKING {
            return Err(EngineError::Validation("too many payments for booking"));
        }

        let id = Ulid::new();
        let checkout = self
            .gateway
            .initiate(&CheckoutRequest {
                payment_id: id,
                booking_id,
                amount,
                kind,
            })
            .await?;

        let event = Event::PaymentInitiated {
            id,
            booking_id,
            amount,
            kind,
            gateway_ref: checkout.gateway_ref.clone(),
            checkout_url: checkout.checkout_url.clone(),
            expires_at: Some(now + PAYMENT_EXPIRY_MS),
            created_at: now,
        };
        self.wal_append(&event).await?;

        let payment = new_payment_record(
            id,
            booking_id,
            amount,
            kind,
            checkout.gateway_ref,
            checkout.checkout_url,
            Some(now + PAYMENT_EXPIRY_MS),
            now,
        );
        self.payments
            .insert(id, Arc::new(RwLock::new(payment.clone())));
        self.booking_payments
            .entry(booking_id)
            .or_default()
            .push(id);
        self.notify.send(booking_id, &event);

        info!(payment = %id, booking = %booking_id, ?kind, amount, "payment initiated");
        Ok(payment)
    }

    /// Reconcile the latest payment of a booking against the gateway.
    /// Terminal payments are never touched again; a terminal answer from
    /// the gateway resolves the payment exactly once.
    pub async fn sync_payment(&self, booking_id: Ulid) -> Result<SyncResult, EngineError> {
        let payment_id = self
            .latest_payment_id(&booking_id)
            .await
            .ok_or(EngineError::NotFound(booking_id))?;
        self.sync_payment_record(payment_id).await
    }

    pub(crate) async fn sync_payment_record(
        &self,
        payment_id: Ulid,
    ) -> Result<SyncResult, EngineError> {
        let payment = self
            .get_payment(&payment_id)
            .ok_or(EngineError::NotFound(payment_id))?;

        let gateway_ref = {
            let guard = payment.read().await;
            if guard.status.is_terminal() {
                metrics::counter!(observability::PAYMENT_SYNCS_TOTAL, "result" => "unchanged")
                    .increment(1);
                return Ok(SyncResult {
                    payment_id,
                    status: guard.status,
                    changed: false,
                });
            }
            guard.gateway_ref.clone()
        };

        let gateway_status = match self.gateway.fetch_status(&gateway_ref).await {
            Ok(s) => s,
            Err(e) => {
                metrics::counter!(observability::PAYMENT_SYNCS_TOTAL, "result" => "error")
                    .increment(1);
                return Err(e.into());
            }
        };
        let mapped = map_gateway_status(gateway_status);
        if mapped == PaymentStatus::Pending {
            metrics::counter!(observability::PAYMENT_SYNCS_TOTAL, "result" => "unchanged")
                .increment(1);
            return Ok(SyncResult {
                payment_id,
                status: PaymentStatus::Pending,
                changed: false,
            });
        }

        let mut guard = payment.write().await;
        // A concurrent sync may have resolved it between our read and here.
        if guard.status.is_terminal() {
            metrics::counter!(observability::PAYMENT_SYNCS_TOTAL, "result" => "unchanged")
                .increment(1);
            return Ok(SyncResult {
                payment_id,
                status: guard.status,
                changed: false,
            });
        }

        let at = now_ms();
        let event = Event::PaymentResolved {
            id: payment_id,
            status: mapped,
            gateway_txn_id: (mapped == PaymentStatus::Success).then(|| gateway_ref.clone()),
            failure_reason: (mapped == PaymentStatus::Failed)
                .then(|| "declined by gateway".to_string()),
            at,
        };
        self.wal_append(&event).await?;
        guard.apply(&event);
        let booking_id = guard.booking_id;
        drop(guard);
        self.notify.send(booking_id, &event);

        metrics::counter!(observability::PAYMENT_SYNCS_TOTAL, "result" => "resolved").increment(1);
        info!(payment = %payment_id, status = %mapped, "payment resolved");
        Ok(SyncResult {
            payment_id,
            status: mapped,
            changed: true,
        })
    }

    /// Refund a successful payment. The original record flips to
    /// Refunded and a Refund-kind record is written alongside it.
    pub async fn refund_payment(
        &self,
        payment_id: Ulid,
        reason: String,
        at: Ms,
    ) -> Result<Payment, EngineError> {
        if reason.len() > MAX_REASON_LEN {
            return Err(EngineError::Validation("refund reason too long"));
        }
        let payment = self
            .get_payment(&payment_id)
            .ok_or(EngineError::NotFound(payment_id))?;
        let mut guard = payment.write().await;
        if guard.kind == PaymentKind::Refund {
            return Err(EngineError::Validation("cannot refund a refund"));
        }
        if guard.status != PaymentStatus::Success {
            return Err(EngineError::RefundNotAllowed {
                payment: payment_id,
                status: guard.status,
            });
        }

        let refund_id = Ulid::new();
        let booking_id = guard.booking_id;
        let amount = guard.amount;
        let event = Event::PaymentRefunded {
            refund_id,
            payment_id,
            booking_id,
            amount,
            reason: reason.clone(),
            at,
        };
        self.wal_append(&event).await?;
        guard.apply(&event);
        drop(guard);

        let refund = refund_record(refund_id, payment_id, booking_id, amount, reason, at);
        self.payments
            .insert(refund_id, Arc::new(RwLock::new(refund.clone())));
        self.booking_payments
            .entry(booking_id)
            .or_default()
            .push(refund_id);

        // Booking lock taken after the payment lock is released, never
        // nested inside it.
        if let Some(booking) = self.get_booking(&booking_id) {
            booking.write().await.settlement = SettlementStatus::Refunded;
        }
        self.notify.send(booking_id, &event);

        info!(refund = %refund_id, payment = %payment_id, amount, "payment refunded");
        Ok(refund)
    }

    /// Expire a Pending payment whose checkout deadline has passed.
    /// Returns whether it expired; resolved payments are left alone.
    pub(crate) async fn expire_payment(&self, payment_id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let Some(payment) = self.get_payment(&payment_id) else {
            return Ok(false);
        };
        let mut guard = payment.write().await;
        if guard.status != PaymentStatus::Pending {
            return Ok(false);
        }
        match guard.expires_at {
            Some(deadline) if deadline <= now => {}
            _ => return Ok(false),
        }

        let event = Event::PaymentResolved {
            id: payment_id,
            status: PaymentStatus::Expired,
            gateway_txn_id: None,
            failure_reason: Some("checkout expired".to_string()),
            at: now,
        };
        self.wal_append(&event).await?;
        guard.apply(&event);
        let booking_id = guard.booking_id;
        drop(guard);
        self.notify.send(booking_id, &event);

        metrics::counter!(observability::PAYMENTS_EXPIRED_TOTAL).increment(1);
        debug!(payment = %payment_id, "payment expired");
        Ok(true)
    }

    /// Pending payments whose deadline is at or before `now`.
    pub(crate) async fn collect_stale_payments(&self, now: Ms) -> Vec<Ulid> {
        let mut stale = Vec::new();
        for entry in self.payments.iter() {
            let guard = entry.value().read().await;
            if guard.status == PaymentStatus::Pending
                && guard.expires_at.is_some_and(|d| d <= now)
            {
                stale.push(guard.id);
            }
        }
        stale
    }

    /// Pending payments still inside their deadline: reconciliation
    /// candidates for the sweep.
    pub(crate) async fn collect_unresolved_payments(&self, now: Ms) -> Vec<Ulid> {
        let mut open = Vec::new();
        for entry in self.payments.iter() {
            let guard = entry.value().read().await;
            if guard.status == PaymentStatus::Pending
                && !guard.expires_at.is_some_and(|d| d <= now)
            {
                open.push(guard.id);
            }
        }
        open
    }

    /// Latest non-refund payment id for a booking, by initiation order.
    pub(crate) async fn latest_payment_id(&self, booking_id: &Ulid) -> Option<Ulid> {
        let ids: Vec<Ulid> = self.booking_payments.get(booking_id)?.value().clone();
        for pid in ids.iter().rev() {
            if let Some(payment) = self.get_payment(pid)
                && payment.read().await.kind != PaymentKind::Refund {
                    return Some(*pid);
                }
        }
        None
    }

    pub(crate) async fn latest_payment_status(&self, booking_id: &Ulid) -> Option<PaymentStatus> {
        let pid = self.latest_payment_id(booking_id).await?;
        let payment = self.get_payment(&pid)?;
        let guard = payment.read().await;
        Some(guard.status)
    }

    /// Whether the booking has any successful payment, optionally of a
    /// specific kind.
    pub(crate) async fn has_success_payment(
        &self,
        booking_id: &Ulid,
        kind: Option<PaymentKind>,
    ) -> bool {
        let Some(index) = self.booking_payments.get(booking_id) else {
            return false;
        };
        let ids: Vec<Ulid> = index.value().clone();
        drop(index);
        for pid in ids {
            if let Some(payment) = self.get_payment(&pid) {
                let guard = payment.read().await;
                if guard.status == PaymentStatus::Success
                    && kind.is_none_or(|k| guard.kind == k)
                {
                    return true;
                }
            }
        }
        false
    }
}
