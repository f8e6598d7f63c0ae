//! Background maintenance: expire stale payments, reconcile open ones
//! against the gateway, auto-cancel Pending bookings that never paid,
//! and compact the WAL when it grows.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineError};
use crate::gateway::RetryPolicy;
use crate::model::{Ms, now_ms};

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub interval: Duration,
    /// How long a booking may sit Pending before auto-cancellation.
    pub pending_expiry_ms: Ms,
    pub retry: RetryPolicy,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            pending_expiry_ms: 30 * 60_000,
            retry: RetryPolicy::default(),
        }
    }
}

pub async fn run_sweeper(engine: Arc<Engine>, cfg: SweepConfig) {
    let mut ticker = tokio::time::interval(cfg.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        sweep_once(&engine, &cfg, now_ms()).await;
    }
}

/// One maintenance pass. Order matters: payments past their deadline are
/// expired first so reconciliation only polls the gateway for live ones,
/// and booking expiry runs last so a payment resolved this pass can still
/// save its booking.
pub async fn sweep_once(engine: &Engine, cfg: &SweepConfig, now: Ms) {
    for payment_id in engine.collect_stale_payments(now).await {
        if let Err(e) = engine.expire_payment(payment_id, now).await {
            warn!(payment = %payment_id, error = %e, "payment expiry failed");
        }
    }

    for payment_id in engine.collect_unresolved_payments(now).await {
        let result = cfg
            .retry
            .retry_transient(|| async {
                match engine.sync_payment_record(payment_id).await {
                    Ok(r) => Ok(Ok(r)),
                    Err(EngineError::Gateway(e)) if e.is_transient() => Err(e),
                    Err(other) => Ok(Err(other)),
                }
            })
            .await;
        match result {
            Ok(Ok(sync)) if sync.changed => {
                debug!(payment = %payment_id, status = %sync.status, "sweep resolved payment");
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(payment = %payment_id, error = %e, "payment sync failed"),
            Err(e) => warn!(payment = %payment_id, error = %e, "gateway unreachable, will retry next sweep"),
        }
    }

    let cutoff = now - cfg.pending_expiry_ms;
    for booking_id in engine.collect_stale_pending(cutoff).await {
        match engine.expire_booking(booking_id, now).await {
            Ok(true) => info!(booking = %booking_id, "expired stale pending booking"),
            Ok(false) => {} // confirmed or paid since the scan
            Err(e) => warn!(booking = %booking_id, error = %e, "booking expiry failed"),
        }
    }
}

/// Compact the WAL whenever enough appends have accumulated.
pub async fn run_compactor(engine: Arc<Engine>, interval: Duration, threshold: u64) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "WAL compacted"),
            Err(e) => warn!(error = %e, "WAL compaction failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CreateBooking;
    use crate::gateway::{GatewayStatus, StaticGateway};
    use crate::limits::PAYMENT_EXPIRY_MS;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use ulid::Ulid;

    fn temp_wal() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("voltra_test_sweep_{}.wal", Ulid::new()))
    }

    async fn engine_with_gateway() -> (Arc<Engine>, Arc<StaticGateway>, std::path::PathBuf) {
        let path = temp_wal();
        let gateway = Arc::new(StaticGateway::new());
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new()), gateway.clone())
            .expect("engine boot");
        (Arc::new(engine), gateway, path)
    }

    async fn seed_pending_booking(engine: &Engine) -> Booking {
        let station = Ulid::new();
        let car = Ulid::new();
        engine.register_station(station, None, 4).await.unwrap();
        engine.register_car(car, station, 50_000, 500_000, 90).await.unwrap();
        let now = now_ms();
        engine
            .create_booking(CreateBooking {
                user_id: Ulid::new(),
                car_id: car,
                pickup_station_id: station,
                return_station_id: None,
                window: Window::new(now + 3_600_000, now + 7_200_000),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn sweep_expires_stale_pending_booking() {
        let (engine, _gw, path) = engine_with_gateway().await;
        let booking = seed_pending_booking(&engine).await;
        let cfg = SweepConfig::default();

        // Not yet stale
        sweep_once(&engine, &cfg, booking.created_at + 1000).await;
        assert_eq!(
            engine.booking(booking.id).await.unwrap().status,
            BookingStatus::Pending
        );

        // Past the pending expiry
        sweep_once(&engine, &cfg, booking.created_at + cfg.pending_expiry_ms + 1).await;
        let after = engine.booking(booking.id).await.unwrap();
        assert_eq!(after.status, BookingStatus::Cancelled);
        assert_eq!(after.cancellation_reason.as_deref(), Some("payment timeout"));

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn sweep_spares_booking_with_successful_payment() {
        let (engine, gw, path) = engine_with_gateway().await;
        let booking = seed_pending_booking(&engine).await;
        let payment = engine
            .initiate_payment(booking.id, PaymentKind::Deposit, None, booking.created_at)
            .await
            .unwrap();
        gw.resolve(&payment.gateway_ref, GatewayStatus::Success);
        engine.sync_payment(booking.id).await.unwrap();

        let cfg = SweepConfig::default();
        sweep_once(&engine, &cfg, booking.created_at + cfg.pending_expiry_ms + 1).await;
        assert_eq!(
            engine.booking(booking.id).await.unwrap().status,
            BookingStatus::Pending
        );

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn sweep_expires_stale_payment() {
        let (engine, _gw, path) = engine_with_gateway().await;
        let booking = seed_pending_booking(&engine).await;
        let payment = engine
            .initiate_payment(booking.id, PaymentKind::Deposit, None, booking.created_at)
            .await
            .unwrap();

        let cfg = SweepConfig::default();
        sweep_once(&engine, &cfg, booking.created_at + PAYMENT_EXPIRY_MS + 1).await;
        assert_eq!(
            engine.payment(payment.id).await.unwrap().status,
            PaymentStatus::Expired
        );

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn sweep_reconciles_open_payment() {
        let (engine, gw, path) = engine_with_gateway().await;
        let booking = seed_pending_booking(&engine).await;
        let payment = engine
            .initiate_payment(booking.id, PaymentKind::Deposit, None, booking.created_at)
            .await
            .unwrap();
        gw.resolve(&payment.gateway_ref, GatewayStatus::Success);

        let cfg = SweepConfig::default();
        sweep_once(&engine, &cfg, booking.created_at + 1000).await;
        assert_eq!(
            engine.payment(payment.id).await.unwrap().status,
            PaymentStatus::Success
        );

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn sweep_retries_transient_gateway_error() {
        let (engine, gw, path) = engine_with_gateway().await;
        let booking = seed_pending_booking(&engine).await;
        let payment = engine
            .initiate_payment(booking.id, PaymentKind::Deposit, None, booking.created_at)
            .await
            .unwrap();
        gw.resolve(&payment.gateway_ref, GatewayStatus::Success);
        gw.fail_once(
            &payment.gateway_ref,
            crate::gateway::GatewayError::Transient("503".into()),
        );

        let cfg = SweepConfig {
            retry: RetryPolicy::new(3, 1, 1, 0.0),
            ..Default::default()
        };
        sweep_once(&engine, &cfg, booking.created_at + 1000).await;
        assert_eq!(
            engine.payment(payment.id).await.unwrap().status,
            PaymentStatus::Success
        );

        let _ = std::fs::remove_file(path);
    }
}
