//! End-to-end rental flows over the public API: one engine, a scripted
//! gateway, and a real WAL file in the temp directory.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ulid::Ulid;

use voltra::engine::{CheckOutRequest, CreateBooking, Engine};
use voltra::gateway::{GatewayStatus, RetryPolicy, StaticGateway};
use voltra::model::*;
use voltra::notify::NotifyHub;
use voltra::pricing::MS_PER_HOUR;
use voltra::sweeper::{SweepConfig, sweep_once};

fn temp_wal() -> PathBuf {
    std::env::temp_dir().join(format!("voltra_test_lifecycle_{}.wal", Ulid::new()))
}

fn boot(path: &PathBuf) -> (Arc<Engine>, Arc<StaticGateway>) {
    let gateway = Arc::new(StaticGateway::new());
    let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new()), gateway.clone())
        .expect("engine boot");
    (Arc::new(engine), gateway)
}

async fn pay(
    engine: &Engine,
    gateway: &StaticGateway,
    booking_id: Ulid,
    kind: PaymentKind,
) -> Payment {
    let payment = engine
        .initiate_payment(booking_id, kind, None, now_ms())
        .await
        .unwrap();
    gateway.resolve(&payment.gateway_ref, GatewayStatus::Success);
    engine.sync_payment(booking_id).await.unwrap();
    engine.payment(payment.id).await.unwrap()
}

#[tokio::test]
async fn weekend_rental_end_to_end() {
    let path = temp_wal();
    let (engine, gateway) = boot(&path);

    let station = Ulid::new();
    let car = Ulid::new();
    let user = Ulid::new();
    engine
        .register_station(station, Some("Riverside".into()), 6)
        .await
        .unwrap();
    engine
        .register_car(car, station, 50_000, 500_000, 100)
        .await
        .unwrap();

    // Two full days at the daily rate, starting tomorrow
    let t0 = now_ms() + 24 * MS_PER_HOUR;
    let window = Window::new(t0, t0 + 48 * MS_PER_HOUR);
    let booking = engine
        .create_booking(CreateBooking {
            user_id: user,
            car_id: car,
            pickup_station_id: station,
            return_station_id: Some(station),
            window,
        })
        .await
        .unwrap();
    assert_eq!(booking.total_amount, 1_000_000);
    assert_eq!(booking.deposit_amount, 300_000);
    assert_eq!(booking.return_station_id, Some(station));

    let deposit = pay(&engine, &gateway, booking.id, PaymentKind::Deposit).await;
    assert_eq!(deposit.status, PaymentStatus::Success);

    engine.confirm_booking(booking.id, now_ms()).await.unwrap();
    engine.check_in(booking.id, window.start, None, None).await.unwrap();
    assert_eq!(engine.station(station).await.unwrap().available_slots, 5);

    // Three hours late, minor scrape
    let actual = engine
        .check_out(
            booking.id,
            window.end + 3 * MS_PER_HOUR,
            CheckOutRequest {
                return_station_id: station,
                note: Some("scrape on rear bumper".into()),
                photo_ref: Some("photos/rear-bumper.jpg".into()),
                damage_fee: 200_000,
                battery_pct: Some(40),
            },
        )
        .await
        .unwrap();
    assert_eq!(actual, 1_000_000 + 3 * 50_000 + 200_000);
    assert_eq!(engine.station(station).await.unwrap().available_slots, 6);

    let rental = pay(&engine, &gateway, booking.id, PaymentKind::Rental).await;
    assert_eq!(rental.amount, actual - 300_000);

    engine.complete_booking(booking.id, now_ms()).await.unwrap();
    let done = engine.booking(booking.id).await.unwrap();
    assert_eq!(done.status, BookingStatus::Completed);
    assert_eq!(done.settlement, SettlementStatus::Paid);
    assert_eq!(done.late_fee, 150_000);

    let car_state = engine.car(car).await.unwrap();
    assert_eq!(car_state.current_station_id, Some(station));
    assert_eq!(car_state.battery_pct, 40);

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn completed_history_survives_restart() {
    let path = temp_wal();
    let (engine, gateway) = boot(&path);

    let station = Ulid::new();
    let car = Ulid::new();
    engine.register_station(station, None, 2).await.unwrap();
    engine.register_car(car, station, 50_000, 500_000, 80).await.unwrap();

    let t0 = now_ms() + 24 * MS_PER_HOUR;
    let window = Window::new(t0, t0 + 4 * MS_PER_HOUR);
    let booking = engine
        .create_booking(CreateBooking {
            user_id: Ulid::new(),
            car_id: car,
            pickup_station_id: station,
            return_station_id: None,
            window,
        })
        .await
        .unwrap();
    pay(&engine, &gateway, booking.id, PaymentKind::Deposit).await;
    engine.confirm_booking(booking.id, now_ms()).await.unwrap();
    engine.check_in(booking.id, window.start, None, None).await.unwrap();
    engine
        .check_out(
            booking.id,
            window.end,
            CheckOutRequest {
                return_station_id: station,
                note: None,
                photo_ref: None,
                damage_fee: 0,
                battery_pct: None,
            },
        )
        .await
        .unwrap();
    pay(&engine, &gateway, booking.id, PaymentKind::Rental).await;
    engine.complete_booking(booking.id, now_ms()).await.unwrap();

    let (engine2, _) = boot(&path);
    let restored = engine2.booking(booking.id).await.unwrap();
    assert_eq!(restored.status, BookingStatus::Completed);
    assert_eq!(restored.settlement, SettlementStatus::Paid);
    assert_eq!(engine2.payments_for(booking.id).await.len(), 2);
    assert_eq!(engine2.station(station).await.unwrap().available_slots, 2);
    // Terminal bookings no longer block the car
    assert!(engine2.check_availability(car, &window).await.unwrap());

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn abandoned_booking_is_swept_away() {
    let path = temp_wal();
    let (engine, _gateway) = boot(&path);

    let station = Ulid::new();
    let car = Ulid::new();
    engine.register_station(station, None, 2).await.unwrap();
    engine.register_car(car, station, 50_000, 500_000, 80).await.unwrap();

    let now = now_ms();
    let booking = engine
        .create_booking(CreateBooking {
            user_id: Ulid::new(),
            car_id: car,
            pickup_station_id: station,
            return_station_id: None,
            window: Window::new(now + MS_PER_HOUR, now + 3 * MS_PER_HOUR),
        })
        .await
        .unwrap();
    let payment = engine
        .initiate_payment(booking.id, PaymentKind::Deposit, None, now)
        .await
        .unwrap();

    let cfg = SweepConfig {
        interval: Duration::from_secs(60),
        pending_expiry_ms: 30 * 60_000,
        retry: RetryPolicy::new(1, 1, 1, 0.0),
    };
    // 31 minutes later nobody has paid: the checkout link is long dead
    // and the booking goes with it
    sweep_once(&engine, &cfg, now + 31 * 60_000).await;

    assert_eq!(
        engine.payment(payment.id).await.unwrap().status,
        PaymentStatus::Expired
    );
    let cancelled = engine.booking(booking.id).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(cancelled.cancellation_reason.as_deref(), Some("payment timeout"));
    // The car is free for the next customer
    assert!(
        engine
            .check_availability(car, &Window::new(now + MS_PER_HOUR, now + 3 * MS_PER_HOUR))
            .await
            .unwrap()
    );

    let _ = std::fs::remove_file(&path);
}
