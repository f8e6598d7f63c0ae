mod availability;
mod bookings;
mod error;
mod payments;
mod queries;
mod slots;

pub use availability::{merge_overlapping, subtract_windows};
pub use bookings::{CheckOutRequest, CreateBooking};
pub use error::EngineError;
pub use payments::SyncResult;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::gateway::PaymentGateway;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedBooking = Arc<RwLock<Booking>>;
pub type SharedCar = Arc<RwLock<CarState>>;
pub type SharedStation = Arc<RwLock<StationState>>;
pub type SharedPayment = Arc<RwLock<Payment>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The booking core. One aggregate map per record kind; each record behind
/// its own RwLock — the write lock is the serialization unit per car,
/// station, booking and payment. Every mutation is WAL-appended before it
/// is applied in memory.
pub struct Engine {
    pub(crate) bookings: DashMap<Ulid, SharedBooking>,
    pub(crate) cars: DashMap<Ulid, SharedCar>,
    pub(crate) stations: DashMap<Ulid, SharedStation>,
    pub(crate) payments: DashMap<Ulid, SharedPayment>,
    /// Booking id → payment ids in initiation order.
    pub(crate) booking_payments: DashMap<Ulid, Vec<Ulid>>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(crate) gateway: Arc<dyn PaymentGateway>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            bookings: DashMap::new(),
            cars: DashMap::new(),
            stations: DashMap::new(),
            payments: DashMap::new(),
            booking_payments: DashMap::new(),
            wal_tx,
            notify,
            gateway,
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use
        // blocking_write here because this may run inside an async context.
        for event in &events {
            engine.replay_apply(event);
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(crate) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(crate) fn get_booking(&self, id: &Ulid) -> Option<SharedBooking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    pub(crate) fn get_car(&self, id: &Ulid) -> Option<SharedCar> {
        self.cars.get(id).map(|e| e.value().clone())
    }

    pub(crate) fn get_station(&self, id: &Ulid) -> Option<SharedStation> {
        self.stations.get(id).map(|e| e.value().clone())
    }

    pub(crate) fn get_payment(&self, id: &Ulid) -> Option<SharedPayment> {
        self.payments.get(id).map(|e| e.value().clone())
    }

    /// WAL-append + apply to the booking record + notify, in one call.
    pub(crate) async fn persist_booking_event(
        &self,
        booking_id: Ulid,
        booking: &mut Booking,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        booking.apply(event);
        self.notify.send(booking_id, event);
        Ok(())
    }

    /// Apply a replayed event. No guards, no WAL write, no notifications —
    /// the event was validated when it was first appended.
    fn replay_apply(&self, event: &Event) {
        match event {
            Event::StationRegistered {
                id,
                name,
                total_slots,
                available_slots,
            } => {
                let st = StationState {
                    id: *id,
                    name: name.clone(),
                    total_slots: *total_slots,
                    available_slots: (*available_slots).min(*total_slots),
                    is_active: true,
                };
                self.stations.insert(*id, Arc::new(RwLock::new(st)));
            }
            Event::SlotsAdjusted { station_id, delta } => {
                if let Some(st) = self.get_station(station_id) {
                    let mut g = st.try_write().expect("replay: uncontended write");
                    let next = (g.available_slots as i64 + *delta as i64)
                        .clamp(0, g.total_slots as i64);
                    g.available_slots = next as u32;
                }
            }
            Event::SlotsRecalculated {
                station_id,
                available_slots,
            } => {
                if let Some(st) = self.get_station(station_id) {
                    let mut g = st.try_write().expect("replay: uncontended write");
                    g.available_slots = (*available_slots).min(g.total_slots);
                }
            }
            Event::CarRegistered {
                id,
                station_id,
                hourly_rate,
                daily_rate,
                battery_pct,
            } => {
                let car = CarState::new(*id, *station_id, *hourly_rate, *daily_rate, *battery_pct);
                self.cars.insert(*id, Arc::new(RwLock::new(car)));
            }
            Event::CarTransferred {
                car_id,
                from_station_id,
                to_station_id,
            } => {
                if let Some(from) = self.get_station(from_station_id) {
                    let mut g = from.try_write().expect("replay: uncontended write");
                    g.available_slots = g.available_slots.saturating_sub(1);
                }
                if let Some(to) = self.get_station(to_station_id) {
                    let mut g = to.try_write().expect("replay: uncontended write");
                    g.available_slots = (g.available_slots + 1).min(g.total_slots);
                }
                if let Some(car) = self.get_car(car_id) {
                    let mut g = car.try_write().expect("replay: uncontended write");
                    g.current_station_id = Some(*to_station_id);
                }
            }
            Event::CarSnapshot { car } => {
                self.cars.insert(car.id, Arc::new(RwLock::new(car.clone())));
            }
            Event::BookingCreated {
                id,
                user_id,
                car_id,
                pickup_station_id,
                return_station_id,
                window,
                hourly_rate,
                daily_rate,
                total_amount,
                deposit_amount,
                created_at,
            } => {
                let booking = new_booking_record(
                    *id,
                    *user_id,
                    *car_id,
                    *pickup_station_id,
                    *return_station_id,
                    *window,
                    *hourly_rate,
                    *daily_rate,
                    *total_amount,
                    *deposit_amount,
                    *created_at,
                );
                self.bookings.insert(*id, Arc::new(RwLock::new(booking)));
                if let Some(car) = self.get_car(car_id) {
                    let mut g = car.try_write().expect("replay: uncontended write");
                    g.insert_entry(ScheduleEntry {
                        booking_id: *id,
                        window: *window,
                    });
                }
            }
            Event::BookingConfirmed { id, .. } | Event::BookingCompleted { id, .. } => {
                if let Some(b) = self.get_booking(id) {
                    let mut g = b.try_write().expect("replay: uncontended write");
                    g.apply(event);
                }
            }
            Event::BookingCheckedIn { id, .. } => {
                let Some(b) = self.get_booking(id) else { return };
                let mut g = b.try_write().expect("replay: uncontended write");
                g.apply(event);
                let (car_id, pickup) = (g.car_id, g.pickup_station_id);
                drop(g);
                if let Some(st) = self.get_station(&pickup) {
                    let mut g = st.try_write().expect("replay: uncontended write");
                    g.available_slots = g.available_slots.saturating_sub(1);
                }
                if let Some(car) = self.get_car(&car_id) {
                    let mut g = car.try_write().expect("replay: uncontended write");
                    g.mark_out(pickup);
                }
            }
            Event::BookingCheckedOut {
                id,
                return_station_id,
                battery_pct,
                ..
            } => {
                let Some(b) = self.get_booking(id) else { return };
                let mut g = b.try_write().expect("replay: uncontended write");
                g.apply(event);
                let car_id = g.car_id;
                drop(g);
                if let Some(st) = self.get_station(return_station_id) {
                    let mut g = st.try_write().expect("replay: uncontended write");
                    g.available_slots = (g.available_slots + 1).min(g.total_slots);
                }
                if let Some(car) = self.get_car(&car_id) {
                    let mut g = car.try_write().expect("replay: uncontended write");
                    g.park_at(*return_station_id, *battery_pct);
                    g.remove_entry(*id);
                }
            }
            Event::BookingCancelled { id, slot_restored, .. } => {
                let Some(b) = self.get_booking(id) else { return };
                let mut g = b.try_write().expect("replay: uncontended write");
                g.apply(event);
                let (car_id, pickup) = (g.car_id, g.pickup_station_id);
                drop(g);
                if let Some(car) = self.get_car(&car_id) {
                    let mut g = car.try_write().expect("replay: uncontended write");
                    g.remove_entry(*id);
                    if *slot_restored {
                        g.park_at(pickup, None);
                    }
                }
                if *slot_restored
                    && let Some(st) = self.get_station(&pickup) {
                        let mut g = st.try_write().expect("replay: uncontended write");
                        g.available_slots = (g.available_slots + 1).min(g.total_slots);
                    }
            }
            Event::BookingSnapshot { booking } => {
                self.bookings
                    .insert(booking.id, Arc::new(RwLock::new(booking.clone())));
                if booking.status.holds_schedule()
                    && let Some(car) = self.get_car(&booking.car_id) {
                        let mut g = car.try_write().expect("replay: uncontended write");
                        g.insert_entry(ScheduleEntry {
                            booking_id: booking.id,
                            window: booking.window,
                        });
                    }
            }
            Event::PaymentInitiated {
                id,
                booking_id,
                amount,
                kind,
                gateway_ref,
                checkout_url,
                expires_at,
                created_at,
            } => {
                let payment = new_payment_record(
                    *id,
                    *booking_id,
                    *amount,
                    *kind,
                    gateway_ref.clone(),
                    checkout_url.clone(),
                    *expires_at,
                    *created_at,
                );
                self.payments.insert(*id, Arc::new(RwLock::new(payment)));
                self.booking_payments.entry(*booking_id).or_default().push(*id);
            }
            Event::PaymentResolved { id, .. } => {
                if let Some(p) = self.get_payment(id) {
                    let mut g = p.try_write().expect("replay: uncontended write");
                    g.apply(event);
                }
            }
            Event::PaymentRefunded {
                refund_id,
                payment_id,
                booking_id,
                amount,
                reason,
                at,
            } => {
                if let Some(p) = self.get_payment(payment_id) {
                    let mut g = p.try_write().expect("replay: uncontended write");
                    g.apply(event);
                }
                let refund = refund_record(
                    *refund_id,
                    *payment_id,
                    *booking_id,
                    *amount,
                    reason.clone(),
                    *at,
                );
                self.payments.insert(*refund_id, Arc::new(RwLock::new(refund)));
                self.booking_payments
                    .entry(*booking_id)
                    .or_default()
                    .push(*refund_id);
                if let Some(b) = self.get_booking(booking_id) {
                    let mut g = b.try_write().expect("replay: uncontended write");
                    g.settlement = SettlementStatus::Refunded;
                }
            }
            Event::PaymentSnapshot { payment } => {
                self.payments
                    .insert(payment.id, Arc::new(RwLock::new(payment.clone())));
                self.booking_payments
                    .entry(payment.booking_id)
                    .or_default()
                    .push(payment.id);
            }
        }
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state: station registrations at their current
    /// counters, car snapshots, booking snapshots, payment snapshots.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        for entry in self.stations.iter() {
            let g = entry.value().read().await;
            events.push(Event::StationRegistered {
                id: g.id,
                name: g.name.clone(),
                total_slots: g.total_slots,
                available_slots: g.available_slots,
            });
        }

        for entry in self.cars.iter() {
            let g = entry.value().read().await;
            events.push(Event::CarSnapshot { car: g.clone() });
        }

        for entry in self.bookings.iter() {
            let g = entry.value().read().await;
            events.push(Event::BookingSnapshot { booking: g.clone() });
        }

        // Preserve per-booking payment order so "latest payment" survives.
        for entry in self.booking_payments.iter() {
            for pid in entry.value() {
                if let Some(p) = self.get_payment(pid) {
                    let g = p.read().await;
                    events.push(Event::PaymentSnapshot { payment: g.clone() });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn new_booking_record(
    id: Ulid,
    user_id: Ulid,
    car_id: Ulid,
    pickup_station_id: Ulid,
    return_station_id: Option<Ulid>,
    window: Window,
    hourly_rate: Amount,
    daily_rate: Amount,
    total_amount: Amount,
    deposit_amount: Amount,
    created_at: Ms,
) -> Booking {
    Booking {
        id,
        user_id,
        car_id,
        pickup_station_id,
        return_station_id,
        window,
        actual_return: None,
        status: BookingStatus::Pending,
        hourly_rate,
        daily_rate,
        deposit_amount,
        total_amount,
        actual_amount: None,
        late_fee: 0,
        damage_fee: 0,
        settlement: SettlementStatus::Unpaid,
        cancellation_reason: None,
        check_in_at: None,
        check_in_note: None,
        check_in_photo: None,
        check_out_note: None,
        check_out_photo: None,
        created_at,
        updated_at: created_at,
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn new_payment_record(
    id: Ulid,
    booking_id: Ulid,
    amount: Amount,
    kind: PaymentKind,
    gateway_ref: String,
    checkout_url: Option<String>,
    expires_at: Option<Ms>,
    created_at: Ms,
) -> Payment {
    Payment {
        id,
        booking_id,
        amount,
        kind,
        status: PaymentStatus::Pending,
        gateway_ref,
        checkout_url,
        gateway_txn_id: None,
        failure_reason: None,
        expires_at,
        paid_at: None,
        refunded_at: None,
        refund_reason: None,
        refund_of: None,
        created_at,
    }
}

pub(crate) fn refund_record(
    refund_id: Ulid,
    payment_id: Ulid,
    booking_id: Ulid,
    amount: Amount,
    reason: String,
    at: Ms,
) -> Payment {
    Payment {
        id: refund_id,
        booking_id,
        amount,
        kind: PaymentKind::Refund,
        status: PaymentStatus::Refunded,
        gateway_ref: String::new(),
        checkout_url: None,
        gateway_txn_id: None,
        failure_reason: None,
        expires_at: None,
        paid_at: None,
        refunded_at: Some(at),
        refund_reason: Some(reason),
        refund_of: Some(payment_id),
        created_at: at,
    }
}
