//! Booking state machine. One guarded path per transition; every accepted
//! transition is WAL-appended before it touches memory. Lock order is
//! always booking, then car, then station.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{self, record_transition};
use crate::pricing;

use super::availability::{find_conflict, validate_window};
use super::{Engine, EngineError, new_booking_record};

pub struct CreateBooking {
    pub user_id: Ulid,
    pub car_id: Ulid,
    pub pickup_station_id: Ulid,
    /// Planned return station, if the customer picked one up front.
    pub return_station_id: Option<Ulid>,
    pub window: Window,
}

pub struct CheckOutRequest {
    pub return_station_id: Ulid,
    pub note: Option<String>,
    pub photo_ref: Option<String>,
    pub damage_fee: Amount,
    pub battery_pct: Option<u8>,
}

fn validate_note(note: &Option<String>) -> Result<(), EngineError> {
    if let Some(n) = note
        && n.len() > MAX_NOTE_LEN {
            return Err(EngineError::Validation("note too long"));
        }
    Ok(())
}

fn validate_photo(photo: &Option<String>) -> Result<(), EngineError> {
    if let Some(p) = photo
        && p.len() > MAX_URL_LEN {
            return Err(EngineError::Validation("photo reference too long"));
        }
    Ok(())
}

impl Engine {
    /// Reserve a car for a window. Availability check and schedule insert
    /// happen under the car's write lock, so two concurrent requests for
    /// the same car cannot both pass the conflict check.
    pub async fn create_booking(&self, req: CreateBooking) -> Result<Booking, EngineError> {
        validate_window(&req.window)?;
        let created_at = now_ms();
        if req.window.start <= created_at {
            return Err(EngineError::Validation("pickup time must be in the future"));
        }

        let car = self
            .get_car(&req.car_id)
            .ok_or(EngineError::NotFound(req.car_id))?;
        let mut car_guard = car.write().await;
        if !car_guard.is_active {
            return Err(EngineError::CarInactive(req.car_id));
        }
        if car_guard.schedule.len() >= MAX_SCHEDULE_ENTRIES {
            return Err(EngineError::Validation("car schedule is full"));
        }
        // The car must live at the requested pickup station, even if it
        // is currently out with another customer.
        let home_station = car_guard.current_station_id.or(car_guard.out_from);
        if home_station != Some(req.pickup_station_id) {
            return Err(EngineError::Validation("car is not at the pickup station"));
        }
        for station_id in std::iter::once(req.pickup_station_id).chain(req.return_station_id) {
            let station = self
                .get_station(&station_id)
                .ok_or(EngineError::NotFound(station_id))?;
            if !station.read().await.is_active {
                return Err(EngineError::StationInactive(station_id));
            }
        }

        if let Some(conflict) = find_conflict(&car_guard, &req.window) {
            metrics::counter!(observability::CONFLICTS_TOTAL).increment(1);
            record_transition("create", false);
            debug!(car = %req.car_id, %conflict, "booking rejected: window conflict");
            return Err(EngineError::CarUnavailable {
                car: req.car_id,
                conflict,
            });
        }

        let total_amount =
            pricing::rental_total(&req.window, car_guard.hourly_rate, car_guard.daily_rate);
        let deposit_amount = pricing::deposit_for(total_amount);
        let id = Ulid::new();

        let event = Event::BookingCreated {
            id,
            user_id: req.user_id,
            car_id: req.car_id,
            pickup_station_id: req.pickup_station_id,
            return_station_id: req.return_station_id,
            window: req.window,
            hourly_rate: car_guard.hourly_rate,
            daily_rate: car_guard.daily_rate,
            total_amount,
            deposit_amount,
            created_at,
        };
        self.wal_append(&event).await?;

        let booking = new_booking_record(
            id,
            req.user_id,
            req.car_id,
            req.pickup_station_id,
            req.return_station_id,
            req.window,
            car_guard.hourly_rate,
            car_guard.daily_rate,
            total_amount,
            deposit_amount,
            created_at,
        );
        car_guard.insert_entry(ScheduleEntry {
            booking_id: id,
            window: req.window,
        });
        self.bookings
            .insert(id, Arc::new(RwLock::new(booking.clone())));

        record_transition("create", true);
        info!(booking = %id, car = %req.car_id, total = total_amount, "booking created");
        Ok(booking)
    }

    /// Pending → Confirmed, gated on a successful deposit payment. The
    /// payment check runs before the booking lock: Success is terminal,
    /// so a positive answer cannot go stale.
    pub async fn confirm_booking(&self, id: Ulid, at: Ms) -> Result<(), EngineError> {
        let latest = self.latest_payment_status(&id).await;
        if !self.has_success_payment(&id, Some(PaymentKind::Deposit)).await {
            record_transition("confirm", false);
            return Err(EngineError::PaymentNotCompleted {
                booking: id,
                latest,
            });
        }

        let booking = self.get_booking(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = booking.write().await;
        if guard.status != BookingStatus::Pending {
            record_transition("confirm", false);
            return Err(EngineError::InvalidTransition {
                id,
                from: guard.status,
                op: "confirm",
            });
        }

        let event = Event::BookingConfirmed { id, at };
        self.persist_booking_event(id, &mut guard, &event).await?;
        record_transition("confirm", true);
        info!(booking = %id, "booking confirmed");
        Ok(())
    }

    /// Confirmed → CheckedIn. The car leaves its station: one slot is
    /// consumed at the pickup station and the car is marked out.
    pub async fn check_in(
        &self,
        id: Ulid,
        at: Ms,
        note: Option<String>,
        photo_ref: Option<String>,
    ) -> Result<(), EngineError> {
        validate_note(&note)?;
        validate_photo(&photo_ref)?;

        let booking = self.get_booking(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = booking.write().await;
        if guard.status != BookingStatus::Confirmed {
            record_transition("check_in", false);
            return Err(EngineError::InvalidTransition {
                id,
                from: guard.status,
                op: "check_in",
            });
        }

        let car = self
            .get_car(&guard.car_id)
            .ok_or(EngineError::NotFound(guard.car_id))?;
        let mut car_guard = car.write().await;
        let station = self
            .get_station(&guard.pickup_station_id)
            .ok_or(EngineError::NotFound(guard.pickup_station_id))?;
        let mut station_guard = station.write().await;

        let Some(next) = station_guard.adjusted(-1) else {
            metrics::counter!(observability::SLOT_VIOLATIONS_TOTAL).increment(1);
            record_transition("check_in", false);
            return Err(EngineError::SlotInvariantViolation {
                station: guard.pickup_station_id,
                available: station_guard.available_slots,
                total: station_guard.total_slots,
                delta: -1,
            });
        };

        let event = Event::BookingCheckedIn {
            id,
            at,
            note,
            photo_ref,
        };
        self.persist_booking_event(id, &mut guard, &event).await?;
        station_guard.available_slots = next;
        car_guard.mark_out(guard.pickup_station_id);

        record_transition("check_in", true);
        info!(booking = %id, car = %guard.car_id, "checked in");
        Ok(())
    }

    /// CheckedIn → CheckedOut. The car arrives at the return station: one
    /// slot is released there, fees are fixed, and the schedule entry is
    /// dropped (the car is bookable again for this window).
    pub async fn check_out(
        &self,
        id: Ulid,
        at: Ms,
        req: CheckOutRequest,
    ) -> Result<Amount, EngineError> {
        validate_note(&req.note)?;
        validate_photo(&req.photo_ref)?;
        if req.damage_fee < 0 {
            return Err(EngineError::Validation("damage fee must not be negative"));
        }
        if let Some(pct) = req.battery_pct
            && pct > 100 {
                return Err(EngineError::Validation("battery percentage above 100"));
            }

        let booking = self.get_booking(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = booking.write().await;
        if guard.status != BookingStatus::CheckedIn {
            record_transition("check_out", false);
            return Err(EngineError::InvalidTransition {
                id,
                from: guard.status,
                op: "check_out",
            });
        }

        let car = self
            .get_car(&guard.car_id)
            .ok_or(EngineError::NotFound(guard.car_id))?;
        let mut car_guard = car.write().await;
        let station = self
            .get_station(&req.return_station_id)
            .ok_or(EngineError::NotFound(req.return_station_id))?;
        let mut station_guard = station.write().await;
        if !station_guard.is_active {
            return Err(EngineError::StationInactive(req.return_station_id));
        }

        let Some(next) = station_guard.adjusted(1) else {
            metrics::counter!(observability::SLOT_VIOLATIONS_TOTAL).increment(1);
            record_transition("check_out", false);
            return Err(EngineError::SlotInvariantViolation {
                station: req.return_station_id,
                available: station_guard.available_slots,
                total: station_guard.total_slots,
                delta: 1,
            });
        };

        let late_fee = pricing::late_fee(guard.window.end, at, guard.hourly_rate);
        let actual_amount =
            pricing::settlement_total(guard.total_amount, late_fee, req.damage_fee);

        let event = Event::BookingCheckedOut {
            id,
            at,
            return_station_id: req.return_station_id,
            note: req.note,
            photo_ref: req.photo_ref,
            late_fee,
            damage_fee: req.damage_fee,
            actual_amount,
            battery_pct: req.battery_pct,
        };
        self.persist_booking_event(id, &mut guard, &event).await?;
        station_guard.available_slots = next;
        car_guard.park_at(req.return_station_id, req.battery_pct);
        car_guard.remove_entry(id);

        record_transition("check_out", true);
        info!(booking = %id, late_fee, actual = actual_amount, "checked out");
        Ok(actual_amount)
    }

    /// CheckedOut → Completed, gated on a successful rental payment for
    /// the settled amount. Terminal.
    pub async fn complete_booking(&self, id: Ulid, at: Ms) -> Result<(), EngineError> {
        let latest = self.latest_payment_status(&id).await;
        if !self.has_success_payment(&id, Some(PaymentKind::Rental)).await {
            record_transition("complete", false);
            return Err(EngineError::PaymentNotCompleted {
                booking: id,
                latest,
            });
        }

        let booking = self.get_booking(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = booking.write().await;
        if guard.status != BookingStatus::CheckedOut {
            record_transition("complete", false);
            return Err(EngineError::InvalidTransition {
                id,
                from: guard.status,
                op: "complete",
            });
        }

        let event = Event::BookingCompleted { id, at };
        self.persist_booking_event(id, &mut guard, &event).await?;
        drop(guard);
        self.notify.remove(&id);

        record_transition("complete", true);
        info!(booking = %id, "booking completed");
        Ok(())
    }

    /// Cancel from Pending, Confirmed or CheckedIn. Cancelling after
    /// check-in returns the car to its pickup station and restores the
    /// slot taken at check-in, exactly once.
    pub async fn cancel_booking(&self, id: Ulid, reason: String, at: Ms) -> Result<(), EngineError> {
        if reason.len() > MAX_REASON_LEN {
            return Err(EngineError::Validation("cancellation reason too long"));
        }

        let booking = self.get_booking(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = booking.write().await;
        if !guard.status.holds_schedule() {
            record_transition("cancel", false);
            return Err(EngineError::InvalidTransition {
                id,
                from: guard.status,
                op: "cancel",
            });
        }
        let slot_restored = guard.status == BookingStatus::CheckedIn;

        let car = self
            .get_car(&guard.car_id)
            .ok_or(EngineError::NotFound(guard.car_id))?;
        let mut car_guard = car.write().await;

        let event = Event::BookingCancelled {
            id,
            at,
            reason,
            slot_restored,
        };
        self.persist_booking_event(id, &mut guard, &event).await?;
        car_guard.remove_entry(id);
        if slot_restored {
            let pickup = guard.pickup_station_id;
            car_guard.park_at(pickup, None);
            if let Some(station) = self.get_station(&pickup) {
                let mut station_guard = station.write().await;
                match station_guard.adjusted(1) {
                    Some(next) => station_guard.available_slots = next,
                    // Counter already at total: drift, not a reason to fail
                    // a cancellation that is already in the WAL.
                    None => tracing::warn!(station = %pickup, "slot restore hit counter ceiling"),
                }
            }
        }
        drop(car_guard);
        drop(guard);
        self.notify.remove(&id);

        record_transition("cancel", true);
        info!(booking = %id, slot_restored, "booking cancelled");
        Ok(())
    }

    /// Auto-cancel a stale Pending booking. Status and payment are both
    /// checked under the booking lock, so a deposit that reconciles
    /// between the sweep's scan and this call still saves its booking.
    /// Returns whether it expired.
    pub(crate) async fn expire_booking(&self, id: Ulid, at: Ms) -> Result<bool, EngineError> {
        let Some(booking) = self.get_booking(&id) else {
            return Ok(false);
        };
        let mut guard = booking.write().await;
        if guard.status != BookingStatus::Pending {
            return Ok(false);
        }
        if self.has_success_payment(&id, None).await {
            return Ok(false);
        }

        let car = self
            .get_car(&guard.car_id)
            .ok_or(EngineError::NotFound(guard.car_id))?;
        let mut car_guard = car.write().await;

        let event = Event::BookingCancelled {
            id,
            at,
            reason: "payment timeout".to_string(),
            slot_restored: false,
        };
        self.persist_booking_event(id, &mut guard, &event).await?;
        car_guard.remove_entry(id);
        drop(car_guard);
        drop(guard);
        self.notify.remove(&id);

        metrics::counter!(observability::BOOKINGS_EXPIRED_TOTAL).increment(1);
        info!(booking = %id, "pending booking expired");
        Ok(true)
    }

    /// Pending bookings created at or before `cutoff`.
    pub(crate) async fn collect_stale_pending(&self, cutoff: Ms) -> Vec<Ulid> {
        let mut stale = Vec::new();
        for entry in self.bookings.iter() {
            let guard = entry.value().read().await;
            if guard.status == BookingStatus::Pending && guard.created_at <= cutoff {
                stale.push(guard.id);
            }
        }
        stale
    }
}
