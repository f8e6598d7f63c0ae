//! Read-side of the engine. Every query returns an owned clone taken
//! under the record's read lock; callers never see a live guard.

use ulid::Ulid;

use crate::model::*;

use super::availability::{self, validate_window};
use super::{Engine, EngineError};

impl Engine {
    pub async fn booking(&self, id: Ulid) -> Option<Booking> {
        let b = self.get_booking(&id)?;
        Some(b.read().await.clone())
    }

    pub async fn car(&self, id: Ulid) -> Option<CarState> {
        let c = self.get_car(&id)?;
        Some(c.read().await.clone())
    }

    pub async fn station(&self, id: Ulid) -> Option<StationState> {
        let s = self.get_station(&id)?;
        Some(s.read().await.clone())
    }

    pub async fn payment(&self, id: Ulid) -> Option<Payment> {
        let p = self.get_payment(&id)?;
        Some(p.read().await.clone())
    }

    /// All payments of a booking in initiation order, refunds included.
    pub async fn payments_for(&self, booking_id: Ulid) -> Vec<Payment> {
        let ids: Vec<Ulid> = self
            .booking_payments
            .get(&booking_id)
            .map(|v| v.clone())
            .unwrap_or_default();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(p) = self.get_payment(&id) {
                out.push(p.read().await.clone());
            }
        }
        out
    }

    /// The latest non-refund payment of a booking.
    pub async fn latest_payment_for(&self, booking_id: Ulid) -> Option<Payment> {
        let id = self.latest_payment_id(&booking_id).await?;
        self.payment(id).await
    }

    /// Whether the car is free for the whole window. Advisory only: the
    /// authoritative check reruns under the car's write lock at creation.
    pub async fn check_availability(
        &self,
        car_id: Ulid,
        window: &Window,
    ) -> Result<bool, EngineError> {
        validate_window(window)?;
        let car = self.get_car(&car_id).ok_or(EngineError::NotFound(car_id))?;
        let guard = car.read().await;
        if !guard.is_active {
            return Ok(false);
        }
        Ok(availability::find_conflict(&guard, window).is_none())
    }

    /// Free gaps in the car's schedule inside `query`.
    pub async fn free_windows(
        &self,
        car_id: Ulid,
        query: &Window,
    ) -> Result<Vec<Window>, EngineError> {
        validate_window(query)?;
        let car = self.get_car(&car_id).ok_or(EngineError::NotFound(car_id))?;
        let guard = car.read().await;
        Ok(availability::free_windows(&guard, query))
    }

    pub async fn bookings_for_user(&self, user_id: Ulid) -> Vec<Booking> {
        let mut out = Vec::new();
        for entry in self.bookings.iter() {
            let guard = entry.value().read().await;
            if guard.user_id == user_id {
                out.push(guard.clone());
            }
        }
        out.sort_by_key(|b| b.created_at);
        out
    }

    /// Cars currently parked at a station.
    pub async fn cars_at(&self, station_id: Ulid) -> Vec<CarState> {
        let mut out = Vec::new();
        for entry in self.cars.iter() {
            let guard = entry.value().read().await;
            if guard.current_station_id == Some(station_id) {
                out.push(guard.clone());
            }
        }
        out
    }

    pub async fn stations(&self) -> Vec<StationState> {
        let mut out = Vec::new();
        for entry in self.stations.iter() {
            out.push(entry.value().read().await.clone());
        }
        out.sort_by_key(|s| s.id);
        out
    }
}
