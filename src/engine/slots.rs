//! Station registry and the slot ledger. `available_slots` tracks cars
//! on site: check-in takes one, check-out returns one, transfers move one.
//! Every mutation stays inside `[0, total_slots]`.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::MAX_NAME_LEN;
use crate::model::*;
use crate::observability;

use super::{Engine, EngineError};

impl Engine {
    pub async fn register_station(
        &self,
        id: Ulid,
        name: Option<String>,
        total_slots: u32,
    ) -> Result<(), EngineError> {
        if total_slots == 0 {
            return Err(EngineError::Validation("station must have at least one slot"));
        }
        if let Some(n) = &name
            && n.len() > MAX_NAME_LEN {
                return Err(EngineError::Validation("station name too long"));
            }
        if self.stations.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::StationRegistered {
            id,
            name: name.clone(),
            total_slots,
            // A new station starts full: every slot holds a rentable car
            // position until cars actually leave.
            available_slots: total_slots,
        };
        self.wal_append(&event).await?;

        let station = StationState {
            id,
            name,
            total_slots,
            available_slots: total_slots,
            is_active: true,
        };
        if self
            .stations
            .insert(id, Arc::new(RwLock::new(station)))
            .is_some()
        {
            // Raced with a concurrent registration of the same id. The WAL
            // replay path tolerates the duplicate (last write wins).
            warn!(station = %id, "duplicate station registration");
        }
        info!(station = %id, total_slots, "station registered");
        Ok(())
    }

    pub async fn register_car(
        &self,
        id: Ulid,
        station_id: Ulid,
        hourly_rate: Amount,
        daily_rate: Amount,
        battery_pct: u8,
    ) -> Result<(), EngineError> {
        if hourly_rate <= 0 || daily_rate <= 0 {
            return Err(EngineError::Validation("rates must be positive"));
        }
        if battery_pct > 100 {
            return Err(EngineError::Validation("battery percentage above 100"));
        }
        let station = self
            .get_station(&station_id)
            .ok_or(EngineError::NotFound(station_id))?;
        if !station.read().await.is_active {
            return Err(EngineError::StationInactive(station_id));
        }
        if self.cars.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::CarRegistered {
            id,
            station_id,
            hourly_rate,
            daily_rate,
            battery_pct,
        };
        self.wal_append(&event).await?;

        let car = CarState::new(id, station_id, hourly_rate, daily_rate, battery_pct);
        self.cars.insert(id, Arc::new(RwLock::new(car)));
        info!(car = %id, station = %station_id, "car registered");
        Ok(())
    }

    /// Manual counter correction by an operator. Rejected at the bounds.
    pub async fn adjust_slots(&self, station_id: Ulid, delta: i32) -> Result<u32, EngineError> {
        let station = self
            .get_station(&station_id)
            .ok_or(EngineError::NotFound(station_id))?;
        let mut guard = station.write().await;

        let Some(next) = guard.adjusted(delta) else {
            metrics::counter!(observability::SLOT_VIOLATIONS_TOTAL).increment(1);
            return Err(EngineError::SlotInvariantViolation {
                station: station_id,
                available: guard.available_slots,
                total: guard.total_slots,
                delta,
            });
        };

        self.wal_append(&Event::SlotsAdjusted { station_id, delta })
            .await?;
        guard.available_slots = next;
        info!(station = %station_id, delta, available = next, "slots adjusted");
        Ok(next)
    }

    /// Rebuild a station's counter from car positions: total minus cars
    /// currently out from this station, clamped to `[0, total_slots]`.
    pub async fn recalculate_slots(&self, station_id: Ulid) -> Result<u32, EngineError> {
        let station = self
            .get_station(&station_id)
            .ok_or(EngineError::NotFound(station_id))?;

        // Count before taking the station lock; cars are locked after
        // stations nowhere, so reading them while holding the station
        // write lock would invert the lock order.
        let mut out_count: u32 = 0;
        for entry in self.cars.iter() {
            let car = entry.value().read().await;
            if car.out_from == Some(station_id) {
                out_count += 1;
            }
        }

        let mut guard = station.write().await;
        let available = guard.total_slots.saturating_sub(out_count);
        if available != guard.available_slots {
            warn!(
                station = %station_id,
                was = guard.available_slots,
                now = available,
                "slot counter drift corrected"
            );
        }
        self.wal_append(&Event::SlotsRecalculated {
            station_id,
            available_slots: available,
        })
        .await?;
        guard.available_slots = available;
        Ok(available)
    }

    /// Relocate a parked car between stations, moving one slot with it.
    pub async fn transfer_car(&self, car_id: Ulid, to_station_id: Ulid) -> Result<(), EngineError> {
        let car = self.get_car(&car_id).ok_or(EngineError::NotFound(car_id))?;
        let to = self
            .get_station(&to_station_id)
            .ok_or(EngineError::NotFound(to_station_id))?;

        let mut car_guard = car.write().await;
        if !car_guard.is_active {
            return Err(EngineError::CarInactive(car_id));
        }
        let Some(from_station_id) = car_guard.current_station_id else {
            return Err(EngineError::Validation("car is out with a customer"));
        };
        if from_station_id == to_station_id {
            return Err(EngineError::Validation("car is already at that station"));
        }
        let from = self
            .get_station(&from_station_id)
            .ok_or(EngineError::NotFound(from_station_id))?;

        // Stations lock in id order to keep a single global order.
        let (mut from_guard, mut to_guard) = if from_station_id < to_station_id {
            let f = from.write().await;
            let t = to.write().await;
            (f, t)
        } else {
            let t = to.write().await;
            let f = from.write().await;
            (f, t)
        };

        if !to_guard.is_active {
            return Err(EngineError::StationInactive(to_station_id));
        }
        let Some(from_next) = from_guard.adjusted(-1) else {
            metrics::counter!(observability::SLOT_VIOLATIONS_TOTAL).increment(1);
            return Err(EngineError::SlotInvariantViolation {
                station: from_station_id,
                available: from_guard.available_slots,
                total: from_guard.total_slots,
                delta: -1,
            });
        };
        let Some(to_next) = to_guard.adjusted(1) else {
            metrics::counter!(observability::SLOT_VIOLATIONS_TOTAL).increment(1);
            return Err(EngineError::SlotInvariantViolation {
                station: to_station_id,
                available: to_guard.available_slots,
                total: to_guard.total_slots,
                delta: 1,
            });
        };

        self.wal_append(&Event::CarTransferred {
            car_id,
            from_station_id,
            to_station_id,
        })
        .await?;

        from_guard.available_slots = from_next;
        to_guard.available_slots = to_next;
        car_guard.current_station_id = Some(to_station_id);
        info!(car = %car_id, from = %from_station_id, to = %to_station_id, "car transferred");
        Ok(())
    }
}
