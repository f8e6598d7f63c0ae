use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Money in the smallest currency unit — the only money type.
pub type Amount = i64;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Half-open rental window `[start, end)` — pickup time to expected return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: Ms,
    pub end: Ms,
}

impl Window {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Window start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Window) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Booking lifecycle. Transitions are guarded in one place
/// (`engine::bookings`); `Completed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    CheckedIn,
    CheckedOut,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }

    /// True while the booking blocks the car's schedule.
    pub fn holds_schedule(&self) -> bool {
        matches!(
            self,
            BookingStatus::Pending | BookingStatus::Confirmed | BookingStatus::CheckedIn
        )
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BookingStatus::Pending => "Pending",
            BookingStatus::Confirmed => "Confirmed",
            BookingStatus::CheckedIn => "CheckedIn",
            BookingStatus::CheckedOut => "CheckedOut",
            BookingStatus::Completed => "Completed",
            BookingStatus::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// Booking-level settlement mirror of the payment history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementStatus {
    Unpaid,
    Paid,
    Refunded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
    Cancelled,
    Expired,
    Refunded,
}

impl PaymentStatus {
    /// Terminal payments are immutable; refunds create a new record.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PaymentStatus::Pending => "Pending",
            PaymentStatus::Success => "Success",
            PaymentStatus::Failed => "Failed",
            PaymentStatus::Cancelled => "Cancelled",
            PaymentStatus::Expired => "Expired",
            PaymentStatus::Refunded => "Refunded",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentKind {
    Deposit,
    Rental,
    Extra,
    Refund,
}

/// A single reservation of one car for one window by one user.
/// Never physically deleted; terminal bookings stay queryable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub car_id: Ulid,
    pub pickup_station_id: Ulid,
    pub return_station_id: Option<Ulid>,
    pub window: Window,
    pub actual_return: Option<Ms>,
    pub status: BookingStatus,
    pub hourly_rate: Amount,
    pub daily_rate: Amount,
    pub deposit_amount: Amount,
    pub total_amount: Amount,
    /// Set at checkout: total + late fee + damage fee.
    pub actual_amount: Option<Amount>,
    pub late_fee: Amount,
    pub damage_fee: Amount,
    pub settlement: SettlementStatus,
    pub cancellation_reason: Option<String>,
    pub check_in_at: Option<Ms>,
    pub check_in_note: Option<String>,
    pub check_in_photo: Option<String>,
    pub check_out_note: Option<String>,
    pub check_out_photo: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    /// Apply the booking-record part of an event. Cross-aggregate effects
    /// (slot counters, car position, schedules) live with their owners.
    pub(crate) fn apply(&mut self, event: &Event) {
        match event {
            Event::BookingConfirmed { at, .. } => {
                self.status = BookingStatus::Confirmed;
                self.updated_at = *at;
            }
            Event::BookingCheckedIn { at, note, photo_ref, .. } => {
                self.status = BookingStatus::CheckedIn;
                self.check_in_at = Some(*at);
                self.check_in_note = note.clone();
                self.check_in_photo = photo_ref.clone();
                self.updated_at = *at;
            }
            Event::BookingCheckedOut {
                at,
                return_station_id,
                note,
                photo_ref,
                late_fee,
                damage_fee,
                actual_amount,
                ..
            } => {
                self.status = BookingStatus::CheckedOut;
                self.return_station_id = Some(*return_station_id);
                self.actual_return = Some(*at);
                self.check_out_note = note.clone();
                self.check_out_photo = photo_ref.clone();
                self.late_fee = *late_fee;
                self.damage_fee = *damage_fee;
                self.actual_amount = Some(*actual_amount);
                self.updated_at = *at;
            }
            Event::BookingCompleted { at, .. } => {
                self.status = BookingStatus::Completed;
                self.settlement = SettlementStatus::Paid;
                self.updated_at = *at;
            }
            Event::BookingCancelled { at, reason, .. } => {
                self.status = BookingStatus::Cancelled;
                self.cancellation_reason = Some(reason.clone());
                self.updated_at = *at;
            }
            _ => {}
        }
    }
}

/// One schedule entry on a car: a non-cancelled booking's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub booking_id: Ulid,
    pub window: Window,
}

/// Car record plus its schedule — the windows of every booking currently
/// in {Pending, Confirmed, CheckedIn}, sorted by `window.start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarState {
    pub id: Ulid,
    /// None while the car is out with a customer.
    pub current_station_id: Option<Ulid>,
    /// Station the car departed from at check-in; None while parked.
    pub out_from: Option<Ulid>,
    pub hourly_rate: Amount,
    pub daily_rate: Amount,
    pub battery_pct: u8,
    pub is_active: bool,
    #[serde(skip)]
    pub schedule: Vec<ScheduleEntry>,
}

impl CarState {
    pub fn new(
        id: Ulid,
        station_id: Ulid,
        hourly_rate: Amount,
        daily_rate: Amount,
        battery_pct: u8,
    ) -> Self {
        Self {
            id,
            current_station_id: Some(station_id),
            out_from: None,
            hourly_rate,
            daily_rate,
            battery_pct,
            is_active: true,
            schedule: Vec::new(),
        }
    }

    /// Insert an entry maintaining sort order by window.start.
    pub fn insert_entry(&mut self, entry: ScheduleEntry) {
        let pos = self
            .schedule
            .binary_search_by_key(&entry.window.start, |e| e.window.start)
            .unwrap_or_else(|e| e);
        self.schedule.insert(pos, entry);
    }

    pub fn remove_entry(&mut self, booking_id: Ulid) -> Option<ScheduleEntry> {
        if let Some(pos) = self.schedule.iter().position(|e| e.booking_id == booking_id) {
            Some(self.schedule.remove(pos))
        } else {
            None
        }
    }

    /// Entries whose window overlaps the query. Binary search skips
    /// entries starting at or after `query.end`.
    pub fn overlapping(&self, query: &Window) -> impl Iterator<Item = &ScheduleEntry> {
        let right_bound = self
            .schedule
            .partition_point(|e| e.window.start < query.end);
        self.schedule[..right_bound]
            .iter()
            .filter(move |e| e.window.end > query.start)
    }

    pub(crate) fn mark_out(&mut self, from_station: Ulid) {
        self.current_station_id = None;
        self.out_from = Some(from_station);
    }

    pub(crate) fn park_at(&mut self, station_id: Ulid, battery_pct: Option<u8>) {
        self.current_station_id = Some(station_id);
        self.out_from = None;
        if let Some(pct) = battery_pct {
            self.battery_pct = pct.min(100);
        }
    }
}

/// Station record. `available_slots` is written only by the slot ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationState {
    pub id: Ulid,
    pub name: Option<String>,
    pub total_slots: u32,
    pub available_slots: u32,
    pub is_active: bool,
}

impl StationState {
    /// Counter after `delta`, or None if it would leave `[0, total_slots]`.
    pub fn adjusted(&self, delta: i32) -> Option<u32> {
        let next = self.available_slots as i64 + delta as i64;
        if next < 0 || next > self.total_slots as i64 {
            None
        } else {
            Some(next as u32)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub amount: Amount,
    pub kind: PaymentKind,
    pub status: PaymentStatus,
    pub gateway_ref: String,
    pub checkout_url: Option<String>,
    pub gateway_txn_id: Option<String>,
    pub failure_reason: Option<String>,
    pub expires_at: Option<Ms>,
    pub paid_at: Option<Ms>,
    pub refunded_at: Option<Ms>,
    pub refund_reason: Option<String>,
    /// For Refund-kind records: the payment being refunded.
    pub refund_of: Option<Ulid>,
    pub created_at: Ms,
}

impl Payment {
    pub(crate) fn apply(&mut self, event: &Event) {
        match event {
            Event::PaymentResolved {
                status,
                gateway_txn_id,
                failure_reason,
                at,
                ..
            } => {
                self.status = *status;
                self.gateway_txn_id = gateway_txn_id.clone();
                self.failure_reason = failure_reason.clone();
                if *status == PaymentStatus::Success {
                    self.paid_at = Some(*at);
                    self.expires_at = None;
                }
            }
            // Applied to the original payment, not the refund record.
            Event::PaymentRefunded { reason, at, .. } => {
                self.status = PaymentStatus::Refunded;
                self.refunded_at = Some(*at);
                self.refund_reason = Some(reason.clone());
            }
            _ => {}
        }
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
/// Snapshot variants are emitted only by compaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    StationRegistered {
        id: Ulid,
        name: Option<String>,
        total_slots: u32,
        available_slots: u32,
    },
    SlotsAdjusted {
        station_id: Ulid,
        delta: i32,
    },
    SlotsRecalculated {
        station_id: Ulid,
        available_slots: u32,
    },
    CarRegistered {
        id: Ulid,
        station_id: Ulid,
        hourly_rate: Amount,
        daily_rate: Amount,
        battery_pct: u8,
    },
    CarTransferred {
        car_id: Ulid,
        from_station_id: Ulid,
        to_station_id: Ulid,
    },
    CarSnapshot {
        car: CarState,
    },
    BookingCreated {
        id: Ulid,
        user_id: Ulid,
        car_id: Ulid,
        pickup_station_id: Ulid,
        /// Planned return station; the actual one is fixed at check-out.
        return_station_id: Option<Ulid>,
        window: Window,
        hourly_rate: Amount,
        daily_rate: Amount,
        total_amount: Amount,
        deposit_amount: Amount,
        created_at: Ms,
    },
    BookingConfirmed {
        id: Ulid,
        at: Ms,
    },
    BookingCheckedIn {
        id: Ulid,
        at: Ms,
        note: Option<String>,
        photo_ref: Option<String>,
    },
    BookingCheckedOut {
        id: Ulid,
        at: Ms,
        return_station_id: Ulid,
        note: Option<String>,
        photo_ref: Option<String>,
        late_fee: Amount,
        damage_fee: Amount,
        actual_amount: Amount,
        battery_pct: Option<u8>,
    },
    BookingCompleted {
        id: Ulid,
        at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        at: Ms,
        reason: String,
        /// True when the pickup-station slot was restored (cancel after
        /// check-in).
        slot_restored: bool,
    },
    BookingSnapshot {
        booking: Booking,
    },
    PaymentInitiated {
        id: Ulid,
        booking_id: Ulid,
        amount: Amount,
        kind: PaymentKind,
        gateway_ref: String,
        checkout_url: Option<String>,
        expires_at: Option<Ms>,
        created_at: Ms,
    },
    PaymentResolved {
        id: Ulid,
        status: PaymentStatus,
        gateway_txn_id: Option<String>,
        failure_reason: Option<String>,
        at: Ms,
    },
    PaymentRefunded {
        refund_id: Ulid,
        payment_id: Ulid,
        booking_id: Ulid,
        amount: Amount,
        reason: String,
        at: Ms,
    },
    PaymentSnapshot {
        payment: Payment,
    },
}
