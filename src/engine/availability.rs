//! Availability decisions over a car's schedule. Pure logic — the caller
//! holds whatever lock makes the answer trustworthy.

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_window(window: &Window) -> Result<(), EngineError> {
    if window.start < MIN_VALID_TIMESTAMP_MS || window.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::Validation("timestamp out of range"));
    }
    if window.start >= window.end {
        return Err(EngineError::Validation("return time must be after pickup time"));
    }
    if window.duration_ms() > MAX_WINDOW_DURATION_MS {
        return Err(EngineError::Validation("rental window too wide"));
    }
    Ok(())
}

/// First schedule entry overlapping `window`, if any. Half-open overlap:
/// `a.start < b.end && b.start < a.end`.
pub(crate) fn find_conflict(car: &CarState, window: &Window) -> Option<Ulid> {
    car.overlapping(window).next().map(|e| e.booking_id)
}

/// Merge sorted overlapping/adjacent windows into disjoint windows.
pub fn merge_overlapping(sorted: &[Window]) -> Vec<Window> {
    let mut merged: Vec<Window> = Vec::new();
    for &w in sorted {
        if let Some(last) = merged.last_mut()
            && w.start <= last.end {
                last.end = last.end.max(w.end);
                continue;
            }
        merged.push(w);
    }
    merged
}

/// Subtract `booked` from `base`; both sorted by start.
pub fn subtract_windows(base: &[Window], booked: &[Window]) -> Vec<Window> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < booked.len() && booked[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < booked.len() && booked[j].start < current_end {
            let r = &booked[j];
            if r.start > current_start {
                result.push(Window::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Window::new(current_start, current_end));
        }
    }

    result
}

/// Free gaps of a car's schedule inside `query`.
pub(crate) fn free_windows(car: &CarState, query: &Window) -> Vec<Window> {
    let mut booked: Vec<Window> = car
        .overlapping(query)
        .map(|e| {
            Window::new(
                e.window.start.max(query.start),
                e.window.end.min(query.end),
            )
        })
        .collect();
    booked.sort_by_key(|w| w.start);
    let booked = merge_overlapping(&booked);
    subtract_windows(&[*query], &booked)
}
