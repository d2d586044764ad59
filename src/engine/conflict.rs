use chrono::{NaiveDate, NaiveDateTime};
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Local wall-clock time. Calendars are shop-local and timezone-naive.
pub(crate) fn now_local() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < 0 || span.end > MINUTES_PER_DAY {
        return Err(EngineError::InvalidInput("time of day out of range"));
    }
    if span.start >= span.end {
        return Err(EngineError::InvalidInput("start must precede end"));
    }
    Ok(())
}

/// Write-time guard for booking creation: the same widened-overlap
/// predicate the slot resolver applies, re-checked under the shop's write
/// lock so two racing clients cannot both commit the slot they each saw
/// as free.
pub(crate) fn check_no_conflict(
    shop: &ShopState,
    staff_id: Ulid,
    date: NaiveDate,
    span: &Span,
    buffer_before: Minutes,
    buffer_after: Minutes,
) -> Result<(), EngineError> {
    for booking in shop.day_bookings(date) {
        if booking.staff_id != staff_id || !booking.status.occupies() {
            continue;
        }
        if booking.span.padded(buffer_before, buffer_after).overlaps(span) {
            return Err(EngineError::Conflict(booking.id));
        }
    }
    Ok(())
}
