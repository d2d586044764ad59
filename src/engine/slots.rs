use chrono::{NaiveDate, NaiveDateTime, Timelike};

use crate::model::*;

// ── Slot Resolver ─────────────────────────────────────────────────

/// Why a day produced no slots. Collapsed to an empty list at the query
/// surface; kept distinct here for callers that want richer messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    /// No day rule for the weekday, the rule is marked closed, or a
    /// full-day closure falls on the date.
    ShopClosed,
    /// The staff member's weekday rule marks a day off.
    StaffDayOff,
    /// An approved time-off range covers the date.
    StaffTimeOff,
    /// Nominally open but no resolved open or close time.
    HoursUnset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotOutcome {
    Open(Vec<Slot>),
    Unavailable(UnavailableReason),
}

impl SlotOutcome {
    /// The original contract: unavailable days are just empty lists.
    pub fn into_slots(self) -> Vec<Slot> {
        match self {
            SlotOutcome::Open(slots) => slots,
            SlotOutcome::Unavailable(_) => Vec::new(),
        }
    }
}

/// Effective open/close for the day. Staff fields override per-field;
/// the shop rule fills whichever side the staff rule leaves unset.
fn effective_window(
    shop_rule: &DayRule,
    staff_rule: Option<&DayRule>,
) -> (Option<Minutes>, Option<Minutes>) {
    match staff_rule {
        Some(rule) => (rule.open.or(shop_rule.open), rule.close.or(shop_rule.close)),
        None => (shop_rule.open, shop_rule.close),
    }
}

/// Compute the bookable slots for one (shop, service, staff, date) tuple.
///
/// Pure and single-pass: candidates start at the effective open time and
/// advance on the 30-minute grid while a full service duration still fits
/// before close. On the current date, slots starting at or before `now`
/// are dropped. A candidate survives if it overlaps no occupying booking
/// (pending or confirmed; widened by the service's buffers) and no
/// partial-day closure. Touching ranges do not conflict.
pub fn resolve_slots(
    shop: &ShopState,
    service: &Service,
    staff: Option<&StaffState>,
    date: NaiveDate,
    now: NaiveDateTime,
) -> SlotOutcome {
    let Some(shop_rule) = shop.hours[weekday_index(date)] else {
        return SlotOutcome::Unavailable(UnavailableReason::ShopClosed);
    };
    if shop_rule.closed {
        return SlotOutcome::Unavailable(UnavailableReason::ShopClosed);
    }

    let closure = shop.closure_on(date);
    if matches!(closure, Some(Closure { span: None, .. })) {
        return SlotOutcome::Unavailable(UnavailableReason::ShopClosed);
    }

    let (open, close) = match staff {
        Some(member) => {
            let staff_rule = member.hours[weekday_index(date)];
            if staff_rule.is_some_and(|r| r.closed) {
                return SlotOutcome::Unavailable(UnavailableReason::StaffDayOff);
            }
            if member.on_time_off(date) {
                return SlotOutcome::Unavailable(UnavailableReason::StaffTimeOff);
            }
            effective_window(&shop_rule, staff_rule.as_ref())
        }
        None => effective_window(&shop_rule, None),
    };

    // An "open" day with no explicit hours is unbookable, not 24-hour.
    let (Some(open), Some(close)) = (open, close) else {
        return SlotOutcome::Unavailable(UnavailableReason::HoursUnset);
    };

    let mut busy: Vec<Span> = shop
        .day_bookings(date)
        .iter()
        .filter(|b| b.status.occupies())
        .filter(|b| staff.is_none_or(|member| b.staff_id == member.id))
        .map(|b| b.span.padded(service.buffer_before, service.buffer_after))
        .collect();
    if let Some(Closure { span: Some(blocked), .. }) = closure {
        busy.push(*blocked);
    }

    let today = date == now.date();
    let now_min = (now.time().hour() * 60 + now.time().minute()) as Minutes;

    let mut slots = Vec::new();
    let mut start = open;
    while start + service.duration_min <= close {
        let candidate = Span::new(start, start + service.duration_min);
        // A slot starting exactly now has already passed.
        let past = today && candidate.start <= now_min;
        if !past && !busy.iter().any(|b| b.overlaps(&candidate)) {
            slots.push(Slot {
                start: candidate.start,
                end: candidate.end,
            });
        }
        start += SLOT_STEP;
    }

    SlotOutcome::Open(slots)
}
