use std::collections::{HashMap, HashSet};

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Minutes since midnight — the only time-of-day type.
pub type Minutes = i32;

pub const MINUTES_PER_DAY: Minutes = 24 * 60;

/// Candidate slots are generated on this grid.
pub const SLOT_STEP: Minutes = 30;

/// Half-open minute range `[start, end)` within a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Minutes,
    pub end: Minutes,
}

impl Span {
    pub fn new(start: Minutes, end: Minutes) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_min(&self) -> Minutes {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Widen by `before`/`after` minutes, clamped to the day.
    pub fn padded(&self, before: Minutes, after: Minutes) -> Span {
        Span {
            start: (self.start - before).max(0),
            end: (self.end + after).min(MINUTES_PER_DAY),
        }
    }
}

/// Parse `HH:MM` (24-hour) into minutes since midnight.
pub fn parse_hhmm(s: &str) -> Option<Minutes> {
    let (h, m) = s.split_once(':')?;
    let h: Minutes = h.parse().ok()?;
    let m: Minutes = m.parse().ok()?;
    if !(0..24).contains(&h) || !(0..60).contains(&m) {
        return None;
    }
    Some(h * 60 + m)
}

/// Format minutes since midnight as 24-hour `HH:MM`.
pub fn fmt_hhmm(m: Minutes) -> String {
    format!("{:02}:{:02}", m / 60, m % 60)
}

/// Format minutes since midnight as a 12-hour `hh:mm AM/PM` label.
pub fn fmt_label(m: Minutes) -> String {
    let (h24, min) = (m / 60, m % 60);
    let suffix = if h24 < 12 { "AM" } else { "PM" };
    let h12 = match h24 % 12 {
        0 => 12,
        h => h,
    };
    format!("{h12:02}:{min:02} {suffix}")
}

/// Weekday index for a date: 0 = Monday … 6 = Sunday.
pub fn weekday_index(date: NaiveDate) -> usize {
    date.weekday().num_days_from_monday() as usize
}

/// Operating-hours record for one weekday, for a shop or a staff member.
///
/// If `closed` is set, `open`/`close` are ignored. On a staff rule, unset
/// fields inherit per-field from the shop's rule for the same weekday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayRule {
    pub open: Option<Minutes>,
    pub close: Option<Minutes>,
    pub closed: bool,
}

/// Inclusive date range of staff leave. Only approved ranges block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOffRange {
    pub id: Ulid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub approved: bool,
}

impl TimeOffRange {
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }
}

/// Exceptional shop closure. `span: None` closes the whole day; `Some`
/// blocks just that range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Closure {
    pub date: NaiveDate,
    pub span: Option<Span>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 5] = [
        BookingStatus::Pending,
        BookingStatus::Confirmed,
        BookingStatus::Completed,
        BookingStatus::Cancelled,
        BookingStatus::NoShow,
    ];

    /// Only non-terminal bookings occupy time.
    pub fn occupies(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::NoShow => "no_show",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BookingStatus::Pending),
            "confirmed" => Some(BookingStatus::Confirmed),
            "completed" => Some(BookingStatus::Completed),
            "cancelled" => Some(BookingStatus::Cancelled),
            "no_show" => Some(BookingStatus::NoShow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    /// Strictly positive.
    pub duration_min: Minutes,
    pub price_cents: i64,
    pub buffer_before: Minutes,
    pub buffer_after: Minutes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub staff_id: Ulid,
    pub service_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub status: BookingStatus,
    pub customer: Option<String>,
    /// Price captured at booking time, in case the service changes later.
    pub price_cents: i64,
    pub cancel_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StaffState {
    pub id: Ulid,
    pub name: String,
    pub hours: [Option<DayRule>; 7],
    pub time_off: Vec<TimeOffRange>,
    /// Services this member performs — caller-side eligibility data,
    /// never consulted by the slot resolver.
    pub services: HashSet<Ulid>,
}

impl StaffState {
    pub fn new(id: Ulid, name: String) -> Self {
        Self {
            id,
            name,
            hours: [None; 7],
            time_off: Vec::new(),
            services: HashSet::new(),
        }
    }

    pub fn on_time_off(&self, date: NaiveDate) -> bool {
        self.time_off.iter().any(|t| t.approved && t.covers(date))
    }
}

#[derive(Debug, Clone)]
pub struct ShopState {
    pub id: Ulid,
    pub name: String,
    pub hours: [Option<DayRule>; 7],
    /// Sorted by date, at most one per date.
    pub closures: Vec<Closure>,
    pub services: HashMap<Ulid, Service>,
    pub staff: HashMap<Ulid, StaffState>,
    /// All bookings, sorted by `(date, span.start)`.
    pub bookings: Vec<Booking>,
}

impl ShopState {
    pub fn new(id: Ulid, name: String) -> Self {
        Self {
            id,
            name,
            hours: [None; 7],
            closures: Vec::new(),
            services: HashMap::new(),
            staff: HashMap::new(),
            bookings: Vec::new(),
        }
    }

    /// Insert a booking maintaining sort order by (date, span.start).
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| (b.date, b.span.start) <= (booking.date, booking.span.start));
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// One date's bookings as a contiguous slice of the sorted vec.
    pub fn day_bookings(&self, date: NaiveDate) -> &[Booking] {
        let lo = self.bookings.partition_point(|b| b.date < date);
        let hi = self.bookings.partition_point(|b| b.date <= date);
        &self.bookings[lo..hi]
    }

    pub fn closure_on(&self, date: NaiveDate) -> Option<&Closure> {
        self.closures
            .binary_search_by_key(&date, |c| c.date)
            .ok()
            .map(|i| &self.closures[i])
    }

    /// Insert or replace the closure for a date, keeping the vec sorted.
    pub fn set_closure(&mut self, closure: Closure) {
        match self.closures.binary_search_by_key(&closure.date, |c| c.date) {
            Ok(i) => self.closures[i] = closure,
            Err(i) => self.closures.insert(i, closure),
        }
    }

    pub fn remove_closure(&mut self, date: NaiveDate) -> Option<Closure> {
        self.closures
            .binary_search_by_key(&date, |c| c.date)
            .ok()
            .map(|i| self.closures.remove(i))
    }
}

/// A bookable slot — produced by the resolver, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub start: Minutes,
    pub end: Minutes,
}

impl Slot {
    /// Machine-readable key, 24-hour `HH:MM`.
    pub fn key(&self) -> String {
        fmt_hhmm(self.start)
    }

    /// Human label, `hh:mm AM/PM`.
    pub fn label(&self) -> String {
        fmt_label(self.start)
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ShopCreated {
        id: Ulid,
        name: String,
    },
    ShopDeleted {
        id: Ulid,
    },
    ShopHoursSet {
        shop_id: Ulid,
        weekday: u8,
        rule: DayRule,
    },
    ClosureAdded {
        shop_id: Ulid,
        date: NaiveDate,
        span: Option<Span>,
    },
    ClosureRemoved {
        shop_id: Ulid,
        date: NaiveDate,
    },
    ServiceCreated {
        id: Ulid,
        shop_id: Ulid,
        name: String,
        duration_min: Minutes,
        price_cents: i64,
        buffer_before: Minutes,
        buffer_after: Minutes,
    },
    ServiceDeleted {
        id: Ulid,
        shop_id: Ulid,
    },
    StaffCreated {
        id: Ulid,
        shop_id: Ulid,
        name: String,
    },
    StaffDeleted {
        id: Ulid,
        shop_id: Ulid,
    },
    StaffHoursSet {
        staff_id: Ulid,
        shop_id: Ulid,
        weekday: u8,
        rule: DayRule,
    },
    ServiceAssigned {
        staff_id: Ulid,
        shop_id: Ulid,
        service_id: Ulid,
    },
    ServiceUnassigned {
        staff_id: Ulid,
        shop_id: Ulid,
        service_id: Ulid,
    },
    TimeOffAdded {
        id: Ulid,
        staff_id: Ulid,
        shop_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
        approved: bool,
    },
    TimeOffRemoved {
        id: Ulid,
        staff_id: Ulid,
        shop_id: Ulid,
    },
    BookingCreated {
        id: Ulid,
        shop_id: Ulid,
        staff_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
        span: Span,
        status: BookingStatus,
        customer: Option<String>,
        price_cents: i64,
    },
    BookingStatusChanged {
        id: Ulid,
        shop_id: Ulid,
        status: BookingStatus,
        reason: Option<String>,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShopInfo {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub id: Ulid,
    pub shop_id: Ulid,
    pub name: String,
    pub duration_min: Minutes,
    pub price_cents: i64,
    pub buffer_before: Minutes,
    pub buffer_after: Minutes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffInfo {
    pub id: Ulid,
    pub shop_id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRow {
    pub id: Ulid,
    pub shop_id: Ulid,
    pub staff_id: Ulid,
    pub service_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub status: BookingStatus,
    pub customer: Option<String>,
    pub price_cents: i64,
}

/// One per-status line of a booking-stats aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCount {
    pub status: BookingStatus,
    pub count: u64,
    pub revenue_cents: i64,
}
