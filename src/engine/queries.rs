use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::now_local;
use super::slots::resolve_slots;
use super::{Engine, EngineError};

impl Engine {
    /// The slot query surface. Unknown shop, service, or staff ids yield
    /// an empty list, never an error — by the time a client asks for slots
    /// the ids came from its own earlier listings, and a stale id simply
    /// means nothing is bookable.
    pub async fn available_slots(
        &self,
        shop_id: Ulid,
        service_id: Ulid,
        staff_id: Option<Ulid>,
        date: NaiveDate,
    ) -> Result<Vec<Slot>, EngineError> {
        let shop = match self.get_shop(&shop_id) {
            Some(shop) => shop,
            None => return Ok(vec![]),
        };
        let guard = shop.read().await;

        let Some(service) = guard.services.get(&service_id) else {
            return Ok(vec![]);
        };
        let staff = match staff_id {
            Some(id) => match guard.staff.get(&id) {
                Some(member) => Some(member),
                None => return Ok(vec![]),
            },
            None => None,
        };

        Ok(resolve_slots(&guard, service, staff, date, now_local()).into_slots())
    }

    pub fn list_shops(&self) -> Vec<ShopInfo> {
        let mut shops: Vec<ShopInfo> = self
            .shops
            .iter()
            .map(|entry| {
                let shop = entry.value().clone();
                let guard = shop.try_read().expect("list_shops: uncontended read");
                ShopInfo {
                    id: guard.id,
                    name: guard.name.clone(),
                }
            })
            .collect();
        shops.sort_by_key(|s| s.id);
        shops
    }

    pub async fn list_services(&self, shop_id: Ulid) -> Result<Vec<ServiceInfo>, EngineError> {
        let shop = match self.get_shop(&shop_id) {
            Some(shop) => shop,
            None => return Ok(vec![]),
        };
        let guard = shop.read().await;
        let mut services: Vec<ServiceInfo> = guard
            .services
            .values()
            .map(|s| ServiceInfo {
                id: s.id,
                shop_id,
                name: s.name.clone(),
                duration_min: s.duration_min,
                price_cents: s.price_cents,
                buffer_before: s.buffer_before,
                buffer_after: s.buffer_after,
            })
            .collect();
        services.sort_by_key(|s| s.id);
        Ok(services)
    }

    /// List a shop's staff; with `service_id`, only members assigned to
    /// that service — the eligibility filter callers apply before asking
    /// for staff-scoped slots.
    pub async fn list_staff(
        &self,
        shop_id: Ulid,
        service_id: Option<Ulid>,
    ) -> Result<Vec<StaffInfo>, EngineError> {
        let shop = match self.get_shop(&shop_id) {
            Some(shop) => shop,
            None => return Ok(vec![]),
        };
        let guard = shop.read().await;
        let mut staff: Vec<StaffInfo> = guard
            .staff
            .values()
            .filter(|m| service_id.is_none_or(|sid| m.services.contains(&sid)))
            .map(|m| StaffInfo {
                id: m.id,
                shop_id,
                name: m.name.clone(),
            })
            .collect();
        staff.sort_by_key(|m| m.id);
        Ok(staff)
    }

    pub async fn list_bookings(
        &self,
        shop_id: Ulid,
        date: Option<NaiveDate>,
        staff_id: Option<Ulid>,
        status: Option<BookingStatus>,
    ) -> Result<Vec<BookingRow>, EngineError> {
        let shop = match self.get_shop(&shop_id) {
            Some(shop) => shop,
            None => return Ok(vec![]),
        };
        let guard = shop.read().await;

        let bookings: &[Booking] = match date {
            Some(date) => guard.day_bookings(date),
            None => &guard.bookings,
        };

        // Already sorted by (date, span.start).
        Ok(bookings
            .iter()
            .filter(|b| staff_id.is_none_or(|id| b.staff_id == id))
            .filter(|b| status.is_none_or(|s| b.status == s))
            .map(|b| BookingRow {
                id: b.id,
                shop_id,
                staff_id: b.staff_id,
                service_id: b.service_id,
                date: b.date,
                span: b.span,
                status: b.status,
                customer: b.customer.clone(),
                price_cents: b.price_cents,
            })
            .collect())
    }

    /// Per-status booking counts and revenue over an inclusive date range.
    /// Always returns one row per status, zeros included, in a stable
    /// order.
    pub async fn booking_stats(
        &self,
        shop_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Vec<StatusCount>, EngineError> {
        if start_date > end_date {
            return Err(EngineError::InvalidInput("stats range starts after it ends"));
        }
        if (end_date - start_date).num_days() > MAX_STATS_RANGE_DAYS {
            return Err(EngineError::LimitExceeded("stats range too wide"));
        }
        let shop = match self.get_shop(&shop_id) {
            Some(shop) => shop,
            None => return Ok(vec![]),
        };
        let guard = shop.read().await;

        let lo = guard.bookings.partition_point(|b| b.date < start_date);
        let hi = guard.bookings.partition_point(|b| b.date <= end_date);

        let mut rows: Vec<StatusCount> = BookingStatus::ALL
            .into_iter()
            .map(|status| StatusCount { status, count: 0, revenue_cents: 0 })
            .collect();
        for booking in &guard.bookings[lo..hi] {
            let row = rows
                .iter_mut()
                .find(|r| r.status == booking.status)
                .expect("every status has a row");
            row.count += 1;
            row.revenue_cents += booking.price_cents;
        }
        Ok(rows)
    }
}
