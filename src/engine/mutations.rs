use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_span};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    pub async fn create_shop(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        if self.shops.len() >= MAX_SHOPS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many shops"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("shop name too long"));
        }
        if self.shops.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ShopCreated { id, name: name.clone() };
        self.wal_append(&event).await?;
        self.shops.insert(id, Arc::new(RwLock::new(ShopState::new(id, name))));
        self.notify.send(id, &event);
        Ok(())
    }

    pub async fn delete_shop(&self, id: Ulid) -> Result<(), EngineError> {
        if !self.shops.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::ShopDeleted { id };
        self.wal_append(&event).await?;
        self.shops.remove(&id);
        self.notify.send(id, &event);
        Ok(())
    }

    pub async fn set_shop_hours(
        &self,
        shop_id: Ulid,
        weekday: u8,
        rule: DayRule,
    ) -> Result<(), EngineError> {
        validate_day_rule(weekday, &rule)?;
        let shop = self
            .get_shop(&shop_id)
            .ok_or(EngineError::NotFound(shop_id))?;
        let mut guard = shop.write().await;

        let event = Event::ShopHoursSet { shop_id, weekday, rule };
        self.persist_and_apply(shop_id, &mut guard, &event).await
    }

    pub async fn add_closure(
        &self,
        shop_id: Ulid,
        date: NaiveDate,
        span: Option<Span>,
    ) -> Result<(), EngineError> {
        if let Some(ref s) = span {
            validate_span(s)?;
        }
        let shop = self
            .get_shop(&shop_id)
            .ok_or(EngineError::NotFound(shop_id))?;
        let mut guard = shop.write().await;
        if guard.closures.len() >= MAX_CLOSURES_PER_SHOP {
            return Err(EngineError::LimitExceeded("too many closures"));
        }

        let event = Event::ClosureAdded { shop_id, date, span };
        self.persist_and_apply(shop_id, &mut guard, &event).await
    }

    pub async fn remove_closure(&self, shop_id: Ulid, date: NaiveDate) -> Result<(), EngineError> {
        let shop = self
            .get_shop(&shop_id)
            .ok_or(EngineError::NotFound(shop_id))?;
        let mut guard = shop.write().await;
        if guard.closure_on(date).is_none() {
            return Err(EngineError::InvalidInput("no closure on that date"));
        }

        let event = Event::ClosureRemoved { shop_id, date };
        self.persist_and_apply(shop_id, &mut guard, &event).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_service(
        &self,
        id: Ulid,
        shop_id: Ulid,
        name: String,
        duration_min: Minutes,
        price_cents: i64,
        buffer_before: Minutes,
        buffer_after: Minutes,
    ) -> Result<(), EngineError> {
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("service name too long"));
        }
        if duration_min <= 0 {
            return Err(EngineError::InvalidInput("duration must be positive"));
        }
        if buffer_before < 0 || buffer_after < 0 {
            return Err(EngineError::InvalidInput("buffers must not be negative"));
        }
        if self.entity_to_shop.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let shop = self
            .get_shop(&shop_id)
            .ok_or(EngineError::NotFound(shop_id))?;
        let mut guard = shop.write().await;
        if guard.services.len() >= MAX_SERVICES_PER_SHOP {
            return Err(EngineError::LimitExceeded("too many services"));
        }

        let event = Event::ServiceCreated {
            id,
            shop_id,
            name,
            duration_min,
            price_cents,
            buffer_before,
            buffer_after,
        };
        self.persist_and_apply(shop_id, &mut guard, &event).await
    }

    pub async fn delete_service(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (shop_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.services.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::ServiceDeleted { id, shop_id };
        self.persist_and_apply(shop_id, &mut guard, &event).await?;
        Ok(shop_id)
    }

    pub async fn create_staff(
        &self,
        id: Ulid,
        shop_id: Ulid,
        name: String,
    ) -> Result<(), EngineError> {
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("staff name too long"));
        }
        if self.entity_to_shop.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let shop = self
            .get_shop(&shop_id)
            .ok_or(EngineError::NotFound(shop_id))?;
        let mut guard = shop.write().await;
        if guard.staff.len() >= MAX_STAFF_PER_SHOP {
            return Err(EngineError::LimitExceeded("too many staff"));
        }

        let event = Event::StaffCreated { id, shop_id, name };
        self.persist_and_apply(shop_id, &mut guard, &event).await
    }

    pub async fn delete_staff(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (shop_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.staff.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::StaffDeleted { id, shop_id };
        self.persist_and_apply(shop_id, &mut guard, &event).await?;
        Ok(shop_id)
    }

    pub async fn set_staff_hours(
        &self,
        staff_id: Ulid,
        weekday: u8,
        rule: DayRule,
    ) -> Result<Ulid, EngineError> {
        validate_day_rule(weekday, &rule)?;
        let (shop_id, mut guard) = self.resolve_entity_write(&staff_id).await?;
        if !guard.staff.contains_key(&staff_id) {
            return Err(EngineError::NotFound(staff_id));
        }
        let event = Event::StaffHoursSet { staff_id, shop_id, weekday, rule };
        self.persist_and_apply(shop_id, &mut guard, &event).await?;
        Ok(shop_id)
    }

    pub async fn assign_service(&self, staff_id: Ulid, service_id: Ulid) -> Result<(), EngineError> {
        let (shop_id, mut guard) = self.resolve_entity_write(&staff_id).await?;
        if !guard.staff.contains_key(&staff_id) {
            return Err(EngineError::NotFound(staff_id));
        }
        if !guard.services.contains_key(&service_id) {
            return Err(EngineError::NotFound(service_id));
        }
        let event = Event::ServiceAssigned { staff_id, shop_id, service_id };
        self.persist_and_apply(shop_id, &mut guard, &event).await
    }

    pub async fn unassign_service(&self, staff_id: Ulid, service_id: Ulid) -> Result<(), EngineError> {
        let (shop_id, mut guard) = self.resolve_entity_write(&staff_id).await?;
        let member = guard.staff.get(&staff_id).ok_or(EngineError::NotFound(staff_id))?;
        if !member.services.contains(&service_id) {
            return Err(EngineError::NotFound(service_id));
        }
        let event = Event::ServiceUnassigned { staff_id, shop_id, service_id };
        self.persist_and_apply(shop_id, &mut guard, &event).await
    }

    pub async fn add_time_off(
        &self,
        id: Ulid,
        staff_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
        approved: bool,
    ) -> Result<Ulid, EngineError> {
        if start_date > end_date {
            return Err(EngineError::InvalidInput("time off starts after it ends"));
        }
        if self.entity_to_shop.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let (shop_id, mut guard) = self.resolve_entity_write(&staff_id).await?;
        let member = guard.staff.get(&staff_id).ok_or(EngineError::NotFound(staff_id))?;
        if member.time_off.len() >= MAX_TIME_OFF_PER_STAFF {
            return Err(EngineError::LimitExceeded("too many time-off ranges"));
        }

        let event = Event::TimeOffAdded { id, staff_id, shop_id, start_date, end_date, approved };
        self.persist_and_apply(shop_id, &mut guard, &event).await?;
        Ok(shop_id)
    }

    pub async fn remove_time_off(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (shop_id, mut guard) = self.resolve_entity_write(&id).await?;
        let staff_id = guard
            .staff
            .values()
            .find(|m| m.time_off.iter().any(|t| t.id == id))
            .map(|m| m.id)
            .ok_or(EngineError::NotFound(id))?;

        let event = Event::TimeOffRemoved { id, staff_id, shop_id };
        self.persist_and_apply(shop_id, &mut guard, &event).await?;
        Ok(shop_id)
    }

    /// Create a booking. The end time is derived from the service duration
    /// and the span is re-checked against occupying bookings under the
    /// shop's write lock — the authoritative guard against double-booking,
    /// since any slot list the caller saw is stale by now.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_booking(
        &self,
        id: Ulid,
        staff_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
        start: Minutes,
        status: BookingStatus,
        customer: Option<String>,
    ) -> Result<Ulid, EngineError> {
        if let Some(ref c) = customer
            && c.len() > MAX_CUSTOMER_LEN
        {
            return Err(EngineError::LimitExceeded("customer name too long"));
        }
        if self.entity_to_shop.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let (shop_id, mut guard) = self.resolve_entity_write(&staff_id).await?;
        if !guard.staff.contains_key(&staff_id) {
            return Err(EngineError::NotFound(staff_id));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_SHOP {
            return Err(EngineError::LimitExceeded("too many bookings"));
        }
        let service = guard
            .services
            .get(&service_id)
            .ok_or(EngineError::NotFound(service_id))?;

        let span = Span {
            start,
            end: start + service.duration_min,
        };
        validate_span(&span)?;
        let price_cents = service.price_cents;
        let (buffer_before, buffer_after) = (service.buffer_before, service.buffer_after);

        if status.occupies() {
            check_no_conflict(&guard, staff_id, date, &span, buffer_before, buffer_after)?;
        }

        let event = Event::BookingCreated {
            id,
            shop_id,
            staff_id,
            service_id,
            date,
            span,
            status,
            customer,
            price_cents,
        };
        self.persist_and_apply(shop_id, &mut guard, &event).await?;
        Ok(shop_id)
    }

    /// Drive the booking lifecycle: pending → confirmed, either active
    /// status → completed/cancelled/no_show. Terminal statuses stay put.
    pub async fn set_booking_status(
        &self,
        id: Ulid,
        status: BookingStatus,
        reason: Option<String>,
    ) -> Result<Ulid, EngineError> {
        if let Some(ref r) = reason
            && r.len() > MAX_REASON_LEN
        {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        let (shop_id, mut guard) = self.resolve_entity_write(&id).await?;
        let booking = guard.booking(id).ok_or(EngineError::NotFound(id))?;

        let from = booking.status;
        let allowed = match status {
            BookingStatus::Confirmed => from == BookingStatus::Pending,
            BookingStatus::Completed | BookingStatus::Cancelled | BookingStatus::NoShow => {
                from.occupies()
            }
            BookingStatus::Pending => false,
        };
        if !allowed {
            return Err(EngineError::InvalidTransition { from, to: status });
        }

        let event = Event::BookingStatusChanged { id, shop_id, status, reason };
        self.persist_and_apply(shop_id, &mut guard, &event).await?;
        Ok(shop_id)
    }

    /// Cancel a booking (the DELETE of the wire dialect).
    pub async fn cancel_booking(&self, id: Ulid, reason: Option<String>) -> Result<Ulid, EngineError> {
        self.set_booking_status(id, BookingStatus::Cancelled, reason).await
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();
        let mut seen = HashSet::new();

        let shop_ids: Vec<Ulid> = self.shops.iter().map(|e| *e.key()).collect();
        for id in shop_ids {
            if !seen.insert(id) {
                continue;
            }
            let entry = match self.shops.get(&id) {
                Some(e) => e,
                None => continue,
            };
            let shop_arc = entry.value().clone();
            let shop = shop_arc.try_read().expect("compact: uncontended read");

            events.push(Event::ShopCreated { id: shop.id, name: shop.name.clone() });
            for (weekday, rule) in shop.hours.iter().enumerate() {
                if let Some(rule) = rule {
                    events.push(Event::ShopHoursSet {
                        shop_id: shop.id,
                        weekday: weekday as u8,
                        rule: *rule,
                    });
                }
            }
            for closure in &shop.closures {
                events.push(Event::ClosureAdded {
                    shop_id: shop.id,
                    date: closure.date,
                    span: closure.span,
                });
            }
            for service in shop.services.values() {
                events.push(Event::ServiceCreated {
                    id: service.id,
                    shop_id: shop.id,
                    name: service.name.clone(),
                    duration_min: service.duration_min,
                    price_cents: service.price_cents,
                    buffer_before: service.buffer_before,
                    buffer_after: service.buffer_after,
                });
            }
            for member in shop.staff.values() {
                events.push(Event::StaffCreated {
                    id: member.id,
                    shop_id: shop.id,
                    name: member.name.clone(),
                });
                for (weekday, rule) in member.hours.iter().enumerate() {
                    if let Some(rule) = rule {
                        events.push(Event::StaffHoursSet {
                            staff_id: member.id,
                            shop_id: shop.id,
                            weekday: weekday as u8,
                            rule: *rule,
                        });
                    }
                }
                for service_id in &member.services {
                    events.push(Event::ServiceAssigned {
                        staff_id: member.id,
                        shop_id: shop.id,
                        service_id: *service_id,
                    });
                }
                for time_off in &member.time_off {
                    events.push(Event::TimeOffAdded {
                        id: time_off.id,
                        staff_id: member.id,
                        shop_id: shop.id,
                        start_date: time_off.start_date,
                        end_date: time_off.end_date,
                        approved: time_off.approved,
                    });
                }
            }
            for booking in &shop.bookings {
                events.push(Event::BookingCreated {
                    id: booking.id,
                    shop_id: shop.id,
                    staff_id: booking.staff_id,
                    service_id: booking.service_id,
                    date: booking.date,
                    span: booking.span,
                    status: booking.status,
                    customer: booking.customer.clone(),
                    price_cents: booking.price_cents,
                });
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

fn validate_day_rule(weekday: u8, rule: &DayRule) -> Result<(), EngineError> {
    if weekday > 6 {
        return Err(EngineError::InvalidInput("weekday must be 0-6"));
    }
    for bound in [rule.open, rule.close].into_iter().flatten() {
        if !(0..=MINUTES_PER_DAY).contains(&bound) {
            return Err(EngineError::InvalidInput("time of day out of range"));
        }
    }
    if !rule.closed
        && let (Some(open), Some(close)) = (rule.open, rule.close)
        && open >= close
    {
        return Err(EngineError::InvalidInput("open must precede close"));
    }
    Ok(())
}
