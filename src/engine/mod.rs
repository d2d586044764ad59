mod conflict;
mod error;
mod mutations;
mod queries;
mod slots;
#[cfg(test)]
mod tests;

pub use error::EngineError;
pub use slots::{resolve_slots, SlotOutcome, UnavailableReason};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedShopState = Arc<RwLock<ShopState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

pub struct Engine {
    pub shops: DashMap<Ulid, SharedShopState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: entity (staff/service/booking/time-off) id → shop id.
    pub(super) entity_to_shop: DashMap<Ulid, Ulid>,
}

/// Apply an event directly to a ShopState (no locking — caller holds the lock).
fn apply_to_shop(shop: &mut ShopState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ShopHoursSet { weekday, rule, .. } => {
            shop.hours[*weekday as usize] = Some(*rule);
        }
        Event::ClosureAdded { date, span, .. } => {
            shop.set_closure(Closure { date: *date, span: *span });
        }
        Event::ClosureRemoved { date, .. } => {
            shop.remove_closure(*date);
        }
        Event::ServiceCreated {
            id,
            shop_id,
            name,
            duration_min,
            price_cents,
            buffer_before,
            buffer_after,
        } => {
            shop.services.insert(
                *id,
                Service {
                    id: *id,
                    name: name.clone(),
                    duration_min: *duration_min,
                    price_cents: *price_cents,
                    buffer_before: *buffer_before,
                    buffer_after: *buffer_after,
                },
            );
            entity_map.insert(*id, *shop_id);
        }
        Event::ServiceDeleted { id, .. } => {
            shop.services.remove(id);
            for member in shop.staff.values_mut() {
                member.services.remove(id);
            }
            entity_map.remove(id);
        }
        Event::StaffCreated { id, shop_id, name } => {
            shop.staff.insert(*id, StaffState::new(*id, name.clone()));
            entity_map.insert(*id, *shop_id);
        }
        Event::StaffDeleted { id, .. } => {
            // Their booking history stays; only the calendar goes.
            shop.staff.remove(id);
            entity_map.remove(id);
        }
        Event::StaffHoursSet { staff_id, weekday, rule, .. } => {
            if let Some(member) = shop.staff.get_mut(staff_id) {
                member.hours[*weekday as usize] = Some(*rule);
            }
        }
        Event::ServiceAssigned { staff_id, service_id, .. } => {
            if let Some(member) = shop.staff.get_mut(staff_id) {
                member.services.insert(*service_id);
            }
        }
        Event::ServiceUnassigned { staff_id, service_id, .. } => {
            if let Some(member) = shop.staff.get_mut(staff_id) {
                member.services.remove(service_id);
            }
        }
        Event::TimeOffAdded {
            id,
            staff_id,
            shop_id,
            start_date,
            end_date,
            approved,
        } => {
            if let Some(member) = shop.staff.get_mut(staff_id) {
                member.time_off.push(TimeOffRange {
                    id: *id,
                    start_date: *start_date,
                    end_date: *end_date,
                    approved: *approved,
                });
                entity_map.insert(*id, *shop_id);
            }
        }
        Event::TimeOffRemoved { id, staff_id, .. } => {
            if let Some(member) = shop.staff.get_mut(staff_id) {
                member.time_off.retain(|t| t.id != *id);
            }
            entity_map.remove(id);
        }
        Event::BookingCreated {
            id,
            shop_id,
            staff_id,
            service_id,
            date,
            span,
            status,
            customer,
            price_cents,
        } => {
            shop.insert_booking(Booking {
                id: *id,
                staff_id: *staff_id,
                service_id: *service_id,
                date: *date,
                span: *span,
                status: *status,
                customer: customer.clone(),
                price_cents: *price_cents,
                cancel_reason: None,
            });
            entity_map.insert(*id, *shop_id);
        }
        Event::BookingStatusChanged { id, status, reason, .. } => {
            if let Some(booking) = shop.booking_mut(*id) {
                booking.status = *status;
                if *status == BookingStatus::Cancelled {
                    booking.cancel_reason = reason.clone();
                }
            }
        }
        // ShopCreated/Deleted are handled at the DashMap level, not here
        Event::ShopCreated { .. } | Event::ShopDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            shops: DashMap::new(),
            wal_tx,
            notify,
            entity_to_shop: DashMap::new(),
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this may run inside an async context (e.g. lazy tenant
        // creation).
        for event in &events {
            match event {
                Event::ShopCreated { id, name } => {
                    let shop = ShopState::new(*id, name.clone());
                    engine.shops.insert(*id, Arc::new(RwLock::new(shop)));
                }
                Event::ShopDeleted { id } => {
                    engine.shops.remove(id);
                }
                other => {
                    if let Some(shop_id) = event_shop_id(other)
                        && let Some(entry) = engine.shops.get(&shop_id)
                    {
                        let shop_arc = entry.clone();
                        let mut guard = shop_arc.try_write().expect("replay: uncontended write");
                        apply_to_shop(&mut guard, other, &engine.entity_to_shop);
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_shop(&self, id: &Ulid) -> Option<SharedShopState> {
        self.shops.get(id).map(|e| e.value().clone())
    }

    pub fn shop_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_shop.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(
        &self,
        shop_id: Ulid,
        shop: &mut ShopState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_shop(shop, event, &self.entity_to_shop);
        self.notify.send(shop_id, event);
        Ok(())
    }

    /// Lookup entity → shop, get shop, acquire write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ShopState>), EngineError> {
        let shop_id = self
            .shop_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let shop = self
            .get_shop(&shop_id)
            .ok_or(EngineError::NotFound(shop_id))?;
        let guard = shop.write_owned().await;
        Ok((shop_id, guard))
    }
}

/// Extract the shop id from an event (for non-Create/Delete shop events).
fn event_shop_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ShopHoursSet { shop_id, .. }
        | Event::ClosureAdded { shop_id, .. }
        | Event::ClosureRemoved { shop_id, .. }
        | Event::ServiceCreated { shop_id, .. }
        | Event::ServiceDeleted { shop_id, .. }
        | Event::StaffCreated { shop_id, .. }
        | Event::StaffDeleted { shop_id, .. }
        | Event::StaffHoursSet { shop_id, .. }
        | Event::ServiceAssigned { shop_id, .. }
        | Event::ServiceUnassigned { shop_id, .. }
        | Event::TimeOffAdded { shop_id, .. }
        | Event::TimeOffRemoved { shop_id, .. }
        | Event::BookingCreated { shop_id, .. }
        | Event::BookingStatusChanged { shop_id, .. } => Some(*shop_id),
        Event::ShopCreated { .. } | Event::ShopDeleted { .. } => None,
    }
}
