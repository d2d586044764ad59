use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;

use super::{Engine, EngineError};

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotd_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(name: &str) -> Engine {
    let notify = Arc::new(NotifyHub::new());
    Engine::new(test_wal_path(name), notify).unwrap()
}

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn open_rule(open: &str, close: &str) -> DayRule {
    DayRule {
        open: Some(parse_hhmm(open).unwrap()),
        close: Some(parse_hhmm(close).unwrap()),
        closed: false,
    }
}

const DAY_OFF: DayRule = DayRule { open: None, close: None, closed: true };

// A Monday, far enough out that "today" filtering never kicks in.
const MON: &str = "2030-01-07";

/// Shop open every day 09:00–17:00 with one 30-minute service and one
/// staff member inheriting shop hours.
async fn setup_shop(engine: &Engine) -> (Ulid, Ulid, Ulid) {
    let shop_id = Ulid::new();
    let service_id = Ulid::new();
    let staff_id = Ulid::new();

    engine.create_shop(shop_id, "Fade Factory".into()).await.unwrap();
    for weekday in 0..7 {
        engine
            .set_shop_hours(shop_id, weekday, open_rule("09:00", "17:00"))
            .await
            .unwrap();
    }
    engine
        .create_service(service_id, shop_id, "Cut".into(), 30, 3000, 0, 0)
        .await
        .unwrap();
    engine.create_staff(staff_id, shop_id, "Sam".into()).await.unwrap();

    (shop_id, service_id, staff_id)
}

async fn slot_keys(
    engine: &Engine,
    shop_id: Ulid,
    service_id: Ulid,
    staff_id: Option<Ulid>,
    date_s: &str,
) -> Vec<String> {
    engine
        .available_slots(shop_id, service_id, staff_id, date(date_s))
        .await
        .unwrap()
        .iter()
        .map(Slot::key)
        .collect()
}

// ── Shop / service / staff CRUD ──────────────────────────

#[tokio::test]
async fn create_and_get_shop() {
    let engine = new_engine("create_shop.wal");
    let id = Ulid::new();
    engine.create_shop(id, "Fade Factory".into()).await.unwrap();

    let shop = engine.get_shop(&id).unwrap();
    let guard = shop.read().await;
    assert_eq!(guard.name, "Fade Factory");
}

#[tokio::test]
async fn duplicate_shop_rejected() {
    let engine = new_engine("dup_shop.wal");
    let id = Ulid::new();
    engine.create_shop(id, "A".into()).await.unwrap();
    let result = engine.create_shop(id, "B".into()).await;
    assert!(matches!(result, Err(EngineError::AlreadyExists(_))));
}

#[tokio::test]
async fn delete_shop_removes_it() {
    let engine = new_engine("delete_shop.wal");
    let id = Ulid::new();
    engine.create_shop(id, "A".into()).await.unwrap();
    engine.delete_shop(id).await.unwrap();
    assert!(engine.get_shop(&id).is_none());
    assert!(matches!(engine.delete_shop(id).await, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn hours_validation() {
    let engine = new_engine("hours_validation.wal");
    let (shop_id, _, _) = setup_shop(&engine).await;

    let result = engine.set_shop_hours(shop_id, 7, open_rule("09:00", "17:00")).await;
    assert!(matches!(result, Err(EngineError::InvalidInput(_))));

    let result = engine.set_shop_hours(shop_id, 0, open_rule("17:00", "09:00")).await;
    assert!(matches!(result, Err(EngineError::InvalidInput(_))));
}

#[tokio::test]
async fn service_validation() {
    let engine = new_engine("service_validation.wal");
    let (shop_id, _, _) = setup_shop(&engine).await;

    let result = engine
        .create_service(Ulid::new(), shop_id, "Free".into(), 0, 0, 0, 0)
        .await;
    assert!(matches!(result, Err(EngineError::InvalidInput(_))));

    let result = engine
        .create_service(Ulid::new(), shop_id, "Odd".into(), 30, 0, -5, 0)
        .await;
    assert!(matches!(result, Err(EngineError::InvalidInput(_))));
}

// ── Slot queries ─────────────────────────────────────────

#[tokio::test]
async fn open_day_yields_full_grid() {
    let engine = new_engine("full_grid.wal");
    let (shop_id, service_id, _) = setup_shop(&engine).await;

    let keys = slot_keys(&engine, shop_id, service_id, None, MON).await;
    // 09:00 through 16:30 on the half-hour grid.
    assert_eq!(keys.len(), 16);
    assert_eq!(keys.first().map(String::as_str), Some("09:00"));
    assert_eq!(keys.last().map(String::as_str), Some("16:30"));
}

#[tokio::test]
async fn unknown_ids_yield_empty_not_error() {
    let engine = new_engine("unknown_ids.wal");
    let (shop_id, service_id, _) = setup_shop(&engine).await;

    assert!(slot_keys(&engine, Ulid::new(), service_id, None, MON).await.is_empty());
    assert!(slot_keys(&engine, shop_id, Ulid::new(), None, MON).await.is_empty());
    assert!(slot_keys(&engine, shop_id, service_id, Some(Ulid::new()), MON).await.is_empty());
}

#[tokio::test]
async fn booking_blocks_overlapping_slots() {
    let engine = new_engine("booking_blocks.wal");
    let (shop_id, service_id, staff_id) = setup_shop(&engine).await;

    engine
        .create_booking(
            Ulid::new(),
            staff_id,
            service_id,
            date(MON),
            parse_hhmm("09:00").unwrap(),
            BookingStatus::Confirmed,
            Some("Ada".into()),
        )
        .await
        .unwrap();

    let keys = slot_keys(&engine, shop_id, service_id, Some(staff_id), MON).await;
    assert!(!keys.contains(&"09:00".to_string()));
    // Touching slot survives.
    assert!(keys.contains(&"09:30".to_string()));
}

#[tokio::test]
async fn cancelling_frees_the_slot() {
    let engine = new_engine("cancel_frees.wal");
    let (shop_id, service_id, staff_id) = setup_shop(&engine).await;

    let booking_id = Ulid::new();
    engine
        .create_booking(
            booking_id,
            staff_id,
            service_id,
            date(MON),
            parse_hhmm("09:00").unwrap(),
            BookingStatus::Confirmed,
            None,
        )
        .await
        .unwrap();
    assert!(!slot_keys(&engine, shop_id, service_id, Some(staff_id), MON)
        .await
        .contains(&"09:00".to_string()));

    engine.cancel_booking(booking_id, Some("rain".into())).await.unwrap();
    assert!(slot_keys(&engine, shop_id, service_id, Some(staff_id), MON)
        .await
        .contains(&"09:00".to_string()));
}

#[tokio::test]
async fn staff_scoping_of_occupancy() {
    let engine = new_engine("staff_scope.wal");
    let (shop_id, service_id, staff_a) = setup_shop(&engine).await;
    let staff_b = Ulid::new();
    engine.create_staff(staff_b, shop_id, "Blake".into()).await.unwrap();

    engine
        .create_booking(
            Ulid::new(),
            staff_a,
            service_id,
            date(MON),
            parse_hhmm("09:00").unwrap(),
            BookingStatus::Confirmed,
            None,
        )
        .await
        .unwrap();

    // B's calendar is free at 09:00; the shop-wide view is not.
    assert!(slot_keys(&engine, shop_id, service_id, Some(staff_b), MON)
        .await
        .contains(&"09:00".to_string()));
    assert!(!slot_keys(&engine, shop_id, service_id, None, MON)
        .await
        .contains(&"09:00".to_string()));
}

#[tokio::test]
async fn staff_day_off_and_fallback() {
    let engine = new_engine("day_off_fallback.wal");
    let (shop_id, service_id, staff_id) = setup_shop(&engine).await;

    engine.set_staff_hours(staff_id, 0, DAY_OFF).await.unwrap();
    assert!(slot_keys(&engine, shop_id, service_id, Some(staff_id), MON).await.is_empty());

    // Tuesday: staff opens late, close inherited from the shop.
    engine
        .set_staff_hours(
            staff_id,
            1,
            DayRule { open: Some(parse_hhmm("11:00").unwrap()), close: None, closed: false },
        )
        .await
        .unwrap();
    let keys = slot_keys(&engine, shop_id, service_id, Some(staff_id), "2030-01-08").await;
    assert_eq!(keys.first().map(String::as_str), Some("11:00"));
    assert_eq!(keys.last().map(String::as_str), Some("16:30"));
}

#[tokio::test]
async fn time_off_lifecycle() {
    let engine = new_engine("time_off.wal");
    let (shop_id, service_id, staff_id) = setup_shop(&engine).await;

    let time_off_id = Ulid::new();
    engine
        .add_time_off(time_off_id, staff_id, date("2030-01-01"), date("2030-01-10"), true)
        .await
        .unwrap();
    assert!(slot_keys(&engine, shop_id, service_id, Some(staff_id), MON).await.is_empty());
    // The shop-wide view is unaffected.
    assert!(!slot_keys(&engine, shop_id, service_id, None, MON).await.is_empty());

    engine.remove_time_off(time_off_id).await.unwrap();
    assert!(!slot_keys(&engine, shop_id, service_id, Some(staff_id), MON).await.is_empty());
}

#[tokio::test]
async fn closure_lifecycle() {
    let engine = new_engine("closure.wal");
    let (shop_id, service_id, _) = setup_shop(&engine).await;

    engine.add_closure(shop_id, date(MON), None).await.unwrap();
    assert!(slot_keys(&engine, shop_id, service_id, None, MON).await.is_empty());

    engine.remove_closure(shop_id, date(MON)).await.unwrap();
    assert!(!slot_keys(&engine, shop_id, service_id, None, MON).await.is_empty());

    // Partial closure blocks only its range.
    engine
        .add_closure(
            shop_id,
            date(MON),
            Some(Span::new(parse_hhmm("09:00").unwrap(), parse_hhmm("12:00").unwrap())),
        )
        .await
        .unwrap();
    let keys = slot_keys(&engine, shop_id, service_id, None, MON).await;
    assert_eq!(keys.first().map(String::as_str), Some("12:00"));
}

// ── Booking writes ───────────────────────────────────────

#[tokio::test]
async fn double_booking_rejected() {
    let engine = new_engine("double_booking.wal");
    let (_, service_id, staff_id) = setup_shop(&engine).await;

    engine
        .create_booking(
            Ulid::new(),
            staff_id,
            service_id,
            date(MON),
            parse_hhmm("10:00").unwrap(),
            BookingStatus::Pending,
            None,
        )
        .await
        .unwrap();

    // Overlapping second booking loses, even though it's only pending.
    let result = engine
        .create_booking(
            Ulid::new(),
            staff_id,
            service_id,
            date(MON),
            parse_hhmm("10:15").unwrap(),
            BookingStatus::Confirmed,
            None,
        )
        .await;
    assert!(matches!(result, Err(EngineError::Conflict(_))));

    // A touching one is fine.
    engine
        .create_booking(
            Ulid::new(),
            staff_id,
            service_id,
            date(MON),
            parse_hhmm("10:30").unwrap(),
            BookingStatus::Confirmed,
            None,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn booking_end_and_price_derive_from_service() {
    let engine = new_engine("derived_fields.wal");
    let (shop_id, _, staff_id) = setup_shop(&engine).await;
    let service_id = Ulid::new();
    engine
        .create_service(service_id, shop_id, "Color".into(), 45, 12000, 0, 0)
        .await
        .unwrap();

    let booking_id = Ulid::new();
    engine
        .create_booking(
            booking_id,
            staff_id,
            service_id,
            date(MON),
            parse_hhmm("09:00").unwrap(),
            BookingStatus::Confirmed,
            None,
        )
        .await
        .unwrap();

    let rows = engine
        .list_bookings(shop_id, Some(date(MON)), None, None)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].span, Span::new(540, 585));
    assert_eq!(rows[0].price_cents, 12000);
}

#[tokio::test]
async fn buffered_service_spaces_bookings() {
    let engine = new_engine("buffered.wal");
    let (shop_id, _, staff_id) = setup_shop(&engine).await;
    let service_id = Ulid::new();
    engine
        .create_service(service_id, shop_id, "Shave".into(), 30, 2500, 0, 15)
        .await
        .unwrap();

    engine
        .create_booking(
            Ulid::new(),
            staff_id,
            service_id,
            date(MON),
            parse_hhmm("10:00").unwrap(),
            BookingStatus::Confirmed,
            None,
        )
        .await
        .unwrap();

    // 10:30 sits inside the 15-minute tail buffer; 11:00 clears it.
    let keys = slot_keys(&engine, shop_id, service_id, Some(staff_id), MON).await;
    assert!(!keys.contains(&"10:30".to_string()));
    assert!(keys.contains(&"11:00".to_string()));

    let result = engine
        .create_booking(
            Ulid::new(),
            staff_id,
            service_id,
            date(MON),
            parse_hhmm("10:30").unwrap(),
            BookingStatus::Confirmed,
            None,
        )
        .await;
    assert!(matches!(result, Err(EngineError::Conflict(_))));
}

#[tokio::test]
async fn booking_requires_known_staff_and_service() {
    let engine = new_engine("booking_unknowns.wal");
    let (_, service_id, staff_id) = setup_shop(&engine).await;

    let result = engine
        .create_booking(
            Ulid::new(),
            Ulid::new(),
            service_id,
            date(MON),
            540,
            BookingStatus::Pending,
            None,
        )
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));

    let result = engine
        .create_booking(
            Ulid::new(),
            staff_id,
            Ulid::new(),
            date(MON),
            540,
            BookingStatus::Pending,
            None,
        )
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn status_transitions() {
    let engine = new_engine("transitions.wal");
    let (_, service_id, staff_id) = setup_shop(&engine).await;

    let booking_id = Ulid::new();
    engine
        .create_booking(
            booking_id,
            staff_id,
            service_id,
            date(MON),
            parse_hhmm("09:00").unwrap(),
            BookingStatus::Pending,
            None,
        )
        .await
        .unwrap();

    engine
        .set_booking_status(booking_id, BookingStatus::Confirmed, None)
        .await
        .unwrap();
    engine
        .set_booking_status(booking_id, BookingStatus::Completed, None)
        .await
        .unwrap();

    // Completed is terminal.
    let result = engine
        .set_booking_status(booking_id, BookingStatus::Cancelled, None)
        .await;
    assert!(matches!(result, Err(EngineError::InvalidTransition { .. })));

    // Nothing goes back to pending.
    let result = engine
        .set_booking_status(booking_id, BookingStatus::Pending, None)
        .await;
    assert!(matches!(result, Err(EngineError::InvalidTransition { .. })));
}

#[tokio::test]
async fn cancel_records_reason() {
    let engine = new_engine("cancel_reason.wal");
    let (shop_id, service_id, staff_id) = setup_shop(&engine).await;

    let booking_id = Ulid::new();
    engine
        .create_booking(
            booking_id,
            staff_id,
            service_id,
            date(MON),
            parse_hhmm("09:00").unwrap(),
            BookingStatus::Pending,
            None,
        )
        .await
        .unwrap();
    engine
        .cancel_booking(booking_id, Some("client moved away".into()))
        .await
        .unwrap();

    let shop = engine.get_shop(&shop_id).unwrap();
    let guard = shop.read().await;
    let booking = guard.booking(booking_id).unwrap();
    assert_eq!(booking.status, BookingStatus::Cancelled);
    assert_eq!(booking.cancel_reason.as_deref(), Some("client moved away"));
}

// ── Listings and stats ───────────────────────────────────

#[tokio::test]
async fn list_bookings_filters() {
    let engine = new_engine("list_filters.wal");
    let (shop_id, service_id, staff_a) = setup_shop(&engine).await;
    let staff_b = Ulid::new();
    engine.create_staff(staff_b, shop_id, "Blake".into()).await.unwrap();

    for (staff, start) in [(staff_a, "09:00"), (staff_b, "09:00"), (staff_a, "10:00")] {
        engine
            .create_booking(
                Ulid::new(),
                staff,
                service_id,
                date(MON),
                parse_hhmm(start).unwrap(),
                BookingStatus::Confirmed,
                None,
            )
            .await
            .unwrap();
    }

    let all = engine.list_bookings(shop_id, Some(date(MON)), None, None).await.unwrap();
    assert_eq!(all.len(), 3);
    // Chronological within the date.
    assert!(all.windows(2).all(|w| w[0].span.start <= w[1].span.start));

    let only_a = engine
        .list_bookings(shop_id, Some(date(MON)), Some(staff_a), None)
        .await
        .unwrap();
    assert_eq!(only_a.len(), 2);

    let none = engine
        .list_bookings(shop_id, Some(date("2030-01-08")), None, None)
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn list_staff_filtered_by_service() {
    let engine = new_engine("staff_by_service.wal");
    let (shop_id, service_id, staff_a) = setup_shop(&engine).await;
    let staff_b = Ulid::new();
    engine.create_staff(staff_b, shop_id, "Blake".into()).await.unwrap();
    engine.assign_service(staff_a, service_id).await.unwrap();

    let all = engine.list_staff(shop_id, None).await.unwrap();
    assert_eq!(all.len(), 2);

    let cutters = engine.list_staff(shop_id, Some(service_id)).await.unwrap();
    assert_eq!(cutters.len(), 1);
    assert_eq!(cutters[0].id, staff_a);

    engine.unassign_service(staff_a, service_id).await.unwrap();
    assert!(engine.list_staff(shop_id, Some(service_id)).await.unwrap().is_empty());
}

#[tokio::test]
async fn deleting_service_unassigns_it() {
    let engine = new_engine("service_unassign.wal");
    let (shop_id, service_id, staff_id) = setup_shop(&engine).await;
    engine.assign_service(staff_id, service_id).await.unwrap();
    engine.delete_service(service_id).await.unwrap();

    let shop = engine.get_shop(&shop_id).unwrap();
    let guard = shop.read().await;
    assert!(guard.staff[&staff_id].services.is_empty());
}

#[tokio::test]
async fn stats_aggregate_by_status() {
    let engine = new_engine("stats.wal");
    let (shop_id, service_id, staff_id) = setup_shop(&engine).await;

    let confirmed = Ulid::new();
    let completed = Ulid::new();
    for (id, start) in [(confirmed, "09:00"), (completed, "10:00")] {
        engine
            .create_booking(
                id,
                staff_id,
                service_id,
                date(MON),
                parse_hhmm(start).unwrap(),
                BookingStatus::Confirmed,
                None,
            )
            .await
            .unwrap();
    }
    engine
        .set_booking_status(completed, BookingStatus::Completed, None)
        .await
        .unwrap();
    // Outside the queried range.
    engine
        .create_booking(
            Ulid::new(),
            staff_id,
            service_id,
            date("2030-02-01"),
            parse_hhmm("09:00").unwrap(),
            BookingStatus::Confirmed,
            None,
        )
        .await
        .unwrap();

    let stats = engine
        .booking_stats(shop_id, date("2030-01-01"), date("2030-01-31"))
        .await
        .unwrap();
    assert_eq!(stats.len(), BookingStatus::ALL.len());

    let by_status = |status: BookingStatus| stats.iter().find(|r| r.status == status).unwrap();
    assert_eq!(by_status(BookingStatus::Confirmed).count, 1);
    assert_eq!(by_status(BookingStatus::Confirmed).revenue_cents, 3000);
    assert_eq!(by_status(BookingStatus::Completed).count, 1);
    assert_eq!(by_status(BookingStatus::Pending).count, 0);
}

#[tokio::test]
async fn stats_rejects_bad_ranges() {
    let engine = new_engine("stats_bad_range.wal");
    let (shop_id, _, _) = setup_shop(&engine).await;

    let result = engine
        .booking_stats(shop_id, date("2030-02-01"), date("2030-01-01"))
        .await;
    assert!(matches!(result, Err(EngineError::InvalidInput(_))));

    let result = engine
        .booking_stats(shop_id, date("2030-01-01"), date("2032-01-01"))
        .await;
    assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
}

// ── Durability and notifications ─────────────────────────

#[tokio::test]
async fn replay_restores_state() {
    let path = test_wal_path("replay_restore.wal");
    let shop_id = Ulid::new();
    let service_id = Ulid::new();
    let staff_id = Ulid::new();

    {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        engine.create_shop(shop_id, "Fade Factory".into()).await.unwrap();
        engine
            .set_shop_hours(shop_id, 0, open_rule("09:00", "10:00"))
            .await
            .unwrap();
        engine
            .create_service(service_id, shop_id, "Cut".into(), 30, 3000, 0, 0)
            .await
            .unwrap();
        engine.create_staff(staff_id, shop_id, "Sam".into()).await.unwrap();
        engine
            .create_booking(
                Ulid::new(),
                staff_id,
                service_id,
                date(MON),
                parse_hhmm("09:00").unwrap(),
                BookingStatus::Confirmed,
                None,
            )
            .await
            .unwrap();
    }

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    let keys = slot_keys(&engine, shop_id, service_id, Some(staff_id), MON).await;
    assert_eq!(keys, vec!["09:30"]);

    // Replayed bookings keep their entity mapping — a conflicting insert
    // still loses after restart.
    let result = engine
        .create_booking(
            Ulid::new(),
            staff_id,
            service_id,
            date(MON),
            parse_hhmm("09:00").unwrap(),
            BookingStatus::Confirmed,
            None,
        )
        .await;
    assert!(matches!(result, Err(EngineError::Conflict(_))));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compact_preserve.wal");
    let shop_id = Ulid::new();
    let service_id = Ulid::new();
    let staff_id = Ulid::new();

    {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        engine.create_shop(shop_id, "Fade Factory".into()).await.unwrap();
        engine
            .set_shop_hours(shop_id, 0, open_rule("09:00", "10:00"))
            .await
            .unwrap();
        engine
            .create_service(service_id, shop_id, "Cut".into(), 30, 3000, 0, 0)
            .await
            .unwrap();
        engine.create_staff(staff_id, shop_id, "Sam".into()).await.unwrap();
        // Churn that compaction folds away.
        for _ in 0..5 {
            engine.add_closure(shop_id, date("2030-06-01"), None).await.unwrap();
            engine.remove_closure(shop_id, date("2030-06-01")).await.unwrap();
        }
        engine.compact_wal().await.unwrap();
    }

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    let keys = slot_keys(&engine, shop_id, service_id, Some(staff_id), MON).await;
    assert_eq!(keys, vec!["09:00", "09:30"]);
    let shop = engine.get_shop(&shop_id).unwrap();
    assert!(shop.read().await.closures.is_empty());
}

#[tokio::test]
async fn mutations_notify_shop_subscribers() {
    let engine = new_engine("notify.wal");
    let (shop_id, service_id, staff_id) = setup_shop(&engine).await;

    let mut rx = engine.notify.subscribe(shop_id);
    let booking_id = Ulid::new();
    engine
        .create_booking(
            booking_id,
            staff_id,
            service_id,
            date(MON),
            parse_hhmm("09:00").unwrap(),
            BookingStatus::Pending,
            None,
        )
        .await
        .unwrap();

    let event = rx.recv().await.unwrap();
    match event {
        Event::BookingCreated { id, .. } => assert_eq!(id, booking_id),
        other => panic!("expected BookingCreated, got {other:?}"),
    }
}
