use super::*;
use super::conflict::{find_conflict, validate_range};
use crate::limits::*;

use rust_decimal::Decimal;

fn d(s: &str) -> Day {
    s.parse().unwrap()
}

fn input(start: &str, end: &str, price: i64) -> IntervalInput {
    IntervalInput {
        id: None,
        open_date: d(start),
        close_date: d(end),
        price: Decimal::new(price, 0),
    }
}

fn edit(id: Ulid, start: &str, end: &str, price: i64) -> IntervalInput {
    IntervalInput {
        id: Some(id),
        ..input(start, end, price)
    }
}

fn request(start: &str, end: &str) -> BookingRequest {
    BookingRequest {
        customer_id: Ulid::new(),
        employee_id: Ulid::new(),
        agreed_price: Decimal::new(45_000, 2),
        start: d(start),
        end: d(end),
    }
}

// ── Async engine tests ───────────────────────────────────

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("rentledger_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

/// Registers a vehicle and gives it a listing with one January interval.
async fn vehicle_with_listing(engine: &Engine, name: &str) -> (Ulid, Ulid) {
    let vehicle_id = Ulid::new();
    engine.register_vehicle(vehicle_id, name.into()).await.unwrap();
    engine
        .upsert_intervals(vehicle_id, None, vec![input("2024-01-01", "2024-01-31", 100)])
        .await
        .unwrap();
    let listing_id = engine.listing_for_vehicle(&vehicle_id).unwrap();
    (vehicle_id, listing_id)
}

#[tokio::test]
async fn register_vehicle_and_view() {
    let path = test_wal_path("register_view.wal");
    let engine = Engine::new(path).unwrap();

    let id = Ulid::new();
    engine.register_vehicle(id, "  Corolla ".into()).await.unwrap();

    let view = engine.get_listing_view(id).await.unwrap();
    assert_eq!(view.vehicle.name, "Corolla");
    assert_eq!(view.listing_id, None);
    assert!(view.intervals.is_empty());
    assert!(view.contracts.is_empty());
}

#[tokio::test]
async fn register_vehicle_rejects_duplicate_and_empty_name() {
    let path = test_wal_path("register_reject.wal");
    let engine = Engine::new(path).unwrap();

    let id = Ulid::new();
    engine.register_vehicle(id, "Golf".into()).await.unwrap();

    let dup = engine.register_vehicle(id, "Golf".into()).await.unwrap_err();
    assert!(matches!(dup, EngineError::AlreadyExists(x) if x == id));
    assert_eq!(dup.kind(), ErrorKind::Conflict);

    let empty = engine.register_vehicle(Ulid::new(), "   ".into()).await.unwrap_err();
    assert_eq!(empty.kind(), ErrorKind::Validation);

    let long = engine
        .register_vehicle(Ulid::new(), "x".repeat(MAX_NAME_LEN + 1))
        .await
        .unwrap_err();
    assert!(matches!(long, EngineError::LimitExceeded(_)));
}

#[tokio::test]
async fn get_listing_view_unknown_vehicle() {
    let path = test_wal_path("view_unknown.wal");
    let engine = Engine::new(path).unwrap();
    let result = engine.get_listing_view(Ulid::new()).await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

// ── Interval store ───────────────────────────────────────

#[tokio::test]
async fn upsert_creates_listing_once() {
    let path = test_wal_path("upsert_creates.wal");
    let engine = Engine::new(path).unwrap();

    let vid = Ulid::new();
    engine.register_vehicle(vid, "Model 3".into()).await.unwrap();

    let first = engine
        .upsert_intervals(vid, None, vec![input("2024-03-01", "2024-03-10", 80)])
        .await
        .unwrap();
    let listing_id = engine.listing_for_vehicle(&vid).unwrap();
    let second = engine
        .upsert_intervals(vid, None, vec![input("2024-02-01", "2024-02-10", 70)])
        .await
        .unwrap();

    assert_eq!(engine.listing_for_vehicle(&vid), Some(listing_id));
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 2);
    // Ordered by open date.
    assert_eq!(second[0].range.start, d("2024-02-01"));
    assert_eq!(second[1].range.start, d("2024-03-01"));
    assert!(second.iter().all(|i| i.status == IntervalStatus::Available));
}

#[tokio::test]
async fn upsert_unknown_vehicle_not_found() {
    let path = test_wal_path("upsert_unknown_vehicle.wal");
    let engine = Engine::new(path).unwrap();
    let result = engine
        .upsert_intervals(Ulid::new(), None, vec![input("2024-01-01", "2024-01-02", 1)])
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn upsert_edits_in_place() {
    let path = test_wal_path("upsert_edit.wal");
    let engine = Engine::new(path).unwrap();
    let (vid, _) = vehicle_with_listing(&engine, "Clio").await;

    let id = engine.get_listing_view(vid).await.unwrap().intervals[0].id;
    let updated = engine
        .upsert_intervals(vid, None, vec![edit(id, "2024-06-01", "2024-06-15", 250)])
        .await
        .unwrap();

    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].id, id);
    assert_eq!(updated[0].range, DateRange::new(d("2024-06-01"), d("2024-06-15")));
    assert_eq!(updated[0].price, Decimal::new(250, 0));
}

#[tokio::test]
async fn upsert_reversed_range_writes_nothing() {
    let path = test_wal_path("upsert_reversed.wal");
    let engine = Engine::new(path).unwrap();
    let (vid, _) = vehicle_with_listing(&engine, "Polo").await;
    let appends_before = engine.wal_appends_since_compact().await;

    let result = engine
        .upsert_intervals(
            vid,
            None,
            vec![
                input("2024-05-01", "2024-05-10", 90),
                input("2024-07-10", "2024-07-01", 90),
            ],
        )
        .await;

    assert!(matches!(result, Err(EngineError::InvalidRange { .. })));
    assert_eq!(engine.get_listing_view(vid).await.unwrap().intervals.len(), 1);
    assert_eq!(engine.wal_appends_since_compact().await, appends_before);
}

#[tokio::test]
async fn upsert_negative_price_rejected() {
    let path = test_wal_path("upsert_negative.wal");
    let engine = Engine::new(path).unwrap();
    let (vid, _) = vehicle_with_listing(&engine, "Fiesta").await;

    let result = engine
        .upsert_intervals(vid, None, vec![input("2024-05-01", "2024-05-10", -5)])
        .await;
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn upsert_unknown_interval_id_is_not_found() {
    let path = test_wal_path("upsert_unknown_id.wal");
    let engine = Engine::new(path).unwrap();
    let (vid, _) = vehicle_with_listing(&engine, "Mazda 3").await;

    let ghost = Ulid::new();
    let result = engine
        .upsert_intervals(
            vid,
            None,
            vec![
                input("2024-04-01", "2024-04-05", 60),
                edit(ghost, "2024-04-10", "2024-04-12", 60),
            ],
        )
        .await;

    assert!(matches!(result, Err(EngineError::NotFound(x)) if x == ghost));
    // The valid input in the same batch was not written either.
    assert_eq!(engine.get_listing_view(vid).await.unwrap().intervals.len(), 1);
}

#[tokio::test]
async fn upsert_rejects_interval_of_other_listing() {
    let path = test_wal_path("upsert_foreign_id.wal");
    let engine = Engine::new(path).unwrap();
    let (vid_a, _) = vehicle_with_listing(&engine, "A").await;
    let (vid_b, _) = vehicle_with_listing(&engine, "B").await;

    let foreign = engine.get_listing_view(vid_a).await.unwrap().intervals[0].id;
    let result = engine
        .upsert_intervals(vid_b, None, vec![edit(foreign, "2024-09-01", "2024-09-02", 1)])
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn upsert_batch_limit() {
    let path = test_wal_path("upsert_batch_limit.wal");
    let engine = Engine::new(path).unwrap();
    let (vid, _) = vehicle_with_listing(&engine, "Batch").await;

    let inputs = vec![input("2024-01-01", "2024-01-01", 1); MAX_BATCH_SIZE + 1];
    let result = engine.upsert_intervals(vid, None, inputs).await;
    assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
}

#[tokio::test]
async fn upsert_assigns_and_reassigns_manager() {
    let path = test_wal_path("upsert_manager.wal");
    let engine = Engine::new(path).unwrap();

    let vid = Ulid::new();
    let first = Ulid::new();
    let second = Ulid::new();
    engine.register_vehicle(vid, "Kona".into()).await.unwrap();

    engine
        .upsert_intervals(vid, Some(first), vec![input("2024-01-01", "2024-01-02", 1)])
        .await
        .unwrap();
    assert_eq!(engine.get_listing_view(vid).await.unwrap().manager_id, Some(first));

    // No manager supplied: unchanged.
    engine
        .upsert_intervals(vid, None, vec![input("2024-02-01", "2024-02-02", 1)])
        .await
        .unwrap();
    assert_eq!(engine.get_listing_view(vid).await.unwrap().manager_id, Some(first));

    engine.open_listing(vid, Some(second)).await.unwrap();
    assert_eq!(engine.get_listing_view(vid).await.unwrap().manager_id, Some(second));
}

#[tokio::test]
async fn delete_interval_and_idempotence() {
    let path = test_wal_path("delete_interval.wal");
    let engine = Engine::new(path).unwrap();
    let (vid, _) = vehicle_with_listing(&engine, "Ibiza").await;

    let id = engine.get_listing_view(vid).await.unwrap().intervals[0].id;
    engine.delete_interval(id).await.unwrap();
    assert!(engine.get_listing_view(vid).await.unwrap().intervals.is_empty());
    assert_eq!(engine.listing_for_entity(&id), None);

    // Again, and with an id nobody has ever seen.
    engine.delete_interval(id).await.unwrap();
    engine.delete_interval(Ulid::new()).await.unwrap();
}

#[tokio::test]
async fn delete_interval_ignores_contract_id() {
    let path = test_wal_path("delete_contract_id.wal");
    let engine = Engine::new(path).unwrap();
    let (_, lid) = vehicle_with_listing(&engine, "Octavia").await;

    let contract = engine
        .request_booking(lid, request("2024-01-05", "2024-01-06"))
        .await
        .unwrap();
    engine.delete_interval(contract.id).await.unwrap();
    assert_eq!(engine.list_active_contracts(lid).await.unwrap().len(), 1);
}

// ── Availability engine ──────────────────────────────────

#[tokio::test]
async fn booking_touching_boundary_conflicts() {
    let path = test_wal_path("booking_touching.wal");
    let engine = Engine::new(path).unwrap();
    let (_, lid) = vehicle_with_listing(&engine, "Civic").await;

    let first = engine
        .request_booking(lid, request("2024-01-01", "2024-01-10"))
        .await
        .unwrap();
    let result = engine
        .request_booking(lid, request("2024-01-10", "2024-01-20"))
        .await;

    assert!(matches!(result, Err(EngineError::Conflict(x)) if x == first.id));
    assert_eq!(engine.list_active_contracts(lid).await.unwrap().len(), 1);
}

#[tokio::test]
async fn booking_adjacent_day_succeeds() {
    let path = test_wal_path("booking_adjacent.wal");
    let engine = Engine::new(path).unwrap();
    let (_, lid) = vehicle_with_listing(&engine, "Accord").await;

    engine
        .request_booking(lid, request("2024-01-01", "2024-01-10"))
        .await
        .unwrap();
    let second = engine
        .request_booking(lid, request("2024-01-11", "2024-01-20"))
        .await
        .unwrap();

    let contracts = engine.list_active_contracts(lid).await.unwrap();
    assert_eq!(contracts.len(), 2);
    assert_eq!(contracts[1].id, second.id);
    assert_eq!(second.listing_id, lid);
}

#[tokio::test]
async fn booking_validation() {
    let path = test_wal_path("booking_validation.wal");
    let engine = Engine::new(path).unwrap();
    let (_, lid) = vehicle_with_listing(&engine, "Leaf").await;

    let reversed = engine
        .request_booking(lid, request("2024-01-10", "2024-01-01"))
        .await;
    assert!(matches!(reversed, Err(EngineError::InvalidRange { .. })));

    let mut negative = request("2024-01-01", "2024-01-02");
    negative.agreed_price = Decimal::new(-1, 0);
    let result = engine.request_booking(lid, negative).await;
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Validation);

    let unknown = engine
        .request_booking(Ulid::new(), request("2024-01-01", "2024-01-02"))
        .await;
    assert!(matches!(unknown, Err(EngineError::NotFound(_))));

    assert!(engine.list_active_contracts(lid).await.unwrap().is_empty());
}

#[tokio::test]
async fn booking_marks_overlapping_intervals_rented() {
    let path = test_wal_path("booking_marks.wal");
    let engine = Engine::new(path).unwrap();

    let vid = Ulid::new();
    engine.register_vehicle(vid, "Outback".into()).await.unwrap();
    engine
        .upsert_intervals(
            vid,
            None,
            vec![
                input("2024-01-01", "2024-01-09", 100),
                input("2024-01-10", "2024-01-15", 100),
                input("2024-01-20", "2024-01-25", 100),
                input("2024-03-01", "2024-03-31", 100),
            ],
        )
        .await
        .unwrap();
    let lid = engine.listing_for_vehicle(&vid).unwrap();

    engine
        .request_booking(lid, request("2024-01-05", "2024-01-20"))
        .await
        .unwrap();

    let statuses: Vec<_> = engine
        .get_listing_view(vid)
        .await
        .unwrap()
        .intervals
        .iter()
        .map(|p| p.status)
        .collect();
    // The third interval only touches the contract on its first day.
    assert_eq!(
        statuses,
        vec![
            IntervalStatus::Rented,
            IntervalStatus::Rented,
            IntervalStatus::Rented,
            IntervalStatus::Available,
        ]
    );
}

#[tokio::test]
async fn interval_moved_onto_contract_becomes_rented() {
    let path = test_wal_path("interval_moved.wal");
    let engine = Engine::new(path).unwrap();
    let (vid, lid) = vehicle_with_listing(&engine, "Ranger").await;

    engine
        .request_booking(lid, request("2024-01-05", "2024-01-06"))
        .await
        .unwrap();
    let view = engine.get_listing_view(vid).await.unwrap();
    let id = view.intervals[0].id;
    assert_eq!(view.intervals[0].status, IntervalStatus::Rented);

    let moved = engine
        .set_interval_window(lid, vec![edit(id, "2024-05-01", "2024-05-31", 100)])
        .await
        .unwrap();
    assert_eq!(moved[0].status, IntervalStatus::Available);

    let back = engine
        .set_interval_window(lid, vec![edit(id, "2024-01-06", "2024-01-31", 100)])
        .await
        .unwrap();
    assert_eq!(back[0].status, IntervalStatus::Rented);
}

#[tokio::test]
async fn cancel_booking_restores_availability() {
    let path = test_wal_path("cancel_restores.wal");
    let engine = Engine::new(path).unwrap();

    let vid = Ulid::new();
    engine.register_vehicle(vid, "Qashqai".into()).await.unwrap();
    engine
        .upsert_intervals(
            vid,
            None,
            vec![
                input("2024-01-01", "2024-01-10", 100),
                input("2024-01-11", "2024-01-20", 100),
            ],
        )
        .await
        .unwrap();
    let lid = engine.listing_for_vehicle(&vid).unwrap();

    let wide = engine
        .request_booking(lid, request("2024-01-08", "2024-01-12"))
        .await
        .unwrap();
    let narrow = engine
        .request_booking(lid, request("2024-01-15", "2024-01-16"))
        .await
        .unwrap();

    let removed = engine.cancel_booking(wide.id).await.unwrap();
    assert_eq!(removed, wide);

    let view = engine.get_listing_view(vid).await.unwrap();
    assert_eq!(view.intervals[0].status, IntervalStatus::Available);
    // Still covered by the narrow contract.
    assert_eq!(view.intervals[1].status, IntervalStatus::Rented);
    assert_eq!(view.contracts.len(), 1);
    assert_eq!(view.contracts[0].id, narrow.id);

    // The freed days can be booked again.
    engine
        .request_booking(lid, request("2024-01-01", "2024-01-12"))
        .await
        .unwrap();
}

#[tokio::test]
async fn cancel_unknown_contract_not_found() {
    let path = test_wal_path("cancel_unknown.wal");
    let engine = Engine::new(path).unwrap();
    let (vid, _) = vehicle_with_listing(&engine, "Tucson").await;

    let result = engine.cancel_booking(Ulid::new()).await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));

    // An interval id is not a contract id.
    let interval_id = engine.get_listing_view(vid).await.unwrap().intervals[0].id;
    let result = engine.cancel_booking(interval_id).await;
    assert!(matches!(result, Err(EngineError::NotFound(x)) if x == interval_id));
}

#[tokio::test]
async fn release_interval_keeps_contracts() {
    let path = test_wal_path("release_keeps.wal");
    let engine = Engine::new(path).unwrap();
    let (vid, lid) = vehicle_with_listing(&engine, "Jazz").await;

    engine
        .request_booking(lid, request("2024-01-02", "2024-01-03"))
        .await
        .unwrap();
    let id = engine.get_listing_view(vid).await.unwrap().intervals[0].id;
    engine.release_interval(id).await.unwrap();

    let view = engine.get_listing_view(vid).await.unwrap();
    assert!(view.intervals.is_empty());
    assert_eq!(view.contracts.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_bookings_one_wins() {
    let path = test_wal_path("concurrent_bookings.wal");
    let engine = Arc::new(Engine::new(path).unwrap());
    let (_, lid) = vehicle_with_listing(&engine, "Prius").await;

    let mut handles = Vec::new();
    for offset in 0..8u32 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            let start = d("2024-01-01") + chrono::Days::new(u64::from(offset));
            let end = start + chrono::Days::new(10);
            let req = BookingRequest {
                start,
                end,
                ..request("2024-01-01", "2024-01-01")
            };
            eng.request_booking(lid, req).await
        }));
    }

    let mut won = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => won += 1,
            Err(EngineError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(conflicts, 7);
    assert_eq!(engine.list_active_contracts(lid).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_upserts_share_one_listing() {
    let path = test_wal_path("concurrent_upserts.wal");
    let engine = Arc::new(Engine::new(path).unwrap());

    let vid = Ulid::new();
    engine.register_vehicle(vid, "Aygo".into()).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.upsert_intervals(vid, None, vec![input("2024-01-01", "2024-01-02", 10)])
                .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    assert_eq!(engine.listings.len(), 1);
    assert_eq!(engine.get_listing_view(vid).await.unwrap().intervals.len(), 10);
}

// ── Booking ledger ───────────────────────────────────────

#[tokio::test]
async fn contracts_listed_by_start_date() {
    let path = test_wal_path("contracts_order.wal");
    let engine = Engine::new(path).unwrap();
    let (_, lid) = vehicle_with_listing(&engine, "Swift").await;

    for (start, end) in [
        ("2024-03-01", "2024-03-02"),
        ("2024-01-01", "2024-01-02"),
        ("2024-02-01", "2024-02-02"),
    ] {
        engine.request_booking(lid, request(start, end)).await.unwrap();
    }

    let starts: Vec<_> = engine
        .list_active_contracts(lid)
        .await
        .unwrap()
        .iter()
        .map(|c| c.range.start)
        .collect();
    assert_eq!(starts, vec![d("2024-01-01"), d("2024-02-01"), d("2024-03-01")]);

    let unknown = engine.list_active_contracts(Ulid::new()).await;
    assert!(matches!(unknown, Err(EngineError::NotFound(_))));
}

// ── Listing assembler ────────────────────────────────────

#[tokio::test]
async fn list_vehicles_empty_store() {
    let path = test_wal_path("list_empty.wal");
    let engine = Engine::new(path).unwrap();

    let page = engine.list_vehicles(Some("1"), Some("20"), Some("")).await;
    assert_eq!(page.page, 1);
    assert_eq!(page.limit, 20);
    assert!(page.data.is_empty());
}

#[tokio::test]
async fn list_vehicles_permissive_paging() {
    let path = test_wal_path("list_paging.wal");
    let engine = Engine::new(path).unwrap();

    let mut ids = Vec::new();
    for i in 0..5 {
        let id = Ulid::new();
        engine.register_vehicle(id, format!("Car {i}")).await.unwrap();
        ids.push(id);
    }
    ids.sort();

    let page = engine.list_vehicles(Some("zero"), Some("-4"), None).await;
    assert_eq!((page.page, page.limit), (DEFAULT_PAGE, DEFAULT_PAGE_LIMIT));
    assert_eq!(page.data.len(), 5);

    let page = engine.list_vehicles(Some("2"), Some("2"), None).await;
    let got: Vec<_> = page.data.iter().map(|a| a.vehicle.id).collect();
    assert_eq!(got, ids[2..4].to_vec());

    let page = engine.list_vehicles(Some("9"), Some("2"), None).await;
    assert!(page.data.is_empty());

    let page = engine.list_vehicles(None, Some("100000"), None).await;
    assert_eq!(page.limit, MAX_PAGE_LIMIT);
}

#[tokio::test]
async fn list_vehicles_search_is_case_insensitive() {
    let path = test_wal_path("list_search.wal");
    let engine = Engine::new(path).unwrap();

    engine.register_vehicle(Ulid::new(), "Toyota Corolla".into()).await.unwrap();
    engine.register_vehicle(Ulid::new(), "Honda Civic".into()).await.unwrap();
    engine.register_vehicle(Ulid::new(), "toyota yaris".into()).await.unwrap();

    let page = engine.list_vehicles(None, None, Some("TOYOTA")).await;
    assert_eq!(page.data.len(), 2);
    assert!(page
        .data
        .iter()
        .all(|a| a.vehicle.name.to_lowercase().contains("toyota")));
}

#[tokio::test]
async fn list_vehicles_includes_listing_data() {
    let path = test_wal_path("list_joined.wal");
    let engine = Engine::new(path).unwrap();
    let (vid, lid) = vehicle_with_listing(&engine, "Sandero").await;
    engine
        .request_booking(lid, request("2024-01-03", "2024-01-04"))
        .await
        .unwrap();

    let page = engine.list_vehicles(None, None, None).await;
    let entry = page.data.iter().find(|a| a.vehicle.id == vid).unwrap();
    assert_eq!(entry.listing_id, Some(lid));
    assert_eq!(entry.intervals.len(), 1);
    assert_eq!(entry.intervals[0].status, IntervalStatus::Rented);
    assert_eq!(entry.contracts.len(), 1);
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn engine_wal_replay() {
    let path = test_wal_path("replay.wal");

    let (vid, lid, contract) = {
        let engine = Engine::new(path.clone()).unwrap();
        let manager = Ulid::new();
        let vid = Ulid::new();
        engine.register_vehicle(vid, "Megane".into()).await.unwrap();
        engine
            .upsert_intervals(
                vid,
                Some(manager),
                vec![
                    input("2024-01-01", "2024-01-10", 100),
                    input("2024-02-01", "2024-02-10", 100),
                ],
            )
            .await
            .unwrap();
        let lid = engine.listing_for_vehicle(&vid).unwrap();
        let contract = engine
            .request_booking(lid, request("2024-02-05", "2024-02-06"))
            .await
            .unwrap();
        (vid, lid, contract)
    };

    let engine = Engine::new(path).unwrap();
    assert_eq!(engine.listing_for_vehicle(&vid), Some(lid));
    assert_eq!(engine.listing_for_entity(&contract.id), Some(lid));

    let view = engine.get_listing_view(vid).await.unwrap();
    assert_eq!(view.vehicle.name, "Megane");
    assert!(view.manager_id.is_some());
    assert_eq!(view.intervals[0].status, IntervalStatus::Available);
    assert_eq!(view.intervals[1].status, IntervalStatus::Rented);
    assert_eq!(engine.list_active_contracts(lid).await.unwrap(), vec![contract]);

    // The replayed ledger still rejects overlaps.
    let again = engine
        .request_booking(lid, request("2024-02-06", "2024-02-07"))
        .await;
    assert!(matches!(again, Err(EngineError::Conflict(_))));
}

#[tokio::test]
async fn writes_after_torn_tail_survive_next_restart() {
    use std::io::Write;

    let path = test_wal_path("torn_tail.wal");

    let (vid, lid) = {
        let engine = Engine::new(path.clone()).unwrap();
        vehicle_with_listing(&engine, "Clio").await
    };
    {
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[40, 0, 0, 0, 1, 2]).unwrap();
    }

    let (spare, contract) = {
        let engine = Engine::new(path.clone()).unwrap();
        let spare = Ulid::new();
        engine.register_vehicle(spare, "Spare".into()).await.unwrap();
        let contract = engine
            .request_booking(lid, request("2024-01-10", "2024-01-12"))
            .await
            .unwrap();
        assert_eq!(engine.vehicle_count(), 2);
        (spare, contract)
    };

    let engine = Engine::new(path).unwrap();
    assert_eq!(engine.vehicle_count(), 2);
    assert!(engine.get_listing_view(spare).await.is_ok());
    assert_eq!(engine.list_active_contracts(lid).await.unwrap(), vec![contract]);
    let view = engine.get_listing_view(vid).await.unwrap();
    assert_eq!(view.intervals[0].status, IntervalStatus::Rented);

    let overlap = engine
        .request_booking(lid, request("2024-01-12", "2024-01-14"))
        .await;
    assert!(matches!(overlap, Err(EngineError::Conflict(_))));
}

#[tokio::test]
async fn compact_wal_preserves_state() {
    let path = test_wal_path("compact_state.wal");
    let engine = Engine::new(path.clone()).unwrap();
    let (vid, lid) = vehicle_with_listing(&engine, "Astra").await;

    // Churn.
    for _ in 0..10 {
        let c = engine
            .request_booking(lid, request("2024-01-02", "2024-01-03"))
            .await
            .unwrap();
        engine.cancel_booking(c.id).await.unwrap();
    }
    engine
        .request_booking(lid, request("2024-01-20", "2024-01-22"))
        .await
        .unwrap();

    let before = engine.get_listing_view(vid).await.unwrap();
    let size_before = std::fs::metadata(&path).unwrap().len();

    engine.compact_wal().await.unwrap();

    let size_after = std::fs::metadata(&path).unwrap().len();
    assert!(size_after < size_before, "compacted WAL ({size_after}) should be smaller than original ({size_before})");
    assert_eq!(engine.get_listing_view(vid).await.unwrap(), before);
    assert_eq!(engine.wal_appends_since_compact().await, 0);
}

#[tokio::test]
async fn compact_wal_survives_restart() {
    let path = test_wal_path("compact_restart.wal");

    let (vid, before) = {
        let engine = Engine::new(path.clone()).unwrap();
        let (vid, lid) = vehicle_with_listing(&engine, "Duster").await;
        engine
            .request_booking(lid, request("2024-01-10", "2024-01-12"))
            .await
            .unwrap();
        engine.register_vehicle(Ulid::new(), "Spare".into()).await.unwrap();

        engine.compact_wal().await.unwrap();

        // Written after compaction.
        engine
            .upsert_intervals(vid, None, vec![input("2024-04-01", "2024-04-30", 120)])
            .await
            .unwrap();
        (vid, engine.get_listing_view(vid).await.unwrap())
    };

    let engine = Engine::new(path).unwrap();
    assert_eq!(engine.vehicle_count(), 2);
    assert_eq!(engine.get_listing_view(vid).await.unwrap(), before);
}

#[tokio::test]
async fn group_commit_batches_appends() {
    let path = test_wal_path("group_commit_batch.wal");
    let engine = Arc::new(Engine::new(path.clone()).unwrap());

    let n = 20;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.register_vehicle(Ulid::new(), format!("V{i}")).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.vehicle_count(), n);

    let engine2 = Engine::new(path).unwrap();
    assert_eq!(engine2.vehicle_count(), n);
}

#[tokio::test]
async fn wal_appends_since_compact_through_channel() {
    let path = test_wal_path("appends_counter.wal");
    let engine = Engine::new(path).unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 0);

    // Vehicle, listing, intervals.
    vehicle_with_listing(&engine, "Corsa").await;
    assert_eq!(engine.wal_appends_since_compact().await, 3);
}

// ── Pure helpers ─────────────────────────────────────────

#[test]
fn validate_range_limits() {
    assert!(validate_range(d("2024-01-01"), d("2024-01-01")).is_ok());
    assert!(matches!(
        validate_range(d("2024-01-02"), d("2024-01-01")),
        Err(EngineError::InvalidRange { .. })
    ));
    assert!(matches!(
        validate_range(d("1800-01-01"), d("1800-01-02")),
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(
        validate_range(d("2000-01-01"), d("2030-01-01")),
        Err(EngineError::LimitExceeded(_))
    ));
}

#[test]
fn find_conflict_inclusive_predicate() {
    let mut ls = ListingState::new(Ulid::new(), Ulid::new(), None);
    ls.insert_contract(BookingContract {
        id: Ulid::new(),
        listing_id: ls.id,
        customer_id: Ulid::new(),
        employee_id: Ulid::new(),
        agreed_price: Decimal::ONE,
        range: DateRange::new(d("2024-01-01"), d("2024-01-10")),
    });

    let touching = DateRange::new(d("2024-01-10"), d("2024-01-20"));
    let before = DateRange::new(d("2023-12-25"), d("2024-01-01"));
    let clear = DateRange::new(d("2024-01-11"), d("2024-01-20"));
    assert!(find_conflict(&ls, &touching).is_some());
    assert!(find_conflict(&ls, &before).is_some());
    assert!(find_conflict(&ls, &clear).is_none());
}

#[test]
fn parse_day_formats() {
    assert_eq!(parse_day("2024-02-29").unwrap(), d("2024-02-29"));
    assert!(parse_day("2023-02-29").is_err());
    assert!(parse_day("01/02/2024").is_err());
}
