//! Racing allocations across independent SQLite connections on one file.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use landing_experiments::{EngineConfig, ExperimentEngine, NewTest, NewVariant, SqliteStore, TestId, TestStatus};

const THREADS: usize = 8;

fn open_engine(path: &std::path::Path) -> ExperimentEngine {
    let store = SqliteStore::open(path, Duration::from_secs(10)).unwrap();
    ExperimentEngine::new(Arc::new(store), EngineConfig::default())
}

fn allocation_rows(path: &std::path::Path, test_id: TestId, visitor_id: &str) -> i64 {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.query_row(
        "SELECT COUNT(*) FROM ab_allocations WHERE test_id = ?1 AND visitor_id = ?2",
        rusqlite::params![test_id, visitor_id],
        |row| row.get(0),
    )
    .unwrap()
}

#[test]
fn test_concurrent_first_requests_agree() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("experiments.db");

    let setup = open_engine(&path);
    let test = NewTest::new("race")
        .with_variant(NewVariant::control("a", "tpl/a", 34))
        .with_variant(NewVariant::new("b", "tpl/b", 33))
        .with_variant(NewVariant::new("c", "tpl/c", 33));
    let test_id = setup.create_test(1, &test).unwrap().test.id;
    setup.update_status(test_id, TestStatus::Running).unwrap();

    // Every connection is opened before any thread starts.
    let engines: Vec<ExperimentEngine> = (0..THREADS).map(|_| open_engine(&path)).collect();
    let visitors: Vec<String> = (0..25).map(|i| format!("racer-{}", i)).collect();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = engines
        .into_iter()
        .map(|engine| {
            let barrier = Arc::clone(&barrier);
            let visitors = visitors.clone();
            thread::spawn(move || {
                barrier.wait();
                visitors
                    .iter()
                    .map(|v| engine.allocate(test_id, v).unwrap().unwrap().id)
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let seen: Vec<Vec<i64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    for (i, visitor) in visitors.iter().enumerate() {
        let first = seen[0][i];
        assert!(seen.iter().all(|ids| ids[i] == first), "threads disagree on {}", visitor);
        assert_eq!(allocation_rows(&path, test_id, visitor), 1, "{}", visitor);
        assert_eq!(setup.allocate(test_id, visitor).unwrap().unwrap().id, first);
    }
}

#[test]
fn test_concurrent_conversions_all_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("experiments.db");

    let setup = open_engine(&path);
    let test = NewTest::new("convert")
        .with_variant(NewVariant::control("a", "tpl/a", 50))
        .with_variant(NewVariant::new("b", "tpl/b", 50));
    let test_id = setup.create_test(1, &test).unwrap().test.id;
    setup.update_status(test_id, TestStatus::Running).unwrap();
    let variant = setup.allocate(test_id, "shared").unwrap().unwrap();

    let engines: Vec<ExperimentEngine> = (0..THREADS).map(|_| open_engine(&path)).collect();
    let handles: Vec<_> = engines
        .into_iter()
        .map(|engine| {
            let variant_id = variant.id;
            thread::spawn(move || {
                for _ in 0..10 {
                    engine
                        .record_conversion(test_id, variant_id, "shared", "click", None)
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let results = setup.get_results(test_id).unwrap();
    let r = results.variant(variant.id).unwrap();
    assert_eq!(r.conversion_events, (THREADS * 10) as u64);
    assert_eq!(r.conversions, 1);
}
