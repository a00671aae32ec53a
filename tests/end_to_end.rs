//! Integration tests against the public crate API, exercising the
//! end-to-end scenarios a store/accumulator/rotation deployment actually
//! hits: write/query, column iteration, merge-as-union, accumulator
//! overflow, rotation expiry, and crash recovery.

use std::collections::HashSet;
use std::fs::OpenOptions;

use pairdb::{Accumulator, Column, Options, Query, Row, RowSet, Rotator, Store};
use tempfile::tempdir;

fn init() {
    env_logger::try_init().ok();
}

fn write_rows(path: &std::path::Path, rows: &[(u64, u64)], ts: u64, quant: u64) {
    let mut set = RowSet::new();
    for &(a, b) in rows {
        set.push(a, b).unwrap();
    }
    Store::write(path, ts, quant, &mut set).unwrap();
}

#[test]
fn simple_write_and_query() {
    init();
    let dir = tempdir().unwrap();
    let path = dir.path().join("a.rill");
    write_rows(&path, &[(1, 10), (1, 20), (2, 20), (3, 30)], 100, 3600);

    let store = Store::open(&path).unwrap();

    let mut out = RowSet::new();
    store.query(Column::A, 1, &mut out).unwrap();
    assert_eq!(out.as_slice(), &[Row::new(1, 10), Row::new(1, 20)]);

    let mut out = RowSet::new();
    store.query(Column::B, 20, &mut out).unwrap();
    assert_eq!(out.as_slice(), &[Row::new(1, 20), Row::new(2, 20)]);

    let mut out = RowSet::new();
    store.query(Column::A, 4, &mut out).unwrap();
    assert!(out.is_empty());
}

#[test]
fn iterate_both_columns() {
    init();
    let dir = tempdir().unwrap();
    let path = dir.path().join("a.rill");
    write_rows(&path, &[(1, 10), (1, 20), (2, 20), (3, 30)], 100, 3600);
    let store = Store::open(&path).unwrap();

    let mut decoder = store.iterate(Column::A).unwrap();
    let mut got = Vec::new();
    loop {
        let row = decoder.next().unwrap();
        if row.is_nil() {
            break;
        }
        got.push((row.a, row.b));
    }
    assert_eq!(got, vec![(1, 10), (1, 20), (2, 20), (3, 30)]);

    let mut decoder = store.iterate(Column::B).unwrap();
    let mut got = Vec::new();
    loop {
        let row = decoder.next().unwrap();
        if row.is_nil() {
            break;
        }
        got.push((row.a, row.b));
    }
    assert_eq!(got, vec![(10, 1), (20, 1), (20, 2), (30, 3)]);
}

#[test]
fn merge_with_overlap_is_union_with_dedup() {
    init();
    let dir = tempdir().unwrap();
    let path_a = dir.path().join("a.rill");
    let path_b = dir.path().join("b.rill");
    write_rows(&path_a, &[(1, 10), (2, 20)], 100, 3600);
    write_rows(&path_b, &[(2, 20), (3, 30)], 200, 3600);

    let store_a = Store::open(&path_a).unwrap();
    let store_b = Store::open(&path_b).unwrap();

    let merged_path = dir.path().join("merged.rill");
    Store::merge(&[&store_a, &store_b], &merged_path, 200, 3600).unwrap();

    let merged = Store::open(&merged_path).unwrap();
    assert_eq!(merged.rows(), 3);

    let mut out = RowSet::new();
    merged.query(Column::A, 2, &mut out).unwrap();
    assert_eq!(out.as_slice(), &[Row::new(2, 20)]);
}

#[test]
fn accumulator_overflow_reports_loss_and_keeps_the_tail() {
    init();
    let dir = tempdir().unwrap();
    let acc = Accumulator::open(dir.path(), 32).unwrap();
    assert_eq!(acc.capacity(), 64);

    for i in 1..=200u64 {
        acc.ingest(i, i).unwrap();
    }

    let report = acc.drain(dir.path().join("drained.rill"), 1000).unwrap();
    assert_eq!(report.lost, 136);
    assert_eq!(report.rows, 64);

    let store = Store::open(dir.path().join("drained.rill")).unwrap();
    assert_eq!(store.rows(), 64);
    // The surviving rows are drawn from the last 64 ingests, i.e. 137..=200.
    let mut out = RowSet::new();
    store.query(Column::A, 137, &mut out).unwrap();
    assert_eq!(out.as_slice(), &[Row::new(137, 137)]);
    let mut out = RowSet::new();
    store.query(Column::A, 136, &mut out).unwrap();
    assert!(out.is_empty());
}

/// Over a span comfortably past the retention horizon, rotate periodically
/// and confirm every surviving row postdates the horizon. Uses a scaled-down
/// `Options` (small integer "seconds") purely so the test doesn't need tens
/// of thousands of real-scale hourly files to exercise the same cascade of
/// hour -> day -> week -> month merges and eventual expiry.
#[test]
fn rotation_expires_stores_past_the_retention_horizon() {
    init();
    let dir = tempdir().unwrap();
    let opts = Options { hour_secs: 1, day_secs: 2, week_secs: 4, month_secs: 8, retention_secs: 8 * 13 };
    let rotator = Rotator::new(dir.path(), opts);

    let total_hours = opts.retention_secs * 2;
    for h in 0..total_hours {
        let ts = h * opts.hour_secs;
        let path = dir.path().join(format!("raw-{}.rill", h));
        write_rows(&path, &[(1, ts + 1)], ts, opts.hour_secs);
        rotator.run(ts).unwrap();
    }

    let now = total_hours * opts.hour_secs;
    rotator.run(now).unwrap();

    let query = Query::open(dir.path()).unwrap();
    let mut out = RowSet::new();
    query.key(Column::A, 1, &mut out).unwrap();
    assert!(!out.is_empty());

    let horizon = now.saturating_sub(opts.retention_secs);
    for row in out.as_slice() {
        assert!(row.b > horizon, "row {:?} predates retention horizon {}", row, horizon);
    }
}

#[test]
fn crash_truncated_store_is_rejected_and_ignored_by_rotation() {
    init();
    let dir = tempdir().unwrap();
    write_rows(&dir.path().join("good.rill"), &[(1, 10)], 100, 3600);

    // Simulate a crash before the stamp was written: a fresh store file
    // truncated to a single byte.
    let bad_path = dir.path().join("bad.rill");
    write_rows(&bad_path, &[(2, 20)], 200, 3600);
    {
        let file = OpenOptions::new().write(true).open(&bad_path).unwrap();
        file.set_len(1).unwrap();
    }
    assert!(Store::open(&bad_path).is_err());

    let rotator = Rotator::new(dir.path(), Options::default());
    rotator.run(100_000).unwrap();

    // The corrupt file is skipped at scan, not merged or mistaken for valid
    // data; rotation over the directory produces no further errors.
    let query = Query::open(dir.path()).unwrap();
    assert_eq!(query.len(), 1);
}

#[test]
fn randomized_store_round_trip() {
    init();
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    // Fixed seed: a failure here should reproduce deterministically rather
    // than depend on the host's entropy source.
    let mut rng = SmallRng::seed_from_u64(0xC0FFEE);

    let mut rows = RowSet::new();
    let mut seen = HashSet::new();
    while seen.len() < 500 {
        let a = rng.gen_range(1..2000u64);
        let b = rng.gen_range(1..2000u64);
        if seen.insert((a, b)) {
            rows.push(a, b).unwrap();
        }
    }

    let mut expected = rows.clone();
    expected.compact();
    let expected_rows: Vec<Row> = expected.as_slice().to_vec();

    let dir = tempdir().unwrap();
    let path = dir.path().join("random.rill");
    Store::write(&path, 42, 3600, &mut rows).unwrap();

    let store = Store::open(&path).unwrap();
    assert_eq!(store.rows(), expected_rows.len() as u64);

    let mut decoder = store.iterate(Column::A).unwrap();
    let mut got = Vec::new();
    loop {
        let row = decoder.next().unwrap();
        if row.is_nil() {
            break;
        }
        got.push(row);
    }
    assert_eq!(got, expected_rows);
}
