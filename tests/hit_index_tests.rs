mod common;

use common::*;
use egrin2_ensemble::hits::{hits_frame, IndexReport, MotifHitIndexer};
use egrin2_ensemble::query::PositionQueryEngine;
use std::fs;

/// Two runs with indexed hits; run 001 has a second cluster file.
fn indexed_ensemble(base: &std::path::Path) -> MotifHitIndexer {
    let r1 = run_dir(base, "001");
    write_hits(
        &r1,
        1,
        &[
            hit("1", "chr", 100, 200, 1e-6),
            hit("2", "chr", 150, 160, 1e-3),
        ],
    );
    write_hits(&r1, 12, &[hit("1", "plasmid", 120, 130, 1e-8)]);
    let r2 = run_dir(base, "002");
    write_hits(&r2, 3, &[hit("1", "chr", 180, 400, 1e-7)]);

    let indexer = MotifHitIndexer::new(&layout(base));
    let runs = indexer.layout().discover().unwrap();
    let coverage = indexer.build_all(&runs);
    assert!(coverage.is_complete());
    indexer
}

#[test]
fn test_build_index_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let r1 = run_dir(tmp.path(), "001");
    write_hits(&r1, 1, &[hit("1", "chr", 100, 200, 1e-6)]);
    write_hits(&r1, 2, &[hit("1", "chr", 5, 9, 1e-4), hit("2", "chr", 7, 8, 1e-2)]);

    let layout = layout(tmp.path());
    let indexer = MotifHitIndexer::new(&layout);
    let run = layout.discover().unwrap().remove(0);

    match indexer.build_index(&run).unwrap() {
        IndexReport::Built { files, rows, skipped } => {
            assert_eq!(files, 2);
            assert_eq!(rows, 3);
            assert!(skipped.is_empty());
        }
        other => panic!("unexpected report {:?}", other),
    }
    assert!(matches!(
        indexer.build_index(&run).unwrap(),
        IndexReport::AlreadyIndexed
    ));

    let index = indexer.open_index(&run).unwrap().unwrap();
    assert_eq!(index.len().unwrap(), 3);

    // a forced rebuild replaces rather than appends
    write_hits(&r1, 3, &[hit("4", "chr", 1, 2, 1e-5)]);
    assert!(matches!(
        indexer.rebuild_index(&run).unwrap(),
        IndexReport::Built { rows: 4, .. }
    ));
    let index = indexer.open_index(&run).unwrap().unwrap();
    assert_eq!(index.len().unwrap(), 4);
}

#[test]
fn test_run_without_hit_files() {
    let tmp = tempfile::tempdir().unwrap();
    run_dir(tmp.path(), "001");
    let layout = layout(tmp.path());
    let indexer = MotifHitIndexer::new(&layout);
    let run = layout.discover().unwrap().remove(0);

    assert!(matches!(
        indexer.build_index(&run).unwrap(),
        IndexReport::NoHitFiles
    ));
    assert!(indexer.open_index(&run).unwrap().is_none());
}

#[test]
fn test_unreadable_hit_file_is_skipped() {
    let tmp = tempfile::tempdir().unwrap();
    let r1 = run_dir(tmp.path(), "001");
    write_hits(&r1, 1, &[hit("1", "chr", 100, 200, 1e-6)]);
    // not bzip2
    fs::write(r1.join("fimo-outs/fimo-out-0002.bz2"), "plain text").unwrap();
    // bzip2, but missing the p-value column
    write_bz2(
        &r1.join("fimo-outs/fimo-out-0003.bz2"),
        "#pattern name\tsequence name\tstart\tstop\n1\tchr\t1\t2\n",
    );

    let layout = layout(tmp.path());
    let indexer = MotifHitIndexer::new(&layout);
    let run = layout.discover().unwrap().remove(0);

    match indexer.build_index(&run).unwrap() {
        IndexReport::Built { files, rows, skipped } => {
            assert_eq!(files, 1);
            assert_eq!(rows, 1);
            assert_eq!(skipped.len(), 2);
        }
        other => panic!("unexpected report {:?}", other),
    }
    let hits = indexer
        .open_index(&run)
        .unwrap()
        .unwrap()
        .overlapping(150, 1.0, None)
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].cluster, 1);
    assert_eq!(hits[0].run_id.as_str(), "001");
}

#[test]
fn test_all_files_unreadable_writes_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let r1 = run_dir(tmp.path(), "001");
    fs::create_dir_all(r1.join("fimo-outs")).unwrap();
    fs::write(r1.join("fimo-outs/fimo-out-0001.bz2"), "garbage").unwrap();

    let layout = layout(tmp.path());
    let indexer = MotifHitIndexer::new(&layout);
    let run = layout.discover().unwrap().remove(0);

    assert!(matches!(
        indexer.build_index(&run).unwrap(),
        IndexReport::Built { files: 0, rows: 0, .. }
    ));
    assert!(!indexer.index_path(&run).exists());
}

#[test]
fn test_position_query_boundaries_are_inclusive() {
    let tmp = tempfile::tempdir().unwrap();
    let r1 = run_dir(tmp.path(), "001");
    write_hits(&r1, 1, &[hit("1", "chr", 100, 200, 1e-6)]);
    let indexer = MotifHitIndexer::new(&layout(tmp.path()));
    indexer.build_all(&indexer.layout().discover().unwrap());
    let engine = PositionQueryEngine::new(&indexer);

    assert_eq!(engine.query(100, 1e-5, None).unwrap().items.len(), 1);
    assert_eq!(engine.query(200, 1e-5, None).unwrap().items.len(), 1);
    assert!(engine.query(99, 1e-5, None).unwrap().items.is_empty());
    assert!(engine.query(201, 1e-5, None).unwrap().items.is_empty());
    assert!(engine.query(150, 1e-10, None).unwrap().items.is_empty());
}

#[test]
fn test_position_query_spans_runs_in_order() {
    let tmp = tempfile::tempdir().unwrap();
    let indexer = indexed_ensemble(tmp.path());
    let engine = PositionQueryEngine::new(&indexer);

    let found = engine.query(190, 1e-5, None).unwrap();
    assert!(found.is_complete());
    let summary: Vec<(&str, u32, i64)> = found
        .items
        .iter()
        .map(|h| (h.run_id.as_str(), h.cluster, h.start))
        .collect();
    assert_eq!(summary, vec![("001", 1, 100), ("002", 3, 180)]);

    let hits = engine.query(155, 1e-2, None).unwrap().items;
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[1].pattern_name, "2");
    assert_eq!(hits[1].p_value, 1e-3);

    let on_plasmid = engine.query(125, 1e-5, Some("plasmid")).unwrap().items;
    assert_eq!(on_plasmid.len(), 1);
    assert_eq!(on_plasmid[0].cluster, 12);
    assert!(engine.query(125, 1e-5, Some("chr")).unwrap().items.len() == 1);
    assert!(engine
        .query(125, 1e-5, Some("other"))
        .unwrap()
        .items
        .is_empty());

    let df = hits_frame(&found.items).unwrap();
    assert_eq!(df.height(), 2);
    assert_eq!(df.width(), 7);
}

#[test]
fn test_broken_index_contributes_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let indexer = indexed_ensemble(tmp.path());
    let r2 = tmp.path().join(format!("{}002", PREFIX));
    fs::write(r2.join("fimo-outs.db"), "corrupted index file").unwrap();
    // a run that was never indexed is simply skipped
    run_dir(tmp.path(), "003");

    let engine = PositionQueryEngine::new(&indexer);
    let found = engine.query(190, 1e-5, None).unwrap();
    assert_eq!(found.items.len(), 1);
    assert_eq!(found.items[0].run_id.as_str(), "001");
    assert_eq!(found.failures.len(), 1);
    assert_eq!(found.failures[0].run.as_str(), "002");
}

#[test]
fn test_index_with_integer_motif_names() {
    let tmp = tempfile::tempdir().unwrap();
    let r1 = run_dir(tmp.path(), "001");
    // laid out like a pandas `to_sql` table: numeric motif names as INTEGER
    let conn = rusqlite::Connection::open(r1.join("fimo-outs.db")).unwrap();
    conn.execute_batch(
        r##"CREATE TABLE fimo_out (
            "#pattern name" INTEGER, "sequence name" TEXT, start INTEGER, stop INTEGER,
            strand TEXT, score REAL, "p-value" REAL, "q-value" REAL,
            "matched sequence" TEXT, cluster INTEGER, run_id TEXT
        );
        INSERT INTO fimo_out VALUES (3, 'chr', 100, 200, '+', 10.5, 1e-6, 0.01, 'ACGT', 5, './eco-out-001');
        INSERT INTO fimo_out VALUES (1, 'chr', 150, 160, '-', 8.0, 1e-7, 0.01, 'TTGA', 5, './eco-out-001');
        CREATE INDEX idx ON fimo_out(start, stop, "p-value");"##,
    )
    .unwrap();
    drop(conn);

    let indexer = MotifHitIndexer::new(&layout(tmp.path()));
    let runs = indexer.layout().discover().unwrap();
    assert!(matches!(
        indexer.build_index(&runs[0]).unwrap(),
        IndexReport::AlreadyIndexed
    ));

    let found = PositionQueryEngine::new(&indexer)
        .query(155, 1e-5, None)
        .unwrap();
    assert!(found.is_complete());
    let patterns: Vec<&str> = found.items.iter().map(|h| h.pattern_name.as_str()).collect();
    assert_eq!(patterns, vec!["3", "1"]);
    assert_eq!(found.items[0].cluster, 5);

    let index = indexer.open_index(&runs[0]).unwrap().unwrap();
    let motif = index.motif_hits(5, "3").unwrap();
    assert_eq!(motif.len(), 1);
    assert_eq!(motif[0].start, 100);
}
