//! Integration tests for the match engine over a real hash table.
//!
//! Hashes are produced by the local pipeline and the stored `matches` rows
//! are read back with rusqlite.

use image::{DynamicImage, ImageBuffer, Rgb};
use phash_bench::core::hasher::{AverageHasher, DctHasher, HashMethod};
use phash_bench::core::matcher::{MatchConfig, MatchEngine};
use phash_bench::core::modifier::{Base, Invert, Modification};
use phash_bench::core::pipeline::LocalPipeline;
use phash_bench::core::registry::RegistryBuilder;
use phash_bench::core::stage::StageContext;
use phash_bench::core::store::{Session, SqliteConnector, StoreConnector};
use rusqlite::Connection;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn context(root: &Path) -> StageContext {
    let modifications = RegistryBuilder::<dyn Modification>::new()
        .register("base", Arc::new(Base))
        .register("invert", Arc::new(Invert))
        .build()
        .unwrap();
    let methods = RegistryBuilder::<dyn HashMethod>::new()
        .register("averagehash", Arc::new(AverageHasher::new(8)))
        .register("dct-hash", Arc::new(DctHasher::new(8)))
        .build()
        .unwrap();

    StageContext::new(
        Arc::new(SqliteConnector::new(root.join("bench.db"))),
        root.join("modified"),
        modifications,
        methods,
    )
}

fn write_corpus(input: &Path, images: u8) {
    for i in 0..images {
        let path = input.join(format!("user{}/img{}.png", i % 2, i));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let seed = i.wrapping_mul(37);
        let img = ImageBuffer::from_fn(20, 20, |x, y| {
            Rgb([(x as u8 * 12).wrapping_add(seed), (y as u8 * 5) ^ seed, seed])
        });
        DynamicImage::ImageRgb8(img).save(&path).unwrap();
    }
}

/// Stored pairs as (hash_id1, hash_id2, method of 1, method of 2, distance)
fn stored_pairs(db: &Path) -> Vec<(i64, i64, i64, i64, f64)> {
    let conn = Connection::open(db).unwrap();
    let mut stmt = conn
        .prepare(
            "SELECT m.hash_id1, m.hash_id2, a.hash_method_id, b.hash_method_id, m.hamming_distance
             FROM matches m
             JOIN hashes a ON a.id = m.hash_id1
             JOIN hashes b ON b.id = m.hash_id2",
        )
        .unwrap();
    stmt.query_map([], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
    })
    .unwrap()
    .map(|row| row.unwrap())
    .collect()
}

#[test]
fn every_unordered_pair_is_stored_once_per_method() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    write_corpus(&root.join("in"), 4);

    let report = LocalPipeline::builder(context(root), root.join("in"))
        .match_config(MatchConfig {
            page_size: 3,
            batch_size: 7,
            yield_every: 5,
        })
        .build()
        .run()
        .unwrap();

    // 4 images x 2 modifications = 8 hashes per method, C(8, 2) = 28 pairs each
    assert_eq!(report.matches.persisted, 56);

    let pairs = stored_pairs(&root.join("bench.db"));
    assert_eq!(pairs.len(), 56);

    let mut seen = HashSet::new();
    for (a, b, method_a, method_b, distance) in pairs {
        assert!(a < b, "pair ({a}, {b}) is not ordered");
        assert_eq!(method_a, method_b, "pair ({a}, {b}) crosses methods");
        assert!((0.0..=1.0).contains(&distance));
        assert!(seen.insert((a, b)), "pair ({a}, {b}) stored twice");
    }
}

#[test]
fn interrupted_match_run_resumes_without_duplicates() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    write_corpus(&root.join("in"), 3);
    let context = context(root);

    // Stage only: run the pipeline, then wipe the matches it wrote
    LocalPipeline::builder(context.clone(), root.join("in"))
        .build()
        .run()
        .unwrap();
    Connection::open(root.join("bench.db"))
        .unwrap()
        .execute("DELETE FROM matches", [])
        .unwrap();

    let config = MatchConfig {
        page_size: 2,
        batch_size: 4,
        yield_every: 3,
    };

    // First engine stops part way through
    let store = context.connector().connect().unwrap();
    let mut first = MatchEngine::new(Session::new(store, config.batch_size), config);
    let finished = first.run_steps(10, |_| {}).unwrap();
    assert!(!finished);
    let partial = first.summary().persisted;
    // Dropping the engine commits its open batch
    drop(first);

    // A fresh engine starts over and skips what is already stored
    let store = context.connector().connect().unwrap();
    let mut second = MatchEngine::new(Session::new(store, config.batch_size), config);
    let summary = second.run_to_completion(|_| {}).unwrap();

    // 3 images x 2 modifications = 6 hashes per method, 15 pairs each
    assert_eq!(partial + summary.persisted, 30);
    assert_eq!(summary.duplicates, partial);
    assert_eq!(stored_pairs(&root.join("bench.db")).len(), 30);
}
