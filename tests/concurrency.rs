//! Multi-threaded use of a shared store.

use branchstore::{
    BlockId, BlockStore, BranchId, BranchRegistry, CowEngine, MergeCoordinator, Store,
    StoreConfig, TableWrite,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

#[test]
fn test_concurrent_writes_to_one_table_all_land() {
    init_tracing();
    let store = Arc::new(Store::new(StoreConfig::default()));
    let main = BranchId::main();

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let store = Arc::clone(&store);
            let main = main.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    store
                        .apply(&main, "events", TableWrite::Append(json!({"t": t, "i": i})))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.query(&main, "events").unwrap().len(), 400);

    // Every write saw the one before it.
    let log = store.operation_log(&main).unwrap();
    assert_eq!(log.len(), 400);
    for pair in log.windows(2) {
        assert_eq!(pair[1].base_version, pair[0].result_version);
    }
}

#[test]
fn test_branches_written_in_parallel_stay_isolated() {
    let store = Arc::new(Store::new(StoreConfig::default()));
    let main = BranchId::main();
    store.update(&main, "products", json!({"id": 1, "price": 100})).unwrap();

    let branches: Vec<_> = (0..6)
        .map(|_| store.create_branch(&main, None).unwrap().id)
        .collect();

    let handles: Vec<_> = branches
        .iter()
        .cloned()
        .enumerate()
        .map(|(n, id)| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..20 {
                    store
                        .update(&id, "products", json!({"id": 1, "price": n * 100 + i}))
                        .unwrap();
                    // Readers never block on other branches' writers.
                    store.query(&BranchId::main(), "products").unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(
        store.query(&main, "products").unwrap().rows[0]["price"],
        json!(100)
    );
    for (n, id) in branches.iter().enumerate() {
        let view = store.query(id, "products").unwrap();
        assert_eq!(view.rows[0]["price"], json!(n * 100 + 19));
    }

    let stats = store.stats();
    assert_eq!(stats.block_clones, 6);
    assert_eq!(stats.total_blocks, 7);
}

#[test]
fn test_rollback_races_with_writes() {
    init_tracing();
    let store = Arc::new(Store::new(StoreConfig::default()));
    let main = BranchId::main();
    store.update(&main, "t", json!({"id": 0})).unwrap();

    for _ in 0..20 {
        let branch = store.create_branch(&main, None).unwrap().id;

        let writer = {
            let store = Arc::clone(&store);
            let branch = branch.clone();
            thread::spawn(move || {
                for i in 0..20 {
                    // Fails once the rollback wins; it must never corrupt counts.
                    if store.update(&branch, "t", json!({"id": i})).is_err() {
                        break;
                    }
                }
            })
        };
        store.rollback(&branch).unwrap();
        writer.join().unwrap();
    }

    let stats = store.stats();
    assert_eq!(stats.total_branches, 1);
    assert_eq!(stats.total_blocks, 1);
    assert_eq!(stats.shared_blocks, 0);
    assert_eq!(store.query(&main, "t").unwrap().len(), 1);
}

#[test]
fn test_concurrent_branch_creation_gets_unique_ids() {
    let store = Arc::new(Store::new(StoreConfig::default()));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                (0..10)
                    .map(|_| store.create_branch(&BranchId::main(), None).unwrap().id)
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ids: Vec<BranchId> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 80);
    assert_eq!(store.list_branches().len(), 81);
}

#[test]
fn test_forks_race_with_parent_writes_and_sibling_rollbacks() {
    init_tracing();
    let blocks = Arc::new(BlockStore::new());
    let registry = Arc::new(BranchRegistry::new(Arc::clone(&blocks)));
    let engine = Arc::new(CowEngine::new(Arc::clone(&blocks), "id"));
    let coordinator = Arc::new(MergeCoordinator::new(
        Arc::clone(&registry),
        Arc::clone(&engine),
    ));
    let main = BranchId::main();
    let main_cell = registry.get(&main).unwrap();
    for t in 0..4 {
        engine
            .update(&main_cell, &format!("t{}", t), TableWrite::Upsert(json!({"id": 0})))
            .unwrap();
    }

    let pending: Arc<Mutex<Vec<BranchId>>> = Arc::default();
    let forks_done = Arc::new(AtomicBool::new(false));

    let forker = {
        let registry = Arc::clone(&registry);
        let pending = Arc::clone(&pending);
        let forks_done = Arc::clone(&forks_done);
        thread::spawn(move || {
            for _ in 0..100 {
                let branch = registry.create_branch(&BranchId::main(), None).unwrap();
                pending.lock().push(branch.id);
            }
            forks_done.store(true, Ordering::SeqCst);
        })
    };

    // Every fork shares main's blocks, so these writes clone and release.
    let writer = {
        let engine = Arc::clone(&engine);
        let main_cell = Arc::clone(&main_cell);
        thread::spawn(move || {
            for i in 0..400 {
                engine
                    .update(
                        &main_cell,
                        &format!("t{}", i % 4),
                        TableWrite::Upsert(json!({"id": i % 7, "n": i})),
                    )
                    .unwrap();
            }
        })
    };

    let roller = {
        let coordinator = Arc::clone(&coordinator);
        let pending = Arc::clone(&pending);
        let forks_done = Arc::clone(&forks_done);
        thread::spawn(move || loop {
            let next = pending.lock().pop();
            match next {
                Some(id) => {
                    coordinator.rollback(&id).unwrap();
                }
                None if forks_done.load(Ordering::SeqCst) => break,
                None => thread::yield_now(),
            }
        })
    };

    forker.join().unwrap();
    writer.join().unwrap();
    roller.join().unwrap();

    let mut references: HashMap<BlockId, usize> = HashMap::new();
    for cell in registry.cells() {
        for id in cell.snapshot().values() {
            *references.entry(*id).or_default() += 1;
        }
    }
    assert_eq!(references.len(), blocks.len());
    for (id, count) in references {
        assert_eq!(blocks.ref_count(id), Some(count), "block {}", id);
    }
}
