use log::LevelFilter;
use rbft_rs::types::data_types::{InstanceId, PpSeqNo, ViewNumber};

mod common;

use crate::common::{
    harness::{requests, PoolOptions, TestPool, DOMAIN_LEDGER},
    logging::setup_logger,
};

const CHK_FREQ: u64 = 5;

// Start a pool that checkpoints every `CHK_FREQ` batches of 2 requests.
fn checkpointing_pool() -> TestPool {
    TestPool::start(
        4,
        PoolOptions {
            chk_freq: CHK_FREQ,
            max_batch_size: 2,
            ..Default::default()
        },
    )
}

// Have the master instance of `pool` order `batches` more batches, of requests not submitted before.
fn order_more_batches(pool: &mut TestPool, batches: u64) {
    let first_req_id = pool.ledger_size(0, DOMAIN_LEDGER);
    let last_ordered = pool.nodes[0]
        .replica(InstanceId::MASTER)
        .unwrap()
        .last_ordered()
        .int();
    pool.submit_to_all(&requests(DOMAIN_LEDGER, first_req_id, 2 * batches));
    pool.run_until("every batch is ordered", |pool| {
        pool.all_ordered_up_to(0..4, InstanceId::MASTER, last_ordered + batches)
    });
}

// Start a checkpointing pool and have its master instance order `batches` batches.
fn order_batches(batches: u64) -> TestPool {
    let mut pool = checkpointing_pool();
    order_more_batches(&mut pool, batches);
    pool
}

// Number of ordered batches whose three-phase state has not been garbage collected, checking that
// every queue agrees.
fn non_gced_batch_count(pool: &TestPool, idx: usize) -> usize {
    let replica = pool.nodes[idx].replica(InstanceId::MASTER).unwrap();
    let count = replica.ordered().len();
    assert_eq!(replica.prepares().len(), count);
    assert_eq!(replica.commits().len(), count);
    assert_eq!(
        replica.pre_prepares().len() + replica.sent_pre_prepares().len(),
        count
    );
    assert_eq!(replica.commits_waiting_for_prepare().len(), 0);
    assert_eq!(replica.batches().len(), 0);
    count
}

// Whether the master instance of every node holds exactly `count` ordered batches that were not
// garbage collected.
fn gced_down_to(pool: &TestPool, count: usize) -> bool {
    pool.nodes.iter().all(|node| {
        node.replica(InstanceId::MASTER)
            .is_some_and(|replica| replica.ordered().len() == count)
    })
}

#[test]
fn more_than_a_checkpoint_window_test() {
    setup_logger(LevelFilter::Info);

    // 1. Order CHK_FREQ + 2 batches and wait for the first window to become stable everywhere.
    let mut pool = order_batches(CHK_FREQ + 2);
    pool.run_until("the first checkpoint is stable on every node", |pool| {
        pool.nodes.iter().all(|node| {
            node.stable_checkpoint(InstanceId::MASTER)
                .is_some_and(|checkpoint| checkpoint.seq_no_end == PpSeqNo::new(CHK_FREQ))
        })
    });

    // 2. The first CHK_FREQ batches were garbage collected, and the trailing partial window was not.
    for idx in 0..4 {
        assert_eq!(non_gced_batch_count(&pool, idx), 2);
        let replica = pool.nodes[idx].replica(InstanceId::MASTER).unwrap();
        assert_eq!(replica.watermarks().0, PpSeqNo::new(CHK_FREQ));
        assert_eq!(replica.checkpoints().open_window_len(), 2);
        assert_eq!(replica.checkpoints().pending_windows(), 0);
        assert_eq!(pool.ledger_size(idx, DOMAIN_LEDGER), 2 * (CHK_FREQ + 2));
    }
}

#[test]
fn exactly_a_checkpoint_window_test() {
    setup_logger(LevelFilter::Info);

    // 1. Order exactly CHK_FREQ batches.
    let mut pool = order_batches(CHK_FREQ);
    pool.run_until("the checkpoint is stable on every node", |pool| {
        pool.nodes
            .iter()
            .all(|node| node.stable_checkpoint(InstanceId::MASTER).is_some())
    });

    // 2. Exactly one checkpoint became stable, and nothing is left to garbage collect.
    for idx in 0..4 {
        let checkpoint = pool.nodes[idx]
            .stable_checkpoint(InstanceId::MASTER)
            .unwrap();
        assert_eq!(checkpoint.seq_no_start, PpSeqNo::new(1));
        assert_eq!(checkpoint.seq_no_end, PpSeqNo::new(CHK_FREQ));
        assert_eq!(non_gced_batch_count(&pool, idx), 0);
    }
}

#[test]
fn less_than_a_checkpoint_window_test() {
    setup_logger(LevelFilter::Info);

    // 1. Order CHK_FREQ - 2 batches.
    let pool = order_batches(CHK_FREQ - 2);

    // 2. No checkpoint was sent, so every batch is still around.
    for idx in 0..4 {
        let replica = pool.nodes[idx].replica(InstanceId::MASTER).unwrap();
        assert!(replica.stable_checkpoint().is_none());
        assert_eq!(replica.checkpoints().open_window_len(), (CHK_FREQ - 2) as usize);
        assert_eq!(non_gced_batch_count(&pool, idx), (CHK_FREQ - 2) as usize);
    }
}

// Order `batches` batches, change views, then order `batches` batches again. Garbage collection
// leaves as many batches around in the new view as it did in the old one, since checkpoint windows
// restart at the first batch ordered in the new view.
fn checkpoint_across_views(batches: u64) {
    setup_logger(LevelFilter::Info);
    let non_gced = if batches >= CHK_FREQ {
        batches - CHK_FREQ
    } else {
        batches
    } as usize;

    // 1. Order the batches in view 0.
    let mut pool = order_batches(batches);
    pool.run_until("garbage collection caught up in view 0", |pool| {
        gced_down_to(pool, non_gced)
    });
    for idx in 0..4 {
        assert_eq!(non_gced_batch_count(&pool, idx), non_gced);
    }

    // 2. Change views. The three-phase state and the checkpoint votes are gone, and every node has
    //    the same ledger.
    pool.detector.arm(0);
    pool.run_until("every node moved to view 1", |pool| {
        pool.nodes
            .iter()
            .all(|node| node.view_no() == ViewNumber::new(1) && !node.is_view_changing())
    });
    for idx in 0..4 {
        assert_eq!(non_gced_batch_count(&pool, idx), 0);
        let checkpoints = pool.nodes[idx].replica(InstanceId::MASTER).unwrap().checkpoints();
        assert_eq!(checkpoints.open_window_len(), 0);
        assert_eq!(checkpoints.pending_windows(), 0);
        assert_eq!(
            pool.nodes[idx].ledger(DOMAIN_LEDGER).unwrap().summary(),
            pool.nodes[0].ledger(DOMAIN_LEDGER).unwrap().summary()
        );
    }

    // 3. Order the same number of batches in view 1, and garbage collection ends up in the same
    //    place.
    order_more_batches(&mut pool, batches);
    pool.run_until("garbage collection caught up in view 1", |pool| {
        gced_down_to(pool, non_gced)
    });
    for idx in 0..4 {
        assert_eq!(non_gced_batch_count(&pool, idx), non_gced);
    }

    // 4. Top up to a full window, and nothing is left.
    let top_up = CHK_FREQ - non_gced as u64;
    order_more_batches(&mut pool, top_up);
    pool.run_until("every batch is garbage collected", |pool| gced_down_to(pool, 0));
    for idx in 0..4 {
        assert_eq!(non_gced_batch_count(&pool, idx), 0);
    }
    assert!(pool.all_have_ledger_size(0..4, DOMAIN_LEDGER, 2 * (2 * batches + top_up)));
}

#[test]
fn more_than_a_checkpoint_window_across_views_test() {
    checkpoint_across_views(CHK_FREQ + 2);
}

#[test]
fn exactly_a_checkpoint_window_across_views_test() {
    checkpoint_across_views(CHK_FREQ);
}

#[test]
fn less_than_a_checkpoint_window_across_views_test() {
    checkpoint_across_views(CHK_FREQ - 2);
}
