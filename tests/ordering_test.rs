use std::time::Duration;

use log::LevelFilter;
use rbft_rs::{ledger::Ledger, node::NodeError, types::data_types::InstanceId};

mod common;

use crate::common::{
    harness::{requests, PoolOptions, TestPool, DOMAIN_LEDGER, POOL_LEDGER},
    logging::{first_seven_base64_chars, setup_logger},
};

#[test]
fn ordering_test() {
    setup_logger(LevelFilter::Info);

    // 1. Start a pool of 4 nodes, which tolerates 1 fault and runs 2 instances.
    let mut pool = TestPool::start(
        4,
        PoolOptions {
            max_batch_size: 4,
            ..Default::default()
        },
    );
    assert!(pool
        .nodes
        .iter()
        .all(|node| node.replicas().len() == 2 && node.primary(InstanceId::MASTER) == Some(pool.key(0))));

    // 2. Submit requests to both ledgers to every node. An invalid request is turned away.
    let mut all_requests = requests(DOMAIN_LEDGER, 0, 10);
    all_requests.extend(requests(POOL_LEDGER, 100, 3));
    pool.submit_to_all(&all_requests);
    let mut invalid = requests(DOMAIN_LEDGER, 200, 1).remove(0);
    invalid.payload.clear();
    for node in pool.nodes.iter_mut() {
        assert!(matches!(
            node.submit_request(invalid.clone()),
            Err(NodeError::InvalidRequest(digest)) if digest == invalid.digest()
        ));
    }

    // 2.1. Submitting a request twice is a no-op.
    assert!(!pool.nodes[1].submit_request(all_requests[0].clone()).unwrap());

    // 3. Poll until every node committed every valid request.
    pool.run_until("every valid request is committed", |pool| {
        pool.all_have_ledger_size(0..4, DOMAIN_LEDGER, 10)
            && pool.all_have_ledger_size(0..4, POOL_LEDGER, 3)
    });

    // 4. Every node ordered the same batches in the same order, and ended up with the same ledgers
    //    and app state.
    for idx in 1..4 {
        assert_eq!(pool.ordered(idx), pool.ordered(0));
        for ledger_id in [POOL_LEDGER, DOMAIN_LEDGER] {
            assert_eq!(
                pool.nodes[idx].ledger(ledger_id).unwrap().summary(),
                pool.nodes[0].ledger(ledger_id).unwrap().summary()
            );
            assert_eq!(
                pool.nodes[idx].app().committed(ledger_id),
                pool.nodes[0].app().committed(ledger_id)
            );
        }
    }
    assert_eq!(pool.nodes[0].app().committed(DOMAIN_LEDGER), 10);
    log::debug!(
        "Domain ledger root: {}",
        first_seven_base64_chars(&pool.nodes[0].ledger(DOMAIN_LEDGER).unwrap().root_hash().bytes())
    );

    // 5. Batches are numbered consecutively, never exceed the maximum batch size, and write to a
    //    single ledger each.
    let ordered = pool.ordered(0);
    for (i, batch) in ordered.iter().enumerate() {
        assert_eq!(batch.pp_seq_no.int(), i as u64 + 1);
        assert!(!batch.req_idr.is_empty() && batch.req_idr.len() <= 4);
    }
    assert_eq!(ordered.iter().map(|batch| batch.req_idr.len()).sum::<usize>(), 13);
    assert!(ordered
        .iter()
        .all(|batch| batch.inst_id == InstanceId::MASTER && batch.view_no.int() == 0));

    let batch_count = ordered.len() as u64;

    // 6. The backup instance orders everything the master did, and nothing is left unordered.
    pool.run_until("the backup instance caught up", |pool| {
        pool.all_ordered_up_to(0..4, InstanceId::new(1), batch_count)
    });
    assert!(pool.nodes.iter().all(|node| {
        node.replicas().iter().all(|replica| {
            replica.request_queue().is_empty() && replica.batches().is_empty()
        })
    }));
    assert!(pool
        .nodes
        .iter()
        .all(|node| node.requests().is_empty() && node.requests().ordered_len() == 13));

    // 6.1. Submitting an ordered request again does not order it twice.
    for node in pool.nodes.iter_mut() {
        assert!(!node.submit_request(all_requests[0].clone()).unwrap());
    }
    pool.run_for(Duration::from_millis(50));
    assert!(pool.all_have_ledger_size(0..4, DOMAIN_LEDGER, 10));
    assert_eq!(pool.ordered(0).len() as u64, batch_count);

    // 7. A ledger reopened from a torn down node's store has the same root.
    let expected = pool.nodes[3].ledger(DOMAIN_LEDGER).unwrap().summary();
    let node = pool.nodes.pop().unwrap();
    let (ledgers, app) = node.teardown();
    assert_eq!(app.speculative_batches(DOMAIN_LEDGER), 0);
    let store = ledgers
        .into_iter()
        .find(|ledger| ledger.ledger_id() == DOMAIN_LEDGER)
        .unwrap()
        .into_store();
    assert_eq!(store.records().len(), 10);
    let reopened = Ledger::new(DOMAIN_LEDGER, store).unwrap();
    assert_eq!(reopened.summary(), expected);
}
