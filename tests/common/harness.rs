//! [`TestPool`], which starts a pool of nodes over a mock network and polls them in lockstep.

use std::{
    thread,
    time::{Duration, Instant},
};

use rand_core::OsRng;
use rbft_rs::{
    config::Configuration,
    ledger::Ledger,
    node::{Node, NodeSpec},
    three_phase::messages::Ordered,
    types::{
        crypto_primitives::{SigningKey, VerifyingKey},
        data_types::{InstanceId, LedgerId},
        pool::Pool,
        requests::Request,
    },
};

use super::{
    counter_app::CounterApp,
    detector::ForcedDegradation,
    mem_store::MemStore,
    network::{mock_network, NetworkStub, Partition},
};

pub(crate) type TestNode = Node<MemStore, CounterApp, NetworkStub>;

pub(crate) const POOL_LEDGER: LedgerId = LedgerId::new(0);
pub(crate) const DOMAIN_LEDGER: LedgerId = LedgerId::new(1);

/// How long [`TestPool::run_until`] waits for a condition before failing the test.
const RUN_TIMEOUT: Duration = Duration::from_secs(20);

/// Parameters that differ between tests.
pub(crate) struct PoolOptions {
    pub(crate) chk_freq: u64,
    pub(crate) max_batch_size: usize,
    pub(crate) perf_check_freq: Duration,
    pub(crate) view_change_timeout: Duration,
    pub(crate) max_master_latency: Duration,
    pub(crate) min_backup_requests: u64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            chk_freq: 100,
            max_batch_size: 100,
            perf_check_freq: Duration::from_millis(20),
            view_change_timeout: Duration::from_secs(5),
            max_master_latency: Duration::from_secs(60),
            // High enough that the throughput ratio never fires unless a test asks for it.
            min_backup_requests: 1_000_000,
        }
    }
}

/// A pool of nodes whose order in `nodes` is the order of their keys in the [`Pool`], so that
/// `nodes[0]` is the primary of the master instance in view 0.
pub(crate) struct TestPool {
    pub(crate) nodes: Vec<TestNode>,
    pub(crate) partition: Partition,
    pub(crate) detector: ForcedDegradation,
    // Everything each node's master instance ordered, in order.
    ordered: Vec<Vec<Ordered>>,
}

impl TestPool {
    pub(crate) fn start(size: usize, options: PoolOptions) -> TestPool {
        let mut csprg = OsRng {};
        let mut keypairs: Vec<SigningKey> =
            (0..size).map(|_| SigningKey::generate(&mut csprg)).collect();
        keypairs.sort_by_key(|keypair| keypair.verifying_key().to_bytes());

        let pool = Pool::new(keypairs.iter().map(SigningKey::verifying_key));
        let (network_stubs, partition) =
            mock_network(keypairs.iter().map(SigningKey::verifying_key));
        let detector = ForcedDegradation::new();

        let nodes = keypairs
            .into_iter()
            .zip(network_stubs)
            .map(|(keypair, network)| {
                let configuration = Configuration::builder()
                    .me(keypair)
                    .pool(pool.clone())
                    .chk_freq(options.chk_freq)
                    .perf_check_freq(options.perf_check_freq)
                    .view_change_timeout(options.view_change_timeout)
                    .log_events(true)
                    .max_batch_size(options.max_batch_size)
                    .max_master_latency(options.max_master_latency)
                    .min_backup_requests(options.min_backup_requests)
                    .build();

                NodeSpec::builder()
                    .app(CounterApp::new())
                    .network(network)
                    .ledgers(vec![
                        Ledger::new(POOL_LEDGER, MemStore::new()).unwrap(),
                        Ledger::new(DOMAIN_LEDGER, MemStore::new()).unwrap(),
                    ])
                    .configuration(configuration)
                    .degradation_detector(detector.clone())
                    .build()
                    .init()
                    .unwrap()
            })
            .collect::<Vec<TestNode>>();

        TestPool {
            ordered: vec![Vec::new(); nodes.len()],
            nodes,
            partition,
            detector,
        }
    }

    pub(crate) fn key(&self, idx: usize) -> VerifyingKey {
        self.nodes[idx].me()
    }

    /// Submit every request in `requests` to the nodes at `idxs`.
    pub(crate) fn submit_to(&mut self, idxs: impl IntoIterator<Item = usize>, requests: &[Request]) {
        for idx in idxs {
            for request in requests {
                self.nodes[idx].submit_request(request.clone()).unwrap();
            }
        }
    }

    pub(crate) fn submit_to_all(&mut self, requests: &[Request]) {
        self.submit_to(0..self.nodes.len(), requests)
    }

    /// Poll every node once, in order.
    pub(crate) fn poll(&mut self) {
        for (node, ordered) in self.nodes.iter_mut().zip(self.ordered.iter_mut()) {
            node.poll().unwrap();
            ordered.extend(node.ordered());
        }
    }

    /// Keep polling until `condition` holds.
    ///
    /// # Panics
    ///
    /// Panics if `condition` does not hold within [`RUN_TIMEOUT`].
    pub(crate) fn run_until(&mut self, description: &str, condition: impl Fn(&TestPool) -> bool) {
        log::debug!("Polling until {}.", description);
        let deadline = Instant::now() + RUN_TIMEOUT;
        loop {
            self.poll();
            if condition(self) {
                return;
            }
            if Instant::now() > deadline {
                panic!("Timed out polling until {}.", description);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Keep polling for `duration`, whatever happens.
    pub(crate) fn run_for(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            self.poll();
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Batches the master instance of the node at `idx` ordered, in order.
    pub(crate) fn ordered(&self, idx: usize) -> &[Ordered] {
        &self.ordered[idx]
    }

    /// Number of transactions committed to `ledger_id` on the node at `idx`.
    pub(crate) fn ledger_size(&self, idx: usize, ledger_id: LedgerId) -> u64 {
        self.nodes[idx].ledger(ledger_id).unwrap().size()
    }

    /// Whether every node in `idxs` committed exactly `size` transactions to `ledger_id`.
    pub(crate) fn all_have_ledger_size(
        &self,
        idxs: impl IntoIterator<Item = usize>,
        ledger_id: LedgerId,
        size: u64,
    ) -> bool {
        idxs.into_iter()
            .all(|idx| self.ledger_size(idx, ledger_id) == size)
    }

    /// Whether the instance `inst_id` of every node in `idxs` ordered exactly up to `pp_seq_no`.
    pub(crate) fn all_ordered_up_to(
        &self,
        idxs: impl IntoIterator<Item = usize>,
        inst_id: InstanceId,
        pp_seq_no: u64,
    ) -> bool {
        idxs.into_iter().all(|idx| {
            self.nodes[idx]
                .replica(inst_id)
                .is_some_and(|replica| replica.last_ordered().int() == pp_seq_no)
        })
    }
}

/// `count` distinct, valid requests to `ledger_id`, numbered from `first`.
pub(crate) fn requests(ledger_id: LedgerId, first: u64, count: u64) -> Vec<Request> {
    (first..first + count)
        .map(|req_id| Request::new(ledger_id, req_id, format!("txn-{}", req_id).into_bytes()))
        .collect()
}
