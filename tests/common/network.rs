use std::{
    collections::{HashMap, HashSet},
    sync::{
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
};

use rbft_rs::{
    networking::{messages::Message, network::Network},
    types::crypto_primitives::VerifyingKey,
};

/// Nodes whose links are cut. Shared by every stub of a mock network.
#[derive(Clone, Default)]
pub(crate) struct Partition(Arc<Mutex<HashSet<VerifyingKey>>>);

impl Partition {
    /// Drop every message to and from `peer` from now on.
    pub(crate) fn disconnect(&self, peer: VerifyingKey) {
        self.0.lock().unwrap().insert(peer);
    }

    fn is_cut(&self, from: &VerifyingKey, to: &VerifyingKey) -> bool {
        let disconnected = self.0.lock().unwrap();
        disconnected.contains(from) || disconnected.contains(to)
    }
}

/// A mock network stub which passes messages between nodes using channels.
#[derive(Clone)]
pub(crate) struct NetworkStub {
    my_verifying_key: VerifyingKey,
    all_peers: HashMap<VerifyingKey, Sender<(VerifyingKey, Message)>>,
    inbox: Arc<Mutex<Receiver<(VerifyingKey, Message)>>>,
    partition: Partition,
}

impl Network for NetworkStub {
    fn send(&mut self, peer: VerifyingKey, message: Message) {
        if self.partition.is_cut(&self.my_verifying_key, &peer) {
            return;
        }
        if let Some(peer) = self.all_peers.get(&peer) {
            let _ = peer.send((self.my_verifying_key, message));
        }
    }

    fn broadcast(&mut self, message: Message) {
        for (verifying_key, peer) in &self.all_peers {
            if *verifying_key == self.my_verifying_key
                || self.partition.is_cut(&self.my_verifying_key, verifying_key)
            {
                continue;
            }
            let _ = peer.send((self.my_verifying_key, message.clone()));
        }
    }

    fn recv(&mut self) -> Option<(VerifyingKey, Message)> {
        match self.inbox.lock().unwrap().try_recv() {
            Ok(o_m) => Some(o_m),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => panic!(),
        }
    }
}

/// Create one connected stub per peer, in the order given, and the [`Partition`] that controls them.
pub(crate) fn mock_network(
    peers: impl Iterator<Item = VerifyingKey>,
) -> (Vec<NetworkStub>, Partition) {
    let partition = Partition::default();
    let mut all_peers = HashMap::new();
    let peer_and_inboxes: Vec<(VerifyingKey, Receiver<(VerifyingKey, Message)>)> = peers
        .map(|peer| {
            let (sender, receiver) = mpsc::channel();
            all_peers.insert(peer, sender);

            (peer, receiver)
        })
        .collect();

    let stubs = peer_and_inboxes
        .into_iter()
        .map(|(my_verifying_key, inbox)| NetworkStub {
            my_verifying_key,
            all_peers: all_peers.clone(),
            inbox: Arc::new(Mutex::new(inbox)),
            partition: partition.clone(),
        })
        .collect();
    (stubs, partition)
}
