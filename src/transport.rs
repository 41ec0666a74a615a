//! Peer-to-peer call interface, and an in-process implementation of it.
//!
//! The replication core only ever talks to peers through [`PeerTransport`]:
//! a blocking point-to-point call that either returns the peer's reply or
//! fails within the transport's timeout. A production deployment supplies
//! its own wire transport (the message types are serde-ready); the
//! [`LocalNetwork`] here connects a cluster within one process and doubles
//! as the fault-injection harness the protocol tests run against.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::replica::{PeerReply, PeerRequest, Replica, ReplicaId};
use crate::utils::ViewstampedError;

use async_trait::async_trait;

use tokio::time::{timeout, Duration};

/// Point-to-point call primitive to cluster peers. Any delivery failure
/// (timeout, unreachable peer, lost request or reply) surfaces as an
/// `Err`; the core never distinguishes the causes and simply does not
/// count the peer toward quorum.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Sends a request to given peer and waits for its reply, bounded by
    /// the transport's timeout.
    async fn call(
        &self,
        peer: ReplicaId,
        req: PeerRequest,
    ) -> Result<PeerReply, ViewstampedError>;
}

/// In-process network connecting a cluster of replicas. Calls are handed
/// straight to the target replica's handlers on spawned tasks, so a caller
/// abandoning a slow call never cancels the target's processing of it.
/// Crashed replicas and severed links make calls fail, which is how the
/// tests inject crash and partition faults.
pub struct LocalNetwork {
    /// Cluster size (total number of replicas).
    population: u8,

    /// Per-call delivery timeout.
    call_timeout: Duration,

    /// Map from replica ID -> live replica handle.
    replicas: RwLock<HashMap<ReplicaId, Arc<Replica>>>,

    /// Links currently severed, stored as ordered ID pairs.
    severed: RwLock<HashSet<(ReplicaId, ReplicaId)>>,
}

impl LocalNetwork {
    /// Creates a new in-process network for a cluster of given population.
    pub fn new(population: u8, call_timeout: Duration) -> Arc<Self> {
        if population == 0 {
            panic!("invalid population {}", population);
        }
        Arc::new(LocalNetwork {
            population,
            call_timeout,
            replicas: RwLock::new(HashMap::new()),
            severed: RwLock::new(HashSet::new()),
        })
    }

    /// Makes a transport endpoint bound to given replica ID, to be handed
    /// to that replica at construction.
    pub fn endpoint(self: &Arc<Self>, me: ReplicaId) -> Arc<LocalEndpoint> {
        if me >= self.population {
            panic!("invalid replica ID {} in population {}", me,
                   self.population);
        }
        Arc::new(LocalEndpoint {
            me,
            net: self.clone(),
        })
    }

    /// Puts a replica on the network, making it reachable by peers. A
    /// replica re-registered under the same ID replaces the old one.
    pub fn register(&self, replica: Arc<Replica>) {
        let id = replica.id();
        self.replicas
            .write()
            .expect("replicas lock poisoned")
            .insert(id, replica);
    }

    /// Takes a replica off the network, simulating a crash: all calls to
    /// and from it fail from now on. Returns the removed handle so tests
    /// can still inspect (and shut down) the crashed replica's state.
    pub fn crash(&self, id: ReplicaId) -> Option<Arc<Replica>> {
        self.replicas
            .write()
            .expect("replicas lock poisoned")
            .remove(&id)
    }

    /// Severs the link between two replicas in both directions.
    pub fn cut(&self, a: ReplicaId, b: ReplicaId) {
        self.severed
            .write()
            .expect("severed lock poisoned")
            .insert(Self::link(a, b));
    }

    /// Restores the link between two replicas.
    pub fn heal(&self, a: ReplicaId, b: ReplicaId) {
        self.severed
            .write()
            .expect("severed lock poisoned")
            .remove(&Self::link(a, b));
    }

    /// Restores all severed links.
    pub fn heal_all(&self) {
        self.severed
            .write()
            .expect("severed lock poisoned")
            .clear();
    }

    /// Isolates a replica from every peer, without taking it off the
    /// network: it stays alive but all its links are severed.
    pub fn isolate(&self, id: ReplicaId) {
        for peer in (0..self.population).filter(|&p| p != id) {
            self.cut(id, peer);
        }
    }

    #[inline]
    fn link(a: ReplicaId, b: ReplicaId) -> (ReplicaId, ReplicaId) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    /// Resolves the target of a call, provided both ends are alive and the
    /// link between them is intact.
    fn route(&self, from: ReplicaId, to: ReplicaId) -> Option<Arc<Replica>> {
        if self
            .severed
            .read()
            .expect("severed lock poisoned")
            .contains(&Self::link(from, to))
        {
            return None;
        }
        let replicas = self.replicas.read().expect("replicas lock poisoned");
        if !replicas.contains_key(&from) {
            return None; // caller itself has crashed
        }
        replicas.get(&to).cloned()
    }
}

/// One replica's view of a [`LocalNetwork`].
pub struct LocalEndpoint {
    /// The replica ID this endpoint is bound to.
    me: ReplicaId,

    /// The network this endpoint belongs to.
    net: Arc<LocalNetwork>,
}

#[async_trait]
impl PeerTransport for LocalEndpoint {
    async fn call(
        &self,
        peer: ReplicaId,
        req: PeerRequest,
    ) -> Result<PeerReply, ViewstampedError> {
        let Some(target) = self.net.route(self.me, peer) else {
            return Err(ViewstampedError(format!(
                "peer {} unreachable",
                peer
            )));
        };

        // the handler runs on its own task so that dropping this call
        // future (e.g. after quorum) does not cancel it mid-processing
        let handle =
            tokio::spawn(async move { target.handle_request(req).await });
        match timeout(self.net.call_timeout, handle).await {
            Ok(joined) => joined?,
            Err(_) => Err(ViewstampedError(format!(
                "call to peer {} timed out",
                peer
            ))),
        }
    }
}

#[cfg(test)]
mod transport_tests {
    use super::*;
    use crate::replica::{Command, PrepareArgs};

    async fn two_replica_net(
    ) -> Result<(Arc<LocalNetwork>, Arc<Replica>, Arc<Replica>), ViewstampedError>
    {
        let net = LocalNetwork::new(3, Duration::from_millis(100));
        let r0 =
            Replica::new_and_setup(0, 3, 0, net.endpoint(0), None).await?;
        let r1 =
            Replica::new_and_setup(1, 3, 0, net.endpoint(1), None).await?;
        net.register(r0.clone());
        net.register(r1.clone());
        Ok((net, r0, r1))
    }

    fn prepare_req(index: usize) -> PeerRequest {
        PeerRequest::Prepare(PrepareArgs {
            view: 0,
            primary_commit: 0,
            index,
            entry: Command::from("hello"),
        })
    }

    #[tokio::test]
    async fn delivers_calls() -> Result<(), ViewstampedError> {
        let (net, _r0, _r1) = two_replica_net().await?;
        let endpoint = net.endpoint(0);
        let reply = endpoint.call(1, prepare_req(1)).await?;
        match reply {
            PeerReply::Prepare(reply) => assert!(reply.success),
            _ => panic!("wrong reply type"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn unregistered_peer_unreachable() -> Result<(), ViewstampedError>
    {
        let (net, _r0, _r1) = two_replica_net().await?;
        let endpoint = net.endpoint(0);
        assert!(endpoint.call(2, prepare_req(1)).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn cut_and_heal_links() -> Result<(), ViewstampedError> {
        let (net, _r0, _r1) = two_replica_net().await?;
        let endpoint = net.endpoint(0);
        net.cut(0, 1);
        assert!(endpoint.call(1, prepare_req(1)).await.is_err());
        net.heal(0, 1);
        assert!(endpoint.call(1, prepare_req(1)).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn crashed_replica_unreachable() -> Result<(), ViewstampedError> {
        let (net, _r0, r1) = two_replica_net().await?;
        let endpoint = net.endpoint(0);
        let crashed = net.crash(1);
        assert!(crashed.is_some());
        assert!(endpoint.call(1, prepare_req(1)).await.is_err());
        // a crashed caller cannot reach anyone either
        let lame = net.endpoint(1);
        assert!(lame.call(0, prepare_req(1)).await.is_err());
        r1.shutdown().await?;
        Ok(())
    }
}
