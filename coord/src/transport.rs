use crate::id::Address;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use fnv::FnvHashMap;
use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;

/// Address of one multiplexed endpoint: the physical host address plus the
/// multiplex name the endpoint was opened under.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct LogicalAddress<A> {
    pub host: A,
    pub name: String,
}

/// A physical transport able to hand out named logical endpoints sharing one
/// underlying channel. Consumed capability; implementations live outside the
/// coordination core.
pub trait Multiplexer<A: Address>: Send + Sync + 'static {
    /// The physical address peers reach this process at.
    fn local_address(&self) -> A;

    /// Opens the logical endpoint registered under `name`.
    fn open(&self, name: &str) -> Result<Box<dyn MultiplexEndPoint<A>>>;
}

/// A point-to-point message endpoint. Delivery is best effort; the
/// coordination protocol treats every message as a hint.
#[async_trait]
pub trait MultiplexEndPoint<A: Address>: Send + Sync + 'static {
    fn local_address(&self) -> LogicalAddress<A>;

    async fn send(&self, msg: Vec<u8>, remote: &LogicalAddress<A>) -> Result<()>;

    /// Dequeues the next message together with its sender address.
    async fn receive(&self) -> Result<(Vec<u8>, LogicalAddress<A>)>;
}

type Inbox = mpsc::UnboundedSender<(Vec<u8>, LogicalAddress<String>)>;

/// An in-process network of loopback multiplexers, addressed by host name.
/// One instance simulates the fabric connecting a set of processes; each
/// [`LoopbackMultiplexer`] obtained from [`LoopbackNetwork::node`] plays the
/// role of one process's physical transport.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    endpoints: Arc<Mutex<FnvHashMap<(String, String), Inbox>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the multiplexer for the process at `host`.
    pub fn node(&self, host: impl Into<String>) -> LoopbackMultiplexer {
        LoopbackMultiplexer {
            host: host.into(),
            network: self.clone(),
        }
    }
}

/// Loopback transport provider for one simulated process.
#[derive(Clone)]
pub struct LoopbackMultiplexer {
    host: String,
    network: LoopbackNetwork,
}

impl Multiplexer<String> for LoopbackMultiplexer {
    fn local_address(&self) -> String {
        self.host.clone()
    }

    fn open(&self, name: &str) -> Result<Box<dyn MultiplexEndPoint<String>>> {
        let (tx, rx) = mpsc::unbounded();
        let address = LogicalAddress {
            host: self.host.clone(),
            name: name.to_owned(),
        };
        self.network
            .endpoints
            .lock()
            .insert((address.host.clone(), address.name.clone()), tx);
        Ok(Box::new(LoopbackEndPoint {
            address,
            network: self.network.clone(),
            rx: futures::lock::Mutex::new(rx),
        }))
    }
}

struct LoopbackEndPoint {
    address: LogicalAddress<String>,
    network: LoopbackNetwork,
    rx: futures::lock::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, LogicalAddress<String>)>>,
}

#[async_trait]
impl MultiplexEndPoint<String> for LoopbackEndPoint {
    fn local_address(&self) -> LogicalAddress<String> {
        self.address.clone()
    }

    async fn send(&self, msg: Vec<u8>, remote: &LogicalAddress<String>) -> Result<()> {
        let tx = self
            .network
            .endpoints
            .lock()
            .get(&(remote.host.clone(), remote.name.clone()))
            .cloned();
        let tx = tx.ok_or_else(|| anyhow!("no endpoint {} at {}", remote.name, remote.host))?;
        tx.unbounded_send((msg, self.address.clone()))
            .map_err(|_| anyhow!("endpoint {} at {} closed", remote.name, remote.host))?;
        Ok(())
    }

    async fn receive(&self) -> Result<(Vec<u8>, LogicalAddress<String>)> {
        self.rx
            .lock()
            .await
            .next()
            .await
            .ok_or_else(|| anyhow!("endpoint closed"))
    }
}

impl Drop for LoopbackEndPoint {
    fn drop(&mut self) {
        self.network
            .endpoints
            .lock()
            .remove(&(self.address.host.clone(), self.address.name.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[async_std::test]
    async fn routes_between_nodes() {
        let network = LoopbackNetwork::new();
        let a = network.node("a").open("ep-a").unwrap();
        let b = network.node("b").open("ep-b").unwrap();

        a.send(b"hello".to_vec(), &b.local_address()).await.unwrap();
        let (msg, from) = b.receive().await.unwrap();
        assert_eq!(msg, b"hello");
        assert_eq!(from, a.local_address());

        b.send(b"world".to_vec(), &from).await.unwrap();
        let (msg, _) = a.receive().await.unwrap();
        assert_eq!(msg, b"world");
    }

    #[async_std::test]
    async fn unknown_endpoint_errors() {
        let network = LoopbackNetwork::new();
        let a = network.node("a").open("ep-a").unwrap();
        let missing = LogicalAddress {
            host: "b".to_owned(),
            name: "nope".to_owned(),
        };
        assert!(a.send(b"x".to_vec(), &missing).await.is_err());
    }

    #[async_std::test]
    async fn dropped_endpoint_is_deregistered() {
        let network = LoopbackNetwork::new();
        let a = network.node("a").open("ep-a").unwrap();
        let b = network.node("b").open("ep-b").unwrap();
        let addr = b.local_address();
        drop(b);
        assert!(a.send(b"x".to_vec(), &addr).await.is_err());
    }
}
