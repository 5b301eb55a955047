use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{error, trace};
use crate::util::mutex_map::MutexMap;

/// This is an abstraction for sending a datagram, introduced to facilitate mocking the I/O part
///  away for testing. A WebSocket transport for PRUDP Lite plugs in here as well.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketSocket: Send + Sync + 'static {
    async fn send_to(&self, to: SocketAddr, data: &[u8]);

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl PacketSocket for Arc<UdpSocket> {
    async fn send_to(&self, to: SocketAddr, data: &[u8]) {
        trace!("UDP socket: sending {} bytes to {:?}", data.len(), to);

        if let Err(e) = self.as_ref().send_to(data, to).await {
            error!("error sending UDP datagram to {:?}: {}", to, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref().local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}


/// A client address as seen by the server. All virtual connections of the client (one per
///  endpoint it talks to) share it.
pub struct SocketConnection {
    address: SocketAddr,
    socket: Arc<dyn PacketSocket>,
    /// connection IDs by discriminator
    virtual_connections: MutexMap<(u8, String), u32>,
}

impl SocketConnection {
    pub fn new(address: SocketAddr, socket: Arc<dyn PacketSocket>) -> SocketConnection {
        SocketConnection {
            address,
            socket,
            virtual_connections: MutexMap::new(),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub async fn send(&self, data: &[u8]) {
        self.socket.send_to(self.address, data).await;
    }

    /// virtual connections are identified by the endpoint's stream ID and the client's port
    pub fn register(&self, stream_id: u8, discriminator: &str, connection_id: u32) {
        self.virtual_connections.set((stream_id, discriminator.to_string()), connection_id);
    }

    /// removes the virtual connection if it is still the registered one
    pub fn unregister(&self, stream_id: u8, discriminator: &str, connection_id: u32) {
        self.virtual_connections.delete_if(&(stream_id, discriminator.to_string()), |&id| id == connection_id);
    }

    pub fn virtual_connection_count(&self) -> usize {
        self.virtual_connections.len()
    }
}
