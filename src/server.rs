use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::bail;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level, Span};
use uuid::Uuid;
use crate::config::{EndPointConfig, PrudpServerConfig};
use crate::end_point::PrudpEndPoint;
use crate::packet::{PacketFlags, PacketType, PrudpPacket};
use crate::send_pipeline::SendPipeline;
use crate::socket::{PacketSocket, SocketConnection};
use crate::util::mutex_map::MutexMap;

/// large enough for any UDP datagram
const RECEIVE_BUFFER_SIZE: usize = 65536;

/// The PRUDP server is the place where all other parts of the protocol come together: it
///  receives datagrams, decodes the packets in them and dispatches each packet to the endpoint
///  for its destination stream ID.
pub struct PrudpServer {
    config: Arc<PrudpServerConfig>,
    receive_socket: Option<Arc<UdpSocket>>,
    send_socket: Arc<dyn PacketSocket>,
    pipeline: Arc<SendPipeline>,
    sockets: Arc<MutexMap<SocketAddr, Arc<SocketConnection>>>,
    end_points: MutexMap<u8, Arc<PrudpEndPoint>>,
    shutdown_token: CancellationToken,
}

impl PrudpServer {
    /// Binds a UDP socket to the configured address. [PrudpServer::listen] starts receiving.
    pub async fn bind(config: PrudpServerConfig) -> anyhow::Result<Arc<PrudpServer>> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(config.bind_address).await?);
        info!("bound PRUDP socket to {:?}", UdpSocket::local_addr(&socket)?);

        let mut server = Self::new(config, Arc::new(socket.clone()));
        server.receive_socket = Some(socket);
        Ok(Arc::new(server))
    }

    /// A server that sends through the given socket and receives whatever is passed to
    ///  [PrudpServer::handle_datagram], e.g. by a WebSocket transport
    pub fn with_socket(config: PrudpServerConfig, socket: Arc<dyn PacketSocket>) -> anyhow::Result<Arc<PrudpServer>> {
        config.validate()?;
        Ok(Arc::new(Self::new(config, socket)))
    }

    fn new(config: PrudpServerConfig, send_socket: Arc<dyn PacketSocket>) -> PrudpServer {
        let config = Arc::new(config);
        PrudpServer {
            pipeline: Arc::new(SendPipeline::new(config.clone())),
            config,
            receive_socket: None,
            send_socket,
            sockets: Default::default(),
            end_points: MutexMap::new(),
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &PrudpServerConfig {
        &self.config
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.send_socket.local_addr()
    }

    /// Registers an endpoint for the configured stream ID
    pub fn bind_end_point(&self, config: EndPointConfig) -> anyhow::Result<Arc<PrudpEndPoint>> {
        config.validate()?;

        let stream_id = config.stream_id;
        let end_point = PrudpEndPoint::new(config, self.pipeline.clone(), self.sockets.clone());
        let (registered, created) = self.end_points.get_or_insert_with(stream_id, || end_point.clone());
        if !created {
            bail!("there is already an endpoint for stream ID {}", stream_id);
        }
        info!("bound endpoint for stream ID {}", stream_id);
        Ok(registered)
    }

    pub fn end_point(&self, stream_id: u8) -> Option<Arc<PrudpEndPoint>> {
        self.end_points.get(&stream_id)
    }

    /// number of client addresses with at least one connection
    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    /// Spawns `listener_count` receive loops on the UDP socket
    pub fn listen(self: &Arc<Self>) -> anyhow::Result<()> {
        let Some(socket) = self.receive_socket.clone() else {
            bail!("server has no UDP socket to listen on");
        };

        for _ in 0..self.config.listener_count {
            tokio::spawn(self.clone().recv_loop(socket.clone()));
        }
        Ok(())
    }

    async fn recv_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        info!("starting receive loop");

        let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
        loop {
            let (num_read, from) = tokio::select! {
                _ = self.shutdown_token.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(x) => x,
                    Err(e) => {
                        error!("socket error: {}", e);
                        continue;
                    }
                },
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "packet_received", ?correlation_id);
            self.handle_datagram(from, &buf[..num_read])
                .instrument(span)
                .await;
        }
        info!("receive loop stopped");
    }

    /// Decodes all packets in a datagram and processes each of them on its own task
    pub async fn handle_datagram(self: &Arc<Self>, from: SocketAddr, data: &[u8]) {
        trace!("received datagram from {:?}: {:?}", from, data);

        for decoded in PrudpPacket::decode_datagram(data, &self.config) {
            match decoded {
                Ok(packet) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.process_packet(from, packet).await;
                    }.instrument(Span::current()));
                }
                Err(e) => {
                    warn!("received unparsable packet from {:?}, dropping: {}", from, e);
                }
            }
        }
    }

    /// Routes a packet to the endpoint for its destination stream ID
    pub async fn process_packet(&self, from: SocketAddr, packet: PrudpPacket) {
        let Some(end_point) = self.end_points.get(&packet.destination.stream_id) else {
            debug!("no endpoint for stream ID {} - dropping packet from {:?}", packet.destination.stream_id, from);
            return;
        };

        let is_connection_request = packet.packet_type == PacketType::Syn && !packet.has_flag(PacketFlags::ACK);
        let socket = if is_connection_request {
            self.sockets.get_or_insert_with(from, || Arc::new(SocketConnection::new(from, self.send_socket.clone()))).0
        }
        else {
            match self.sockets.get(&from) {
                Some(socket) => socket,
                None => {
                    debug!("{:?} packet from unknown address {:?} - dropping", packet.packet_type, from);
                    return;
                }
            }
        };

        end_point.process_packet(socket, packet).await;
    }

    /// Stops the receive loops and cleans up all connections of all endpoints
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.shutdown_token.cancel();
        for end_point in self.end_points.values() {
            end_point.shutdown().await;
        }
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;
    use tokio::runtime::Builder;
    use tokio::time::sleep;
    use super::*;
    use crate::connection::ConnectionState;
    use crate::end_point::events::MockEndPointEvents;
    use crate::packet::tests::test_config;
    use crate::rmc::RmcMessage;
    use crate::test_util::{RecordingHandler, TestClient, TrackingPacketSocket};

    fn block_on<F: std::future::Future>(f: F) -> F::Output {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
            .block_on(f)
    }

    fn server() -> (Arc<PrudpServer>, Arc<TrackingPacketSocket>) {
        let socket = Arc::new(TrackingPacketSocket::new());
        let server = PrudpServer::with_socket(test_config("6f599f81"), socket.clone()).unwrap();
        (server, socket)
    }

    /// encodes the packets into one datagram and lets the spawned processing tasks run
    async fn receive(server: &Arc<PrudpServer>, from: SocketAddr, packets: &[PrudpPacket]) {
        let datagram = packets.iter()
            .flat_map(|p| p.encode(server.config()))
            .collect::<Vec<_>>();
        server.handle_datagram(from, &datagram).await;
        sleep(Duration::from_millis(1)).await;
    }

    #[test]
    fn test_bind_end_point() {
        let (server, _) = server();
        assert!(server.bind_end_point(EndPointConfig::new(1)).is_ok());
        assert!(server.bind_end_point(EndPointConfig::new(1)).is_err());
        assert!(server.end_point(1).is_some());
        assert!(server.end_point(2).is_none());
    }

    #[test]
    fn test_bind_and_listen_on_udp() {
        let mut config = test_config("6f599f81");
        config.bind_address = SocketAddr::from(([127, 0, 0, 1], 0));
        config.listener_count = 2;

        Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
            let server = PrudpServer::bind(config).await.unwrap();
            assert_ne!(server.local_addr().port(), 0);
            assert!(server.listen().is_ok());
            server.shutdown().await;
        });
    }

    #[test]
    fn test_listen_requires_udp_socket() {
        let (server, _) = server();
        assert!(server.listen().is_err());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = PrudpServerConfig::default_ipv4(60000);
        assert!(PrudpServer::with_socket(config, Arc::new(TrackingPacketSocket::new())).is_err());
    }

    #[test]
    fn test_handshake_and_request() {
        let (server, socket) = server();
        let end_point = server.bind_end_point(EndPointConfig::new(1)).unwrap();
        let handler = Arc::new(RecordingHandler::new(true));
        end_point.add_handler(handler.clone());

        let mut client = TestClient::new(SocketAddr::from(([10, 1, 2, 3], 4000)), Arc::new(test_config("6f599f81")));
        let from = client.address;

        block_on(async {
            receive(&server, from, &[client.syn()]).await;
            let sent = socket.sent();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].0, from);
            let syn_ack = PrudpPacket::decode_datagram(&sent[0].1, server.config()).remove(0).unwrap();
            client.accept_syn_ack(&syn_ack);

            receive(&server, from, &[client.connect(Vec::new())]).await;
            let connect_ack = socket.decode_sent(server.config()).remove(0);
            client.accept_connect_ack(&connect_ack);
            assert_eq!(server.socket_count(), 1);

            // two requests in one datagram
            let first = client.rmc_request(&RmcMessage::new_request(10, 1, 1, vec![1]));
            let second = client.rmc_request(&RmcMessage::new_request(10, 2, 2, vec![2]));
            receive(&server, from, &[first, second]).await;

            let call_ids = handler.messages().iter().map(|m| m.call_id).collect::<Vec<_>>();
            assert_eq!(call_ids, vec![1, 2]);
            assert_eq!(socket.decode_sent(server.config()).len(), 2);

            let connection = end_point.connections().remove(0);
            end_point.send_rmc(&connection, &RmcMessage::new_success(10, 1, 1, vec![7])).await.unwrap();
            let response = socket.decode_sent(server.config()).remove(0);
            let message = RmcMessage::from_bytes(&client.decrypt(&response), false, server.config().byte_stream_settings).unwrap();
            assert_eq!(message.parameters, vec![7]);

            server.shutdown().await;
        });
    }

    #[test]
    fn test_unknown_stream_and_garbage_are_dropped() {
        let (server, socket) = server();
        server.bind_end_point(EndPointConfig::new(1)).unwrap();
        let mut client = TestClient::new(SocketAddr::from(([10, 1, 2, 3], 4000)), Arc::new(test_config("6f599f81")));
        client.server_port.stream_id = 2;

        block_on(async {
            receive(&server, client.address, &[client.syn()]).await;
            server.handle_datagram(client.address, &[0xEA, 0xD0, 0x01]).await;
            sleep(Duration::from_millis(1)).await;

            assert!(socket.sent().is_empty());
            assert_eq!(server.socket_count(), 0);
        });
    }

    #[test]
    fn test_non_syn_from_unknown_address() {
        let (server, socket) = server();
        server.bind_end_point(EndPointConfig::new(1)).unwrap();
        let client = TestClient::new(SocketAddr::from(([10, 1, 2, 3], 4000)), Arc::new(test_config("6f599f81")));

        block_on(async {
            receive(&server, client.address, &[client.ping()]).await;
            assert!(socket.sent().is_empty());
            assert_eq!(server.socket_count(), 0);
        });
    }

    #[test]
    fn test_shutdown_ends_all_connections() {
        let (server, socket) = server();
        let mut events = MockEndPointEvents::new();
        events.expect_on_connect().return_const(());
        events.expect_on_connection_ended().times(2).return_const(());
        let events = Arc::new(events);

        let first = server.bind_end_point(EndPointConfig::new(1)).unwrap();
        first.add_handler(events.clone());
        let second = server.bind_end_point(EndPointConfig::new(2)).unwrap();
        second.add_handler(events);

        let mut first_client = TestClient::new(SocketAddr::from(([10, 1, 2, 3], 4000)), Arc::new(test_config("6f599f81")));
        let mut second_client = TestClient::new(SocketAddr::from(([10, 1, 2, 3], 4000)), Arc::new(test_config("6f599f81")));
        second_client.server_port.stream_id = 2;

        block_on(async {
            for client in [&mut first_client, &mut second_client] {
                receive(&server, client.address, &[client.syn()]).await;
                client.accept_syn_ack(&socket.decode_sent(server.config())[0]);
                receive(&server, client.address, &[client.connect(Vec::new())]).await;
                socket.sent();
            }
            // both connections share the client address
            assert_eq!(server.socket_count(), 1);
            let connection = first.connections().remove(0);

            server.shutdown().await;
            assert_eq!(first.connection_count(), 0);
            assert_eq!(second.connection_count(), 0);
            assert_eq!(server.socket_count(), 0);
            assert_eq!(connection.state(), ConnectionState::Disconnecting);
        });
    }
}
