//! UDP transport
//!
//! A receiver task classifies incoming datagrams and forwards them to the
//! tick loop; a sender task drains the outgoing queue so the tick loop never
//! awaits the socket.

use crate::error::ServerError;
use log::{debug, error, warn};
use shared::packet::{connless_packet, parse_packet, RawPacket, MAX_PACKET_SIZE};
use shared::Datagram;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Messages delivered to the tick loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { datagram: Datagram, addr: SocketAddr },
    Connless { body: Vec<u8>, addr: SocketAddr },
    ConsoleLine(String),
    Shutdown,
}

#[derive(Debug)]
struct Outgoing {
    data: Vec<u8>,
    addr: SocketAddr,
}

pub struct Transport {
    socket: Arc<UdpSocket>,
    out_tx: mpsc::UnboundedSender<Outgoing>,
    out_rx: Option<mpsc::UnboundedReceiver<Outgoing>>,
}

impl Transport {
    pub async fn bind(addr: &str) -> Result<Self, ServerError> {
        let socket = UdpSocket::bind(addr).await.map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        Ok(Self {
            socket: Arc::new(socket),
            out_tx,
            out_rx: Some(out_rx),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.socket.local_addr()?)
    }

    /// Starts the receiver and sender tasks. Calling it again does nothing.
    pub fn spawn(&mut self, server_tx: mpsc::UnboundedSender<ServerMessage>) {
        let Some(mut out_rx) = self.out_rx.take() else {
            return;
        };

        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            let mut buffer = [0u8; MAX_PACKET_SIZE + 1];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let message = match parse_packet(&buffer[..len]) {
                            Ok(RawPacket::Connless(body)) => ServerMessage::Connless {
                                body: body.to_vec(),
                                addr,
                            },
                            Ok(RawPacket::Routed(datagram)) => ServerMessage::PacketReceived { datagram, addr },
                            Err(e) => {
                                debug!("dropping malformed packet from {}: {}", addr, e);
                                continue;
                            }
                        };
                        if server_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // ICMP port unreachable from a vanished client shows up here
                        warn!("error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
            debug!("network receiver stopped");
        });

        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            while let Some(Outgoing { data, addr }) = out_rx.recv().await {
                if let Err(e) = socket.send_to(&data, addr).await {
                    error!("failed to send packet to {}: {}", addr, e);
                }
            }
        });
    }

    pub fn send(&self, addr: SocketAddr, datagram: &Datagram) {
        match datagram.encode() {
            Ok(data) => self.queue(addr, data),
            Err(e) => error!("failed to encode packet for {}: {}", addr, e),
        }
    }

    pub fn send_connless(&self, addr: SocketAddr, preamble: &[u8; 8], body: &[u8]) {
        self.queue(addr, connless_packet(preamble, body));
    }

    fn queue(&self, addr: SocketAddr, data: Vec<u8>) {
        if data.len() > MAX_PACKET_SIZE {
            warn!("dropping oversized packet ({} bytes) to {}", data.len(), addr);
            return;
        }
        if self.out_tx.send(Outgoing { data, addr }).is_err() {
            error!("network sender is gone, packet to {} lost", addr);
        }
    }
}
