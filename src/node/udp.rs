//! The UDP duplex node (§4.6): the wire-facing endpoint. Ingress decodes
//! the 20-byte coded-protocol header and dispatches upward; egress stamps
//! the header (raw vs coded) and sends to the message's destination.

use crate::error::UdpError;
use crate::message::Message;
use crate::node::{Node, NodeKind, NodeState};
use crate::reactor::{events, Reactor};
use crate::wire::{PacType, PacketHeader, HEADER_LEN};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

const MAX_DATAGRAM: usize = 65536;

pub struct UdpNode {
    state: NodeState,
    socket: StdUdpSocket,
    flow_id: AtomicU64,
    file_id: AtomicU32,
}

impl UdpNode {
    pub fn bind(name: impl Into<String>, listen_port: u16) -> Result<Arc<Self>, UdpError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(UdpError::Create)?;
        socket.set_reuse_address(true).map_err(UdpError::Create)?;
        socket.set_reuse_port(true).map_err(UdpError::Create)?;
        socket.set_nonblocking(true).map_err(UdpError::Create)?;

        let addr: SocketAddr = ([0, 0, 0, 0], listen_port).into();
        socket
            .bind(&addr.into())
            .map_err(|source| UdpError::Bind { addr, source })?;

        let std_socket = StdUdpSocket::from(socket);

        Ok(Arc::new(UdpNode {
            state: NodeState::new(name, NodeKind::FullDuplex),
            socket: std_socket,
            flow_id: AtomicU64::new(1),
            file_id: AtomicU32::new(1),
        }))
    }

    pub fn register_with_reactor(self: &Arc<Self>, reactor: &Reactor) {
        let weak = Arc::downgrade(self);
        let fd = self.socket.as_raw_fd();
        reactor.register(
            fd,
            events::READABLE,
            -1,
            Box::new(move |_mask| {
                let Some(node) = weak.upgrade() else {
                    return;
                };
                node.drain_reads();
            }),
        );
    }

    fn drain_reads(&self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    let datagram = &buf[..n];
                    match PacketHeader::decode(datagram) {
                        Some(_header) => {
                            let msg = Message::new(n);
                            msg.reserve_header(0);
                            msg.fill(datagram);
                            msg.set_dst_addr(from);
                            self.dispatch(msg);
                        }
                        None => {
                            tracing::warn!(
                                node = self.state.name(),
                                "dropping datagram with malformed coded-protocol header"
                            );
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(node = self.state.name(), "udp recv error: {e}");
                    break;
                }
            }
        }
    }
}

impl Node for UdpNode {
    fn state(&self) -> &NodeState {
        &self.state
    }

    fn handle_msg(&self, _msg: Message) {
        tracing::error!(
            node = self.state.name(),
            "udp node received handle_msg; full-duplex nodes should only see fd_write"
        );
    }

    /// Stamps the 20-byte coded-protocol header — differently for coded vs
    /// raw messages — then sends to the destination carried in the
    /// message's metadata.
    fn fd_write(&self, msg: Message) {
        let Some(dst) = msg.dst_addr() else {
            tracing::warn!(node = self.state.name(), "dropping message with no destination address");
            return;
        };

        let payload = msg.payload_snapshot();
        let mut datagram = vec![0u8; HEADER_LEN + payload.len()];

        let header = if msg.needs_coded() {
            PacketHeader {
                flow_id: self.flow_id.fetch_add(1, Ordering::Relaxed),
                file_id: self.file_id.load(Ordering::Relaxed),
                batch_id: msg.seq(),
                pac_num: 1,
                pac_type: PacType::Coded,
            }
        } else {
            PacketHeader {
                flow_id: 0,
                file_id: 0,
                batch_id: 0,
                pac_num: 1,
                pac_type: PacType::Raw,
            }
        };
        header.encode_into(&mut datagram[..HEADER_LEN]);
        datagram[HEADER_LEN..].copy_from_slice(&payload);

        if let Err(e) = self.socket.send_to(&datagram, dst) {
            tracing::warn!(node = self.state.name(), "udp send failed: {e}");
        }
    }
}
