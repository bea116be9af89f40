// Round trip probes over a connected UDP socket, standing in for a one-sided RDMA write when no
// RDMA transport is available.
//
// Both pacers bind a socket and connect it to the other: the server role binds `port` and talks
// to `port + 1`, the client role the other way around. Every probe carries a kind byte and a
// sequence number, padded to the probe size. Each side echoes the other's requests while polling
// for its own responses, so the two monitors serve as each other's reflector.

use std::io;
use std::net;
use std::time;

use super::{Completion, ProbeChannel};
use crate::config::ProbeConfig;

const SOCKET_POLLING_KEY: usize = 0;

const KIND_REQUEST: u8 = 0x01;
const KIND_RESPONSE: u8 = 0x02;
const HEADER_SIZE: usize = 9;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

pub struct UdpProbeChannel {
    // Non-blocking socket connected to the peer
    socket: net::UdpSocket,
    // Polling objects
    poller: polling::Poller,
    poller_events: polling::Events,
    // Always-allocated probe and receive buffers
    probe: Box<[u8]>,
    recv_buffer: Box<[u8]>,
    // Sequence number of the outstanding probe
    seq: u64,
    outstanding: Option<u64>,
}

impl UdpProbeChannel {
    pub fn connect(peer_host: &str, role: Role, config: &ProbeConfig) -> io::Result<Self> {
        let (local_port, remote_port) = match role {
            Role::Server => (config.port, config.port + 1),
            Role::Client => (config.port + 1, config.port),
        };

        Self::connect_ports(("0.0.0.0", local_port), (peer_host, remote_port), config.probe_size)
    }

    pub fn connect_ports<A, B>(
        bind_address: A,
        connect_address: B,
        probe_size: usize,
    ) -> io::Result<Self>
    where
        A: net::ToSocketAddrs,
        B: net::ToSocketAddrs,
    {
        let socket = net::UdpSocket::bind(bind_address)?;
        socket.set_nonblocking(true)?;
        socket.connect(connect_address)?;

        let poller = polling::Poller::new()?;

        unsafe {
            poller.add(&socket, polling::Event::readable(SOCKET_POLLING_KEY))?;
        }

        let probe_size = probe_size.max(HEADER_SIZE);

        Ok(Self {
            socket,
            poller,
            poller_events: polling::Events::new(),
            probe: vec![0; probe_size].into_boxed_slice(),
            recv_buffer: vec![0; probe_size.max(1472)].into_boxed_slice(),
            seq: 0,
            outstanding: None,
        })
    }

    pub fn local_addr(&self) -> io::Result<net::SocketAddr> {
        self.socket.local_addr()
    }
}

impl ProbeChannel for UdpProbeChannel {
    fn post_probe(&mut self) -> io::Result<()> {
        self.seq = self.seq.wrapping_add(1);

        self.probe[0] = KIND_REQUEST;
        self.probe[1..HEADER_SIZE].copy_from_slice(&self.seq.to_le_bytes());

        self.socket.send(&self.probe)?;
        self.outstanding = Some(self.seq);

        Ok(())
    }

    fn poll_completion(&mut self) -> io::Result<Option<Completion>> {
        loop {
            let len = match self.socket.recv(&mut self.recv_buffer) {
                Ok(len) => len,
                Err(err) => {
                    return match err.kind() {
                        // Nothing to read yet
                        io::ErrorKind::WouldBlock => Ok(None),
                        // ICMP port unreachable from a connected socket
                        io::ErrorKind::ConnectionRefused => {
                            self.outstanding = None;
                            Ok(Some(Completion::Failed("peer unreachable".into())))
                        }
                        _ => Err(err),
                    };
                }
            };

            if len < HEADER_SIZE {
                continue;
            }

            let kind = self.recv_buffer[0];
            let mut seq_bytes = [0u8; 8];
            seq_bytes.copy_from_slice(&self.recv_buffer[1..HEADER_SIZE]);
            let seq = u64::from_le_bytes(seq_bytes);

            match kind {
                KIND_REQUEST => {
                    self.recv_buffer[0] = KIND_RESPONSE;
                    // Best effort, the peer times the probe out if this is lost
                    let _ = self.socket.send(&self.recv_buffer[..len]);
                }
                KIND_RESPONSE if self.outstanding == Some(seq) => {
                    self.outstanding = None;
                    return Ok(Some(Completion::Success));
                }
                // Stale response or garbage
                _ => {}
            }
        }
    }

    fn wait(&mut self, timeout: time::Duration) -> io::Result<()> {
        // Wait for a readable event (must be done prior to each wait() call)
        self.poller
            .modify(&self.socket, polling::Event::readable(SOCKET_POLLING_KEY))?;

        self.poller_events.clear();
        self.poller.wait(&mut self.poller_events, Some(timeout))?;

        Ok(())
    }
}

impl Drop for UdpProbeChannel {
    fn drop(&mut self) {
        let _ = self.poller.delete(&self.socket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wait_for_completion(
        channel: &mut UdpProbeChannel,
        peer: &mut UdpProbeChannel,
    ) -> Completion {
        let deadline = time::Instant::now() + time::Duration::from_secs(5);

        while time::Instant::now() < deadline {
            if let Some(completion) = channel.poll_completion().unwrap() {
                return completion;
            }
            // The peer only reflects while polling
            assert_eq!(peer.poll_completion().unwrap(), None);
            channel.wait(time::Duration::from_millis(1)).unwrap();
        }

        panic!("probe never completed");
    }

    #[test]
    fn peers_reflect_each_other() {
        let mut a = UdpProbeChannel::connect_ports("127.0.0.1:0", "127.0.0.1:9", 64).unwrap();
        let mut b = UdpProbeChannel::connect_ports("127.0.0.1:0", a.local_addr().unwrap(), 64)
            .unwrap();
        a.socket.connect(b.local_addr().unwrap()).unwrap();

        for _ in 0..3 {
            a.post_probe().unwrap();
            assert_eq!(wait_for_completion(&mut a, &mut b), Completion::Success);

            b.post_probe().unwrap();
            assert_eq!(wait_for_completion(&mut b, &mut a), Completion::Success);
        }
    }
}
