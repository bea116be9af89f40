use std::io::{self, Read, Write};
use std::path;
use std::time;

use tracing::{info, warn};

use super::listener::Listener;
use super::protocol::{Reply, Request, MSG_LEN};
use crate::control::AdmissionPort;
use crate::error::{PacerError, PacerResult};
use crate::shutdown::Shutdown;

// Bound on accept latency after shutdown is requested
const POLL_INTERVAL: time::Duration = time::Duration::from_millis(100);
// A client that connects but never writes must not stall admission
const CLIENT_TIMEOUT: time::Duration = time::Duration::from_secs(1);

/// Serves admission requests one connection at a time.
pub struct AdmissionServer {
    listener: Listener,
    port: AdmissionPort,
}

impl AdmissionServer {
    pub fn bind<P>(path: P, port: AdmissionPort) -> PacerResult<Self>
    where
        P: AsRef<path::Path>,
    {
        let listener = Listener::bind(path).map_err(PacerError::Admission)?;

        info!(path = %listener.path().display(), "admission server listening");

        Ok(Self { listener, port })
    }

    pub fn path(&self) -> &path::Path {
        self.listener.path()
    }

    /// Applies one request to the flow table and returns the reply for the client.
    pub fn handle(&mut self, message: &[u8]) -> Reply {
        let request = match Request::parse(message) {
            Ok(request) => request,
            Err(err) => {
                warn!(%err, "rejected admission request");
                return Reply::Unknown;
            }
        };

        match request {
            Request::Join => match self.port.join() {
                Ok(slot) => {
                    info!(slot, "flow joined");
                    Reply::Slot(slot)
                }
                Err(err) => {
                    warn!(%err, "rejected join");
                    Reply::Full
                }
            },
            Request::Quit(slot) => match self.port.quit(slot) {
                Ok(()) => {
                    info!(slot, "flow quit");
                    Reply::Ok
                }
                Err(err) => {
                    warn!(%err, "rejected quit");
                    Reply::BadSlot
                }
            },
            Request::Read => Reply::Peer,
        }
    }

    fn serve_connection(&mut self, mut stream: impl Read + Write) -> io::Result<()> {
        let mut message = [0u8; MSG_LEN];
        let mut len = 0;

        // A frame ends at a full 8 bytes, a NUL, a complete command or EOF. Clients may send a
        // short unpadded command and keep the connection open for the reply.
        while len < MSG_LEN {
            match stream.read(&mut message[len..])? {
                0 => break,
                n => len += n,
            }
            if message[..len].contains(&0) || Request::parse(&message[..len]).is_ok() {
                break;
            }
        }

        let reply = self.handle(&message[..len]);
        stream.write_all(&reply.to_bytes())
    }

    /// Waits up to `timeout` for one client and serves it. Returns Ok(false) if nobody connected.
    ///
    /// Failures on an accepted connection only affect that client; failures of the listening
    /// socket are returned.
    pub fn serve_one(&mut self, timeout: Option<time::Duration>) -> PacerResult<bool> {
        let stream = match self.listener.wait_for_connection(timeout) {
            Ok(Some(stream)) => stream,
            Ok(None) => return Ok(false),
            Err(err) => return Err(PacerError::Admission(err)),
        };

        let result = stream
            .set_read_timeout(Some(CLIENT_TIMEOUT))
            .and_then(|()| stream.set_write_timeout(Some(CLIENT_TIMEOUT)))
            .and_then(|()| self.serve_connection(&stream));

        if let Err(err) = result {
            warn!(%err, "admission connection failed");
        }

        Ok(true)
    }

    pub fn run(&mut self, shutdown: &Shutdown) -> PacerResult<()> {
        while !shutdown.is_triggered() {
            self.serve_one(Some(POLL_INTERVAL))?;
        }

        info!("admission server stopped");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::control::ControlBlock;
    use std::sync::Arc;

    fn server(max_flows: usize) -> (AdmissionServer, Arc<ControlBlock>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cb = ControlBlock::new(&Config {
            max_flows,
            ..Default::default()
        })
        .unwrap();
        let server =
            AdmissionServer::bind(dir.path().join("pacer.sock"), cb.admission_port().unwrap())
                .unwrap();

        (server, cb, dir)
    }

    #[test]
    fn join_and_quit() {
        let (mut server, cb, _dir) = server(4);

        assert_eq!(server.handle(b"join\0\0\0\0"), Reply::Slot(0));
        assert_eq!(server.handle(b"join\0\0\0\0"), Reply::Slot(1));
        assert!(cb.flow(1).unwrap().reserved);

        assert_eq!(server.handle(b"quit 0\0\0"), Reply::Ok);
        assert!(!cb.flow(0).unwrap().reserved);
        assert_eq!(server.handle(b"quit 0\0\0"), Reply::BadSlot);
        assert_eq!(server.handle(b"quit 77\0"), Reply::BadSlot);
    }

    #[test]
    fn full_table() {
        let (mut server, _cb, _dir) = server(1);

        assert_eq!(server.handle(b"join"), Reply::Slot(0));
        assert_eq!(server.handle(b"join"), Reply::Full);
    }

    #[test]
    fn other_messages() {
        let (mut server, cb, _dir) = server(4);

        assert_eq!(server.handle(b"read\0\0\0\0"), Reply::Peer);
        assert_eq!(server.handle(b"hello\0\0\0"), Reply::Unknown);
        assert_eq!(server.handle(b""), Reply::Unknown);
        assert!(!cb.rebalance_pending());
    }

    #[test]
    fn serves_a_connection() {
        let (mut server, _cb, _dir) = server(4);

        let mut client = std::os::unix::net::UnixStream::connect(server.path()).unwrap();
        client.write_all(b"join\0\0\0\0").unwrap();

        assert!(server.serve_one(Some(time::Duration::from_secs(5))).unwrap());

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, b"0");

        assert!(!server.serve_one(Some(time::Duration::from_millis(10))).unwrap());
    }

    #[test]
    fn short_command_on_open_connection() {
        let (mut server, cb, _dir) = server(4);

        let mut client = std::os::unix::net::UnixStream::connect(server.path()).unwrap();
        client.write_all(b"join").unwrap();

        // The write side stays open, the reply must not wait for EOF
        assert!(server.serve_one(Some(time::Duration::from_secs(5))).unwrap());

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, b"0");
        assert!(cb.flow(0).unwrap().reserved);
    }
}
