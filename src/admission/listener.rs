use std::fs;
use std::io;
use std::os::unix::net;
use std::path;
use std::time;

const LISTENER_POLLING_KEY: usize = 0;

pub struct Listener {
    // Non-blocking listening socket
    listener: net::UnixListener,
    // Cached from socket initialization
    path: path::PathBuf,
    // Polling objects
    poller: polling::Poller,
    poller_events: polling::Events,
}

impl Listener {
    /// Binds a Unix stream socket at `path`, replacing a stale socket file left by a previous run.
    pub fn bind<P>(path: P) -> io::Result<Self>
    where
        P: AsRef<path::Path>,
    {
        let path = path.as_ref().to_path_buf();

        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }

        let listener = net::UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;

        let poller = polling::Poller::new()?;

        unsafe {
            poller.add(&listener, polling::Event::readable(LISTENER_POLLING_KEY))?;
        }

        Ok(Self {
            listener,
            path,
            poller,
            poller_events: polling::Events::new(),
        })
    }

    /// If a connection is pending, accepts it and returns a blocking stream. Returns Ok(None)
    /// otherwise.
    pub fn try_accept(&self) -> io::Result<Option<net::UnixStream>> {
        match self.listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                Ok(Some(stream))
            }
            Err(err) => match err.kind() {
                // The only acceptable error is WouldBlock, indicating no connection
                io::ErrorKind::WouldBlock => Ok(None),
                _ => Err(err),
            },
        }
    }

    /// Blocks for a duration of up to `timeout` for an incoming connection and accepts it.
    /// Returns Ok(None) if no connection arrived in the alloted time, or if polling awoke
    /// spuriously.
    pub fn wait_for_connection(
        &mut self,
        timeout: Option<time::Duration>,
    ) -> io::Result<Option<net::UnixStream>> {
        // Wait for a readable event (must be done prior to each wait() call)
        self.poller
            .modify(&self.listener, polling::Event::readable(LISTENER_POLLING_KEY))?;

        self.poller_events.clear();

        let n = match self.poller.wait(&mut self.poller_events, timeout) {
            Ok(n) => n,
            // A signal landed while waiting
            Err(err) if err.kind() == io::ErrorKind::Interrupted => 0,
            Err(err) => return Err(err),
        };

        if n > 0 {
            self.try_accept()
        } else {
            Ok(None)
        }
    }

    pub fn path(&self) -> &path::Path {
        &self.path
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = self.poller.delete(&self.listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("admission.sock");

        drop(Listener::bind(&path).unwrap());
        assert!(path.exists());

        let listener = Listener::bind(&path).unwrap();
        assert_eq!(listener.path(), path.as_path());
    }

    #[test]
    fn accepts_pending_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("admission.sock");
        let mut listener = Listener::bind(&path).unwrap();

        assert!(listener.try_accept().unwrap().is_none());
        assert!(listener
            .wait_for_connection(Some(time::Duration::from_millis(10)))
            .unwrap()
            .is_none());

        let _client = net::UnixStream::connect(&path).unwrap();
        let stream = listener
            .wait_for_connection(Some(time::Duration::from_secs(5)))
            .unwrap();
        assert!(stream.is_some());
    }
}
