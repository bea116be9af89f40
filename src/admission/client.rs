// Sender side of the admission protocol: one connection per request.

use std::io::{Read, Write};
use std::os::unix::net;
use std::path;

use super::protocol::{Reply, Request};
use crate::error::{PacerError, PacerResult};

/// Sends one request to the admission server at `path` and waits for its reply.
pub fn request<P>(path: P, request: Request) -> PacerResult<Reply>
where
    P: AsRef<path::Path>,
{
    let frame = request.to_bytes()?;

    let mut stream = net::UnixStream::connect(path).map_err(PacerError::Admission)?;
    stream.write_all(&frame).map_err(PacerError::Admission)?;

    let mut reply = Vec::new();
    stream
        .read_to_end(&mut reply)
        .map_err(PacerError::Admission)?;

    if reply.is_empty() {
        return Err(PacerError::Protocol {
            message: "connection closed without a reply".into(),
        });
    }

    Reply::parse(&reply)
}

/// Asks for a slot. Returns the slot index.
pub fn join<P>(path: P) -> PacerResult<u16>
where
    P: AsRef<path::Path>,
{
    match request(path, Request::Join)? {
        Reply::Slot(slot) => Ok(slot),
        Reply::Full => Err(PacerError::Protocol {
            message: "admission refused, flow table full".into(),
        }),
        reply => Err(PacerError::Protocol {
            message: format!("unexpected reply {:?} to join", reply),
        }),
    }
}

/// Gives back a slot obtained from [`join`].
pub fn quit<P>(path: P, slot: u16) -> PacerResult<()>
where
    P: AsRef<path::Path>,
{
    match request(path, Request::Quit(slot))? {
        Reply::Ok => Ok(()),
        reply => Err(PacerError::Protocol {
            message: format!("unexpected reply {:?} to quit {}", reply, slot),
        }),
    }
}
