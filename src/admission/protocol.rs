// Admission messages are fixed 8-byte ASCII frames, padded with NUL. A frame ends at its first
// NUL, whatever follows it. Replies are unpadded ASCII.

use crate::error::{PacerError, PacerResult};

pub const MSG_LEN: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request {
    Join,
    Quit(u16),
    // Directional flag, answered by the remote pacer
    Read,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reply {
    Slot(u16),
    Ok,
    Full,
    BadSlot,
    Peer,
    Unknown,
}

fn trim(bytes: &[u8]) -> &[u8] {
    let bytes = match bytes.iter().position(|&b| b == 0) {
        Some(nul) => &bytes[..nul],
        None => bytes,
    };
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    &bytes[..end]
}

impl Request {
    pub fn parse(bytes: &[u8]) -> PacerResult<Self> {
        let text = std::str::from_utf8(trim(bytes)).map_err(|_| PacerError::Protocol {
            message: "request is not ASCII".into(),
        })?;

        match text.split_once(' ') {
            None if text == "join" => Ok(Self::Join),
            None if text == "read" => Ok(Self::Read),
            Some(("quit", slot)) => {
                let slot = slot.trim().parse::<u16>().map_err(|_| PacerError::Protocol {
                    message: format!("bad slot in {:?}", text),
                })?;
                Ok(Self::Quit(slot))
            }
            _ => Err(PacerError::Protocol {
                message: format!("unknown command {:?}", text),
            }),
        }
    }

    /// Encodes the request as one frame. Fails for slots past any valid table size, whose
    /// departure does not fit.
    pub fn to_bytes(&self) -> PacerResult<[u8; MSG_LEN]> {
        let text = match self {
            Self::Join => "join".to_string(),
            Self::Quit(slot) => format!("quit {}", slot),
            Self::Read => "read".to_string(),
        };

        if text.len() > MSG_LEN {
            return Err(PacerError::Protocol {
                message: format!("{:?} does not fit in {} bytes", text, MSG_LEN),
            });
        }

        let mut frame = [0u8; MSG_LEN];
        frame[..text.len()].copy_from_slice(text.as_bytes());
        Ok(frame)
    }
}

impl Reply {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Slot(slot) => slot.to_string().into_bytes(),
            Self::Ok => b"ok".to_vec(),
            Self::Full => b"ERR FULL".to_vec(),
            Self::BadSlot => b"ERR SLOT".to_vec(),
            Self::Peer => b"ERR PEER".to_vec(),
            Self::Unknown => b"ERR CMD".to_vec(),
        }
    }

    pub fn parse(bytes: &[u8]) -> PacerResult<Self> {
        match trim(bytes) {
            b"ok" => Ok(Self::Ok),
            b"ERR FULL" => Ok(Self::Full),
            b"ERR SLOT" => Ok(Self::BadSlot),
            b"ERR PEER" => Ok(Self::Peer),
            b"ERR CMD" => Ok(Self::Unknown),
            other => std::str::from_utf8(other)
                .ok()
                .and_then(|text| text.parse::<u16>().ok())
                .map(Self::Slot)
                .ok_or_else(|| PacerError::Protocol {
                    message: format!("unexpected reply {:?}", String::from_utf8_lossy(other)),
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_requests() {
        assert_eq!(Request::parse(b"join\0\0\0\0").unwrap(), Request::Join);
        assert_eq!(Request::parse(b"read").unwrap(), Request::Read);
        assert_eq!(Request::parse(b"join\n").unwrap(), Request::Join);
        assert_eq!(Request::parse(b"quit 17\0").unwrap(), Request::Quit(17));
        assert_eq!(Request::parse(b"quit 511").unwrap(), Request::Quit(511));
    }

    #[test]
    fn ignore_bytes_after_terminator() {
        assert_eq!(Request::parse(b"join\0\x7f\x13A").unwrap(), Request::Join);
        assert_eq!(Request::parse(b"read\0\xff\xfe").unwrap(), Request::Read);
        assert_eq!(Request::parse(b"quit 3\0x").unwrap(), Request::Quit(3));
        assert_eq!(Reply::parse(b"ok\0junk").unwrap(), Reply::Ok);
        assert!(Request::parse(b"\0join\0\0\0").is_err());
    }

    #[test]
    fn reject_malformed_requests() {
        let cases: [&[u8]; 7] = [
            b"jump\0\0\0\0",
            b"",
            b"quit",
            b"quit abc",
            b"quit -1",
            b"join 3",
            b"\xff\xfe",
        ];

        for bytes in cases {
            assert!(
                matches!(Request::parse(bytes), Err(PacerError::Protocol { .. })),
                "accepted {:?}",
                bytes
            );
        }
    }

    #[test]
    fn request_frames() {
        assert_eq!(&Request::Join.to_bytes().unwrap(), b"join\0\0\0\0");
        assert_eq!(&Request::Quit(42).to_bytes().unwrap(), b"quit 42\0");
        assert_eq!(&Request::Quit(999).to_bytes().unwrap(), b"quit 999");
        assert!(Request::Quit(1000).to_bytes().is_err());
    }

    #[test]
    fn replies() {
        assert_eq!(Reply::Slot(0).to_bytes(), b"0");
        assert_eq!(Reply::Slot(511).to_bytes(), b"511");
        assert_eq!(Reply::parse(b"511").unwrap(), Reply::Slot(511));
        assert_eq!(Reply::parse(b"ERR FULL").unwrap(), Reply::Full);
        assert_eq!(Reply::parse(b"ok").unwrap(), Reply::Ok);
        assert!(Reply::parse(b"what").is_err());

        for reply in [Reply::Full, Reply::BadSlot, Reply::Peer, Reply::Unknown] {
            assert!(reply.to_bytes().len() <= MSG_LEN);
        }
    }
}
