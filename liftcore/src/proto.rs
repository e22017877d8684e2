//! Wire protocol between cars, call clients and the controller.
//!
//! Every frame is a 2-byte unsigned big-endian length followed by that
//! many bytes of ASCII text, no terminator. The grammar is a handful of
//! space-separated messages:
//!
//! ```text
//! CAR <name> <lowest> <highest>        car registration (first frame)
//! STATUS <status> <current> <dest>     car state mirror
//! EMERGENCY                            car entered emergency mode
//! INDIVIDUAL SERVICE                   car left for manual service
//! FLOOR <target>                       controller target push
//! CALL <src> <dst>                     hall call request
//! CAR <name> / UNAVAILABLE             hall call reply
//! ```
//!
//! `CAR` is both the registration message and the positive call reply;
//! the reply form has no floor arguments, so the parse is unambiguous.

use std::io::{self, Read, Write};
use std::time::Duration;

use thiserror::Error;

use crate::floor::{Floor, FloorError};
use crate::shm::{self, CabStatus};

/// Largest frame body the 2-byte length prefix can carry.
pub const MAX_FRAME: usize = u16::MAX as usize;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("frame larger than {MAX_FRAME} bytes")]
    Oversize,
    #[error("unrecognised message: {0:?}")]
    BadMessage(String),
    #[error("bad floor in message: {0}")]
    BadFloor(#[from] FloorError),
    #[error("bad car name in message")]
    BadName,
    #[error("bad status in message")]
    BadStatus,
}

/// One parsed protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Register {
        name: String,
        lowest: Floor,
        highest: Floor,
    },
    Status {
        status: CabStatus,
        current: Floor,
        destination: Floor,
    },
    Emergency,
    IndividualService,
    Floor {
        target: Floor,
    },
    Call {
        from: Floor,
        to: Floor,
    },
    Assigned {
        name: String,
    },
    Unavailable,
}

impl Message {
    /// Parse one frame body.
    pub fn parse(text: &str) -> Result<Message, ProtoError> {
        let fields: Vec<&str> = text.split(' ').collect();
        match fields.as_slice() {
            ["CAR", name, lowest, highest] => {
                if !shm::valid_name(name) {
                    return Err(ProtoError::BadName);
                }
                Ok(Message::Register {
                    name: name.to_string(),
                    lowest: Floor::parse(lowest)?,
                    highest: Floor::parse(highest)?,
                })
            }
            ["CAR", name] => {
                if !shm::valid_name(name) {
                    return Err(ProtoError::BadName);
                }
                Ok(Message::Assigned {
                    name: name.to_string(),
                })
            }
            ["STATUS", status, current, destination] => Ok(Message::Status {
                status: status.parse().map_err(|_| ProtoError::BadStatus)?,
                current: Floor::parse(current)?,
                destination: Floor::parse(destination)?,
            }),
            ["EMERGENCY"] => Ok(Message::Emergency),
            ["INDIVIDUAL", "SERVICE"] => Ok(Message::IndividualService),
            ["FLOOR", target] => Ok(Message::Floor {
                target: Floor::parse(target)?,
            }),
            ["CALL", from, to] => Ok(Message::Call {
                from: Floor::parse(from)?,
                to: Floor::parse(to)?,
            }),
            ["UNAVAILABLE"] => Ok(Message::Unavailable),
            _ => Err(ProtoError::BadMessage(text.to_string())),
        }
    }

    /// Frame body for this message.
    pub fn encode(&self) -> String {
        match self {
            Message::Register {
                name,
                lowest,
                highest,
            } => format!("CAR {} {} {}", name, lowest, highest),
            Message::Status {
                status,
                current,
                destination,
            } => format!("STATUS {} {} {}", status, current, destination),
            Message::Emergency => "EMERGENCY".to_string(),
            Message::IndividualService => "INDIVIDUAL SERVICE".to_string(),
            Message::Floor { target } => format!("FLOOR {}", target),
            Message::Call { from, to } => format!("CALL {} {}", from, to),
            Message::Assigned { name } => format!("CAR {}", name),
            Message::Unavailable => "UNAVAILABLE".to_string(),
        }
    }
}

/// Write one frame, retrying interrupted and would-block writes.
pub fn write_frame<W: Write>(writer: &mut W, text: &str) -> io::Result<()> {
    if text.len() > MAX_FRAME {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "frame too long"));
    }
    let mut buf = Vec::with_capacity(2 + text.len());
    buf.extend_from_slice(&(text.len() as u16).to_be_bytes());
    buf.extend_from_slice(text.as_bytes());

    let mut written = 0;
    while written < buf.len() {
        match writer.write(&buf[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => return Err(e),
        }
    }
    writer.flush()
}

/// Read one frame.
///
/// Returns `Ok(None)` when the read times out before the first byte of a
/// frame arrives (a quiet peer) or when the peer has shut down cleanly at
/// a frame boundary. A timeout in the middle of a frame is an error: the
/// peer started a frame and stalled.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<String>> {
    let mut header = [0u8; 2];
    match read_full(reader, &mut header, true)? {
        ReadOutcome::Done => {}
        ReadOutcome::Quiet => return Ok(None),
    }

    let len = u16::from_be_bytes(header) as usize;
    let mut body = vec![0u8; len];
    read_full(reader, &mut body, false)?;

    String::from_utf8(body)
        .map(Some)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame is not valid text"))
}

enum ReadOutcome {
    Done,
    Quiet,
}

/// Fill `buf`, retrying interrupts. When `quiet_ok` holds, a timeout or
/// clean EOF before the first byte reports `Quiet` instead of an error.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8], quiet_ok: bool) -> io::Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 && quiet_ok {
                    return Ok(ReadOutcome::Quiet);
                }
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e)
                if filled == 0
                    && quiet_ok
                    && matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
            {
                return Ok(ReadOutcome::Quiet);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(ReadOutcome::Done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn floor(label: &str) -> Floor {
        Floor::parse(label).unwrap()
    }

    #[test]
    fn test_frame_round_trip() {
        let longest = "a".repeat(MAX_FRAME);
        for text in ["", "x", "CALL 3 7", longest.as_str()] {
            let mut wire = Vec::new();
            write_frame(&mut wire, text).unwrap();
            let mut cursor = Cursor::new(wire);
            assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), text);
        }
    }

    #[test]
    fn test_frame_rejects_oversize() {
        let mut wire = Vec::new();
        let text = "a".repeat(MAX_FRAME + 1);
        assert!(write_frame(&mut wire, &text).is_err());
    }

    #[test]
    fn test_frame_round_trip_over_tcp() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let echo = std::thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            let text = read_frame(&mut peer).unwrap().unwrap();
            write_frame(&mut peer, &text).unwrap();
        });

        let mut stream = std::net::TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        // Nothing sent yet: the poll comes back quiet.
        assert!(read_frame(&mut stream).unwrap().is_none());

        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        write_frame(&mut stream, "CALL 3 7").unwrap();
        assert_eq!(read_frame(&mut stream).unwrap().unwrap(), "CALL 3 7");
        echo.join().unwrap();
    }

    #[test]
    fn test_read_frame_on_clean_eof() {
        let mut cursor = Cursor::new(Vec::new());
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_read_frame_on_truncated_body() {
        let mut wire = Vec::new();
        write_frame(&mut wire, "STATUS").unwrap();
        wire.truncate(4);
        let mut cursor = Cursor::new(wire);
        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn test_message_round_trip() {
        let messages = [
            Message::Register {
                name: "A".to_string(),
                lowest: floor("B2"),
                highest: floor("10"),
            },
            Message::Status {
                status: CabStatus::Between,
                current: floor("3"),
                destination: floor("7"),
            },
            Message::Emergency,
            Message::IndividualService,
            Message::Floor { target: floor("B1") },
            Message::Call {
                from: floor("3"),
                to: floor("7"),
            },
            Message::Assigned {
                name: "A".to_string(),
            },
            Message::Unavailable,
        ];
        for msg in messages {
            assert_eq!(Message::parse(&msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn test_message_parse_rejects_malformed() {
        for text in [
            "",
            "NOPE",
            "CAR",
            "CAR a/b 1 2",
            "CAR A 0 9",
            "STATUS AJAR 1 2",
            "STATUS OPEN 1",
            "FLOOR",
            "FLOOR 01",
            "CALL 1",
            "CALL 1 2 3",
            "INDIVIDUAL",
        ] {
            assert!(Message::parse(text).is_err(), "accepted {:?}", text);
        }
    }
}
