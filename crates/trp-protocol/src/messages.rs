use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use thiserror::Error;

use crate::frame::{Frame, FrameKind};

/// Identifier of a visitor within one session
pub type VisitorId = u64;

/// Non-fatal protocol violations, reported per message
///
/// The offending message is dropped; the connection stays open unless
/// [`ProtocolError::is_fatal`] says otherwise.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unknown package type: {0}")]
    UnknownType(i32),

    #[error("{0:?} frame received without a VISITOR tag")]
    Untagged(FrameKind),

    #[error("VISITOR {visitor_id} followed by {kind:?}, expected NEW_VISITOR, CLOSE_VISITOR or DATA")]
    UnexpectedFollowUp { visitor_id: VisitorId, kind: FrameKind },

    #[error("Invalid visitor id: {0:?}")]
    InvalidVisitorId(String),

    #[error("Invalid port mapping: {0:?}")]
    InvalidPorts(String),
}

impl ProtocolError {
    /// Whether the session cannot continue after this violation
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::InvalidPorts(_))
    }
}

/// Port mapping requested by a client: expose `remote` on the server and
/// forward it to `local` on the client side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub remote: u16,
    pub local: u16,
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.remote, self.local)
    }
}

impl FromStr for PortMapping {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidPorts(s.to_string());
        let (remote, local) = s.split_once(':').ok_or_else(invalid)?;
        Ok(Self {
            remote: parse_decimal(remote).ok_or_else(invalid)?,
            local: parse_decimal(local).ok_or_else(invalid)?,
        })
    }
}

/// Strict decimal parse: ASCII digits only, no sign or whitespace
fn parse_decimal<T: FromStr>(s: &str) -> Option<T> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn parse_visitor_id(payload: &[u8]) -> Result<VisitorId, ProtocolError> {
    std::str::from_utf8(payload)
        .ok()
        .and_then(parse_decimal::<VisitorId>)
        .ok_or_else(|| {
            ProtocolError::InvalidVisitorId(String::from_utf8_lossy(payload).into_owned())
        })
}

/// A complete control-plane message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Request to expose a port
    Ports(PortMapping),
    /// Keepalive
    Heartbeat,
    /// A visitor connected to the exposed port
    NewVisitor(VisitorId),
    /// A visitor connection was closed
    CloseVisitor(VisitorId),
    /// Bytes belonging to a visitor
    Data { visitor_id: VisitorId, data: Bytes },
}

impl ControlMessage {
    /// The visitor this message is tagged with, if any
    pub fn visitor_id(&self) -> Option<VisitorId> {
        match self {
            ControlMessage::NewVisitor(id) | ControlMessage::CloseVisitor(id) => Some(*id),
            ControlMessage::Data { visitor_id, .. } => Some(*visitor_id),
            ControlMessage::Ports(_) | ControlMessage::Heartbeat => None,
        }
    }

    /// Split into the optional `VISITOR` tag frame and the frame it qualifies
    pub fn into_frames(self) -> (Option<Frame>, Frame) {
        let tag = self
            .visitor_id()
            .map(|id| Frame::new(FrameKind::Visitor, id.to_string().into_bytes()));

        let frame = match self {
            ControlMessage::Ports(mapping) => {
                Frame::new(FrameKind::Ports, mapping.to_string().into_bytes())
            }
            ControlMessage::Heartbeat => Frame::empty(FrameKind::Heartbeat),
            ControlMessage::NewVisitor(_) => Frame::empty(FrameKind::NewVisitor),
            ControlMessage::CloseVisitor(_) => Frame::empty(FrameKind::CloseVisitor),
            ControlMessage::Data { data, .. } => Frame::new(FrameKind::Data, data),
        };

        (tag, frame)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    AwaitingFollowUp(VisitorId),
    /// The tag was malformed; its follow-up frame is swallowed
    Discarding,
}

/// Assembles decoded frames into control messages
///
/// A `VISITOR` frame is never a message on its own: the sequencer remembers
/// the id and pairs it with the next frame, which must be `NEW_VISITOR`,
/// `CLOSE_VISITOR` or `DATA`.
#[derive(Debug)]
pub struct Sequencer {
    state: State,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequencer {
    pub fn new() -> Self {
        Self { state: State::Idle }
    }

    /// Visitor id whose follow-up frame is still expected
    pub fn awaiting(&self) -> Option<VisitorId> {
        match self.state {
            State::AwaitingFollowUp(id) => Some(id),
            _ => None,
        }
    }

    /// Feed one frame, yielding a message once one is complete
    pub fn push(&mut self, frame: Frame) -> Result<Option<ControlMessage>, ProtocolError> {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => self.push_top_level(frame),
            State::Discarding => Ok(None),
            State::AwaitingFollowUp(visitor_id) => match frame.kind {
                FrameKind::NewVisitor => Ok(Some(ControlMessage::NewVisitor(visitor_id))),
                FrameKind::CloseVisitor => Ok(Some(ControlMessage::CloseVisitor(visitor_id))),
                FrameKind::Data => Ok(Some(ControlMessage::Data {
                    visitor_id,
                    data: frame.payload,
                })),
                kind => Err(ProtocolError::UnexpectedFollowUp { visitor_id, kind }),
            },
        }
    }

    fn push_top_level(&mut self, frame: Frame) -> Result<Option<ControlMessage>, ProtocolError> {
        match frame.kind {
            FrameKind::Ports => {
                let raw = String::from_utf8_lossy(&frame.payload);
                raw.parse().map(|mapping| Some(ControlMessage::Ports(mapping)))
            }
            FrameKind::Heartbeat => Ok(Some(ControlMessage::Heartbeat)),
            FrameKind::Visitor => match parse_visitor_id(&frame.payload) {
                Ok(id) => {
                    self.state = State::AwaitingFollowUp(id);
                    Ok(None)
                }
                Err(e) => {
                    self.state = State::Discarding;
                    Err(e)
                }
            },
            kind @ (FrameKind::Data | FrameKind::NewVisitor | FrameKind::CloseVisitor) => {
                Err(ProtocolError::Untagged(kind))
            }
            FrameKind::Unknown(n) => Err(ProtocolError::UnknownType(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(id: &str) -> Frame {
        Frame::new(FrameKind::Visitor, id.as_bytes().to_vec())
    }

    #[test]
    fn test_port_mapping_parse() {
        let mapping: PortMapping = "7080:9090".parse().unwrap();
        assert_eq!(mapping, PortMapping { remote: 7080, local: 9090 });
        assert_eq!(mapping.to_string(), "7080:9090");
    }

    #[test]
    fn test_port_mapping_rejects_malformed() {
        let malformed = [
            "", "7080", "7080:", ":9090", "a:1", "1:-2", " 1:2", "70000:1", "1:2:3", "+1:2",
        ];
        for raw in malformed {
            assert!(
                matches!(raw.parse::<PortMapping>(), Err(ProtocolError::InvalidPorts(_))),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_tagged_data_is_paired() {
        let mut seq = Sequencer::new();
        assert_eq!(seq.push(tag("3")).unwrap(), None);
        assert_eq!(seq.awaiting(), Some(3));

        let msg = seq
            .push(Frame::new(FrameKind::Data, &b"payload"[..]))
            .unwrap()
            .unwrap();
        assert_eq!(
            msg,
            ControlMessage::Data {
                visitor_id: 3,
                data: Bytes::from_static(b"payload"),
            }
        );
        assert_eq!(seq.awaiting(), None);
    }

    #[test]
    fn test_new_and_close_are_paired() {
        let mut seq = Sequencer::new();
        seq.push(tag("0")).unwrap();
        assert_eq!(
            seq.push(Frame::empty(FrameKind::NewVisitor)).unwrap(),
            Some(ControlMessage::NewVisitor(0))
        );
        seq.push(tag("0")).unwrap();
        assert_eq!(
            seq.push(Frame::empty(FrameKind::CloseVisitor)).unwrap(),
            Some(ControlMessage::CloseVisitor(0))
        );
    }

    #[test]
    fn test_unexpected_follow_up_is_dropped() {
        let mut seq = Sequencer::new();
        seq.push(tag("5")).unwrap();
        let err = seq.push(Frame::empty(FrameKind::Heartbeat)).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::UnexpectedFollowUp {
                visitor_id: 5,
                kind: FrameKind::Heartbeat
            }
        );
        assert!(!err.is_fatal());

        // Back to idle: the next heartbeat is a message of its own
        assert_eq!(
            seq.push(Frame::empty(FrameKind::Heartbeat)).unwrap(),
            Some(ControlMessage::Heartbeat)
        );
    }

    #[test]
    fn test_malformed_visitor_id_discards_follow_up() {
        let mut seq = Sequencer::new();
        for raw in ["", "-1", "abc", " 4", "1.5"] {
            let err = seq.push(tag(raw)).unwrap_err();
            assert!(matches!(err, ProtocolError::InvalidVisitorId(_)));
            assert_eq!(seq.push(Frame::new(FrameKind::Data, &b"x"[..])).unwrap(), None);
        }
        assert_eq!(
            seq.push(Frame::empty(FrameKind::Heartbeat)).unwrap(),
            Some(ControlMessage::Heartbeat)
        );
    }

    #[test]
    fn test_untagged_and_unknown_frames() {
        let mut seq = Sequencer::new();
        assert_eq!(
            seq.push(Frame::new(FrameKind::Data, &b"x"[..])).unwrap_err(),
            ProtocolError::Untagged(FrameKind::Data)
        );
        assert_eq!(
            seq.push(Frame::empty(FrameKind::Unknown(12))).unwrap_err(),
            ProtocolError::UnknownType(12)
        );
    }

    #[test]
    fn test_malformed_ports_is_fatal() {
        let mut seq = Sequencer::new();
        let err = seq
            .push(Frame::new(FrameKind::Ports, &b"7080-9090"[..]))
            .unwrap_err();
        assert!(err.is_fatal());

        assert_eq!(
            seq.push(Frame::new(FrameKind::Ports, &b"7080:9090"[..])).unwrap(),
            Some(ControlMessage::Ports(PortMapping { remote: 7080, local: 9090 }))
        );
    }

    #[test]
    fn test_into_frames() {
        let (tag_frame, frame) = ControlMessage::CloseVisitor(42).into_frames();
        assert_eq!(tag_frame, Some(tag("42")));
        assert_eq!(frame, Frame::empty(FrameKind::CloseVisitor));

        let (tag_frame, frame) = ControlMessage::Heartbeat.into_frames();
        assert_eq!(tag_frame, None);
        assert_eq!(frame, Frame::empty(FrameKind::Heartbeat));
    }
}
