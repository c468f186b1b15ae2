use bytes::Bytes;

/// Size of the fixed frame header (length + type)
pub const HEADER_LEN: usize = 8;

/// Maximum payload size of a single frame (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Frame type as carried in the header
///
/// The numeric values are positional and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Port mapping request (`"<remote>:<local>"`), client to server
    Ports,
    /// Client liveness signal
    Heartbeat,
    /// Raw visitor bytes
    Data,
    /// Visitor tag, payload is the decimal visitor id
    Visitor,
    /// A visitor connected on the public port
    NewVisitor,
    /// A visitor connection was closed
    CloseVisitor,
    /// Any type number this implementation does not know
    Unknown(i32),
}

impl FrameKind {
    /// Whether this kind may follow a `VISITOR` frame
    pub fn is_follow_up(self) -> bool {
        matches!(
            self,
            FrameKind::Data | FrameKind::NewVisitor | FrameKind::CloseVisitor
        )
    }
}

impl From<i32> for FrameKind {
    fn from(value: i32) -> Self {
        match value {
            0 => FrameKind::Ports,
            1 => FrameKind::Heartbeat,
            2 => FrameKind::Data,
            3 => FrameKind::Visitor,
            4 => FrameKind::NewVisitor,
            5 => FrameKind::CloseVisitor,
            other => FrameKind::Unknown(other),
        }
    }
}

impl From<FrameKind> for i32 {
    fn from(kind: FrameKind) -> Self {
        match kind {
            FrameKind::Ports => 0,
            FrameKind::Heartbeat => 1,
            FrameKind::Data => 2,
            FrameKind::Visitor => 3,
            FrameKind::NewVisitor => 4,
            FrameKind::CloseVisitor => 5,
            FrameKind::Unknown(other) => other,
        }
    }
}

/// A single frame on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// A frame with no payload
    pub fn empty(kind: FrameKind) -> Self {
        Self {
            kind,
            payload: Bytes::new(),
        }
    }

    /// Encoded size of this frame including the header
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}
