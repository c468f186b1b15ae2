//! Wire protocol for trp reverse tunnels
//!
//! A control connection carries length-prefixed, typed frames. Frames that
//! belong to a visitor are "tagged": a `VISITOR` frame carrying the decimal
//! visitor id is immediately followed by the `NEW_VISITOR`, `CLOSE_VISITOR`
//! or `DATA` frame it qualifies.

mod codec;
mod frame;
mod messages;

use std::time::Duration;

pub use codec::{CodecError, FrameCodec};
pub use frame::{Frame, FrameKind, HEADER_LEN, MAX_FRAME_SIZE};
pub use messages::{ControlMessage, PortMapping, ProtocolError, Sequencer, VisitorId};

/// Interval between client heartbeats
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Number of missed heartbeat intervals tolerated before a peer is considered gone
pub const HEARTBEAT_TOLERANCE: u32 = 3;
