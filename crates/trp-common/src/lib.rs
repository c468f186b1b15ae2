mod dispatcher;
mod error;
mod session;
mod visitor;

pub use dispatcher::{dispatch, ControlHandler};
pub use error::TunnelError;
pub use session::{Session, CONTROL_QUEUE_DEPTH, RELAY_BUFFER_SIZE};
pub use visitor::{Visitor, VISITOR_QUEUE_DEPTH};
