//! Wire protocol shared by Desd's control socket and its connection to the
//! spawner host: tab-delimited framing, the message registry, and the
//! client/server endpoint roles.

pub mod endpoint;
pub mod errors;
pub mod frame;
pub mod registry;

pub use endpoint::{serve_connection, Client, EventCallback, HandlerResult, Reply};
pub use errors::{ClientError, FrameError};
pub use frame::{FrameReader, FrameWriter, Message, MAX_LINE_LEN};
pub use registry::{control_registry, spawner_registry, Registry};
