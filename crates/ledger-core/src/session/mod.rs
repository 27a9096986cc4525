//! Session messenger: sesiones por contraparte. `send` y `receive` son
//! puntos de suspensión gestionados por la máquina de estados.

mod messenger;
mod transport;

pub(crate) use messenger::Inbound;
pub use messenger::{Envelope, FlowSession, SessionMessenger};
pub use transport::{InMemoryTransport, SentMessage, SessionHandle, Transport};
