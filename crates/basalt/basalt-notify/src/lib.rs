mod broadcast;
mod engine;
mod envelope;
mod gate;
mod posted;
mod recv;
mod registry;
mod send;
mod transport;

pub use broadcast::{BroadcastError, BroadcastReport, Broadcaster};
pub use engine::{ConfigEngine, EngineError};
pub use envelope::{Envelope, EnvelopeRef};
pub use gate::WriteGate;
pub use posted::{PostedEvent, PostedEvents};
pub use recv::{Delivery, ReceiveMachine, RecvFailure};
pub use registry::{ConnectionRegistry, ControlConnection, WorkerId};
pub use send::{SendMachine, SendProgress, SendState};
pub use transport::Transport;
