// Gated terminal sessions
//
// A session owns one backend shell, the queue of commands waiting to run in
// it, the approval gate every command passes through, and the scrollback its
// clients replay from. The registry maps identifiers to sessions and reaps
// the ones nobody owns anymore.

pub mod events;
pub mod input_gate;
pub mod queue;
mod registry;
pub mod scrollback;
mod session;

// Re-export public API
pub use events::{CommandStatus, SessionEvent};
pub use queue::CommandQueue;
pub use registry::{CreateSessionRequest, RegistryConfig, SessionRegistry, SweepReport};
pub use scrollback::OutputBuffer;
pub use session::{ExecuteResult, Session, SessionOptions, Termination};
