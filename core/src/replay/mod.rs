//! Trace replay: scheduler, per-connection workers, and the wire session to
//! the target server.

pub mod scheduler;
pub mod session;
pub mod worker;

pub use self::scheduler::{ReplaySummary, Scheduler};
pub use self::session::{parse_target, ServerSession};
pub use self::worker::WorkerContext;
