//! Input event transport: the bounded outbound queue and the per-session router.

pub mod queue;
pub mod router;

pub use queue::{InputQueue, PushError, PushOutcome, QueueStats};
pub use router::{InjectError, InputCapture, InputInjector, InputRouter};
