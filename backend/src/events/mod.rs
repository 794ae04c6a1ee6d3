// Event queue and dispatch
//
// C4 and C5 produce events; the queue deduplicates and holds them; the
// dispatcher resolves them to automation runs.

pub mod dispatcher;
pub mod queue;

pub use dispatcher::{DispatchStats, Dispatcher};
pub use queue::{claim_batch, enqueue, release_for_retry, EnqueueOutcome};
