//! Backend-agnostic pieces of the frame-in-flight lifecycle

pub mod deferred;
pub mod update_queue;

pub use deferred::DeferredFreeQueue;
pub use update_queue::{FrameUpdateQueues, PendingWrite, UpdateQueue};
