//! The `hal` module models the hardware side of execution.
//!
//! - [`queue`]: device queues and the completion events they signal.
//! - [`memory`]: memory resources that hand out heaps, and heaps that hand out buffer views.
//! - [`allocator`]: a caching allocator that carves heaps into blocks and pools them per queue.
//!
//! Each contract comes with a host implementation backed by ordinary memory and threads.

pub mod allocator;
pub mod memory;
pub mod queue;
