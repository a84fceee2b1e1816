//! Bounded FIFO of opaque byte records, thread-safe and optionally
//! process-safe.
//!
//! The queue lives in a single mapped memory region: a page-aligned header
//! followed by a circular buffer of fixed-size record slots. The region is
//! either private anonymous memory (intra-process use) or a named POSIX
//! shared-memory object, in which case the synchronization primitives are
//! initialized with process-shared attributes so another process can attach
//! and push records.
//!
//! Every record occupies one slot of `size_prefix + record_max` bytes
//! regardless of its actual length. That wastes space for records with a
//! large size spread, but keeps the allocation policy predictable and the
//! operations cheap, which is what the path-record workload wants.

mod queue;

pub use queue::Queue;
