//! Bounded-concurrency asynchronous mapping for ordered sequences.
//!
//! [`bounded_map`] runs an async transform over every element of a sequence
//! with at most N transforms in flight, FIFO admission, and results in input
//! order. [`AdmissionGate`] is the reusable throttling primitive underneath.

mod gate;
mod mapper;

pub use gate::{AdmissionGate, AdmissionPermit};
pub use mapper::{BoundedMapError, BoundedMapExt, bounded_map};
