//! # Batching Core
//!
//! The machinery every engine replica runs on: a background worker that
//! drains a shared request queue in bounded batches.
//!
//! ## Module Structure
//!
//! * [`batch`] - The batching loop. Drains at most `batch_size` queued requests
//!   at a time, runs them through a [`handler::BatchHandler`], and sleeps on a
//!   notifier (with a periodic recheck) while the queue is empty.
//!
//! * [`handler`] - The `BatchHandler` trait: how a batch is assembled, run and answered.
//!
//! * [`worker`] - `BatchWorkerHandle`, which owns the spawned loop and stops it
//!   either cooperatively (`stop`, which waits) or on drop.
pub mod worker;
pub mod batch;
pub mod handler;
