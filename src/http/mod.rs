//! Segmented HTTP(S) downloader.
//!
//! [`client`] wraps the reqwest client (probe + ranged GET), [`segment`]
//! plans the byte-range partition, [`filename`] resolves safe output
//! names, [`checksum`] verifies user-supplied digests, and [`task`] is
//! the per-download worker the controller spawns.

pub mod checksum;
pub mod client;
pub mod filename;
pub mod segment;
pub mod task;

pub use client::{HttpClient, Probe};
pub use segment::plan_segments;
pub use task::{HttpTaskParams, run};
