//! Fetching and decoding the status of [Phusion Passenger] application servers.
//!
//! # Overview
//!
//! - [`StatusCommand`] runs `passenger-status --show=xml` (or another configured command) with a timeout
//!   and returns its output.
//! - [`Info`] is the decoded status snapshot: pool-wide counters, hosted applications ([`SuperGroup`]s)
//!   and their worker [`Process`]es. All values are kept as reported by Passenger, i.e. as strings.
//! - [`parse_interval()`] parses human-formatted intervals such as process uptimes (`1h 2m 3s`).
//! - [`ProcessBuckets`] assigns small, stable bucket indices to worker PIDs across snapshots, so that
//!   per-process metrics can be labeled without unbounded label cardinality.
//!
//! # Examples
//!
//! ```no_run
//! use passenger_status::{ProcessBuckets, StatusCommand};
//! use std::time::Duration;
//!
//! # async fn test() -> Result<(), Box<dyn std::error::Error>> {
//! let command = StatusCommand::new("passenger-status --show=xml", Duration::from_millis(500))?;
//! let info = command.status().await?;
//!
//! let buckets = ProcessBuckets::new();
//! // Buckets should be kept between snapshots; here, we only have a single snapshot.
//! let buckets = buckets.update(info.processes().map(|proc| proc.pid.as_str()));
//! for process in info.processes() {
//!     let bucket = buckets.get(&process.pid).unwrap();
//!     println!("{bucket}: {}", process.real_memory);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! [Phusion Passenger]: https://www.phusionpassenger.com/

// Linter settings.
#![warn(missing_debug_implementations, missing_docs, bare_trait_objects)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::must_use_candidate, clippy::module_name_repetitions)]

mod buckets;
mod command;
mod info;
mod interval;

pub use crate::{
    buckets::ProcessBuckets,
    command::{CommandError, FetchError, StatusCommand, StatusError},
    info::{DecodeError, Group, Info, Options, Process, SuperGroup},
    interval::{parse_duration, parse_interval, IntervalError},
};
