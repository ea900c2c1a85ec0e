//! Prometheus exporter for [Phusion Passenger] running behind nginx.
//!
//! On each scrape, [`PassengerExporter`] runs `passenger-status --show=xml` (or another configured
//! [`StatusCommand`]), decodes its output and reports the following metrics, all prefixed
//! with `passenger_nginx_`:
//!
//! | Metric | Type | Labels |
//! |:-------|:-----|:-------|
//! | `up` | gauge | |
//! | `version` | gauge | `version` |
//! | `top_level_queue` | gauge | |
//! | `max_processes` | gauge | |
//! | `current_processes` | gauge | |
//! | `app_count` | gauge | |
//! | `app_queue` | gauge | `name` |
//! | `app_procs_spawning` | gauge | `name` |
//! | `proc_memory` | gauge | `name`, `id` |
//! | `requests_processed_total` | counter | `name`, `id` |
//! | `proc_uptime` | gauge | `name`, `id`, `code_revision` |
//!
//! Worker processes are labeled by a stable bucket `id` rather than by PID, so that rolling restarts
//! don't inflate label cardinality. If the status command fails or times out, only `up` (set to 0)
//! is reported.
//!
//! Optionally, standard process metrics (`process_cpu_seconds_total`, `process_resident_memory_bytes`
//! etc.) can be reported for the host Passenger / nginx process using [`PidFileCollector`].
//!
//! # Examples
//!
//! ```no_run
//! use passenger_exporter::{PassengerExporter, PidFileCollector, StatusCommand};
//! # use std::net::Ipv4Addr;
//!
//! # async fn test() -> Result<(), Box<dyn std::error::Error>> {
//! let command = StatusCommand::new(StatusCommand::DEFAULT_COMMAND, StatusCommand::DEFAULT_TIMEOUT)?;
//! let exporter = PassengerExporter::new(command)
//!     .with_host_process(PidFileCollector::new("/run/nginx.pid"))
//!     .with_graceful_shutdown(async {
//!         tokio::signal::ctrl_c().await.ok();
//!     });
//! exporter.start((Ipv4Addr::UNSPECIFIED, 9106).into()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! [Phusion Passenger]: https://www.phusionpassenger.com/

// Linter settings.
#![warn(missing_debug_implementations, missing_docs, bare_trait_objects)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::must_use_candidate, clippy::module_name_repetitions)]

pub use passenger_status::StatusCommand;

pub use crate::{
    exporter::{MetricsServer, PassengerExporter},
    format::Format,
    process::{PidFileCollector, PidFileError},
};

mod exporter;
mod format;
mod metrics;
mod process;
