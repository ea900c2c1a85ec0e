//! Host-process metrics for the Passenger / nginx process identified by a PID file.

use prometheus_client::{collector::Collector, encoding::DescriptorEncoder};

use std::{
    fmt, fs, io,
    num::ParseIntError,
    path::{Path, PathBuf},
};

/// Error reading a PID file.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PidFileError {
    /// The file cannot be read.
    #[error("failed reading PID file `{}`: {source}", path.display())]
    Read {
        /// Path to the PID file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The file doesn't contain a decimal PID.
    #[error("PID file `{}` contains invalid PID `{raw}`: {source}", path.display())]
    Parse {
        /// Path to the PID file.
        path: PathBuf,
        /// Trimmed file contents.
        raw: String,
        /// Parsing error.
        #[source]
        source: ParseIntError,
    },
}

/// Collector of standard process metrics (CPU time, memory, file descriptors etc.) for the process whose PID
/// is stored in a file, such as the Passenger core or the nginx master.
///
/// The PID file is re-read on each scrape, so that restarts of the monitored process are picked up.
/// Metrics are reported under the `process_` prefix of the registry the collector is added to.
/// Failures are logged and result in missing samples rather than a failed scrape.
///
/// Process metrics are only collected on Linux; on other platforms, the collector reports nothing.
#[derive(Debug, Clone)]
pub struct PidFileCollector {
    pid_file: PathBuf,
    #[cfg(target_os = "linux")]
    system: Option<linux::System>,
}

impl PidFileCollector {
    /// Creates a collector for the specified PID file. The file doesn't need to exist yet.
    pub fn new(pid_file: impl Into<PathBuf>) -> Self {
        let pid_file = pid_file.into();

        #[cfg(target_os = "linux")]
        let system = linux::System::load()
            .map_err(|err| {
                tracing::warn!(%err, "Failed querying system parameters; host process metrics are disabled");
            })
            .ok();
        #[cfg(not(target_os = "linux"))]
        tracing::warn!(
            pid_file = %pid_file.display(),
            "Host process metrics are only supported on Linux; they won't be reported"
        );

        Self {
            pid_file,
            #[cfg(target_os = "linux")]
            system,
        }
    }

    /// Returns the path to the PID file.
    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    /// Reads the PID from the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or doesn't contain a PID.
    pub fn read_pid(&self) -> Result<i32, PidFileError> {
        let contents = fs::read_to_string(&self.pid_file).map_err(|source| PidFileError::Read {
            path: self.pid_file.clone(),
            source,
        })?;
        let raw = contents.trim();
        raw.parse().map_err(|source| PidFileError::Parse {
            path: self.pid_file.clone(),
            raw: raw.to_owned(),
            source,
        })
    }

    #[cfg(target_os = "linux")]
    fn encode_process(&self, pid: i32, encoder: DescriptorEncoder<'_>) -> fmt::Result {
        match &self.system {
            Some(system) => system.encode_process(pid, encoder),
            None => Ok(()),
        }
    }

    #[cfg(not(target_os = "linux"))]
    #[allow(clippy::unused_self)]
    fn encode_process(&self, _pid: i32, _encoder: DescriptorEncoder<'_>) -> fmt::Result {
        Ok(())
    }
}

impl Collector for PidFileCollector {
    fn encode(&self, encoder: DescriptorEncoder<'_>) -> fmt::Result {
        let pid = match self.read_pid() {
            Ok(pid) => pid,
            Err(err) => {
                tracing::warn!(%err, "Failed reading PID of the host process");
                return Ok(());
            }
        };
        self.encode_process(pid, encoder)
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use procfs::process::{LimitValue, Process};
    use prometheus_client::{
        encoding::{DescriptorEncoder, EncodeMetric},
        metrics::{counter::ConstCounter, gauge::ConstGauge, MetricType},
        registry::Unit,
    };

    use std::{fmt, io};

    #[derive(Debug, Clone, Copy)]
    pub(super) struct System {
        page_size: u64,
        ticks_per_second: u64,
    }

    impl System {
        pub(super) fn load() -> io::Result<Self> {
            Ok(Self {
                page_size: sysconf(libc::_SC_PAGESIZE)?,
                ticks_per_second: sysconf(libc::_SC_CLK_TCK)?,
            })
        }

        #[allow(clippy::cast_precision_loss)] // values are small enough to be represented exactly
        fn ticks_to_seconds(self, ticks: u64) -> f64 {
            ticks as f64 / self.ticks_per_second as f64
        }

        #[allow(clippy::cast_precision_loss)]
        pub(super) fn encode_process(
            self,
            pid: i32,
            mut encoder: DescriptorEncoder<'_>,
        ) -> fmt::Result {
            let process = match Process::new(pid) {
                Ok(process) => process,
                Err(err) => {
                    tracing::warn!(pid, %err, "Host process is not found");
                    return Ok(());
                }
            };
            let stat = match process.stat() {
                Ok(stat) => stat,
                Err(err) => {
                    tracing::warn!(pid, %err, "Failed reading host process stats");
                    return Ok(());
                }
            };

            let cpu = ConstCounter::new(self.ticks_to_seconds(stat.utime + stat.stime));
            cpu.encode(encoder.encode_descriptor(
                "cpu",
                "Total user and system CPU time spent in seconds",
                Some(&Unit::Seconds),
                MetricType::Counter,
            )?)?;

            let virtual_memory = ConstGauge::new(stat.vsize as f64);
            virtual_memory.encode(encoder.encode_descriptor(
                "virtual_memory",
                "Virtual memory size in bytes",
                Some(&Unit::Bytes),
                MetricType::Gauge,
            )?)?;

            let resident_memory = ConstGauge::new((stat.rss * self.page_size) as f64);
            resident_memory.encode(encoder.encode_descriptor(
                "resident_memory",
                "Resident memory size in bytes",
                Some(&Unit::Bytes),
                MetricType::Gauge,
            )?)?;

            match procfs::boot_time_secs() {
                Ok(boot_time) => {
                    let start_time =
                        boot_time as f64 + self.ticks_to_seconds(stat.starttime);
                    ConstGauge::new(start_time).encode(encoder.encode_descriptor(
                        "start_time",
                        "Start time of the process since unix epoch in seconds",
                        Some(&Unit::Seconds),
                        MetricType::Gauge,
                    )?)?;
                }
                Err(err) => tracing::warn!(%err, "Failed reading system boot time"),
            }

            match process.fd_count() {
                Ok(open_fds) => {
                    ConstGauge::new(open_fds as f64).encode(encoder.encode_descriptor(
                        "open_fds",
                        "Number of open file descriptors",
                        None,
                        MetricType::Gauge,
                    )?)?;
                }
                Err(err) => tracing::warn!(pid, %err, "Could not determine open fds"),
            }

            match max_fds(&process) {
                Ok(Some(max_fds)) => {
                    ConstGauge::new(max_fds as f64).encode(encoder.encode_descriptor(
                        "max_fds",
                        "Maximum number of open file descriptors",
                        None,
                        MetricType::Gauge,
                    )?)?;
                }
                Ok(None) => { /* unlimited */ }
                Err(err) => tracing::warn!(pid, %err, "Could not determine max fds"),
            }

            ConstGauge::new(stat.num_threads).encode(encoder.encode_descriptor(
                "threads",
                "Number of OS threads in the process",
                None,
                MetricType::Gauge,
            )?)?;
            Ok(())
        }
    }

    fn max_fds(process: &Process) -> procfs::ProcResult<Option<u64>> {
        let limit = process.limits()?.max_open_files;
        Ok(match (limit.soft_limit, limit.hard_limit) {
            (LimitValue::Value(value), _) | (LimitValue::Unlimited, LimitValue::Value(value)) => {
                Some(value)
            }
            (LimitValue::Unlimited, LimitValue::Unlimited) => None,
        })
    }

    #[allow(unsafe_code)]
    fn sysconf(name: libc::c_int) -> io::Result<u64> {
        // SAFETY: `sysconf` has no preconditions.
        let value = unsafe { libc::sysconf(name) };
        u64::try_from(value)
            .ok()
            .filter(|&value| value > 0)
            .ok_or_else(io::Error::last_os_error)
    }
}
