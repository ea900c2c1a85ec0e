//! Data model of `passenger-status --show=xml` output.
//!
//! All values are kept as strings exactly as reported by Passenger; elements missing from the document
//! decode to empty strings. Numeric interpretation is left to consumers.

use serde::{Deserialize, Deserializer};

use std::{borrow::Cow, collections::HashSet, str};

/// Error decoding Passenger status XML.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// The document is not well-formed or doesn't match the expected shape.
    #[error("malformed passenger status XML: {0}")]
    Xml(#[from] quick_xml::DeError),
    /// The same PID is reported for more than one process in a single snapshot.
    #[error("PID {pid} is reported for multiple processes")]
    DuplicatePid {
        /// Duplicated PID.
        pid: String,
    },
}

/// Root status snapshot (the `<info>` element).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Info {
    /// Passenger version, e.g. `5.0.30`.
    pub passenger_version: String,
    /// Configured maximum number of processes (pool size).
    #[serde(rename = "max")]
    pub max_process_count: String,
    /// Current number of processes across all applications.
    #[serde(rename = "process_count")]
    pub current_process_count: String,
    /// Number of applications.
    #[serde(rename = "group_count")]
    pub app_count: String,
    /// Number of requests in the top-level queue.
    #[serde(rename = "get_wait_list_size")]
    pub top_level_requests_in_queue: String,
    /// Pool capacity currently in use.
    pub capacity_used: String,
    /// Hosted applications in wire order.
    #[serde(deserialize_with = "supergroup_list")]
    pub supergroups: Vec<SuperGroup>,
}

impl Info {
    /// Decodes a status snapshot from the raw command output.
    ///
    /// Passenger declares the `iso8859-1` encoding for its output, but in practice writes UTF-8 strings
    /// (e.g., application paths) as is. Thus, the output is decoded as UTF-8 if it's valid, and as
    /// ISO-8859-1 otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the XML is malformed, or if a PID is reported more than once.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let xml = match str::from_utf8(raw) {
            Ok(xml) => Cow::Borrowed(xml),
            // Each ISO-8859-1 byte maps to the Unicode code point with the same value.
            Err(_) => Cow::Owned(raw.iter().copied().map(char::from).collect()),
        };
        let info: Self = quick_xml::de::from_str(&xml)?;
        info.check_unique_pids()?;
        Ok(info)
    }

    fn check_unique_pids(&self) -> Result<(), DecodeError> {
        let mut seen = HashSet::new();
        for process in self.processes() {
            if !seen.insert(process.pid.as_str()) {
                return Err(DecodeError::DuplicatePid {
                    pid: process.pid.clone(),
                });
            }
        }
        Ok(())
    }

    /// Iterates over all processes of all applications.
    pub fn processes(&self) -> impl Iterator<Item = &Process> + '_ {
        self.supergroups
            .iter()
            .flat_map(|supergroup| &supergroup.group.processes)
    }
}

/// Single hosted application (the `<supergroup>` element).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SuperGroup {
    /// Application name.
    pub name: String,
    /// Lifecycle state, e.g. `READY`.
    pub state: String,
    /// Number of requests queued for this application.
    #[serde(rename = "get_wait_list_size")]
    pub requests_in_queue: String,
    /// Capacity used by this application.
    pub capacity_used: String,
    /// Runtime state of the application.
    pub group: Group,
}

/// Runtime state of a [`SuperGroup`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Group {
    /// Group name.
    pub name: String,
    /// Application root directory.
    pub app_root: String,
    /// Application type, e.g. `rack`.
    pub app_type: String,
    /// Application environment, e.g. `production`.
    pub environment: String,
    /// Unique group identifier.
    pub uuid: String,
    /// Number of processes currently being spawned.
    #[serde(rename = "processes_being_spawned")]
    pub processes_spawning: String,
    /// Number of enabled processes.
    pub enabled_process_count: String,
    /// Number of disabled processes.
    pub disabled_process_count: String,
    /// Spawn options of the application.
    pub options: Options,
    /// Worker processes in wire order, i.e. in ascending order of spawn time.
    #[serde(deserialize_with = "process_list")]
    pub processes: Vec<Process>,
}

/// Spawn options of a [`Group`]. Fields are named after the corresponding Passenger elements.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Options {
    pub app_root: String,
    pub app_type: String,
    pub environment: String,
    pub min_processes: String,
    pub max_processes: String,
    pub start_command: String,
}

/// Single worker process.
#[allow(missing_docs)] // remaining fields are named after the corresponding Passenger elements
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Process {
    /// OS process ID.
    pub pid: String,
    /// Passenger-wide unique process ID.
    pub gupid: String,
    /// Real memory usage in kilobytes.
    pub real_memory: String,
    /// Number of requests processed by the process.
    #[serde(rename = "processed")]
    pub requests_processed: String,
    /// Human-formatted uptime, e.g. `1h 20m 5s`; see [`parse_interval()`](crate::parse_interval).
    pub uptime: String,
    /// Revision of the application code the process runs.
    pub code_revision: String,
    /// Process group of the process.
    pub process_group_id: String,
    pub sessions: String,
    pub busyness: String,
    pub concurrency: String,
    pub cpu: String,
    pub rss: String,
    pub pss: String,
    pub swap: String,
    pub vmsize: String,
    pub life_status: String,
    pub enabled: String,
    pub last_used: String,
    pub command: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SuperGroupList {
    supergroup: Vec<SuperGroup>,
}

fn supergroup_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<SuperGroup>, D::Error> {
    SuperGroupList::deserialize(deserializer).map(|list| list.supergroup)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProcessList {
    process: Vec<Process>,
}

fn process_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Process>, D::Error> {
    ProcessList::deserialize(deserializer).map(|list| list.process)
}
