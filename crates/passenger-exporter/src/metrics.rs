//! Passenger metrics built from a single status snapshot.

use passenger_status::{parse_interval, Info, ProcessBuckets};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

use std::{
    collections::{hash_map::Entry, HashMap},
    mem,
    sync::atomic::AtomicU64,
};

/// Prefix of all metrics reported by the exporter.
pub(crate) const NAMESPACE: &str = "passenger_nginx";

type F64Gauge = Gauge<f64, AtomicU64>;
type F64Counter = Counter<f64, AtomicU64>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
struct VersionLabels {
    version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
struct AppLabels {
    name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
struct ProcessLabels {
    name: String,
    id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
struct UptimeLabels {
    name: String,
    id: String,
    code_revision: String,
}

/// Process buckets for each application, keyed by the supergroup name.
#[derive(Debug, Default)]
pub(crate) struct BucketRegistry {
    by_supergroup: HashMap<String, ProcessBuckets>,
}

impl BucketRegistry {
    /// Advances bucket maps to the snapshot. Maps of applications missing from the snapshot are dropped.
    ///
    /// Supergroups sharing a name share a single map, with their processes taken in wire order.
    pub(crate) fn update(&mut self, info: &Info) {
        let mut pids_by_name: HashMap<&str, Vec<&str>> = HashMap::new();
        for supergroup in &info.supergroups {
            let pids = match pids_by_name.entry(supergroup.name.as_str()) {
                Entry::Occupied(entry) => {
                    tracing::warn!(
                        name = %supergroup.name,
                        "Multiple supergroups share a name; merging their process buckets"
                    );
                    entry.into_mut()
                }
                Entry::Vacant(entry) => entry.insert(vec![]),
            };
            let processes = &supergroup.group.processes;
            pids.extend(processes.iter().map(|process| process.pid.as_str()));
        }

        let mut old = mem::take(&mut self.by_supergroup);
        self.by_supergroup = pids_by_name
            .into_iter()
            .map(|(name, pids)| {
                let buckets = old.remove(name).unwrap_or_default().update(pids);
                (name.to_owned(), buckets)
            })
            .collect();
    }

    pub(crate) fn get(&self, supergroup: &str) -> Option<&ProcessBuckets> {
        self.by_supergroup.get(supergroup)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.by_supergroup.len()
    }
}

/// Metrics for a single scrape. Created from scratch each time, so that label sets of retired
/// applications and processes are never reported.
#[derive(Debug, Default)]
pub(crate) struct PassengerMetrics {
    up: F64Gauge,
    version: Family<VersionLabels, F64Gauge>,
    top_level_queue: F64Gauge,
    max_processes: F64Gauge,
    current_processes: F64Gauge,
    app_count: F64Gauge,
    app_queue: Family<AppLabels, F64Gauge>,
    app_procs_spawning: Family<AppLabels, F64Gauge>,
    proc_memory: Family<ProcessLabels, F64Gauge>,
    requests_processed: Family<ProcessLabels, F64Counter>,
    proc_uptime: Family<UptimeLabels, F64Gauge>,
}

impl PassengerMetrics {
    /// Fills metrics from a successfully decoded snapshot. `buckets` must already be updated
    /// with this snapshot.
    pub(crate) fn new(info: &Info, buckets: &BucketRegistry) -> Self {
        let this = Self::default();
        this.up.set(1.0);

        let version = VersionLabels {
            version: info.passenger_version.clone(),
        };
        this.version.get_or_create(&version).set(1.0);
        this.top_level_queue.set(parse_value(
            "top_level_queue",
            &info.top_level_requests_in_queue,
        ));
        this.max_processes
            .set(parse_value("max_processes", &info.max_process_count));
        this.current_processes.set(parse_value(
            "current_processes",
            &info.current_process_count,
        ));
        this.app_count.set(parse_value("app_count", &info.app_count));

        for supergroup in &info.supergroups {
            let app = AppLabels {
                name: supergroup.name.clone(),
            };
            this.app_queue
                .get_or_create(&app)
                .set(parse_value("app_queue", &supergroup.requests_in_queue));
            this.app_procs_spawning.get_or_create(&app).set(parse_value(
                "app_procs_spawning",
                &supergroup.group.processes_spawning,
            ));

            let Some(buckets) = buckets.get(&supergroup.name) else {
                continue;
            };
            for process in &supergroup.group.processes {
                let Some(bucket) = buckets.get(&process.pid) else {
                    continue;
                };
                let labels = ProcessLabels {
                    name: supergroup.name.clone(),
                    id: bucket.to_string(),
                };
                this.proc_memory
                    .get_or_create(&labels)
                    .set(parse_value("proc_memory", &process.real_memory));
                this.requests_processed
                    .get_or_create(&labels)
                    .inc_by(parse_value("requests_processed", &process.requests_processed));

                match parse_interval(&process.uptime) {
                    Ok(uptime) => {
                        let labels = UptimeLabels {
                            name: labels.name,
                            id: labels.id,
                            code_revision: process.code_revision.clone(),
                        };
                        this.proc_uptime.get_or_create(&labels).set(uptime);
                    }
                    Err(err) => {
                        tracing::warn!(
                            pid = %process.pid,
                            value = %process.uptime,
                            %err,
                            "Failed parsing process uptime; skipping the sample"
                        );
                    }
                }
            }
        }
        this
    }

    /// Registers metrics for a failed scrape, which consist of the `up` gauge only.
    pub(crate) fn register_failure(registry: &mut Registry) {
        let up = F64Gauge::default();
        registry.register("up", UP_HELP, up);
    }

    pub(crate) fn register(self, registry: &mut Registry) {
        registry.register("up", UP_HELP, self.up);
        registry.register("version", "Version of passenger", self.version);
        registry.register(
            "top_level_queue",
            "Number of requests in the top-level queue",
            self.top_level_queue,
        );
        registry.register(
            "max_processes",
            "Configured maximum number of processes",
            self.max_processes,
        );
        registry.register(
            "current_processes",
            "Current number of processes",
            self.current_processes,
        );
        registry.register("app_count", "Number of apps", self.app_count);
        registry.register(
            "app_queue",
            "Number of requests in app process queues",
            self.app_queue,
        );
        registry.register(
            "app_procs_spawning",
            "Number of processes spawning",
            self.app_procs_spawning,
        );
        registry.register(
            "proc_memory",
            "Memory consumed by a process",
            self.proc_memory,
        );
        // Encoded with the `_total` suffix
        registry.register(
            "requests_processed",
            "Number of processed requests",
            self.requests_processed,
        );
        registry.register(
            "proc_uptime",
            "Number of seconds since processor started",
            self.proc_uptime,
        );
    }
}

const UP_HELP: &str = "Could passenger status be queried";

/// Parses a numeric value reported by Passenger. Unparsable values are reported as NaN
/// so that a single odd field doesn't fail the entire scrape.
fn parse_value(metric: &'static str, raw: &str) -> f64 {
    raw.trim().parse().unwrap_or_else(|err| {
        tracing::warn!(
            metric,
            value = %raw,
            %err,
            "Failed parsing metric value; reporting NaN"
        );
        f64::NAN
    })
}

#[cfg(test)]
mod tests {
    use prometheus_client::encoding::text;

    use super::*;

    fn encode(metrics: PassengerMetrics) -> String {
        let mut registry = Registry::with_prefix(NAMESPACE);
        metrics.register(&mut registry);
        let mut buffer = String::new();
        text::encode(&mut buffer, &registry).unwrap();
        buffer
    }

    fn snapshot(xml: &str) -> Info {
        Info::decode(xml.as_bytes()).unwrap()
    }

    #[test]
    fn bucket_maps_are_kept_per_application() {
        let mut buckets = BucketRegistry::default();
        let info = snapshot(
            "<info><supergroups>\
             <supergroup><name>a</name><group><processes>\
             <process><pid>1</pid></process><process><pid>2</pid></process>\
             </processes></group></supergroup>\
             <supergroup><name>b</name><group><processes>\
             <process><pid>3</pid></process>\
             </processes></group></supergroup>\
             </supergroups></info>",
        );
        buckets.update(&info);
        assert_eq!(buckets.get("a").unwrap().get("2"), Some(1));
        assert_eq!(buckets.get("b").unwrap().get("3"), Some(0));

        let info = snapshot(
            "<info><supergroups>\
             <supergroup><name>b</name><group><processes>\
             <process><pid>3</pid></process><process><pid>4</pid></process>\
             </processes></group></supergroup>\
             </supergroups></info>",
        );
        buckets.update(&info);
        assert_eq!(buckets.len(), 1);
        assert!(buckets.get("a").is_none());
        let b_buckets = buckets.get("b").unwrap();
        assert_eq!(b_buckets.get("3"), Some(0));
        assert_eq!(b_buckets.get("4"), Some(1));
    }

    #[test]
    fn failed_scrape_only_reports_up() {
        let mut registry = Registry::with_prefix(NAMESPACE);
        PassengerMetrics::register_failure(&mut registry);
        let mut buffer = String::new();
        text::encode(&mut buffer, &registry).unwrap();

        let samples: Vec<_> = buffer
            .lines()
            .filter(|line| !line.starts_with('#'))
            .collect();
        assert_eq!(samples, ["passenger_nginx_up 0.0"]);
    }

    #[test]
    fn empty_pool() {
        let info = snapshot(
            "<info><passenger_version>6.0.1</passenger_version><max>4</max>\
             <process_count>0</process_count><group_count>0</group_count>\
             <get_wait_list_size>0</get_wait_list_size><supergroups/></info>",
        );
        let mut buckets = BucketRegistry::default();
        buckets.update(&info);
        let payload = encode(PassengerMetrics::new(&info, &buckets));
        let lines: Vec<_> = payload.lines().collect();

        for expected in [
            "passenger_nginx_up 1.0",
            "passenger_nginx_version{version=\"6.0.1\"} 1.0",
            "passenger_nginx_max_processes 4.0",
            "passenger_nginx_current_processes 0.0",
            "passenger_nginx_app_count 0.0",
        ] {
            assert!(lines.contains(&expected), "{payload}");
        }
        assert!(!payload.contains("passenger_nginx_proc_memory{"), "{payload}");
    }

    #[test]
    fn missing_values_are_reported_as_nan() {
        let info = snapshot(
            "<info><supergroups><supergroup><name>app</name><group><processes>\
             <process><pid>10</pid><processed>7</processed><uptime>5s</uptime></process>\
             </processes></group></supergroup></supergroups></info>",
        );
        let mut buckets = BucketRegistry::default();
        buckets.update(&info);
        let payload = encode(PassengerMetrics::new(&info, &buckets));
        let lines: Vec<_> = payload.lines().collect();

        for expected in [
            "passenger_nginx_up 1.0",
            "passenger_nginx_max_processes NaN",
            "passenger_nginx_app_queue{name=\"app\"} NaN",
            "passenger_nginx_proc_memory{name=\"app\",id=\"0\"} NaN",
            "passenger_nginx_requests_processed_total{name=\"app\",id=\"0\"} 7.0",
            "passenger_nginx_proc_uptime{name=\"app\",id=\"0\",code_revision=\"\"} 5.0",
        ] {
            assert!(lines.contains(&expected), "{payload}");
        }
    }
}
