//! Text exposition formats served by the exporter.

use prometheus_client::{encoding::text, registry::Registry};

use std::{fmt, mem};

/// Metrics exposition format, negotiated per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Format {
    /// [OpenMetrics text format][om], as produced by [`prometheus-client`]. Served if the scraper
    /// explicitly accepts `application/openmetrics-text`.
    ///
    /// [om]: https://github.com/OpenObservability/OpenMetrics/blob/main/specification/OpenMetrics.md
    /// [`prometheus-client`]: https://docs.rs/prometheus-client/
    OpenMetrics,
    /// [Prometheus text format][prom]. Obtained by a streaming transform of OpenMetrics-encoded metrics
    /// that names counter descriptors after their `_total` samples, and removes `# UNIT` lines
    /// and the `# EOF` terminator.
    ///
    /// [prom]: https://prometheus.io/docs/instrumenting/exposition_formats/
    Prometheus,
}

impl Format {
    /// Content type for the OpenMetrics text format.
    pub const OPEN_METRICS_CONTENT_TYPE: &'static str =
        "application/openmetrics-text; version=1.0.0; charset=utf-8";
    /// Content type for the Prometheus text format.
    pub const PROMETHEUS_CONTENT_TYPE: &'static str = "text/plain; version=0.0.4; charset=utf-8";

    const OPEN_METRICS_MEDIA_TYPE: &'static str = "application/openmetrics-text";

    /// Selects the format based on the `Accept` header of a scrape request. OpenMetrics is only used
    /// if it's explicitly accepted with a non-zero quality; everything else (including a missing header)
    /// gets the Prometheus format.
    pub fn from_accept_header(accept: Option<&str>) -> Self {
        let accepts_open_metrics = accept.is_some_and(|accept| {
            accept.split(',').any(|media_range| {
                let mut parts = media_range.split(';');
                let media_type = parts.next().unwrap_or_default();
                media_type.trim().eq_ignore_ascii_case(Self::OPEN_METRICS_MEDIA_TYPE)
                    && !parts.any(is_zero_quality)
            })
        });
        if accepts_open_metrics {
            Self::OpenMetrics
        } else {
            Self::Prometheus
        }
    }

    /// Returns the `Content-Type` header value for this format.
    pub fn content_type(self) -> &'static str {
        match self {
            Self::OpenMetrics => Self::OPEN_METRICS_CONTENT_TYPE,
            Self::Prometheus => Self::PROMETHEUS_CONTENT_TYPE,
        }
    }

    pub(crate) fn encode<W: fmt::Write>(self, writer: &mut W, registry: &Registry) -> fmt::Result {
        match self {
            Self::OpenMetrics => text::encode(writer, registry),
            Self::Prometheus => {
                let mut wrapper = PrometheusWrapper::new(writer);
                text::encode(&mut wrapper, registry)?;
                wrapper.flush()
            }
        }
    }
}

/// Checks whether a media range parameter is `q=0` (i.e., "not acceptable").
fn is_zero_quality(param: &str) -> bool {
    let Some((name, value)) = param.split_once('=') else {
        return false;
    };
    name.trim().eq_ignore_ascii_case("q") && value.trim().parse::<f32>().is_ok_and(|q| q <= 0.0)
}

#[derive(Debug)]
struct MetricTypeDefinition<'a> {
    name: &'a str,
    is_counter: bool,
}

impl<'a> MetricTypeDefinition<'a> {
    fn parse(line: &'a str) -> Result<Self, fmt::Error> {
        let (name, ty) = line
            .trim()
            .split_once(|ch: char| ch.is_ascii_whitespace())
            .ok_or(fmt::Error)?;
        Ok(Self {
            name,
            is_counter: ty == "counter",
        })
    }
}

#[must_use = "Must be `flush()`ed to not lose the last line"]
#[derive(Debug)]
struct PrometheusWrapper<'a, W> {
    writer: &'a mut W,
    /// `# HELP` line waiting for the following `# TYPE` line, which determines the metric name.
    pending_help: Option<String>,
    last_line: String,
}

impl<'a, W: fmt::Write> PrometheusWrapper<'a, W> {
    fn new(writer: &'a mut W) -> Self {
        Self {
            writer,
            pending_help: None,
            last_line: String::new(),
        }
    }

    fn handle_line(&mut self) -> fmt::Result {
        let line = mem::take(&mut self.last_line);
        if line == "# EOF" || line.starts_with("# UNIT ") {
            // Neither is a part of the Prometheus format.
            return Ok(());
        }
        if line.starts_with("# HELP ") {
            self.write_pending_help(None)?;
            self.pending_help = Some(line);
            return Ok(());
        }

        if let Some(type_def) = line.strip_prefix("# TYPE ") {
            let definition = MetricTypeDefinition::parse(type_def)?;
            if definition.is_counter {
                // Prometheus expects counter descriptors to be named like their samples.
                let total_name = format!("{}_total", definition.name);
                self.write_pending_help(Some((definition.name, &total_name)))?;
                return writeln!(self.writer, "# TYPE {total_name} counter");
            }
        }
        self.write_pending_help(None)?;
        writeln!(self.writer, "{line}")
    }

    fn write_pending_help(&mut self, rename: Option<(&str, &str)>) -> fmt::Result {
        let Some(help) = self.pending_help.take() else {
            return Ok(());
        };
        if let Some((old_name, new_name)) = rename {
            let description = help
                .strip_prefix("# HELP ")
                .and_then(|rest| rest.strip_prefix(old_name))
                .filter(|rest| rest.is_empty() || rest.starts_with(' '));
            if let Some(description) = description {
                return writeln!(self.writer, "# HELP {new_name}{description}");
            }
        }
        writeln!(self.writer, "{help}")
    }

    fn flush(mut self) -> fmt::Result {
        if !self.last_line.is_empty() {
            self.handle_line()?;
        }
        self.write_pending_help(None)
    }
}

impl<W: fmt::Write> fmt::Write for PrometheusWrapper<'_, W> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let lines: Vec<_> = s.lines().collect();
        for (i, line) in lines.iter().enumerate() {
            self.last_line.push_str(line);
            if i + 1 < lines.len() || s.ends_with('\n') {
                self.handle_line()?;
            }
        }
        Ok(())
    }
}
