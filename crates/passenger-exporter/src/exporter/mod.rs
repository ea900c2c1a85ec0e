//! `PassengerExporter` and closely related types.

use hyper::{
    body::Incoming,
    header::{self, HeaderValue},
    server::conn::http1,
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use passenger_status::StatusCommand;
use prometheus_client::registry::Registry;
use tokio::{io, net::TcpListener, sync::watch, task::JoinError};

use std::{
    convert::Infallible,
    fmt,
    future::{self, Future},
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    time::Instant,
};

use crate::{
    format::Format,
    metrics::{BucketRegistry, PassengerMetrics, NAMESPACE},
    process::PidFileCollector,
};


const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";
const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

#[derive(Debug, thiserror::Error)]
enum RenderError {
    #[error("failed encoding metrics")]
    Encode(#[from] fmt::Error),
    #[error("metrics encoding task failed: {0}")]
    Join(#[from] JoinError),
}

#[derive(Clone)]
struct ExporterInner {
    command: Arc<StatusCommand>,
    buckets: Arc<Mutex<BucketRegistry>>,
    host_process: Option<PidFileCollector>,
    telemetry_path: Arc<str>,
}

impl ExporterInner {
    /// Queries Passenger and puts all metrics for a single scrape into a fresh registry.
    async fn scrape(&self) -> Registry {
        let mut registry = Registry::with_prefix(NAMESPACE);
        match self.command.status().await {
            Ok(info) => {
                let metrics = {
                    let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
                    buckets.update(&info);
                    PassengerMetrics::new(&info, &buckets)
                };
                metrics.register(&mut registry);
            }
            Err(err) => {
                tracing::error!(
                    %err,
                    command = %self.command.command_line(),
                    "Failed querying Passenger status"
                );
                PassengerMetrics::register_failure(&mut registry);
            }
        }

        if let Some(collector) = &self.host_process {
            registry
                .sub_registry_with_prefix("process")
                .register_collector(Box::new(collector.clone()));
        }
        registry
    }

    async fn render_body(&self, format: Format) -> Result<String, RenderError> {
        let started_at = Instant::now();
        let registry = self.scrape().await;
        // Collectors perform blocking I/O, so encoding is moved off the async workers.
        let buffer = tokio::task::spawn_blocking(move || {
            let mut buffer = String::with_capacity(4_096);
            format.encode(&mut buffer, &registry).map(|()| buffer)
        })
        .await??;

        let latency = started_at.elapsed();
        let scraped_size = buffer.len();
        tracing::debug!(
            latency_sec = latency.as_secs_f64(),
            scraped_size,
            ?format,
            "Scraped Passenger metrics in {latency:?} (scraped size: {scraped_size}B)"
        );
        Ok(buffer)
    }

    async fn render(&self, format: Format) -> Response<String> {
        match self.render_body(format).await {
            Ok(body) => response(StatusCode::OK, format.content_type(), body),
            Err(err) => {
                tracing::error!(%err, "Failed rendering metrics");
                response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    TEXT_CONTENT_TYPE,
                    format!("{err}\n"),
                )
            }
        }
    }

    fn landing_page(&self) -> String {
        let path = &*self.telemetry_path;
        format!(
            "<html>\n<head><title>Passenger Exporter</title></head>\n<body>\n\
             <h1>Passenger Exporter</h1>\n<p><a href=\"{path}\">Metrics</a></p>\n\
             </body>\n</html>\n"
        )
    }

    async fn handle(&self, request: Request<Incoming>) -> Response<String> {
        let path = request.uri().path();
        if path == &*self.telemetry_path {
            if request.method() != Method::GET {
                let mut response = response(
                    StatusCode::METHOD_NOT_ALLOWED,
                    TEXT_CONTENT_TYPE,
                    "Method not allowed\n".to_owned(),
                );
                response
                    .headers_mut()
                    .insert(header::ALLOW, HeaderValue::from_static("GET"));
                return response;
            }
            let accept = request
                .headers()
                .get(header::ACCEPT)
                .and_then(|value| value.to_str().ok());
            self.render(Format::from_accept_header(accept)).await
        } else if path == "/" && request.method() == Method::GET {
            response(StatusCode::OK, HTML_CONTENT_TYPE, self.landing_page())
        } else {
            response(
                StatusCode::NOT_FOUND,
                TEXT_CONTENT_TYPE,
                "Not found\n".to_owned(),
            )
        }
    }
}

fn response(status: StatusCode, content_type: &'static str, body: String) -> Response<String> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Prometheus exporter for Passenger status.
///
/// Each scrape of the telemetry path runs the status command, decodes its output and reports
/// metrics for the Passenger instance as a whole, for each application and for each worker process.
/// Worker processes are labeled with stable bucket IDs (see [`ProcessBuckets`]) tracked by the exporter
/// across scrapes.
///
/// # Examples
///
/// See crate-level docs for the examples of usage.
///
/// [`ProcessBuckets`]: passenger_status::ProcessBuckets
pub struct PassengerExporter<'a> {
    inner: ExporterInner,
    shutdown_future: Pin<Box<dyn Future<Output = ()> + Send + 'a>>,
}

impl fmt::Debug for PassengerExporter<'_> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("PassengerExporter")
            .field("command", &self.inner.command)
            .field("host_process", &self.inner.host_process)
            .field("telemetry_path", &self.inner.telemetry_path)
            .finish_non_exhaustive()
    }
}

impl<'a> PassengerExporter<'a> {
    /// Default path serving metrics.
    pub const DEFAULT_TELEMETRY_PATH: &'static str = "/metrics";

    /// Creates an exporter that obtains Passenger status using the specified command.
    pub fn new(command: StatusCommand) -> Self {
        Self {
            inner: ExporterInner {
                command: Arc::new(command),
                buckets: Arc::default(),
                host_process: None,
                telemetry_path: Self::DEFAULT_TELEMETRY_PATH.into(),
            },
            shutdown_future: Box::pin(future::pending()),
        }
    }

    /// Sets the path serving metrics. A leading `/` is added if missing.
    #[must_use]
    pub fn with_telemetry_path(mut self, path: &str) -> Self {
        self.inner.telemetry_path = if path.starts_with('/') {
            path.into()
        } else {
            format!("/{path}").into()
        };
        self
    }

    /// Adds metrics for the host Passenger / nginx process.
    #[must_use]
    pub fn with_host_process(mut self, collector: PidFileCollector) -> Self {
        self.inner.host_process = Some(collector);
        self
    }

    /// Configures graceful shutdown for the exporter server.
    #[must_use]
    pub fn with_graceful_shutdown<F>(mut self, shutdown: F) -> Self
    where
        F: Future<Output = ()> + Send + 'a,
    {
        self.shutdown_future = Box::pin(shutdown);
        self
    }

    /// Starts the server on the specified address. This future resolves when the server is shut down.
    ///
    /// The server will expose the following endpoints:
    ///
    /// - `GET` on the telemetry path: runs a scrape and serves the metrics in the format negotiated
    ///   via the `Accept` header (see [`Format`])
    /// - `GET /`: serves a landing page linking to the telemetry path
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the specified address fails.
    pub async fn start(self, bind_address: SocketAddr) -> io::Result<()> {
        tracing::info!("Starting Passenger exporter web server on {bind_address}");
        self.bind(bind_address).await?.start().await?;
        tracing::info!("Passenger exporter server shut down");
        Ok(())
    }

    /// Creates an HTTP exporter server and binds it to the specified address.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the specified address fails.
    pub async fn bind(mut self, bind_address: SocketAddr) -> io::Result<MetricsServer<'a>> {
        let listener = TcpListener::bind(bind_address).await?;
        let local_addr = listener.local_addr()?;
        let server = async move {
            let (started_shutdown_sender, started_shutdown) = watch::channel(());
            loop {
                let stream = tokio::select! {
                    res = listener.accept() => res?.0,
                    () = &mut self.shutdown_future => break,
                };

                let io = TokioIo::new(stream);
                let inner = self.inner.clone();
                let mut started_shutdown = started_shutdown.clone();
                tokio::spawn(async move {
                    let conn = http1::Builder::new().serve_connection(
                        io,
                        service_fn(|request| async {
                            Ok::<_, Infallible>(inner.handle(request).await)
                        }),
                    );
                    tokio::pin!(conn);

                    let res = tokio::select! {
                        _ = started_shutdown.changed() => {
                            conn.as_mut().graceful_shutdown();
                            conn.await
                        }
                        res = conn.as_mut() => res,
                    };
                    if let Err(err) = res {
                        tracing::warn!(%err, "Error serving connection");
                    }
                });
            }

            tracing::info!("Stop signal received, Passenger exporter is shutting down");
            // Send the graceful shutdown signal to all alive connections.
            drop(started_shutdown);
            started_shutdown_sender.send_replace(());
            // Wait until all connections are dropped.
            started_shutdown_sender.closed().await;

            Ok(())
        };

        Ok(MetricsServer {
            server: Box::pin(server),
            local_addr,
        })
    }
}

/// Metrics server bound to a certain local address returned by [`PassengerExporter::bind()`].
///
/// Useful e.g. if you need to find out which port the server was bound to if the 0th port was specified.
#[must_use = "Server should be `start()`ed"]
pub struct MetricsServer<'a> {
    server: Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>>,
    local_addr: SocketAddr,
}

impl fmt::Debug for MetricsServer<'_> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("MetricsServer")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl MetricsServer<'_> {
    /// Returns the local address this server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts this server. Resolves once the server is shut down.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting connections fails.
    pub async fn start(self) -> io::Result<()> {
        self.server.await
    }
}
