//! Lifecycle of a fake service: registration, start and teardown.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use rama::{
    Layer as _,
    error::{BoxError, ErrorContext as _},
    graceful,
    http::{
        HeaderValue,
        layer::{required_header::AddRequiredResponseHeadersLayer, trace::TraceLayer},
        server::HttpServer,
    },
    net::{address::SocketAddress, socket::Interface},
    rt::Executor,
    tcp::server::TcpListener,
    telemetry::tracing,
};
use tokio::sync::oneshot;

use crate::{
    chaos::{ChaosSource, FailureController, SeededSource},
    endpoint::Endpoint,
    router::{DispatchState, FakeRouter, Route, normalise_path},
    utils::env::server_identifier,
};

/// Upper bound for the graceful shutdown of a fake service.
const SHUTDOWN_LIMIT: Duration = Duration::from_secs(1);

#[derive(Debug)]
/// A fake service in its registration phase.
///
/// Endpoints are resolved as soon as they are registered,
/// such that configuration mistakes surface before anything is bound.
pub struct FakeService {
    port: u16,
    bind_ip: IpAddr,
    chaos: FailureController,
    routes: Vec<Arc<Route>>,
}

impl Default for FakeService {
    fn default() -> Self {
        Self {
            port: 0,
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            chaos: FailureController::default(),
            routes: Vec::new(),
        }
    }
}

impl FakeService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen on a fixed port instead of an ephemeral one.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Bind to this ip instead of `127.0.0.1`.
    pub fn with_bind_ip(mut self, ip: impl Into<IpAddr>) -> Self {
        self.bind_ip = ip.into();
        self
    }

    /// Make the chaos draws repeatable across runs.
    pub fn with_chaos_seed(mut self, seed: u64) -> Self {
        self.chaos = FailureController::new(SeededSource::new(seed));
        self
    }

    pub fn with_chaos_source(mut self, source: impl ChaosSource) -> Self {
        self.chaos = FailureController::new(source);
        self
    }

    /// Register an endpoint, failing in case its configuration is invalid.
    ///
    /// Endpoints are matched in registration order.
    pub fn try_with_endpoint(mut self, endpoint: Endpoint) -> Result<Self, BoxError> {
        let route = Route::try_new(endpoint)?;
        tracing::trace!(
            fake.endpoint = route.pattern(),
            "fake endpoint registered",
        );
        self.routes.push(Arc::new(route));
        Ok(self)
    }

    /// Register an endpoint, panicking in case its configuration is invalid.
    #[track_caller]
    pub fn with_endpoint(self, endpoint: Endpoint) -> Self {
        match self.try_with_endpoint(endpoint) {
            Ok(service) => service,
            Err(err) => panic!("register fake endpoint: {err}"),
        }
    }

    pub fn try_with_endpoints(
        self,
        endpoints: impl IntoIterator<Item = Endpoint>,
    ) -> Result<Self, BoxError> {
        endpoints
            .into_iter()
            .try_fold(self, |service, endpoint| service.try_with_endpoint(endpoint))
    }

    /// Bind the listener and start serving.
    ///
    /// Only returns once the service accepts connections.
    pub async fn run(self) -> Result<RunningFakeService, BoxError> {
        let Self {
            port,
            bind_ip,
            chaos,
            routes,
        } = self;

        let interface: Interface = SocketAddr::new(bind_ip, port)
            .to_string()
            .parse()
            .context("parse fake service interface")
            .context_field("port", port)
            .with_context_debug_field("bind_ip", || bind_ip)?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let graceful = graceful::Shutdown::new(async move {
            let _ = shutdown_rx.await;
        });
        let exec = Executor::graceful(graceful.guard());

        let tcp_listener = TcpListener::bind(interface, exec.clone())
            .await
            .context("bind fake service")
            .context_field("port", port)
            .with_context_debug_field("bind_ip", || bind_ip)?;

        let addr: SocketAddress = tcp_listener
            .local_addr()
            .context("get bound address for fake service")?
            .into();
        let base_url = base_url_for(addr.ip_addr, addr.port);

        tracing::info!("fake service bound to: {addr} (base url: {base_url})");

        let routes: Arc<[Arc<Route>]> = routes.into();
        let state = Arc::new(DispatchState::new(chaos));

        let http_svc = (
            TraceLayer::new_for_http(),
            AddRequiredResponseHeadersLayer::new()
                .with_server_header_value(HeaderValue::from_static(server_identifier())),
        )
            .into_layer(FakeRouter::new(routes.clone(), state.clone()));
        let http_server = HttpServer::auto(exec.clone()).service(Arc::new(http_svc));

        exec.spawn_task(async move {
            tcp_listener.serve(http_server).await;
            tracing::debug!("fake service listener stopped");
        });

        Ok(RunningFakeService {
            base_url,
            addr,
            routes,
            state,
            shutdown: Some(ShutdownHandle {
                tx: shutdown_tx,
                graceful,
            }),
        })
    }
}

fn base_url_for(ip: IpAddr, port: u16) -> String {
    let ip = match ip {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    format!("http://{}", SocketAddr::new(ip, port))
}

struct ShutdownHandle {
    tx: oneshot::Sender<()>,
    graceful: graceful::Shutdown,
}

/// A fake service that is bound and serving.
///
/// Finish a test with [`RunningFakeService::tidy_up`] to verify that every
/// registered endpoint was called. Dropping it stops the service as well,
/// but without any verification.
pub struct RunningFakeService {
    base_url: String,
    addr: SocketAddress,
    routes: Arc<[Arc<Route>]>,
    state: Arc<DispatchState>,
    shutdown: Option<ShutdownHandle>,
}

impl RunningFakeService {
    /// Base url (`http://<ip>:<port>`) at which the service can be reached.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn socket_addr(&self) -> SocketAddress {
        self.addr
    }

    /// Absolute url for the given path on this service.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }

    /// Amount of calls received by the endpoint(s) registered for the given path.
    ///
    /// Returns `None` in case no endpoint was registered for it.
    pub fn calls(&self, path: &str) -> Option<u64> {
        let pattern = normalise_path(path);
        self.routes
            .iter()
            .filter(|route| route.pattern() == pattern)
            .map(|route| route.calls())
            .reduce(|a, b| a + b)
    }

    /// Amount of calls per registered endpoint, in registration order.
    pub fn call_counts(&self) -> Vec<(String, u64)> {
        self.routes
            .iter()
            .map(|route| (route.pattern().to_owned(), route.calls()))
            .collect()
    }

    /// Stop the service and verify that it was used as declared.
    ///
    /// The listener is released regardless of the outcome.
    pub async fn try_tidy_up(mut self) -> Result<(), TidyUpReport> {
        self.shutdown().await;

        let uncalled: Vec<_> = self
            .routes
            .iter()
            .filter(|route| route.calls() == 0)
            .map(|route| UncalledEndpoint {
                path: route.pattern().to_owned(),
                methods: route.methods().iter().map(ToString::to_string).collect(),
            })
            .collect();
        for endpoint in &uncalled {
            tracing::error!(
                fake.endpoint = %endpoint.path,
                "fake endpoint was never called",
            );
        }

        let report = TidyUpReport {
            uncalled,
            failed_expectations: self.state.expectation_failures(),
        };
        if report.is_empty() {
            Ok(())
        } else {
            Err(report)
        }
    }

    /// Stop the service, panicking in case not every endpoint was called
    /// or an expectation failed.
    pub async fn tidy_up(self) {
        if let Err(report) = self.try_tidy_up().await {
            panic!("{report}");
        }
    }

    async fn shutdown(&mut self) {
        let Some(ShutdownHandle { tx, graceful }) = self.shutdown.take() else {
            return;
        };
        let _ = tx.send(());
        match graceful.shutdown_with_limit(SHUTDOWN_LIMIT).await {
            Ok(delay) => {
                tracing::debug!("fake service {} shut down after {delay:?}", self.addr)
            }
            Err(err) => tracing::warn!(
                "fake service {} did not shut down within {SHUTDOWN_LIMIT:?}: {err}",
                self.addr
            ),
        }
    }
}

impl fmt::Debug for RunningFakeService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningFakeService")
            .field("base_url", &self.base_url)
            .field("routes", &self.routes)
            .field("running", &self.shutdown.is_some())
            .finish()
    }
}

impl Drop for RunningFakeService {
    fn drop(&mut self) {
        if let Some(ShutdownHandle { tx, graceful: _ }) = self.shutdown.take() {
            tracing::debug!("fake service {} dropped: stop without verification", self.addr);
            let _ = tx.send(());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A registered endpoint that did not receive a single call.
pub struct UncalledEndpoint {
    pub path: String,
    pub methods: Vec<String>,
}

#[derive(Debug, Clone, Default)]
/// Everything that went wrong during the lifetime of a fake service.
pub struct TidyUpReport {
    pub uncalled: Vec<UncalledEndpoint>,
    pub failed_expectations: Vec<String>,
}

impl TidyUpReport {
    pub fn is_empty(&self) -> bool {
        self.uncalled.is_empty() && self.failed_expectations.is_empty()
    }
}

impl fmt::Display for TidyUpReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fake service was not used as declared:")?;
        for endpoint in &self.uncalled {
            write!(
                f,
                "\n- endpoint {} [{}] was never called",
                endpoint.path,
                endpoint.methods.join(", ")
            )?;
        }
        for failure in &self.failed_expectations {
            write!(f, "\n- {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TidyUpReport {}
