//! Hotswap - a supervisor that swaps the code serving HTTP traffic without a restart
//!
//! A single [`supervisor::Supervisor`] owns the active worker (an external process
//! or a dynamically loaded library) and replaces it when a new artifact is
//! uploaded, fetched or explicitly reloaded. The router built here forwards all
//! other traffic to whichever worker was last published.

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{info, instrument};

pub mod client;
pub mod contract;
pub mod errors;
pub mod handlers;
pub mod inflight;
pub mod signal;
pub mod staging;
pub mod supervisor;
pub mod worker;

use client::{HttpClient, HyperClient};
use staging::{ArtifactSource, ArtifactStaging};
use supervisor::SupervisorHandle;

/// The application state shared by the router and the control endpoints
#[derive(Clone, Debug)]
pub struct AppState<T: HttpClient> {
    pub http_client: T,
    pub supervisor: SupervisorHandle,
    pub staging: Arc<ArtifactStaging>,
    pub source: Option<Arc<dyn ArtifactSource>>,
}

impl AppState<HyperClient> {
    /// Create a new AppState with the default Hyper client
    pub fn new(supervisor: SupervisorHandle, staging: Arc<ArtifactStaging>) -> Self {
        Self::with_client(supervisor, staging, client::create_hyper_client())
    }
}

impl<T: HttpClient> AppState<T> {
    /// Create a new AppState with a custom HTTP client (useful for testing)
    pub fn with_client(
        supervisor: SupervisorHandle,
        staging: Arc<ArtifactStaging>,
        http_client: T,
    ) -> Self {
        Self {
            http_client,
            supervisor,
            staging,
            source: None,
        }
    }

    /// Enables the fetch endpoint, staging artifacts from `source`.
    pub fn with_source(mut self, source: Arc<dyn ArtifactSource>) -> Self {
        self.source = Some(source);
        self
    }
}

/// Where the control endpoints are mounted. Everything else goes to the worker.
#[derive(Debug, Clone)]
pub struct ControlPaths {
    pub reload: String,
    pub upload: String,
    pub shutdown: String,
    pub fetch: String,
    pub status: String,
}

impl Default for ControlPaths {
    fn default() -> Self {
        Self {
            reload: "/_reload".into(),
            upload: "/_upload".into(),
            shutdown: "/_shutdown".into(),
            fetch: "/_fetch".into(),
            status: "/_status".into(),
        }
    }
}

/// Build the main router
/// This creates routes for:
/// - the control endpoints named in `paths`
/// - a fallback forwarding every other request to the active worker
#[instrument(skip(state))]
pub fn build_router<T: HttpClient + Clone + Send + Sync + 'static>(
    state: AppState<T>,
    paths: &ControlPaths,
) -> Router {
    info!("Building router");
    Router::new()
        .route(
            &paths.reload,
            get(handlers::reload::<T>).post(handlers::reload::<T>),
        )
        .route(
            &paths.upload,
            post(handlers::upload::<T>).layer(DefaultBodyLimit::disable()),
        )
        .route(
            &paths.shutdown,
            get(handlers::shutdown::<T>).post(handlers::shutdown::<T>),
        )
        .route(
            &format!("{}/{{name}}", paths.fetch.trim_end_matches('/')),
            post(handlers::fetch::<T>),
        )
        .route(&paths.status, get(handlers::status::<T>))
        .fallback(handlers::route_request::<T>)
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// `prefix` accepts either a literal or an owned string.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}

#[cfg(test)]
pub mod test_utils {
    use super::*;
    use crate::contract::tests::HOTSWAP_ENTRYPOINT_V1;
    use crate::errors::WorkerError;
    use crate::signal::ControlHandle;
    use crate::supervisor::{Supervisor, SupervisorOptions, SupervisorState};
    use crate::worker::{Backend, LoadedEntry, RouteTarget, Worker};
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    pub struct MockHttpClient {
        pub requests: Arc<Mutex<Vec<MockRequest>>>,
        response_builder: Arc<dyn Fn() -> Option<axum::response::Response> + Send + Sync>,
    }

    #[derive(Debug, Clone)]
    pub struct MockRequest {
        pub method: String,
        pub uri: String,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    impl MockHttpClient {
        pub fn new(status: StatusCode, body: &str) -> Self {
            let body = body.to_string();
            Self {
                requests: Arc::new(Mutex::new(Vec::new())),
                response_builder: Arc::new(move || {
                    Some(
                        axum::response::Response::builder()
                            .status(status)
                            .body(axum::body::Body::from(body.clone()))
                            .unwrap(),
                    )
                }),
            }
        }

        /// A client whose every request fails as if the worker had gone away.
        pub fn unreachable() -> Self {
            Self {
                requests: Arc::new(Mutex::new(Vec::new())),
                response_builder: Arc::new(|| None),
            }
        }

        pub fn get_requests(&self) -> Vec<MockRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl std::fmt::Debug for MockHttpClient {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MockHttpClient")
                .field("requests", &self.requests)
                .field("response_builder", &"<closure>")
                .finish()
        }
    }

    impl Clone for MockHttpClient {
        fn clone(&self) -> Self {
            Self {
                requests: Arc::clone(&self.requests),
                response_builder: Arc::clone(&self.response_builder),
            }
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn request(
            &self,
            req: axum::extract::Request,
        ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>> {
            let method = req.method().to_string();
            let uri = req.uri().to_string();
            let headers = req
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect();

            let body = axum::body::to_bytes(req.into_body(), usize::MAX)
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?
                .to_vec();

            self.requests.lock().unwrap().push(MockRequest {
                method,
                uri,
                headers,
                body,
            });

            (self.response_builder)().ok_or_else(|| "connection refused".into())
        }
    }

    /// Backend driven by the artifact's text: `echo` loads the built-in echo
    /// entry point, `bad-load`/`bad-contract` fail accordingly, and any other
    /// name is served as a process at `http://<name>.test/`.
    #[derive(Debug, Clone, Default)]
    pub struct ScriptedBackend;

    #[derive(Debug)]
    struct ScriptedWorker {
        artifact: PathBuf,
        generation: u64,
        target: RouteTarget,
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn exclusive(&self) -> bool {
            false
        }

        fn needs_executable(&self) -> bool {
            false
        }

        fn build(&self, artifact: &Path, generation: u64, _control: ControlHandle) -> Box<dyn Worker> {
            Box::new(ScriptedWorker {
                artifact: artifact.to_path_buf(),
                generation,
                target: RouteTarget::Unavailable,
            })
        }
    }

    #[async_trait]
    impl Worker for ScriptedWorker {
        async fn start(&mut self) -> Result<RouteTarget, WorkerError> {
            let path = self.artifact.clone();
            let script = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| WorkerError::Load {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            self.target = match script.trim() {
                "bad-load" => {
                    return Err(WorkerError::Load {
                        path,
                        reason: "invalid ELF header".into(),
                    });
                }
                "bad-contract" => {
                    return Err(WorkerError::Contract {
                        path,
                        reason: "missing symbol HOTSWAP_ENTRYPOINT_V1".into(),
                    });
                }
                "echo" => RouteTarget::Library {
                    entry: Arc::new(LoadedEntry::from_static(path, HOTSWAP_ENTRYPOINT_V1)),
                    generation: self.generation,
                },
                name => RouteTarget::Process {
                    base: format!("http://{name}.test/").parse().unwrap(),
                    generation: self.generation,
                    pid: None,
                },
            };
            Ok(self.target.clone())
        }

        async fn stop(&mut self, _graceful: bool) -> Result<(), WorkerError> {
            self.target = RouteTarget::Unavailable;
            Ok(())
        }

        fn route_target(&self) -> RouteTarget {
            self.target.clone()
        }
    }

    /// A running supervisor over [`ScriptedBackend`].
    pub struct TestApp {
        pub supervisor: SupervisorHandle,
        pub staging: Arc<ArtifactStaging>,
        pub dir: tempfile::TempDir,
    }

    impl TestApp {
        /// Starts with `initial` as the artifact text, or with no artifact.
        pub async fn start(initial: Option<&str>) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let staging = Arc::new(ArtifactStaging::new(dir.path().join("staging")).unwrap());
            let initial_artifact = initial.map(|script| {
                let path = dir.path().join("initial");
                std::fs::write(&path, script).unwrap();
                path
            });
            let options = SupervisorOptions::builder()
                .maybe_initial_artifact(initial_artifact)
                .build();

            let supervisor = Supervisor::new(Arc::new(ScriptedBackend), Arc::clone(&staging), options);
            let handle = supervisor.handle();
            tokio::spawn(supervisor.supervise());
            let booted = if initial.is_some() {
                SupervisorState::Running
            } else {
                SupervisorState::Degraded
            };
            handle.wait_for_state(booted).await;

            Self {
                supervisor: handle,
                staging,
                dir,
            }
        }

        pub fn state<T: HttpClient>(&self, client: T) -> AppState<T> {
            AppState::with_client(self.supervisor.clone(), Arc::clone(&self.staging), client)
        }
    }
}
