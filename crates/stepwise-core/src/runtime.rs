// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable server for stepwise-core.
//!
//! [`ServerBuilder`] wires the checkpoint engine, the checkpoint API and the
//! realtime API into one axum app and serves it from an existing tokio
//! runtime.
//!
//! # Example
//!
//! ```rust,ignore
//! use stepwise_core::persistence;
//! use stepwise_core::runtime::ServerBuilder;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let state = persistence::connect("sqlite::memory:").await?;
//!
//!     let server = ServerBuilder::new()
//!         .state(state)
//!         .realtime_jwt_secret("realtime")
//!         .run_jwt_secret("runs")
//!         .bind_addr("127.0.0.1:8288".parse()?)
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     server.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use stepwise_realtime::auth::NilAuthFinder;
use stepwise_realtime::{AuthFinder, Broadcaster, InProcessBroadcaster, RealtimeState};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api::{self, CheckpointApiState, DEFAULT_MAX_BODY_BYTES, RunOutputReader};
use crate::checkpoint::Checkpointer;
use crate::exechttp::{DNS_REFRESH_INTERVAL, RequestExecutor, SecureClient};
use crate::executor::Executor;
use crate::function::{AppCreator, EventPublisher, FunctionCreator, FunctionReader};
use crate::metrics::{MetricsProvider, NoopMetrics};
use crate::queue::Queue;
use crate::standalone::{
    LoggingEventPublisher, LoggingQueue, MemoryFunctionStore, StandaloneExecutor,
};
use crate::state::RunService;
use crate::trace::{LogTracerProvider, TracerProvider};

/// Default listen address.
pub const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 8288);

/// Prefixes the checkpoint API is mounted under.
pub const CHECKPOINT_PREFIXES: [&str; 2] = ["/checkpoint", "/http/runs"];

#[derive(Clone)]
struct FunctionStores {
    reader: Arc<dyn FunctionReader>,
    writer: Arc<dyn FunctionCreator>,
    apps: Arc<dyn AppCreator>,
}

impl FunctionStores {
    fn from_store<F>(store: Arc<F>) -> Self
    where
        F: FunctionReader + FunctionCreator + AppCreator + 'static,
    {
        Self {
            reader: store.clone(),
            writer: store.clone(),
            apps: store,
        }
    }
}

/// Builder for a [`Server`].
pub struct ServerBuilder {
    state: Option<Arc<dyn RunService>>,
    executor: Option<Arc<dyn Executor>>,
    output: Option<Arc<dyn RunOutputReader>>,
    queue: Arc<dyn Queue>,
    tracer: Arc<dyn TracerProvider>,
    metrics: Arc<dyn MetricsProvider>,
    events: Arc<dyn EventPublisher>,
    functions: FunctionStores,
    auth: Arc<dyn AuthFinder>,
    broadcaster: Option<Arc<dyn Broadcaster>>,
    http_client: Option<Arc<dyn RequestExecutor>>,
    secure_client: Option<SecureClient>,
    realtime_jwt_secret: Vec<u8>,
    run_jwt_secret: Vec<u8>,
    max_body_bytes: usize,
    bind_addr: SocketAddr,
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("state", &self.state.as_ref().map(|_| "..."))
            .field("executor", &self.executor.as_ref().map(|_| "..."))
            .field("broadcaster", &self.broadcaster.as_ref().map(|_| "..."))
            .field("max_body_bytes", &self.max_body_bytes)
            .field("bind_addr", &self.bind_addr)
            .finish()
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            state: None,
            executor: None,
            output: None,
            queue: Arc::new(LoggingQueue),
            tracer: Arc::new(LogTracerProvider::new()),
            metrics: Arc::new(NoopMetrics),
            events: Arc::new(LoggingEventPublisher),
            functions: FunctionStores::from_store(Arc::new(MemoryFunctionStore::new())),
            auth: Arc::new(NilAuthFinder),
            broadcaster: None,
            http_client: None,
            secure_client: None,
            realtime_jwt_secret: Vec::new(),
            run_jwt_secret: Vec::new(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            bind_addr: SocketAddr::from(DEFAULT_BIND_ADDR),
        }
    }
}

impl ServerBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the run state store (required).
    pub fn state(mut self, state: Arc<dyn RunService>) -> Self {
        self.state = Some(state);
        self
    }

    /// Set the executor.
    ///
    /// Default: a [`StandaloneExecutor`] over the state store, which also
    /// serves `/output`.
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Serve `/output` from `reader`.
    pub fn output_reader(mut self, reader: Arc<dyn RunOutputReader>) -> Self {
        self.output = Some(reader);
        self
    }

    /// Set the queue. Default: [`LoggingQueue`].
    pub fn queue(mut self, queue: Arc<dyn Queue>) -> Self {
        self.queue = queue;
        self
    }

    /// Set the tracer. Default: [`LogTracerProvider`].
    pub fn tracer(mut self, tracer: Arc<dyn TracerProvider>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Set the metrics sink. Default: [`NoopMetrics`].
    pub fn metrics(mut self, metrics: Arc<dyn MetricsProvider>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Set the event publisher. Default: [`LoggingEventPublisher`].
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    /// Set the app and function store. Default: [`MemoryFunctionStore`].
    pub fn functions<F>(mut self, store: Arc<F>) -> Self
    where
        F: FunctionReader + FunctionCreator + AppCreator + 'static,
    {
        self.functions = FunctionStores::from_store(store);
        self
    }

    /// Set request authentication. Default: [`NilAuthFinder`], which rejects
    /// every request not carrying a realtime token.
    pub fn auth(mut self, auth: Arc<dyn AuthFinder>) -> Self {
        self.auth = auth;
        self
    }

    /// Set the broadcaster. Default: a fresh [`InProcessBroadcaster`].
    pub fn broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Use `client` for requests made on behalf of runs. Its DNS cache is
    /// refreshed while the server runs.
    pub fn secure_client(mut self, client: SecureClient) -> Self {
        self.http_client = Some(Arc::new(client.clone()));
        self.secure_client = Some(client);
        self
    }

    /// Use `client` for requests made on behalf of runs.
    pub fn http_client(mut self, client: Arc<dyn RequestExecutor>) -> Self {
        self.http_client = Some(client);
        self.secure_client = None;
        self
    }

    /// Set the HS256 secret of realtime tokens (required).
    pub fn realtime_jwt_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.realtime_jwt_secret = secret.into();
        self
    }

    /// Set the HS256 secret of run-output tokens (required).
    pub fn run_jwt_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.run_jwt_secret = secret.into();
        self
    }

    /// Largest accepted checkpoint request body.
    ///
    /// Default: 4 MiB
    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Set the listen address.
    ///
    /// Default: `0.0.0.0:8288`
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Assemble the server.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<Server> {
        let state = self
            .state
            .ok_or_else(|| anyhow::anyhow!("state is required"))?;
        if self.realtime_jwt_secret.is_empty() {
            anyhow::bail!("realtime JWT secret is required");
        }
        if self.run_jwt_secret.is_empty() {
            anyhow::bail!("run JWT secret is required");
        }

        let (executor, output) = match self.executor {
            Some(executor) => (executor, self.output),
            None => {
                let standalone = Arc::new(StandaloneExecutor::new(
                    state.clone(),
                    self.tracer.clone(),
                ));
                let output: Arc<dyn RunOutputReader> = standalone.clone();
                (standalone as Arc<dyn Executor>, self.output.or(Some(output)))
            }
        };

        let mut checkpointer = Checkpointer::new(
            state.clone(),
            self.functions.reader.clone(),
            executor.clone(),
            self.tracer,
            self.queue,
        )
        .with_metrics(self.metrics)
        .with_run_jwt_secret(self.run_jwt_secret.clone());
        if let Some(client) = self.http_client {
            checkpointer = checkpointer.with_http_client(client);
        }

        let checkpoint_state = CheckpointApiState {
            checkpointer,
            auth: self.auth.clone(),
            executor,
            events: self.events,
            apps: self.functions.apps,
            functions: self.functions.reader,
            function_writer: self.functions.writer,
            output: None,
            run_jwt_secret: Arc::new(self.run_jwt_secret),
            upserts: Arc::new(api::UpsertCache::new()),
            max_body_bytes: self.max_body_bytes,
            output_poll_interval: api::OUTPUT_POLL_INTERVAL,
            output_wait_timeout: api::OUTPUT_WAIT_TIMEOUT,
        };
        let checkpoint_state = match output {
            Some(reader) => checkpoint_state.with_output_reader(reader),
            None => checkpoint_state,
        };

        let broadcaster = self
            .broadcaster
            .unwrap_or_else(|| Arc::new(InProcessBroadcaster::new()));
        let realtime_state =
            RealtimeState::new(broadcaster.clone(), self.auth, self.realtime_jwt_secret);

        Ok(Server {
            checkpoint_state,
            realtime_state,
            broadcaster,
            state,
            secure_client: self.secure_client,
            bind_addr: self.bind_addr,
        })
    }

    /// Build and start the server.
    pub async fn start(self) -> Result<ServerHandle> {
        self.build()?.start().await
    }
}

/// An assembled, not yet listening server.
pub struct Server {
    checkpoint_state: CheckpointApiState,
    realtime_state: RealtimeState,
    broadcaster: Arc<dyn Broadcaster>,
    state: Arc<dyn RunService>,
    secure_client: Option<SecureClient>,
    bind_addr: SocketAddr,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("checkpoint_state", &self.checkpoint_state)
            .field("bind_addr", &self.bind_addr)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// The combined router: the checkpoint API under each of
    /// [`CHECKPOINT_PREFIXES`] and the realtime API at the root.
    pub fn router(&self) -> Router {
        let checkpoint = api::router(self.checkpoint_state.clone());
        let mut app = Router::new();
        for prefix in CHECKPOINT_PREFIXES {
            app = app.nest(prefix, checkpoint.clone());
        }
        app.merge(stepwise_realtime::router(self.realtime_state.clone()))
    }

    /// Bind the listener and start serving.
    pub async fn start(self) -> Result<ServerHandle> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let router = self.router();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let background = CancellationToken::new();
        if let Some(client) = &self.secure_client {
            client
                .dns_cache()
                .spawn_refresh(DNS_REFRESH_INTERVAL, background.clone());
        }

        let server_handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                })
                .await?;
            info!("HTTP server stopped");
            Ok::<(), anyhow::Error>(())
        });

        info!(addr = %local_addr, "stepwise server started");

        Ok(ServerHandle {
            server_handle,
            shutdown_tx,
            background,
            broadcaster: self.broadcaster,
            state: self.state,
            local_addr,
        })
    }
}

/// A running server.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ServerHandle {
    server_handle: JoinHandle<Result<()>>,
    shutdown_tx: watch::Sender<bool>,
    background: CancellationToken,
    broadcaster: Arc<dyn Broadcaster>,
    state: Arc<dyn RunService>,
    local_addr: SocketAddr,
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.local_addr)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl ServerHandle {
    /// Address the server listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The broadcaster behind the realtime API.
    pub fn broadcaster(&self) -> &Arc<dyn Broadcaster> {
        &self.broadcaster
    }

    /// The run state store.
    pub fn state(&self) -> &Arc<dyn RunService> {
        &self.state
    }

    /// Check if the server is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
    }

    /// Gracefully shut down the server.
    ///
    /// Stops accepting connections, waits for in-flight requests, then stops
    /// background tasks. The broadcaster is left to the caller.
    pub async fn shutdown(self) -> Result<()> {
        info!("stepwise server shutting down...");

        let _ = self.shutdown_tx.send(true);
        let result = match self.server_handle.await {
            Ok(Ok(())) => {
                info!("stepwise server shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("stepwise server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("stepwise server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        };
        self.background.cancel();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sqlite_state() -> Arc<dyn RunService> {
        crate::persistence::connect("sqlite::memory:").await.unwrap()
    }

    #[test]
    fn test_builder_defaults() {
        let builder = ServerBuilder::new();
        assert!(builder.state.is_none());
        assert_eq!(builder.bind_addr, "0.0.0.0:8288".parse().unwrap());
        assert_eq!(builder.max_body_bytes, DEFAULT_MAX_BODY_BYTES);
    }

    #[test]
    fn test_build_requires_state() {
        let err = ServerBuilder::new()
            .realtime_jwt_secret("a")
            .run_jwt_secret("b")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("state is required"));
    }

    #[tokio::test]
    async fn test_build_requires_secrets() {
        let err = ServerBuilder::new()
            .state(sqlite_state().await)
            .run_jwt_secret("b")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("realtime JWT secret"));

        let err = ServerBuilder::new()
            .state(sqlite_state().await)
            .realtime_jwt_secret("a")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("run JWT secret"));
    }

    #[tokio::test]
    async fn test_default_executor_serves_output() {
        let server = ServerBuilder::new()
            .state(sqlite_state().await)
            .realtime_jwt_secret("a")
            .run_jwt_secret("b")
            .build()
            .unwrap();
        assert!(server.checkpoint_state.output.is_some());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let handle = ServerBuilder::new()
            .state(sqlite_state().await)
            .realtime_jwt_secret("a")
            .run_jwt_secret("b")
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .start()
            .await
            .unwrap();

        assert!(handle.is_running());
        assert_ne!(handle.local_addr().port(), 0);
        handle.shutdown().await.unwrap();
    }
}
