//! Request server with deferred startup lifecycle.
//!
//! `new()` allocates shared state, `start()` binds the TCP listener, and
//! `serve()` accepts connections. Binding before serving lets the caller
//! learn the OS-assigned port first.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::handlers::{
    enqueue_handler, health_handler, invoke_handler, liveness_handler, readiness_handler,
    route_handler, AppState,
};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;
use crate::config::EmulatorConfig;
use crate::queue::QueueStore;
use crate::registry::EndpointRegistry;

/// How long shutdown waits for in-flight invocations.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    state: AppState,
}

impl NetworkModule {
    #[must_use]
    pub fn new(
        config: NetworkConfig,
        emulator: Arc<EmulatorConfig>,
        registry: Arc<EndpointRegistry>,
        queues: Arc<QueueStore>,
    ) -> Self {
        let state = AppState {
            registry,
            queues,
            emulator,
            shutdown: Arc::new(ShutdownController::new()),
            config: Arc::new(config.clone()),
            start_time: Instant::now(),
        };
        Self {
            config,
            listener: None,
            state,
        }
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.state.shutdown)
    }

    /// Assembles the router.
    ///
    /// Routes:
    /// - `GET /health`, `/health/live`, `/health/ready`
    /// - `POST /2015-03-31/functions/{name}/invocations` and `/@invoke/{name}`
    /// - `POST /@queue/{name}`
    /// - anything else: function endpoints
    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .route("/2015-03-31/functions/{name}/invocations", post(invoke_handler))
            .route("/@invoke/{name}", post(invoke_handler))
            .route("/@queue/{name}", post(enqueue_handler))
            .fallback(route_handler)
            .layer(DefaultBodyLimit::max(self.config.max_body_bytes))
            .layer(build_http_layers(&self.config))
            .with_state(self.state.clone())
    }

    /// Binds the listener and returns the bound port.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        info!(host = %self.config.host, port, "listening");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then drains in-flight invocations.
    ///
    /// # Errors
    ///
    /// Returns an error if the server hits a fatal I/O error or the TLS
    /// certificates cannot be loaded.
    ///
    /// # Panics
    ///
    /// Panics if `start()` was not called before `serve()`.
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let router = self.build_router();
        let listener = self
            .listener
            .expect("start() must be called before serve()");
        let controller = Arc::clone(&self.state.shutdown);

        controller.set_ready();

        if let Some(tls) = &self.config.tls {
            serve_tls(listener, router, tls, shutdown).await?;
        } else {
            info!("serving plain HTTP");
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await?;
        }

        drain(&controller).await;
        Ok(())
    }
}

async fn serve_tls(
    listener: TcpListener,
    router: Router,
    tls: &super::config::TlsConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    use axum_server::tls_rustls::RustlsConfig;

    let rustls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load TLS certificates: {e}"))?;

    let addr = listener.local_addr()?;
    let std_listener = listener.into_std()?;
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        shutdown.await;
        shutdown_handle.graceful_shutdown(None);
    });

    info!(%addr, "serving HTTPS");
    axum_server::from_tcp_rustls(std_listener, rustls_config)
        .handle(handle)
        .serve(router.into_make_service())
        .await?;
    Ok(())
}

async fn drain(controller: &ShutdownController) {
    controller.trigger_shutdown();
    if controller.wait_for_drain(DRAIN_TIMEOUT).await {
        info!("request server drained");
    } else {
        warn!(in_flight = controller.in_flight_count(), "drain timeout expired");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module() -> NetworkModule {
        let emulator = EmulatorConfig::default();
        NetworkModule::new(
            NetworkConfig {
                port: 0,
                ..NetworkConfig::default()
            },
            Arc::new(emulator.clone()),
            Arc::new(EndpointRegistry::new()),
            Arc::new(QueueStore::new(&emulator)),
        )
    }

    #[test]
    fn new_does_not_bind() {
        assert!(module().listener.is_none());
    }

    #[test]
    fn router_builds() {
        let _router = module().build_router();
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let mut module = module();
        let port = module.start().await.unwrap();
        assert!(port > 0);
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    async fn serve_stops_on_shutdown_signal() {
        let mut module = module();
        module.start().await.unwrap();
        let controller = module.shutdown_controller();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(module.serve(async move {
            let _ = rx.await;
        }));

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
        assert_eq!(controller.health_state(), crate::network::HealthState::Stopped);
    }

    #[tokio::test]
    #[should_panic(expected = "start() must be called before serve()")]
    async fn serve_panics_without_start() {
        let _ = module().serve(std::future::pending::<()>()).await;
    }
}
