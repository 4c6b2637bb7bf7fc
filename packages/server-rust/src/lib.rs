//! `LocalFaaS` Server: runs functions from a manifest behind emulated HTTP
//! front ends, a direct invoke API, and queue event sources.

pub mod config;
pub mod delivery;
pub mod events;
pub mod invocation;
pub mod invoker;
pub mod network;
pub mod observer;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod service;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use localfaas_core::Manifest;
use tracing::info;

pub use config::EmulatorConfig;
pub use delivery::{DeliverySink, LocalDelivery};
pub use invocation::{InvocationOutput, InvocationRequest, InvokeError};
pub use invoker::FunctionInvoker;
pub use network::{NetworkConfig, NetworkModule};
pub use queue::{QueueEventSource, QueueStore};
pub use registry::EndpointRegistry;

/// Root of a running emulator: owns the function table, the queues, the
/// delivery sinks and the queue event sources.
pub struct Emulator {
    config: Arc<EmulatorConfig>,
    registry: Arc<EndpointRegistry>,
    queues: Arc<QueueStore>,
    delivery: Arc<LocalDelivery>,
    sources: Vec<Arc<QueueEventSource>>,
}

impl Emulator {
    /// Builds every component from `manifest`. Nothing is mounted yet and
    /// event sources stay idle until [`Emulator::start_sources`].
    ///
    /// # Errors
    ///
    /// Returns an error if a function fails validation, a function or queue
    /// is declared twice, a filter pattern is invalid, or a batching window
    /// is not shorter than its queue's visibility timeout.
    pub fn new(manifest: Manifest, config: EmulatorConfig) -> anyhow::Result<Self> {
        manifest.validate()?;
        let config = Arc::new(config);
        let queues = Arc::new(QueueStore::new(&config));
        for declaration in &manifest.queues {
            queues.create(declaration)?;
        }

        let registry = Arc::new(EndpointRegistry::new());
        let delivery = Arc::new(LocalDelivery::start(
            Arc::downgrade(&registry),
            Arc::clone(&queues),
            config.region.clone(),
        ));
        let sink: Arc<dyn DeliverySink> = delivery.clone();

        let mut sources = Vec::new();
        for definition in manifest.functions {
            let triggers = definition.queues.clone();
            let invoker = FunctionInvoker::new(definition, Arc::clone(&config), Some(Arc::clone(&sink)));
            registry.register(Arc::clone(&invoker))?;

            for trigger in triggers {
                let queue = queues.get_or_create(&trigger.queue);
                let window = Duration::from_secs(trigger.maximum_batching_window);
                if window >= queue.visibility_timeout() {
                    anyhow::bail!(
                        "function {}: batching window of {}s must be shorter than the visibility timeout of queue {} ({}s)",
                        invoker.name(),
                        trigger.maximum_batching_window,
                        trigger.queue,
                        queue.visibility_timeout().as_secs()
                    );
                }
                let source = QueueEventSource::new(Arc::clone(&invoker), trigger, queue, &config)
                    .with_context(|| format!("function {}", invoker.name()))?;
                sources.push(source);
            }
            info!(
                function = %invoker.name(),
                runtime = %invoker.definition().runtime,
                endpoints = invoker.definition().endpoints.len(),
                "function registered"
            );
        }

        Ok(Self {
            config,
            registry,
            queues,
            delivery,
            sources,
        })
    }

    #[must_use]
    pub fn config(&self) -> &Arc<EmulatorConfig> {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn queues(&self) -> &Arc<QueueStore> {
        &self.queues
    }

    #[must_use]
    pub fn delivery(&self) -> &Arc<LocalDelivery> {
        &self.delivery
    }

    #[must_use]
    pub fn sources(&self) -> &[Arc<QueueEventSource>] {
        &self.sources
    }

    /// Creates the request server over this emulator's functions and queues.
    #[must_use]
    pub fn network(&self, config: NetworkConfig) -> NetworkModule {
        NetworkModule::new(
            config,
            Arc::clone(&self.config),
            Arc::clone(&self.registry),
            Arc::clone(&self.queues),
        )
    }

    /// Enables every event source whose trigger is marked enabled.
    pub fn start_sources(&self) {
        for source in self.sources.iter().filter(|s| s.trigger().enabled) {
            source.enable();
        }
    }

    /// Disables event sources, force-unmounts every runner and stops the
    /// delivery worker.
    pub async fn shutdown(&self) {
        for source in &self.sources {
            source.disable().await;
        }
        for invoker in self.registry.invokers() {
            invoker.unmount(true).await;
        }
        self.delivery.stop().await;
        info!("emulator stopped");
    }
}
