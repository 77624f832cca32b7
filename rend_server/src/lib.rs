//! The rendezvous registry server.
//!
//! [`Server::start`] wires the pieces together:
//!
//! - rebuilds the [`ExpiryIndex`] (and the active-registrations gauge)
//!   by scanning the [`rend_store::RecordStore`],
//! - binds an iroh endpoint and registers the request handler for the
//!   `/rend/0.1.0` ALPN on a router,
//! - starts the cleaner task that deletes records past their deadline.
//!
//! [`Server::stop`] tears everything down in the opposite order and is
//! idempotent.

use anyhow::Context;
use iroh::protocol::Router;
use iroh::{Endpoint, EndpointAddr, EndpointId};
use rend_store::RecordStore;
use std::sync::{Arc, Mutex};
use tracing::info;

mod cleaner;
mod config;
mod expiry;
mod handler;
mod metrics;
mod metrics_service;

pub use config::{
    DEFAULT_CLEANER_PERIOD, DEFAULT_LONGEST_TTL, DEFAULT_MAX_LIMIT, DEFAULT_READ_TIMEOUT,
    DEFAULT_WRITE_TIMEOUT, ServerConfig,
};
pub use expiry::{ExpiryEntry, ExpiryIndex};
pub use metrics::{NullMetrics, PromMetrics, ServerMetrics};
pub use metrics_service::start_metrics_server;

use cleaner::Cleaner;
use handler::{HandlerState, RendezvousService};

/// A running rendezvous server.
pub struct Server {
    endpoint: Endpoint,
    router: Option<Router>,
    cleaner: Option<Cleaner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").field("id", &self.id()).finish()
    }
}

impl Server {
    /// Brings the server up over `store`. A failure at any step aborts
    /// start; resources acquired earlier are released on drop.
    pub async fn start(config: ServerConfig, store: RecordStore) -> anyhow::Result<Server> {
        let index = Arc::new(ExpiryIndex::new());

        // Deadlines are persisted with the records, so a restart can
        // reconstruct the whole index from one scan.
        let collected = Arc::new(Mutex::new(Vec::new()));
        {
            let collected = collected.clone();
            let metrics = config.metrics.clone();
            store
                .iterate_all(move |key, deadline_ns| {
                    metrics.add_active_registration(&key.topic_lossy());
                    collected.lock().unwrap().push((key, deadline_ns));
                })
                .await
                .context("failed to scan the record store")?;
        }
        let entries = std::mem::take(&mut *collected.lock().unwrap());
        if !entries.is_empty() {
            info!(records = entries.len(), "rebuilt expiry index from store");
        }
        index.rebuild(entries);

        let mut builder = Endpoint::builder();
        if let Some(secret) = config.secret_key.clone() {
            builder = builder.secret_key(secret);
        }
        if let Some(addr) = config.bind_addr {
            builder = builder.bind_addr_v4(addr);
        }
        let endpoint = builder.bind().await.context("failed to bind endpoint")?;

        let service = RendezvousService::new(HandlerState {
            store: store.clone(),
            index: index.clone(),
            metrics: config.metrics.clone(),
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            longest_ttl: config.longest_ttl,
            max_limit: config.max_limit,
        });
        let router = Router::builder(endpoint.clone())
            .accept(rend_core::proto::ALPN, service)
            .spawn();

        let cleaner = Cleaner::spawn(store, index, config.metrics, config.cleaner_period);

        info!(id = %endpoint.id(), "rendezvous server started");
        Ok(Server {
            endpoint,
            router: Some(router),
            cleaner: Some(cleaner),
        })
    }

    /// The endpoint address clients dial: the server's identity plus
    /// its listening addresses.
    pub fn addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    /// The server's peer identity.
    pub fn id(&self) -> EndpointId {
        self.endpoint.id()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Stops the cleaner, the router, and the endpoint. Safe to call
    /// more than once; later calls are no-ops.
    pub async fn stop(&mut self) -> anyhow::Result<()> {
        if let Some(cleaner) = self.cleaner.take() {
            cleaner.stop().await;
        }
        if let Some(router) = self.router.take() {
            router
                .shutdown()
                .await
                .context("failed to shut down the router")?;
            self.endpoint.close().await;
        }
        Ok(())
    }
}
