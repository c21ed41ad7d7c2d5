//! Proxy server: accept loop, command dispatcher, and shared state.
//!
//! The server owns the flow store, the intercept flag, the active ruleset,
//! and the pending-decision table. Each accepted client connection runs in
//! its own task; the dispatcher task drains observer commands from the bus
//! and mutates shared state or wakes paused handlers.

mod handler;
mod tunnel;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock, oneshot};
use tokio::task::JoinHandle;

use crate::bus::{Command, Event, EventBus};
use crate::error::ProxyError;
use crate::flows::{DEFAULT_CAPACITY, Flow, FlowStore};
use crate::rules::Ruleset;

/// Proxy server configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to listen on.
    pub host: String,
    /// Port to listen on; 0 picks a free port.
    pub port: u16,
    /// Flow store capacity.
    pub flow_capacity: usize,
    /// When set, an unanswered intercept gate resolves as Forward after this
    /// long. Unset waits indefinitely.
    pub decision_timeout: Option<Duration>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            flow_capacity: DEFAULT_CAPACITY,
            decision_timeout: None,
        }
    }
}

/// Outcome of a pending-decision slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    Forward,
    Drop,
    Repeat,
}

/// State shared between the accept loop, handlers, and the dispatcher.
pub(crate) struct ProxyShared {
    pub(crate) flows: RwLock<FlowStore>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) intercept: AtomicBool,
    pub(crate) ruleset: RwLock<Arc<Ruleset>>,
    pub(crate) pending: Mutex<HashMap<u64, oneshot::Sender<Decision>>>,
    pub(crate) client: reqwest::Client,
    pub(crate) decision_timeout: Option<Duration>,
}

/// Read-only view of the flow registry for observers.
///
/// Observers render from this handle instead of reaching into the proxy, so
/// nothing outside a connection handler can mutate a flow.
#[derive(Clone)]
pub struct FlowsView {
    shared: Arc<ProxyShared>,
}

impl FlowsView {
    /// Look up a flow by id.
    pub async fn get(&self, id: u64) -> Option<Flow> {
        self.shared.flows.read().await.get(id).cloned()
    }

    /// All retained flows in current access order.
    pub async fn all(&self) -> Vec<Flow> {
        self.shared
            .flows
            .read()
            .await
            .all()
            .into_iter()
            .cloned()
            .collect()
    }
}

/// The intercepting proxy server.
pub struct ProxyServer {
    config: ProxyConfig,
    shared: Arc<ProxyShared>,
    addr: RwLock<Option<SocketAddr>>,
    shutdown_tx: RwLock<Option<oneshot::Sender<()>>>,
    dispatcher: RwLock<Option<JoinHandle<()>>>,
}

impl ProxyServer {
    /// Create a server bound to nothing yet, wired to the given bus.
    pub fn new(config: ProxyConfig, bus: Arc<EventBus>) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|source| ProxyError::Client { source })?;
        let shared = Arc::new(ProxyShared {
            flows: RwLock::new(FlowStore::new(config.flow_capacity)),
            bus,
            intercept: AtomicBool::new(false),
            ruleset: RwLock::new(Arc::new(Ruleset::default())),
            pending: Mutex::new(HashMap::new()),
            client,
            decision_timeout: config.decision_timeout,
        });
        Ok(Self {
            config,
            shared,
            addr: RwLock::new(None),
            shutdown_tx: RwLock::new(None),
            dispatcher: RwLock::new(None),
        })
    }

    /// The bus this server publishes to and reads commands from.
    pub fn bus(&self) -> Arc<EventBus> {
        self.shared.bus.clone()
    }

    /// Read-only flows handle for observers.
    pub fn flows(&self) -> FlowsView {
        FlowsView {
            shared: self.shared.clone(),
        }
    }

    /// Start the dispatcher and the accept loop; returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, ProxyError> {
        let bind_addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;
        let addr = listener
            .local_addr()
            .map_err(|source| ProxyError::Bind {
                addr: bind_addr,
                source,
            })?;
        *self.addr.write().await = Some(addr);

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        *self.shutdown_tx.write().await = Some(shutdown_tx);
        *self.dispatcher.write().await = Some(tokio::spawn(dispatch(self.shared.clone())));

        let shared = self.shared.clone();
        tokio::spawn(async move {
            tracing::info!("proxy listening on {addr}");
            shared.bus.publish(Event::LogMessage {
                msg: format!("Proxy listening on {addr}"),
            });

            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                tracing::debug!("accepted connection from {peer}");
                                let shared = shared.clone();
                                tokio::spawn(handler::handle_client(stream, shared));
                            }
                            Err(err) => {
                                tracing::error!("accept error: {err}");
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        tracing::info!("proxy shutting down");
                        break;
                    }
                }
            }
        });

        Ok(addr)
    }

    /// Stop accepting connections and halt the dispatcher.
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.dispatcher.write().await.take() {
            task.abort();
        }
    }

    /// The bound address, once `start` has succeeded.
    pub async fn addr(&self) -> Option<SocketAddr> {
        *self.addr.read().await
    }
}

/// Drain observer commands and mutate proxy state accordingly.
async fn dispatch(shared: Arc<ProxyShared>) {
    while let Some(command) = shared.bus.next_command().await {
        match command {
            Command::SetIntercept { on } => {
                shared.intercept.store(on, Ordering::SeqCst);
                shared.bus.publish(Event::LogMessage {
                    msg: format!("Intercept set to {on}"),
                });
            }
            Command::Forward { flow_id } => resolve(&shared, flow_id, Decision::Forward).await,
            Command::Drop { flow_id } => resolve(&shared, flow_id, Decision::Drop).await,
            Command::Repeat { flow_id } => resolve(&shared, flow_id, Decision::Repeat).await,
            Command::ApplyRules { doc } => match Ruleset::compile(doc) {
                Ok(ruleset) => {
                    let count = ruleset.len();
                    *shared.ruleset.write().await = Arc::new(ruleset);
                    shared.bus.publish(Event::LogMessage {
                        msg: format!("Ruleset replaced ({count} rules)"),
                    });
                }
                Err(err) => {
                    tracing::warn!("rejected rule document: {err}");
                    shared.bus.publish(Event::LogMessage {
                        msg: format!("Rejected rule document: {err}"),
                    });
                }
            },
        }
    }
}

/// Complete the pending slot for `flow_id`, if one is installed.
async fn resolve(shared: &Arc<ProxyShared>, flow_id: u64, decision: Decision) {
    if let Some(tx) = shared.pending.lock().await.remove(&flow_id) {
        let _ = tx.send(decision);
    } else {
        tracing::debug!("no pending decision slot for flow {flow_id}");
    }
}
