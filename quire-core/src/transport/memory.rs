use super::{Channel, Endpoint, Endpoints, Service, Transport};
use crate::error::{QuireError, Result};
use crate::rpc::{Envelope, Response};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex};

/// In-process network: services listen on named endpoints and channels are
/// direct calls into them, each served on its own task.
#[derive(Default)]
pub struct MemoryNetwork {
    state: Mutex<NetworkState>,
}

#[derive(Default)]
struct NetworkState {
    listeners: HashMap<Endpoint, Arc<dyn Service>>,
    links: Vec<Weak<Link>>,
}

struct Link {
    server: Endpoint,
    client: Option<Endpoint>,
    server_service: Arc<dyn Service>,
    client_service: Arc<dyn Service>,
    closed: watch::Sender<bool>,
}

impl Link {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }

    async fn wait_closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives as long as the link, so this only ends on close.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn touches(&self, endpoint: &Endpoint) -> bool {
        &self.server == endpoint || self.client.as_ref() == Some(endpoint)
    }
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport whose outbound links are attributed to `local`, so that
    /// severing `local` also cuts connections this node opened.
    pub fn transport(self: &Arc<Self>, local: Option<Endpoint>) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            local,
        }
    }

    pub async fn listen(&self, endpoint: Endpoint, service: Arc<dyn Service>) {
        tracing::debug!("memory network: listening on {}", endpoint);
        self.state.lock().await.listeners.insert(endpoint, service);
    }

    /// Takes the endpoint offline and drops every link touching it.
    pub async fn unlisten(&self, endpoint: &Endpoint) {
        tracing::debug!("memory network: {} goes offline", endpoint);
        self.state.lock().await.listeners.remove(endpoint);
        self.sever(endpoint).await;
    }

    /// Drops live links touching `endpoint`; the listener stays up.
    pub async fn sever(&self, endpoint: &Endpoint) {
        let mut state = self.state.lock().await;
        state.links.retain(|link| match link.upgrade() {
            Some(link) if link.touches(endpoint) => {
                link.close();
                false
            }
            Some(_) => true,
            None => false,
        });
    }

    pub async fn is_listening(&self, endpoint: &Endpoint) -> bool {
        self.state.lock().await.listeners.contains_key(endpoint)
    }
}

pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    local: Option<Endpoint>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(
        &self,
        endpoints: &Endpoints,
        inbound: Arc<dyn Service>,
    ) -> Result<Arc<dyn Channel>> {
        let mut state = self.network.state.lock().await;
        let (endpoint, service) = endpoints
            .iter()
            .find_map(|endpoint| {
                state
                    .listeners
                    .get(endpoint)
                    .map(|service| (endpoint.clone(), service.clone()))
            })
            .ok_or_else(|| QuireError::Network(format!("no listener at {}", endpoints)))?;

        let (closed, _) = watch::channel(false);
        let link = Arc::new(Link {
            server: endpoint,
            client: self.local.clone(),
            server_service: service,
            client_service: inbound,
            closed,
        });
        state.links.retain(|link| link.strong_count() > 0);
        state.links.push(Arc::downgrade(&link));

        let back: Arc<dyn Channel> = Arc::new(MemoryChannel {
            link: link.clone(),
            direction: Direction::ToClient,
            back: None,
        });
        Ok(Arc::new(MemoryChannel {
            link,
            direction: Direction::ToServer,
            back: Some(back),
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[derive(Clone, Copy)]
enum Direction {
    ToServer,
    ToClient,
}

struct MemoryChannel {
    link: Arc<Link>,
    direction: Direction,
    back: Option<Arc<dyn Channel>>,
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        if let Direction::ToServer = self.direction {
            self.link.close();
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn call(&self, envelope: Envelope) -> Result<Response> {
        if self.link.is_closed() {
            return Err(QuireError::Network(format!(
                "link to {} is closed",
                self.link.server
            )));
        }

        let service = match self.direction {
            Direction::ToServer => self.link.server_service.clone(),
            Direction::ToClient => self.link.client_service.clone(),
        };
        let back = self.back.clone();
        let link = self.link.clone();
        let serving = tokio::spawn(async move { service.serve(envelope, back).await });

        tokio::select! {
            response = serving => {
                response.map_err(|error| QuireError::Network(format!("peer task failed: {}", error)))
            }
            _ = link.wait_closed() => {
                Err(QuireError::Network(format!("link to {} closed during call", link.server)))
            }
        }
    }

    async fn closed(&self) {
        self.link.wait_closed().await
    }

    fn is_closed(&self) -> bool {
        self.link.is_closed()
    }
}
