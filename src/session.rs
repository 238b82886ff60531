//! Coordinator session.
//!
//! A session owns one connection to the coordinator.  Once the persistent
//! stream is open it runs two tasks: the receiver, which reads the stream
//! and feeds the update queues, and the dispatcher, which applies link
//! directives to the session's [`LinkStore`] and pushes policies whenever
//! the coordinator makes us primary.
//!
//! A session whose stream ends is not reconnected.  The receiver reports a
//! [`SessionEnded`] event to the supervisor, which releases the session with
//! [`Session::close_ended`].

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::links::{LinkDirective, LinkStore};
use crate::policy::{Policy, PolicySync};
use crate::transport::{Channel, Connector, StreamReceiver, StreamSender, TransportError};
use crate::types::{
    ArbitrationStatus, ArbitrationUpdate, Credentials, PortRange, StreamRequest, StreamResponse,
};
use crate::updates::{self, UpdateReceiver, UpdateSender};

/// Everything a session needs, resolved from the client configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub address: String,
    pub credentials: Credentials,
    pub interfaces: Vec<PortRange>,
    pub policies: Vec<Policy>,
    /// Queue depth above which a lagging dispatcher is reported.
    pub backlog_warn: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Streaming,
    Closed,
}

/// Our role as last announced by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArbitrationState {
    #[default]
    NotPrimary,
    Primary,
}

/// Sent to the supervisor when a session's stream terminates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEnded {
    pub session: String,
    pub reason: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("could not connect to {address}: {source}")]
    Connect {
        address: String,
        source: TransportError,
    },
    #[error("StreamChannel RPC failed: {0}")]
    OpenStream(#[source] TransportError),
}

pub struct Session {
    config: SessionConfig,
    state: SessionState,
    links: Arc<LinkStore>,
    arbitration: Arc<watch::Sender<ArbitrationState>>,
    channel: Option<Arc<dyn Channel>>,
    sender: Option<Box<dyn StreamSender>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let (arbitration, _) = watch::channel(ArbitrationState::default());
        Self {
            config,
            state: SessionState::Disconnected,
            links: Arc::new(LinkStore::new()),
            arbitration: Arc::new(arbitration),
            channel: None,
            sender: None,
            tasks: Vec::new(),
        }
    }

    /// Name of the client this session authenticates as.
    pub fn name(&self) -> &str {
        &self.config.credentials.client
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn arbitration(&self) -> ArbitrationState {
        *self.arbitration.borrow()
    }

    pub fn links(&self) -> &Arc<LinkStore> {
        &self.links
    }

    /// Connects, opens the persistent stream, bids for primary status and
    /// registers the configured port ranges.
    ///
    /// An error here is a startup failure; the connection is released
    /// before returning it.
    pub async fn connect(
        &mut self,
        connector: &dyn Connector,
        ended: mpsc::UnboundedSender<SessionEnded>,
    ) -> Result<(), SessionError> {
        self.state = SessionState::Connecting;
        info!(
            "[{}] Connecting to coordinator at {}",
            self.name(),
            self.config.address
        );
        let channel = match connector
            .connect(&self.config.address, self.config.credentials.clone())
            .await
        {
            Ok(channel) => channel,
            Err(source) => {
                self.state = SessionState::Closed;
                return Err(SessionError::Connect {
                    address: self.config.address.clone(),
                    source,
                });
            }
        };

        let (mut sender, receiver) = match channel.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                channel.close().await;
                self.state = SessionState::Closed;
                return Err(SessionError::OpenStream(e));
            }
        };
        self.state = SessionState::Streaming;
        info!("[{}] Persistent stream open", self.name());

        let name = self.name().to_string();
        let (arb_tx, arb_rx) = updates::channel("arbitration", self.config.backlog_warn);
        let (link_tx, link_rx) = updates::channel("link update", self.config.backlog_warn);
        let receiver = tokio::spawn(receive(name.clone(), receiver, arb_tx, link_tx, ended));
        self.tasks.push(receiver);

        // Request write access to policies
        if let Err(e) = sender
            .send(StreamRequest::Arbitration(ArbitrationUpdate::bid()))
            .await
        {
            error!("[{}] Sending arbitration bid failed: {}", self.name(), e);
        }

        for range in &self.config.interfaces {
            match channel.set_port_range(range).await {
                Ok(()) => info!(
                    "[{}] Port range {}-{} set on VLAN {} ({})",
                    self.name(),
                    range.first_port,
                    range.last_port,
                    range.interface_vlan,
                    range.interface_ip
                ),
                Err(e) => error!(
                    "[{}] SetPortRange RPC failed for VLAN {}: {}",
                    self.name(),
                    range.interface_vlan,
                    e
                ),
            }
        }

        let dispatcher = Dispatcher {
            session: name,
            links: Arc::clone(&self.links),
            channel: Arc::clone(&channel),
            policies: PolicySync::new(&self.config.policies, &self.config.credentials.asn),
            arbitration: Arc::clone(&self.arbitration),
        };
        self.tasks.push(tokio::spawn(dispatcher.run(arb_rx, link_rx)));

        self.sender = Some(sender);
        self.channel = Some(channel);
        Ok(())
    }

    /// Closes the send half of the stream and the connection, then stops the
    /// session's tasks.  Safe to call in any state.
    pub async fn disconnect(&mut self) {
        if let Some(mut sender) = self.sender.take() {
            sender.close_send().await;
        }
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.arbitration.send_replace(ArbitrationState::NotPrimary);
        if self.state == SessionState::Streaming {
            info!("[{}] Disconnected", self.name());
        }
        self.state = SessionState::Closed;
    }

    /// Releases a session whose stream has ended.  Updates queued before the
    /// stream ended are applied first.
    pub async fn close_ended(&mut self) {
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("[{}] Session task panicked", self.config.credentials.client);
                }
            }
        }
        self.disconnect().await;
    }
}

async fn receive(
    session: String,
    mut stream: Box<dyn StreamReceiver>,
    arbitration: UpdateSender<ArbitrationUpdate>,
    links: UpdateSender<LinkDirective>,
    ended: mpsc::UnboundedSender<SessionEnded>,
) {
    let reason = loop {
        let msg = match stream.recv().await {
            Ok(Some(msg)) => msg,
            Ok(None) => break "stream closed by coordinator".to_string(),
            Err(e) => break e.to_string(),
        };
        debug!("[{}] Stream message: {:?}", session, msg);
        match msg {
            StreamResponse::Arbitration(update) => {
                info!("[{}] Arbitration update: {:?}", session, update);
                if arbitration.send(update).is_err() {
                    break "dispatcher stopped".to_string();
                }
            }
            StreamResponse::LinkUpdate(update) => match LinkDirective::try_from(update) {
                Ok(directive) => {
                    info!("[{}] Link update: {:?}", session, directive);
                    if links.send(directive).is_err() {
                        break "dispatcher stopped".to_string();
                    }
                }
                Err(e) => warn!("[{}] Dropping link update: {}", session, e),
            },
            StreamResponse::Error(notice) => warn!("[{}] Coordinator: {}", session, notice.message),
        }
    };
    warn!(
        "[{}] Receiving from persistent stream failed: {}",
        session, reason
    );
    // Closing the queues stops the dispatcher.
    drop(arbitration);
    drop(links);
    let _ = ended.send(SessionEnded { session, reason });
}

struct Dispatcher {
    session: String,
    links: Arc<LinkStore>,
    channel: Arc<dyn Channel>,
    policies: PolicySync,
    arbitration: Arc<watch::Sender<ArbitrationState>>,
}

impl Dispatcher {
    /// Services both queues until both are closed.
    async fn run(
        self,
        mut arbitration: UpdateReceiver<ArbitrationUpdate>,
        mut links: UpdateReceiver<LinkDirective>,
    ) {
        let (mut arbitration_open, mut links_open) = (true, true);
        while arbitration_open || links_open {
            tokio::select! {
                update = arbitration.recv(), if arbitration_open => match update {
                    Some(update) => self.on_arbitration(update).await,
                    None => arbitration_open = false,
                },
                directive = links.recv(), if links_open => match directive {
                    Some(directive) => self.on_directive(directive),
                    None => links_open = false,
                },
            }
        }
        debug!(
            "[{}] Dispatcher stopped (peak backlog: {} arbitration, {} link; {} high-water crossings)",
            self.session,
            arbitration.peak(),
            links.peak(),
            arbitration.crossings() + links.crossings()
        );
    }

    fn on_directive(&self, directive: LinkDirective) {
        let link = directive.link().clone();
        self.links.apply(directive);
        debug!(
            "[{}] {} is now {:?}",
            self.session,
            link,
            self.links.state(&link)
        );
    }

    async fn on_arbitration(&self, update: ArbitrationUpdate) {
        let role = match update.status {
            ArbitrationStatus::Primary => ArbitrationState::Primary,
            ArbitrationStatus::NotPrimary => ArbitrationState::NotPrimary,
            ArbitrationStatus::Error => {
                warn!(
                    "[{}] Coordinator reported an arbitration error{}",
                    self.session,
                    update
                        .vlan
                        .as_deref()
                        .map(|v| format!(" for VLAN {}", v))
                        .unwrap_or_default()
                );
                ArbitrationState::NotPrimary
            }
        };
        let previous = self.arbitration.send_replace(role);
        if previous != role {
            info!("[{}] Arbitration state: {:?}", self.session, role);
        }
        if role == ArbitrationState::Primary {
            self.policies.sync(self.channel.as_ref()).await;
        }
    }
}
