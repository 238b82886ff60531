//! In-memory coordinator used by the session and reconciler tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Channel, Connector, StreamReceiver, StreamSender, TransportError};
use crate::types::{Credentials, PortRange, StreamRequest, StreamResponse, WirePolicy};

type Inbound = Result<StreamResponse, TransportError>;

#[derive(Default)]
pub struct MockChannel {
    pub credentials: Mutex<Option<Credentials>>,
    pub sent: Arc<Mutex<Vec<StreamRequest>>>,
    pub port_ranges: Mutex<Vec<PortRange>>,
    pub policy_calls: Mutex<Vec<Vec<WirePolicy>>>,
    pub policy_errors: Mutex<Vec<String>>,
    /// Interface VLANs whose `SetPortRange` call fails.
    pub failing_vlans: Mutex<Vec<String>>,
    pub fail_stream: AtomicBool,
    pub fail_policies: AtomicBool,
    pub send_closed: Arc<AtomicBool>,
    pub closed: AtomicBool,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
}

impl MockChannel {
    /// Creates a channel and the handle used to push inbound stream messages.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedSender<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            inbound: Mutex::new(Some(rx)),
            ..Self::default()
        };
        (Arc::new(channel), tx)
    }

    pub fn policy_call_count(&self) -> usize {
        self.policy_calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn open_stream(
        &self,
    ) -> Result<(Box<dyn StreamSender>, Box<dyn StreamReceiver>), TransportError> {
        if self.fail_stream.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("stream refused".into()));
        }
        let rx = self
            .inbound
            .lock()
            .unwrap()
            .take()
            .ok_or(TransportError::Closed)?;
        let sender: Box<dyn StreamSender> = Box::new(MockSender {
            sent: Arc::clone(&self.sent),
            closed: Arc::clone(&self.send_closed),
        });
        let receiver: Box<dyn StreamReceiver> = Box::new(MockReceiver { rx });
        Ok((sender, receiver))
    }

    async fn set_port_range(&self, range: &PortRange) -> Result<(), TransportError> {
        self.port_ranges.lock().unwrap().push(range.clone());
        if self
            .failing_vlans
            .lock()
            .unwrap()
            .contains(&range.interface_vlan)
        {
            return Err(TransportError::Rejected("no such interface".into()));
        }
        Ok(())
    }

    async fn set_policies(&self, policies: &[WirePolicy]) -> Result<Vec<String>, TransportError> {
        self.policy_calls.lock().unwrap().push(policies.to_vec());
        if self.fail_policies.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(self.policy_errors.lock().unwrap().clone())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct MockSender {
    sent: Arc<Mutex<Vec<StreamRequest>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl StreamSender for MockSender {
    async fn send(&mut self, request: StreamRequest) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(request);
        Ok(())
    }

    async fn close_send(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct MockReceiver {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl StreamReceiver for MockReceiver {
    async fn recv(&mut self) -> Result<Option<StreamResponse>, TransportError> {
        match self.rx.recv().await {
            Some(Ok(msg)) => Ok(Some(msg)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// Hands out one prepared channel and records the credentials it was given.
pub struct MockConnector {
    pub channel: Arc<MockChannel>,
    pub refuse: bool,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        address: &str,
        credentials: Credentials,
    ) -> Result<Arc<dyn Channel>, TransportError> {
        if self.refuse {
            return Err(TransportError::Connect {
                address: address.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            });
        }
        *self.channel.credentials.lock().unwrap() = Some(credentials);
        let channel: Arc<dyn Channel> = self.channel.clone();
        Ok(channel)
    }
}
