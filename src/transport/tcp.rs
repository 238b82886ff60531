//! Newline-delimited JSON transport over TCP.
//!
//! The persistent stream is a single TCP connection.  It starts with a
//! `stream` header frame carrying the credentials, answered by one reply
//! frame; after that each line is a [`StreamRequest`] (outbound) or a
//! [`StreamResponse`] (inbound).  The stream connection is dialed by
//! [`TcpConnector::connect`], so an unreachable coordinator fails there.
//! Unary calls open a short-lived connection, send one request frame and
//! read one reply frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::{Channel, Connector, StreamReceiver, StreamSender, TransportError};
use crate::types::{Credentials, PortRange, StreamRequest, StreamResponse, WirePolicy};

/// Request frames.  Every frame carries the connection's credentials.
#[derive(Debug, Serialize)]
#[serde(tag = "call", rename_all = "snake_case")]
enum Request<'a> {
    Stream {
        metadata: &'a Credentials,
    },
    SetPortRange {
        metadata: &'a Credentials,
        range: &'a PortRange,
    },
    SetPolicies {
        metadata: &'a Credentials,
        policies: &'a [WirePolicy],
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Reply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    errors: Vec<String>,
}

async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, TransportError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            return Ok(Some(serde_json::from_str(&line)?));
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        address: &str,
        credentials: Credentials,
    ) -> Result<Arc<dyn Channel>, TransportError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|source| TransportError::Connect {
                address: address.to_string(),
                source,
            })?;
        debug!("Connected to {}", address);
        let channel: Arc<dyn Channel> = Arc::new(TcpChannel {
            address: address.to_string(),
            credentials,
            pending: Mutex::new(Some(stream)),
            closed: AtomicBool::new(false),
        });
        Ok(channel)
    }
}

pub struct TcpChannel {
    address: String,
    credentials: Credentials,
    /// Connection dialed by the connector, kept for the persistent stream.
    pending: Mutex<Option<TcpStream>>,
    closed: AtomicBool,
}

impl TcpChannel {
    fn take_pending(&self) -> Option<TcpStream> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    async fn dial(&self) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|source| TransportError::Connect {
                address: self.address.clone(),
                source,
            })?;
        Self::split(stream)
    }

    fn split(
        stream: TcpStream,
    ) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf), TransportError> {
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok((BufReader::new(reader), writer))
    }

    /// Sends `request` and waits for the coordinator's reply.
    async fn exchange(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
        request: &Request<'_>,
    ) -> Result<Reply, TransportError> {
        write_frame(writer, request).await?;
        let reply: Reply = read_frame(reader).await?.ok_or(TransportError::Closed)?;
        match reply.error {
            Some(error) => Err(TransportError::Rejected(error)),
            None => Ok(reply),
        }
    }

    async fn call(&self, request: Request<'_>) -> Result<Reply, TransportError> {
        let (mut reader, mut writer) = self.dial().await?;
        let reply = self.exchange(&mut reader, &mut writer, &request).await;
        let _ = writer.shutdown().await;
        reply
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn open_stream(
        &self,
    ) -> Result<(Box<dyn StreamSender>, Box<dyn StreamReceiver>), TransportError> {
        let (mut reader, mut writer) = match self.take_pending() {
            Some(stream) if !self.closed.load(Ordering::Acquire) => Self::split(stream)?,
            _ => self.dial().await?,
        };
        let header = Request::Stream {
            metadata: &self.credentials,
        };
        self.exchange(&mut reader, &mut writer, &header).await?;
        debug!("Stream to {} established", self.address);
        let sender: Box<dyn StreamSender> = Box::new(TcpStreamSender {
            writer: Some(writer),
        });
        let receiver: Box<dyn StreamReceiver> = Box::new(TcpStreamReceiver { reader });
        Ok((sender, receiver))
    }

    async fn set_port_range(&self, range: &PortRange) -> Result<(), TransportError> {
        self.call(Request::SetPortRange {
            metadata: &self.credentials,
            range,
        })
        .await
        .map(|_| ())
    }

    async fn set_policies(&self, policies: &[WirePolicy]) -> Result<Vec<String>, TransportError> {
        self.call(Request::SetPolicies {
            metadata: &self.credentials,
            policies,
        })
        .await
        .map(|reply| reply.errors)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        drop(self.take_pending());
    }
}

struct TcpStreamSender {
    writer: Option<OwnedWriteHalf>,
}

#[async_trait]
impl StreamSender for TcpStreamSender {
    async fn send(&mut self, request: StreamRequest) -> Result<(), TransportError> {
        let writer = self.writer.as_mut().ok_or(TransportError::Closed)?;
        write_frame(writer, &request).await
    }

    async fn close_send(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
    }
}

struct TcpStreamReceiver {
    reader: BufReader<OwnedReadHalf>,
}

#[async_trait]
impl StreamReceiver for TcpStreamReceiver {
    async fn recv(&mut self) -> Result<Option<StreamResponse>, TransportError> {
        read_frame(&mut self.reader).await
    }
}
