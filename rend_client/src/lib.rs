//! Client for the rendezvous registry protocol.
//!
//! [`Client::connect`] dials a server over iroh under the
//! `/rend/0.1.0` ALPN; [`Client::register`] and [`Client::discover`]
//! each open one bidirectional stream, send the tagged request, and
//! read the response.

use iroh::endpoint::{Connection, Endpoint};
use rend_core::proto::{
    self, Discover, DiscoverResponse, MAX_MESSAGE_SIZE, MessageType, ProtoError, Register,
    RegisterResponse, ResponseStatus,
};
use rend_core::{EndpointRecord, RecordError};
use std::time::Duration;
use tracing::debug;

/// Errors a client call can surface.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ClientError {
    #[error("failed to connect to the server: {0}")]
    Connect(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("server answered with status {0:?}")]
    Status(ResponseStatus),
}

/// A connection to one rendezvous server.
#[derive(Debug, Clone)]
pub struct Client {
    conn: Connection,
}

impl Client {
    /// Dials `addr` from `endpoint`.
    pub async fn connect(
        endpoint: &Endpoint,
        addr: impl Into<iroh::EndpointAddr>,
    ) -> Result<Self, ClientError> {
        let conn = endpoint
            .connect(addr, proto::ALPN)
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        Ok(Client { conn })
    }

    /// Advertises `record` under `topic` for `ttl`.
    pub async fn register(
        &self,
        topic: &str,
        record: &EndpointRecord,
        ttl: Duration,
    ) -> Result<(), ClientError> {
        let request = proto::encode_request(
            MessageType::Register,
            &Register {
                topic: topic.to_owned(),
                record: record.encode()?,
                ttl: ttl.as_nanos().min(u64::MAX as u128) as u64,
            },
        )?;
        let response: RegisterResponse = self.round_trip(request).await?;
        debug!(topic, status = ?response.status, "register answered");
        match response.status {
            ResponseStatus::Ok => Ok(()),
            status => Err(ClientError::Status(status)),
        }
    }

    /// Asks for up to `limit` records registered under `topic`.
    pub async fn discover(
        &self,
        topic: &str,
        limit: u64,
    ) -> Result<Vec<EndpointRecord>, ClientError> {
        let request = proto::encode_request(
            MessageType::Discover,
            &Discover {
                topic: topic.to_owned(),
                limit,
            },
        )?;
        let response: DiscoverResponse = self.round_trip(request).await?;
        debug!(
            topic,
            status = ?response.status,
            records = response.records.len(),
            "discover answered"
        );
        if response.status != ResponseStatus::Ok {
            return Err(ClientError::Status(response.status));
        }
        response
            .records
            .iter()
            .map(|bytes| EndpointRecord::decode(bytes).map_err(ClientError::from))
            .collect()
    }

    async fn round_trip<T>(&self, request: Vec<u8>) -> Result<T, ClientError>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        let (mut send, recv) = self
            .conn
            .open_bi()
            .await
            .map_err(|e| ClientError::Stream(e.to_string()))?;
        send.write_all(&request)
            .await
            .map_err(|e| ClientError::Stream(e.to_string()))?;
        send.finish()
            .map_err(|e| ClientError::Stream(e.to_string()))?;

        let response = recv
            .read_to_end(MAX_MESSAGE_SIZE)
            .await
            .map_err(|e| ClientError::Stream(e.to_string()))?;
        Ok(proto::decode_response(&response)?)
    }
}
