//! Per-stream request handling.
//!
//! Each inbound bidirectional stream carries exactly one request: a
//! message-type tag, a body, and one response. Validation failures map
//! to status codes and never touch the store; an unknown tag closes
//! the stream without a response.

use crate::expiry::ExpiryIndex;
use crate::metrics::ServerMetrics;
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::protocol::{AcceptError, ProtocolHandler};
use minicbor::bytes::ByteVec;
use rend_core::proto::{
    self, Discover, DiscoverResponse, MAX_MESSAGE_SIZE, MessageType, Register, RegisterResponse,
    ResponseStatus,
};
use rend_core::time::deadline_nanos;
use rend_core::{EndpointRecord, Topic};
use rend_store::RecordStore;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::time::timeout;
use tracing::{debug, error};

/// Protocol handler registered on the router for [`proto::ALPN`].
#[derive(Clone)]
pub(crate) struct RendezvousService {
    inner: Arc<HandlerState>,
}

impl RendezvousService {
    pub(crate) fn new(state: HandlerState) -> Self {
        Self {
            inner: Arc::new(state),
        }
    }
}

impl std::fmt::Debug for RendezvousService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendezvousService").finish()
    }
}

pub(crate) struct HandlerState {
    pub(crate) store: RecordStore,
    pub(crate) index: Arc<ExpiryIndex>,
    pub(crate) metrics: Arc<dyn ServerMetrics>,
    pub(crate) read_timeout: Duration,
    pub(crate) write_timeout: Duration,
    pub(crate) longest_ttl: Duration,
    pub(crate) max_limit: u64,
}

impl ProtocolHandler for RendezvousService {
    async fn accept(&self, conn: Connection) -> Result<(), AcceptError> {
        let remote = conn.remote_id()?;
        debug!(%remote, "accepted rendezvous connection");
        while let Ok((send, recv)) = conn.accept_bi().await {
            let state = self.inner.clone();
            tokio::spawn(async move {
                state.handle_stream(send, recv).await;
            });
        }
        Ok(())
    }
}

impl HandlerState {
    async fn handle_stream(&self, mut send: SendStream, recv: RecvStream) {
        let request = match timeout(self.read_timeout, recv.read_to_end(MAX_MESSAGE_SIZE)).await {
            Ok(Ok(buf)) => buf,
            Ok(Err(e)) => {
                debug!("failed to read request: {e}");
                self.metrics.count_error("stream.read");
                return;
            }
            Err(_) => {
                debug!("request read timed out");
                self.metrics.count_error("stream.read");
                return;
            }
        };

        let mut dec = minicbor::Decoder::new(&request);
        let Ok(tag) = dec.u64() else {
            debug!("stream carried no message type");
            return;
        };

        let response = match MessageType::try_from(tag) {
            Ok(MessageType::Register) => {
                let resp = match dec.decode::<Register>() {
                    Ok(msg) => self.register(msg).await,
                    Err(e) => {
                        debug!("undecodable register body: {e}");
                        RegisterResponse {
                            status: ResponseStatus::InvalidContent,
                        }
                    }
                };
                proto::encode_response(&resp)
            }
            Ok(MessageType::Discover) => {
                let resp = match dec.decode::<Discover>() {
                    Ok(msg) => self.discover(msg).await,
                    Err(e) => {
                        debug!("undecodable discover body: {e}");
                        DiscoverResponse {
                            status: ResponseStatus::InvalidContent,
                            records: Vec::new(),
                        }
                    }
                };
                proto::encode_response(&resp)
            }
            Err(_) => {
                // Unknown type: close the stream without responding.
                debug!(tag, "unknown message type, closing stream");
                return;
            }
        };

        let response = match response {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("failed to encode response: {e}");
                self.metrics.count_error("stream.encode");
                return;
            }
        };

        match timeout(self.write_timeout, send.write_all(&response)).await {
            Ok(Ok(())) => {
                let _ = send.finish();
            }
            Ok(Err(e)) => {
                debug!("failed to write response: {e}");
                self.metrics.count_error("stream.write");
            }
            Err(_) => {
                debug!("response write timed out");
                self.metrics.count_error("stream.write");
            }
        }
    }

    pub(crate) async fn register(&self, msg: Register) -> RegisterResponse {
        RegisterResponse {
            status: self.register_status(msg).await,
        }
    }

    async fn register_status(&self, msg: Register) -> ResponseStatus {
        let ttl = Duration::from_nanos(msg.ttl);
        if ttl > self.longest_ttl {
            return ResponseStatus::InvalidTtl;
        }
        let topic = match Topic::new(msg.topic) {
            Ok(topic) => topic,
            Err(_) => return ResponseStatus::InvalidNamespace,
        };
        let record = match EndpointRecord::decode(&msg.record) {
            Ok(record) => record,
            Err(e) => {
                debug!(topic = %topic, "undecodable record in register body: {e}");
                return ResponseStatus::InvalidContent;
            }
        };
        if !record.is_signed() {
            return ResponseStatus::InvalidRecord;
        }

        let deadline_ns = deadline_nanos(SystemTime::now(), ttl);
        match self.store.add(&topic, &record, deadline_ns).await {
            Ok(added) => {
                if !added.replaced {
                    self.metrics.add_active_registration(topic.as_str());
                }
                self.index.push(deadline_ns, added.key);
                ResponseStatus::Ok
            }
            Err(e) => {
                error!(topic = %topic, "failed to store registration: {e}");
                self.metrics.count_error("register.store");
                ResponseStatus::InternalError
            }
        }
    }

    pub(crate) async fn discover(&self, msg: Discover) -> DiscoverResponse {
        let limit = msg.limit.min(self.max_limit) as usize;
        let started = Instant::now();
        let records = match self.store.get_random(&msg.topic, limit).await {
            Ok(records) => records,
            Err(e) => {
                error!(topic = %msg.topic, "discovery failed: {e}");
                self.metrics.count_error("discover.storage");
                return DiscoverResponse {
                    status: ResponseStatus::InternalError,
                    records: Vec::new(),
                };
            }
        };
        self.metrics
            .observe_discovery_duration(&msg.topic, started.elapsed().as_secs_f64());
        self.metrics.observe_discovery_size(&msg.topic, records.len());

        let mut encoded = Vec::with_capacity(records.len());
        for record in &records {
            match record.encode() {
                Ok(bytes) => encoded.push(ByteVec::from(bytes)),
                Err(e) => {
                    error!(topic = %msg.topic, "failed to re-encode stored record: {e}");
                    self.metrics.count_error("discover.encode");
                    return DiscoverResponse {
                        status: ResponseStatus::InternalError,
                        records: Vec::new(),
                    };
                }
            }
        }
        DiscoverResponse {
            status: ResponseStatus::Ok,
            records: encoded,
        }
    }
}
