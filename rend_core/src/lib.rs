//! Shared types for the rendezvous registry.
//!
//! This crate defines the pieces every other crate speaks in:
//!
//! - [`EndpointRecord`]: a signed, CBOR-encoded description of how to
//!   reach a peer, identified by a fixed-length node address.
//! - [`Topic`]: a validated namespace string records are grouped under.
//! - [`StorageKey`]: the `topic || node_address` byte key used by the
//!   persistent store.
//! - [`proto`]: the wire messages and status codes of the
//!   `/rend/0.1.0` protocol.

pub mod key;
pub mod proto;
pub mod record;
pub mod time;
pub mod topic;

pub use key::StorageKey;
pub use record::{AddrEntry, EndpointRecord, NODE_ADDRESS_LENGTH, RecordError};
pub use topic::{MAX_TOPIC_LENGTH, Topic, TopicError};
