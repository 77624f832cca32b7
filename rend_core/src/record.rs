//! The signed endpoint record peers advertise under a topic.
//!
//! A record carries a sequence number, the owner's ed25519 public key
//! and a list of socket addresses, plus a signature over the canonical
//! encoding of everything else. Two derived values matter to the rest
//! of the system:
//!
//! - [`EndpointRecord::node_address`]: the BLAKE3 hash of the public
//!   key, a fixed 32-byte string that identifies the record within a
//!   topic.
//! - [`EndpointRecord::is_signed`]: whether the signature verifies.
//!   Only signed records are admitted by the server.
//!
//! The encoding is CBOR and is deterministic: re-encoding a decoded
//! record reproduces the stored bytes, so records can travel through
//! the store and the wire as opaque blobs.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use minicbor::{CborLen, Decode, Encode};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Size of an ed25519 public key in bytes.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Size of an ed25519 signature in bytes.
pub const SIGNATURE_LENGTH: usize = 64;

/// Size of a node address (BLAKE3 hash of the public key) in bytes.
///
/// Storage keys rely on this being fixed: the topic prefix of a key is
/// everything before the last `NODE_ADDRESS_LENGTH` bytes.
pub const NODE_ADDRESS_LENGTH: usize = 32;

/// Errors from encoding, decoding or verifying an [`EndpointRecord`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RecordError {
    #[error("record encoding failed: {0}")]
    Encode(String),

    #[error("record decoding failed: {0}")]
    Decode(#[from] minicbor::decode::Error),

    #[error("record carries no signature")]
    MissingSignature,

    #[error("invalid signature length: expected {SIGNATURE_LENGTH}, got {0}")]
    InvalidSignatureLength(usize),

    #[error("record public key is not a valid ed25519 key")]
    InvalidPublicKey,

    #[error("record signature verification failed")]
    InvalidSignature,
}

/// One advertised socket address: raw IP octets (4 or 16) and a port.
#[derive(Encode, Decode, CborLen, Clone, Debug, PartialEq, Eq)]
#[cbor(array)]
pub struct AddrEntry {
    #[n(0)]
    #[cbor(with = "minicbor::bytes")]
    pub ip: Vec<u8>,

    #[n(1)]
    pub port: u16,
}

impl AddrEntry {
    /// Returns the entry as a [`SocketAddr`], or `None` if the IP
    /// bytes are neither 4 nor 16 long.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let ip: IpAddr = match self.ip.len() {
            4 => {
                let octets: [u8; 4] = self.ip.as_slice().try_into().ok()?;
                Ipv4Addr::from(octets).into()
            }
            16 => {
                let octets: [u8; 16] = self.ip.as_slice().try_into().ok()?;
                Ipv6Addr::from(octets).into()
            }
            _ => return None,
        };
        Some(SocketAddr::new(ip, self.port))
    }
}

impl From<SocketAddr> for AddrEntry {
    fn from(addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        AddrEntry {
            ip,
            port: addr.port(),
        }
    }
}

/// A signed description of how to reach a peer.
#[derive(Encode, Decode, CborLen, Clone, Debug, PartialEq, Eq)]
#[cbor(array)]
pub struct EndpointRecord {
    /// Monotonic sequence number chosen by the publisher; a peer
    /// re-advertising itself bumps this.
    #[n(0)]
    pub seq: u64,

    /// The publisher's ed25519 public key.
    #[n(1)]
    #[cbor(with = "minicbor::bytes")]
    pub public_key: [u8; PUBLIC_KEY_LENGTH],

    /// Advertised socket addresses.
    #[n(2)]
    pub addrs: Vec<AddrEntry>,

    /// Ed25519 signature over the canonical encoding with this field
    /// empty. Empty for an unsigned record.
    #[n(3)]
    #[cbor(with = "minicbor::bytes")]
    pub signature: Vec<u8>,
}

impl EndpointRecord {
    /// Builds an unsigned record. [`EndpointRecord::is_signed`] will
    /// return `false` until [`EndpointRecord::sign`] is called.
    pub fn unsigned(seq: u64, public_key: [u8; PUBLIC_KEY_LENGTH], addrs: Vec<AddrEntry>) -> Self {
        EndpointRecord {
            seq,
            public_key,
            addrs,
            signature: Vec::new(),
        }
    }

    /// Builds a record for `key` and signs it in one step.
    pub fn signed(seq: u64, addrs: Vec<AddrEntry>, key: &SigningKey) -> Result<Self, RecordError> {
        let mut record = Self::unsigned(seq, key.verifying_key().to_bytes(), addrs);
        record.sign(key)?;
        Ok(record)
    }

    /// Signs the record with `key`, replacing any existing signature.
    /// The public key field is set from `key`.
    pub fn sign(&mut self, key: &SigningKey) -> Result<(), RecordError> {
        self.public_key = key.verifying_key().to_bytes();
        self.signature.clear();
        let message = self.encode()?;
        self.signature = key.sign(&message).to_bytes().to_vec();
        Ok(())
    }

    /// Canonical CBOR encoding of the record.
    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        minicbor::to_vec(self).map_err(|e| RecordError::Encode(e.to_string()))
    }

    /// Decodes a record from its canonical encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        Ok(minicbor::decode(bytes)?)
    }

    /// The fixed-length node address: BLAKE3 of the public key.
    pub fn node_address(&self) -> [u8; NODE_ADDRESS_LENGTH] {
        *blake3::hash(&self.public_key).as_bytes()
    }

    /// Whether the record carries a valid signature by its own public
    /// key. Admission to the registry requires this.
    pub fn is_signed(&self) -> bool {
        self.verify().is_ok()
    }

    /// Verifies the signature, reporting why verification failed.
    pub fn verify(&self) -> Result<(), RecordError> {
        if self.signature.is_empty() {
            return Err(RecordError::MissingSignature);
        }
        if self.signature.len() != SIGNATURE_LENGTH {
            return Err(RecordError::InvalidSignatureLength(self.signature.len()));
        }
        let key = VerifyingKey::from_bytes(&self.public_key)
            .map_err(|_| RecordError::InvalidPublicKey)?;
        let signature =
            Signature::from_slice(&self.signature).map_err(|_| RecordError::InvalidSignature)?;
        let unsigned = EndpointRecord {
            signature: Vec::new(),
            ..self.clone()
        };
        let message = unsigned.encode()?;
        key.verify(&message, &signature)
            .map_err(|_| RecordError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signing_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn addr() -> AddrEntry {
        AddrEntry::from("10.0.10.24:8087".parse::<SocketAddr>().unwrap())
    }

    #[test]
    fn signed_record_verifies() {
        let record = EndpointRecord::signed(1, vec![addr()], &signing_key(1)).unwrap();
        assert!(record.is_signed());
    }

    #[test]
    fn unsigned_record_does_not_verify() {
        let key = signing_key(2);
        let record = EndpointRecord::unsigned(1, key.verifying_key().to_bytes(), vec![addr()]);
        assert!(!record.is_signed());
        assert!(matches!(
            record.verify(),
            Err(RecordError::MissingSignature)
        ));
    }

    #[test]
    fn tampering_breaks_the_signature() {
        let mut record = EndpointRecord::signed(1, vec![addr()], &signing_key(3)).unwrap();
        record.seq = 2;
        assert!(!record.is_signed());
    }

    #[test]
    fn encode_decode_round_trip() {
        let record = EndpointRecord::signed(7, vec![addr()], &signing_key(4)).unwrap();
        let bytes = record.encode().unwrap();
        let decoded = EndpointRecord::decode(&bytes).unwrap();
        assert_eq!(decoded, record);
        assert!(decoded.is_signed());
        // Re-encoding a decoded record is a fixed point on the bytes.
        assert_eq!(decoded.encode().unwrap(), bytes);
    }

    #[test]
    fn node_address_is_stable_and_fixed_length() {
        let key = signing_key(5);
        let a = EndpointRecord::signed(1, vec![addr()], &key).unwrap();
        let b = EndpointRecord::signed(2, vec![], &key).unwrap();
        assert_eq!(a.node_address(), b.node_address());
        assert_eq!(a.node_address().len(), NODE_ADDRESS_LENGTH);

        let other = EndpointRecord::signed(1, vec![addr()], &signing_key(6)).unwrap();
        assert_ne!(a.node_address(), other.node_address());
    }

    #[test]
    fn addr_entry_round_trips_through_socket_addr() {
        for text in ["10.0.10.24:8087", "[2001:db8::1]:443"] {
            let addr: SocketAddr = text.parse().unwrap();
            let entry = AddrEntry::from(addr);
            assert_eq!(entry.socket_addr(), Some(addr));
        }
        let bogus = AddrEntry {
            ip: vec![1, 2, 3],
            port: 80,
        };
        assert_eq!(bogus.socket_addr(), None);
    }
}
