//! # Contract Request Types
//!
//! Domain-side representations of what travels over the
//! `ContractRequestGenerator` stream, and the conversions to and from the
//! generated protobuf messages.
//!
//! - [`RequestId`] - correlation token minted once per consumer run.
//! - [`ContractRequestType`] - purchase or sale.
//! - [`ContractRequestRecord`] - one synthetic contract request referencing a
//!   counterparty and a real estate object by id.
//!
//! Decoding from the wire is strict: a message that violates the record
//! constraints ([`MAX_AMOUNT`], [`MAX_STATUS_LEN`], RFC 3339 timestamps, known
//! request kinds) is rejected with [`Error::InvalidRecord`].

use crate::{Error, proto};
use chrono::{DateTime, Utc};
use core::fmt;
use uuid::Uuid;

/// Upper bound (inclusive) for a contract request amount.
pub const MAX_AMOUNT: f64 = 1_000_000_000.0;

/// Maximum length of a status string, in characters.
pub const MAX_STATUS_LEN: usize = 50;

/// Opaque token binding a generation request to the batches produced for it.
///
/// Freshly minted tokens are random UUIDv4 values rendered as 32 lowercase hex
/// digits, so two runs colliding is cryptographically negligible.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// Mints a new random correlation token.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if `other` is exactly this token.
    pub fn matches(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Kind of a contract request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContractRequestType {
    Purchase,
    Sale,
}

impl ContractRequestType {
    pub const ALL: [Self; 2] = [Self::Purchase, Self::Sale];
}

impl fmt::Display for ContractRequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Purchase => f.write_str("purchase"),
            Self::Sale => f.write_str("sale"),
        }
    }
}

impl From<ContractRequestType> for proto::ContractRequestKind {
    fn from(value: ContractRequestType) -> Self {
        match value {
            ContractRequestType::Purchase => Self::Purchase,
            ContractRequestType::Sale => Self::Sale,
        }
    }
}

impl From<proto::ContractRequestKind> for ContractRequestType {
    fn from(value: proto::ContractRequestKind) -> Self {
        match value {
            proto::ContractRequestKind::Purchase => Self::Purchase,
            proto::ContractRequestKind::Sale => Self::Sale,
        }
    }
}

/// A synthetic contract request.
///
/// `counterparty_id` and `real_estate_id` are foreign references into an
/// external store; nothing guarantees that they exist.
#[derive(Clone, Debug, PartialEq)]
pub struct ContractRequestRecord {
    pub counterparty_id: i32,
    pub real_estate_id: i32,
    pub request_type: ContractRequestType,
    pub amount: f64,
    pub created_date: DateTime<Utc>,
    pub status: String,
}

impl From<ContractRequestRecord> for proto::ContractRequestMessage {
    fn from(record: ContractRequestRecord) -> Self {
        Self {
            counterparty_id: record.counterparty_id,
            real_estate_id: record.real_estate_id,
            request_type: proto::ContractRequestKind::from(record.request_type).into(),
            amount: record.amount,
            created_date: record.created_date.to_rfc3339(),
            status: record.status,
        }
    }
}

impl TryFrom<proto::ContractRequestMessage> for ContractRequestRecord {
    type Error = Error;

    fn try_from(msg: proto::ContractRequestMessage) -> Result<Self, Self::Error> {
        let request_type = proto::ContractRequestKind::try_from(msg.request_type)
            .map(ContractRequestType::from)
            .map_err(|_| Error::InvalidRecord {
                reason: format!("unknown request type {}", msg.request_type),
            })?;

        if !msg.amount.is_finite() || !(0.0..=MAX_AMOUNT).contains(&msg.amount) {
            return Err(Error::InvalidRecord {
                reason: format!("amount {} is outside 0..={MAX_AMOUNT}", msg.amount),
            });
        }

        let created_date = DateTime::parse_from_rfc3339(&msg.created_date)
            .map_err(|e| Error::InvalidRecord {
                reason: format!("created date {:?}: {e}", msg.created_date),
            })?
            .with_timezone(&Utc);

        if msg.status.chars().count() > MAX_STATUS_LEN {
            return Err(Error::InvalidRecord {
                reason: format!("status exceeds {MAX_STATUS_LEN} characters"),
            });
        }

        Ok(Self {
            counterparty_id: msg.counterparty_id,
            real_estate_id: msg.real_estate_id,
            request_type,
            amount: msg.amount,
            created_date,
            status: msg.status,
        })
    }
}
