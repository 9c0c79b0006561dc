//! Wire-Shape Validation
//!
//! Checks applied at the container boundary before a request enters the
//! pipeline or start parameters take effect. Failures surface to callers as
//! `TECHERR` with the underlying cause attached.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::actor_id::{ActorId, AidError};
use crate::message::{ErrorInfo, Request};

/// Validation failure, convertible into the caller-facing `TECHERR`.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("request field '{field}' is invalid: {reason}")]
    Request { field: &'static str, reason: String },

    #[error("invalid actor id in '{field}': {source}")]
    Aid {
        field: &'static str,
        source: AidError,
    },

    #[error("unrecognized or malformed start options: {0}")]
    StartOptions(#[from] serde_json::Error),
}

impl From<ValidationError> for ErrorInfo {
    fn from(err: ValidationError) -> Self {
        ErrorInfo::techerr(err.to_string())
    }
}

/// Validate a request against the schema the wire accepts.
pub fn validate_request(req: &Request) -> Result<(), ValidationError> {
    if req.id.is_empty() {
        return Err(ValidationError::Request {
            field: "id",
            reason: "must be non-empty".into(),
        });
    }
    ActorId::parse(&req.from).map_err(|source| ValidationError::Aid {
        field: "from",
        source,
    })?;
    ActorId::parse(&req.to).map_err(|source| ValidationError::Aid {
        field: "to",
        source,
    })?;
    if req.date == 0 {
        return Err(ValidationError::Request {
            field: "date",
            reason: "must be a positive timestamp".into(),
        });
    }
    if req.timeout == 0 {
        return Err(ValidationError::Request {
            field: "timeout",
            reason: "must be greater than zero".into(),
        });
    }
    Ok(())
}

/// Observability toggle carried in start options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsToggle {
    On,
    Off,
}

/// Container start parameters.
///
/// Unknown keys are rejected, which is the schema check the facade runs
/// before starting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct StartOptions {
    /// Override the local IP recorded in NetInfo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    /// Discovery rendezvous address (multicast group).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_addr: Option<String>,
    /// Discovery rendezvous port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_port: Option<u16>,
    /// Runtime metrics toggle; no effect on routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<StatsToggle>,
}

impl StartOptions {
    /// Parse options from an untyped JSON object, enforcing the schema.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        Ok(serde_json::from_value(value)?)
    }

    /// True when the stats toggle is set to `on`.
    pub fn stats_enabled(&self) -> bool {
        matches!(self.stats, Some(StatsToggle::On))
    }
}
