//! Data structures exchanged with the peering coordinator.
//!
//! These types are serialised using [`serde`](https://serde.rs/) by the
//! transport.  They mirror the coordinator's message set: the persistent
//! stream carries arbitration bids and link directives, the unary calls
//! carry port ranges and policy records.

use serde::{Deserialize, Serialize};

/// Election identifier sent with the initial arbitration bid.
pub const ELECTION_ID: u64 = 100;

/// Per-call metadata attached to every request made on a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub asn: String,
    pub client: String,
    pub token: String,
}

/// UDP port interval reserved on one interface for overlay traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortRange {
    pub interface_vlan: String,
    pub interface_ip: String,
    pub first_port: u32,
    pub last_port: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: String,
    pub port: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkType {
    Peering,
    Core,
    Provider,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateType {
    Create,
    Destroy,
}

/// A link directive as it arrives on the stream.  Both endpoints are
/// optional on the wire; incomplete directives are rejected before they
/// reach the link store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkUpdate {
    #[serde(rename = "type")]
    pub update_type: UpdateType,
    pub link_type: LinkType,
    #[serde(default)]
    pub peer_asn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<Endpoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArbitrationStatus {
    #[default]
    NotPrimary,
    Primary,
    Error,
}

/// Arbitration bid (outbound) or arbitration result (inbound).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArbitrationUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<String>,
    pub election_id: u64,
    #[serde(default)]
    pub status: ArbitrationStatus,
}

impl ArbitrationUpdate {
    /// The bid sent once per session to request primary status in every VLAN.
    pub fn bid() -> Self {
        Self {
            vlan: None,
            election_id: ELECTION_ID,
            status: ArbitrationStatus::NotPrimary,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub message: String,
}

/// Outbound stream messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamRequest {
    Arbitration(ArbitrationUpdate),
    LinkUpdate(LinkUpdate),
}

/// Inbound stream messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamResponse {
    Arbitration(ArbitrationUpdate),
    LinkUpdate(LinkUpdate),
    Error(ErrorNotice),
}

/// Which peers a policy applies to.  A policy without a selector is the
/// default policy of its VLAN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerSelector {
    Asn(String),
    Owner(String),
    Isd(String),
}

/// A policy record as submitted with `SetPolicies`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePolicy {
    pub vlan: String,
    pub asn: String,
    pub accept: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<PeerSelector>,
}
