//! Peering policies.
//!
//! Policies are read once from the file named in the connection config and
//! pushed to the coordinator whenever this client is elected primary.

use std::path::{Path, PathBuf};

use log::{error, info, warn};
use serde::Deserialize;

use crate::transport::Channel;
use crate::types::{PeerSelector, WirePolicy};

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("error reading policy file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid policy file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// One entry of the policy file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub vlan: String,
    pub accept: bool,
    #[serde(default)]
    pub peer_asn: Option<String>,
    #[serde(default)]
    pub peer_owner: Option<String>,
    #[serde(default)]
    pub peer_isd: Option<String>,
}

impl Policy {
    /// The peer this policy applies to.  When several selectors are given
    /// the ASN wins over the owner, and the owner over the ISD.
    pub fn peer(&self) -> Option<PeerSelector> {
        let set = |s: &Option<String>| s.as_ref().filter(|s| !s.is_empty()).cloned();
        set(&self.peer_asn)
            .map(PeerSelector::Asn)
            .or_else(|| set(&self.peer_owner).map(PeerSelector::Owner))
            .or_else(|| set(&self.peer_isd).map(PeerSelector::Isd))
    }

    fn selector_count(&self) -> usize {
        [&self.peer_asn, &self.peer_owner, &self.peer_isd]
            .iter()
            .filter(|s| s.as_deref().is_some_and(|s| !s.is_empty()))
            .count()
    }

    pub fn to_wire(&self, asn: &str) -> WirePolicy {
        WirePolicy {
            vlan: self.vlan.clone(),
            asn: asn.to_string(),
            accept: self.accept,
            peer: self.peer(),
        }
    }
}

pub fn load_policies(path: &Path) -> Result<Vec<Policy>, PolicyError> {
    let data = std::fs::read_to_string(path).map_err(|source| PolicyError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_policies(&data).map_err(|source| PolicyError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_policies(data: &str) -> Result<Vec<Policy>, serde_yaml::Error> {
    // An empty file is an empty policy set.
    if data.trim().is_empty() {
        return Ok(Vec::new());
    }
    let policies: Vec<Policy> = serde_yaml::from_str(data)?;
    for policy in &policies {
        if policy.selector_count() > 1 {
            warn!(
                "Policy for VLAN {} names more than one peer, using {:?}",
                policy.vlan,
                policy.peer()
            );
        }
    }
    Ok(policies)
}

/// Translates local policies into wire records owned by `asn`.
pub fn translate(policies: &[Policy], asn: &str) -> Vec<WirePolicy> {
    policies.iter().map(|p| p.to_wire(asn)).collect()
}

/// Pushes the full policy set of one connection.
#[derive(Debug, Clone)]
pub struct PolicySync {
    records: Vec<WirePolicy>,
}

impl PolicySync {
    pub fn new(policies: &[Policy], asn: &str) -> Self {
        Self {
            records: translate(policies, asn),
        }
    }

    /// Replaces the coordinator's policy set with ours.  Failures are
    /// logged; the next primary notification triggers another attempt.
    pub async fn sync(&self, channel: &dyn Channel) {
        match channel.set_policies(&self.records).await {
            Ok(errors) => {
                for msg in &errors {
                    error!("Coordinator: {}", msg);
                }
                info!(
                    "Synchronized {} policies ({} rejected)",
                    self.records.len(),
                    errors.len()
                );
            }
            Err(e) => error!("SetPolicies RPC failed: {}", e),
        }
    }
}
