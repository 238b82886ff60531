//! Desired and installed overlay links.
//!
//! The store separates what the coordinator asked for from what has been
//! applied to the managed AS.  Directives only record intent; a
//! [`LinkStore::reconcile`] pass is the single place that turns intent into
//! installed state and decides whether a restart is required.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use log::info;

use crate::types::{LinkType, LinkUpdate, UpdateType};

/// Identity of one point-to-point overlay connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Link {
    pub link_type: LinkType,
    pub peer_asn: String,
    pub local_ip: String,
    pub local_port: u16,
    pub remote_ip: String,
    pub remote_port: u16,
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {}:{} -> {}:{} (peer {})",
            self.link_type,
            self.local_ip,
            self.local_port,
            self.remote_ip,
            self.remote_port,
            if self.peer_asn.is_empty() {
                "-"
            } else {
                self.peer_asn.as_str()
            }
        )
    }
}

/// State of a link entry.  An entry that is neither installed nor pending
/// is removed from the store instead of being represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Requested but never applied.
    PendingCreate,
    /// Applied to the managed AS.
    Installed,
    /// Applied, and scheduled for removal on the next reconciliation.
    PendingDestroy,
}

impl LinkState {
    pub fn is_installed(self) -> bool {
        matches!(self, LinkState::Installed | LinkState::PendingDestroy)
    }
}

/// What the coordinator asked us to do with a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkDirective {
    Create(Link),
    Destroy(Link),
}

impl LinkDirective {
    pub fn link(&self) -> &Link {
        match self {
            LinkDirective::Create(link) | LinkDirective::Destroy(link) => link,
        }
    }
}

/// Reasons a [`LinkUpdate`] cannot be turned into a directive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidDirective {
    #[error("link update is missing the local endpoint")]
    MissingLocal,
    #[error("link update is missing the remote endpoint")]
    MissingRemote,
    #[error("port {0} is out of range")]
    PortOutOfRange(u32),
}

fn port(raw: u32) -> Result<u16, InvalidDirective> {
    u16::try_from(raw).map_err(|_| InvalidDirective::PortOutOfRange(raw))
}

impl TryFrom<LinkUpdate> for LinkDirective {
    type Error = InvalidDirective;

    fn try_from(update: LinkUpdate) -> Result<Self, Self::Error> {
        let local = update.local.ok_or(InvalidDirective::MissingLocal)?;
        let remote = update.remote.ok_or(InvalidDirective::MissingRemote)?;
        let link = Link {
            link_type: update.link_type,
            peer_asn: update.peer_asn,
            local_port: port(local.port)?,
            local_ip: local.ip,
            remote_port: port(remote.port)?,
            remote_ip: remote.ip,
        };
        Ok(match update.update_type {
            UpdateType::Create => LinkDirective::Create(link),
            UpdateType::Destroy => LinkDirective::Destroy(link),
        })
    }
}

/// Links changed by one reconciliation pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub created: Vec<Link>,
    pub destroyed: Vec<Link>,
}

impl Reconciliation {
    /// True if the managed AS must be restarted to pick up the changes.
    pub fn restart_needed(&self) -> bool {
        !self.created.is_empty() || !self.destroyed.is_empty()
    }
}

/// Mutex-guarded link table.  Every operation holds the lock for its whole
/// duration, so a reconciliation never observes a half-applied directive.
#[derive(Debug, Default)]
pub struct LinkStore {
    links: Mutex<HashMap<Link, LinkState>>,
}

impl LinkStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<Link, LinkState>> {
        // A poisoned table is still consistent: no operation panics halfway
        // through a mutation.
        self.links.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records a create request.  Duplicates leave the existing entry alone.
    pub fn add(&self, link: Link) {
        self.table().entry(link).or_insert(LinkState::PendingCreate);
    }

    /// Records a destroy request.  Links that were never installed are
    /// forgotten immediately.
    pub fn remove(&self, link: &Link) {
        let mut table = self.table();
        match table.get(link).copied() {
            Some(LinkState::Installed) => {
                table.insert(link.clone(), LinkState::PendingDestroy);
            }
            Some(LinkState::PendingCreate) => {
                table.remove(link);
            }
            Some(LinkState::PendingDestroy) | None => {}
        }
    }

    pub fn apply(&self, directive: LinkDirective) {
        match directive {
            LinkDirective::Create(link) => self.add(link),
            LinkDirective::Destroy(link) => self.remove(&link),
        }
    }

    /// Applies all pending changes in one atomic pass.
    pub fn reconcile(&self) -> Reconciliation {
        let mut result = Reconciliation::default();
        let mut table = self.table();
        table.retain(|link, state| match *state {
            LinkState::Installed => true,
            LinkState::PendingCreate => {
                info!("Create link: {}", link);
                *state = LinkState::Installed;
                result.created.push(link.clone());
                true
            }
            LinkState::PendingDestroy => {
                info!("Destroy link: {}", link);
                result.destroyed.push(link.clone());
                false
            }
        });
        result
    }

    pub fn state(&self, link: &Link) -> Option<LinkState> {
        self.table().get(link).copied()
    }

    /// Links currently applied to the managed AS, sorted.
    pub fn installed(&self) -> Vec<Link> {
        let mut links: Vec<Link> = self
            .table()
            .iter()
            .filter(|(_, state)| state.is_installed())
            .map(|(link, _)| link.clone())
            .collect();
        links.sort();
        links
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }
}
