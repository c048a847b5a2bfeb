//! Node registry: heartbeat tracking, validation state, liveness queries.
//!
//! Two independently keyed concurrent maps hold the registry state, one for
//! the last report time and one for the validation state. Heartbeats,
//! validator tasks, and dispatch requests all touch them concurrently;
//! per-key entry updates are the only synchronization. An enumeration may
//! observe the maps mid-update, which can only demote a node to `Error`,
//! never promote it to `Ready`.

pub mod validator;

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use regex::Regex;
use tokio::time::Instant;

use crate::addr;
use crate::config::Settings;
use crate::error::{HeadnodeError, Result};

/// Where a node stands in the identity handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationState {
    /// `failures == 0` means an attempt is in flight; `failures > 0` counts
    /// consecutive failed attempts awaiting backoff.
    Validating { failures: u32 },
    Ready,
    /// The worker answered with a different nodename than it registered
    /// under. Sticky until the node times out and reports fresh.
    Mismatch,
}

/// Externally observable node state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Ready,
    Error,
    Lost,
}

/// What a validation task should do for a node, decided atomically against
/// the stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationTicket {
    /// No record yet: validate immediately.
    First,
    /// Previous attempts failed: back off, then validate.
    Retry { failures: u32 },
    /// Another attempt is already in flight.
    InFlight,
    /// Ready or poisoned; nothing to do.
    Settled,
}

/// Result of an accepted heartbeat, handed to the validator.
#[derive(Debug, Clone)]
pub struct HeartbeatAck {
    pub display_name: String,
    /// Upper-cased nodename the worker must answer with during validation.
    pub nodename: String,
    /// Canonical `HOSTNAME:PORT` to dial.
    pub host: String,
}

/// Alive, validated nodes matching a pattern, indexed both by display name
/// and by host form.
#[derive(Debug, Default)]
pub struct ReadyPool {
    pub index: HashMap<String, String>,
    pub names: Vec<String>,
}

pub struct NodeRegistry {
    settings: Arc<Settings>,
    last_report: DashMap<String, Instant>,
    validation: DashMap<String, ValidationState>,
}

impl NodeRegistry {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            last_report: DashMap::new(),
            validation: DashMap::new(),
        }
    }

    /// Record a heartbeat. A first-ever heartbeat, or one arriving after the
    /// node timed out, drops any stored validation state so the next
    /// validator run starts fresh.
    pub fn heartbeat(&self, nodename: &str, host: &str) -> Result<HeartbeatAck> {
        if nodename.contains(['(', ')']) {
            tracing::error!(nodename, "Invalid nodename in heartbeat");
            return Err(HeadnodeError::InvalidNodename(nodename.to_string()));
        }
        let (hostname, port, host) = addr::parse_host_address(host, self.settings.default_port)
            .map_err(|e| {
                tracing::error!(error = %e, "Invalid host format in heartbeat");
                e
            })?;
        let nodename = nodename.to_uppercase();
        let display_name =
            addr::display_name(&nodename, &hostname, port, self.settings.default_port);

        match self.last_report.entry(display_name.clone()) {
            Entry::Vacant(slot) => {
                tracing::info!(node = %display_name, "First heartbeat");
                slot.insert(Instant::now());
            }
            Entry::Occupied(mut slot) => {
                if self.timed_out(*slot.get()) {
                    tracing::info!(
                        node = %display_name,
                        silent_secs = slot.get().elapsed().as_secs(),
                        "Node reconnected"
                    );
                    self.validation.remove(&display_name);
                }
                slot.insert(Instant::now());
            }
        }

        Ok(HeartbeatAck {
            display_name,
            nodename,
            host,
        })
    }

    /// Enumerate known nodes matching `pattern`, optionally filtered by state.
    pub fn list(&self, pattern: &str, filter: Option<NodeState>) -> Result<Vec<(String, NodeState)>> {
        let pattern = Regex::new(pattern)?;
        let mut nodes = Vec::new();
        for entry in self.last_report.iter() {
            if !pattern.is_match(entry.key()) {
                continue;
            }
            let state = self.state_of(entry.key(), *entry.value());
            if filter.is_none() || filter == Some(state) {
                nodes.push((entry.key().clone(), state));
            }
        }
        Ok(nodes)
    }

    /// Collect the alive, validated nodes matching `pattern`.
    pub fn resolve_ready(&self, pattern: &str) -> Result<ReadyPool> {
        let pattern = Regex::new(pattern)?;
        let mut pool = ReadyPool::default();
        for entry in self.last_report.iter() {
            let name = entry.key();
            if self.timed_out(*entry.value()) || !pattern.is_match(name) {
                continue;
            }
            if self.validation.get(name).map(|s| *s) != Some(ValidationState::Ready) {
                continue;
            }
            pool.index.insert(name.clone(), name.clone());
            pool.index.insert(
                addr::host_of(name, self.settings.default_port),
                name.clone(),
            );
            pool.names.push(name.clone());
        }
        Ok(pool)
    }

    /// Atomically claim a validation attempt for a node.
    pub fn begin_validation(&self, display_name: &str) -> ValidationTicket {
        match self.validation.entry(display_name.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(ValidationState::Validating { failures: 0 });
                ValidationTicket::First
            }
            Entry::Occupied(mut slot) => match *slot.get() {
                ValidationState::Validating { failures: 0 } => ValidationTicket::InFlight,
                ValidationState::Validating { failures } => {
                    slot.insert(ValidationState::Validating { failures: 0 });
                    ValidationTicket::Retry { failures }
                }
                ValidationState::Ready | ValidationState::Mismatch => ValidationTicket::Settled,
            },
        }
    }

    pub fn mark_ready(&self, display_name: &str) {
        self.validation
            .insert(display_name.to_string(), ValidationState::Ready);
    }

    pub fn mark_mismatch(&self, display_name: &str) {
        self.validation
            .insert(display_name.to_string(), ValidationState::Mismatch);
    }

    pub fn mark_failed(&self, display_name: &str, failures: u32) {
        self.validation
            .insert(display_name.to_string(), ValidationState::Validating { failures });
    }

    pub fn validation_state(&self, display_name: &str) -> Option<ValidationState> {
        self.validation.get(display_name).map(|s| *s)
    }

    fn state_of(&self, name: &str, last_report: Instant) -> NodeState {
        if self.timed_out(last_report) {
            return NodeState::Lost;
        }
        match self.validation.get(name).map(|s| *s) {
            Some(ValidationState::Ready) => NodeState::Ready,
            _ => NodeState::Error,
        }
    }

    fn timed_out(&self, last_report: Instant) -> bool {
        last_report.elapsed() > self.settings.heartbeat_timeout()
    }
}
