//! Resolution of a job's target set against the registry.

use std::collections::HashSet;

use crate::error::Result;
use crate::registry::NodeRegistry;

#[derive(Debug, Default)]
pub struct Selection {
    /// Display names of ready nodes, deduped in input order.
    pub nodes: Vec<String>,
    /// Requested names that matched no ready node, as given.
    pub invalid: Vec<String>,
}

/// Resolve `(requested, pattern)` to ready nodes.
///
/// With no explicit names the whole pattern-matched ready pool is selected.
/// Explicit names may be display names, bare nodenames, or `host:port`
/// forms, any case; each is looked up through the pool's dual index.
pub fn select_nodes(
    registry: &NodeRegistry,
    requested: &[String],
    pattern: &str,
) -> Result<Selection> {
    let pool = registry.resolve_ready(pattern)?;
    if requested.is_empty() {
        return Ok(Selection {
            nodes: pool.names,
            invalid: Vec::new(),
        });
    }

    let mut selection = Selection::default();
    let mut added = HashSet::new();
    for raw in requested {
        match pool.index.get(&raw.to_uppercase()) {
            Some(name) => {
                if added.insert(name.clone()) {
                    selection.nodes.push(name.clone());
                }
            }
            None => selection.invalid.push(raw.clone()),
        }
    }
    Ok(selection)
}
