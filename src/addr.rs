//! Host-address parsing and display-name helpers.
//!
//! Worker hosts are addressed as `HOSTNAME:PORT`, case-insensitive. A node's
//! display name collapses to the bare nodename when the hostname matches the
//! nodename and the port is the default one, otherwise it carries the host in
//! parentheses: `NODENAME(HOSTNAME:PORT)`.

use crate::error::{HeadnodeError, Result};

/// Canonicalize a worker address into `(hostname, port, "HOSTNAME:PORT")`.
///
/// A missing port falls back to `default_port`. Hostnames must be non-empty
/// and free of whitespace and parentheses.
pub fn parse_host_address(addr: &str, default_port: u16) -> Result<(String, u16, String)> {
    let upper = addr.trim().to_uppercase();
    let (hostname, port) = match upper.split_once(':') {
        None => (upper.as_str(), default_port),
        Some((hostname, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| HeadnodeError::InvalidHost(addr.to_string()))?;
            (hostname, port)
        }
    };
    if hostname.is_empty()
        || hostname.contains(['(', ')'])
        || hostname.chars().any(char::is_whitespace)
    {
        return Err(HeadnodeError::InvalidHost(addr.to_string()));
    }
    Ok((hostname.to_string(), port, format!("{hostname}:{port}")))
}

/// Compute the canonical display name for a node.
pub fn display_name(nodename: &str, hostname: &str, port: u16, default_port: u16) -> String {
    if hostname == nodename && port == default_port {
        nodename.to_string()
    } else {
        format!("{nodename}({hostname}:{port})")
    }
}

/// Recover the `HOSTNAME:PORT` form from a display name.
pub fn host_of(display_name: &str, default_port: u16) -> String {
    match display_name.split_once('(') {
        Some((_, host)) => host.trim_end_matches(')').to_string(),
        None => format!("{display_name}:{default_port}"),
    }
}
