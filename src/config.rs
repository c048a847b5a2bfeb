//! Runtime configuration surface of the head node.
//!
//! A few options are tunable over RPC while the process runs; those live
//! behind atomics so heartbeat, validator, and dispatch tasks can read them
//! without coordination. The rest is fixed at startup from the command line.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

pub const CONFIG_HEARTBEAT_TIMEOUT_SECONDS: &str = "HeartbeatTimeoutSeconds";
pub const CONFIG_STORE_OUTPUT: &str = "StoreOutput";
pub const CONFIG_LOG_THREAD_ID: &str = "LogThreadId";

pub const DEFAULT_HEARTBEAT_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_PORT: u16 = 50051;

#[derive(Debug)]
pub struct Settings {
    /// Address workers use to reach this head node, `HOSTNAME:PORT`.
    pub node_host: String,
    /// Port assumed for worker hosts that omit one.
    pub default_port: u16,
    /// Bound on dials to workers during dispatch and cancel.
    pub connect_timeout: Duration,
    /// Directory job output files are written under.
    pub output_dir: PathBuf,
    heartbeat_timeout_secs: AtomicU64,
    store_output: AtomicBool,
    log_thread_id: AtomicBool,
}

impl Settings {
    pub fn new(
        node_host: String,
        default_port: u16,
        connect_timeout: Duration,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            node_host,
            default_port,
            connect_timeout,
            output_dir,
            heartbeat_timeout_secs: AtomicU64::new(DEFAULT_HEARTBEAT_TIMEOUT_SECONDS),
            store_output: AtomicBool::new(true),
            log_thread_id: AtomicBool::new(false),
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs.load(Ordering::Relaxed))
    }

    pub fn store_output(&self) -> bool {
        self.store_output.load(Ordering::Relaxed)
    }

    pub fn log_thread_id(&self) -> bool {
        self.log_thread_id.load(Ordering::Relaxed)
    }

    pub fn set_log_thread_id(&self, enabled: bool) {
        self.log_thread_id.store(enabled, Ordering::Relaxed);
    }

    pub fn set_store_output(&self, enabled: bool) {
        self.store_output.store(enabled, Ordering::Relaxed);
    }

    pub fn set_heartbeat_timeout_secs(&self, secs: u64) {
        self.heartbeat_timeout_secs.store(secs, Ordering::Relaxed);
    }

    /// Apply one `key = value` update from the RPC surface.
    pub fn set(&self, key: &str, value: &str) -> Result<(), String> {
        match key {
            CONFIG_HEARTBEAT_TIMEOUT_SECONDS => {
                let secs: u64 = value
                    .parse()
                    .map_err(|_| format!("not a positive integer: {value}"))?;
                if secs == 0 {
                    return Err("must be greater than zero".to_string());
                }
                self.set_heartbeat_timeout_secs(secs);
                Ok(())
            }
            CONFIG_STORE_OUTPUT => {
                self.set_store_output(parse_bool(value)?);
                Ok(())
            }
            CONFIG_LOG_THREAD_ID => {
                self.set_log_thread_id(parse_bool(value)?);
                Ok(())
            }
            _ => Err(format!("unknown config: {key}")),
        }
    }

    /// Enumerate the settable options as `(key, value, description)`.
    pub fn entries(&self) -> Vec<(String, String, String)> {
        vec![
            (
                CONFIG_HEARTBEAT_TIMEOUT_SECONDS.to_string(),
                self.heartbeat_timeout().as_secs().to_string(),
                "Seconds without a heartbeat before a node is considered lost".to_string(),
            ),
            (
                CONFIG_STORE_OUTPUT.to_string(),
                self.store_output().to_string(),
                "Persist worker output of each job to files".to_string(),
            ),
            (
                CONFIG_LOG_THREAD_ID.to_string(),
                self.log_thread_id().to_string(),
                "Include the thread id in log lines (applied at startup)".to_string(),
            ),
        ]
    }
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(format!("not a boolean: {value}")),
    }
}
