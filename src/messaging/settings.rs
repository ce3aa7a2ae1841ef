use std::time::Duration;

use anyhow::bail;

use crate::messaging::connect_throttle::ConnectThrottleSettings;
use crate::messaging::protocol::{MAX_PROTOCOL_SUPPORTED, MIN_PROTOCOL_SUPPORTED};
use crate::status::Status;

/// Per-worker messaging settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// combined output-buffer budget of one worker, in MiB
    pub outbufs_mb_max_per_thread: usize,
    /// byte budget every connection is guaranteed regardless of how full the
    ///  class totals are, in KiB
    pub outbuf_socket_min_kb: usize,
    /// split the worker budget into equal halves for server and client
    ///  peers. Only enforced when `server` is set; client nodes always use
    ///  the combined cap.
    pub outbufs_limit_per_peer_type_enabled: bool,
    /// whether this worker runs on a server node (accepts inbound peers)
    pub server: bool,

    /// HELLO -> ACK interval before the connection is closed with TimedOut
    pub handshake_timeout: Duration,
    pub connect_throttle: ConnectThrottleSettings,

    pub include_cluster_name_on_handshake: bool,
    pub include_destination_on_handshake: bool,

    /// highest protocol version to offer in HELLO / grant in ACK; lowering
    ///  this below MAX_PROTOCOL_SUPPORTED forces old-protocol operation
    pub max_protocol: u16,

    /// Test facility: with probability `message_error_injection_chance_percent`,
    ///  a message reaching the wire stage is not transmitted. A status of
    ///  `Dropped` keeps it (and its budget) in flight forever; any other
    ///  status fails its on-sent callback with that status.
    pub message_error_injection_status: Option<Status>,
    pub message_error_injection_chance_percent: u8,
}

impl Settings {
    pub fn new() -> Settings {
        Settings {
            outbufs_mb_max_per_thread: 256,
            outbuf_socket_min_kb: 256,
            outbufs_limit_per_peer_type_enabled: true,
            server: false,
            handshake_timeout: Duration::from_secs(1),
            connect_throttle: ConnectThrottleSettings {
                initial: Duration::from_millis(100),
                max: Duration::from_secs(10),
            },
            include_cluster_name_on_handshake: false,
            include_destination_on_handshake: false,
            max_protocol: MAX_PROTOCOL_SUPPORTED,
            message_error_injection_status: None,
            message_error_injection_chance_percent: 0,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.outbufs_mb_max_per_thread == 0 {
            bail!("outbufs_mb_max_per_thread must be positive");
        }
        if self.max_protocol < MIN_PROTOCOL_SUPPORTED || self.max_protocol > MAX_PROTOCOL_SUPPORTED
        {
            bail!(
                "max_protocol {} is outside the supported range [{}, {}]",
                self.max_protocol,
                MIN_PROTOCOL_SUPPORTED,
                MAX_PROTOCOL_SUPPORTED
            );
        }
        if self.message_error_injection_chance_percent > 100 {
            bail!("message_error_injection_chance_percent must be <= 100");
        }
        if self.message_error_injection_chance_percent > 0
            && self.message_error_injection_status.is_none()
        {
            bail!("message error injection enabled without a status to inject");
        }
        Ok(())
    }

    pub fn outbufs_max_bytes(&self) -> usize {
        self.outbufs_mb_max_per_thread * 1024 * 1024
    }

    pub fn socket_min_bytes(&self) -> usize {
        self.outbuf_socket_min_kb * 1024
    }

    /// The per-class split is a server-side behavior; clients keep the
    ///  combined cap even when the flag is set.
    pub fn per_peer_type_budget(&self) -> bool {
        self.server && self.outbufs_limit_per_peer_type_enabled
    }
}

impl Default for Settings {
    fn default() -> Settings {
        Settings::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(Settings::new().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_budget() {
        let mut s = Settings::new();
        s.outbufs_mb_max_per_thread = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_rejects_protocol_out_of_range() {
        let mut s = Settings::new();
        s.max_protocol = MAX_PROTOCOL_SUPPORTED + 1;
        assert!(s.validate().is_err());
        s.max_protocol = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_rejects_injection_without_status() {
        let mut s = Settings::new();
        s.message_error_injection_chance_percent = 50;
        assert!(s.validate().is_err());
        s.message_error_injection_status = Some(Status::Dropped);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_per_peer_type_budget_requires_server() {
        let mut s = Settings::new();
        s.outbufs_limit_per_peer_type_enabled = true;
        s.server = false;
        assert!(!s.per_peer_type_budget());
        s.server = true;
        assert!(s.per_peer_type_budget());
        s.outbufs_limit_per_peer_type_enabled = false;
        assert!(!s.per_peer_type_budget());
    }
}
