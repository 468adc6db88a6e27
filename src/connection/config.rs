use std::time::Duration;

/// Per-connection knobs, frozen when the connection is registered.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// reconnect after a server timeout (and only after a server timeout - a rejected password
    ///  or an explicit disconnect is final)
    pub reconnect: bool,
    pub reconnect_timeout: Duration,

    /// periodic empty command keeping the server-side session alive
    pub keep_alive: bool,
    pub keep_alive_interval: Duration,

    /// retry / liveness scheduler
    pub timeout: bool,
    pub timeout_interval: Duration,

    /// how long the server may stay silent before the session is considered dead
    pub server_timeout: Duration,
    /// per-attempt retransmission interval: attempt n is due n*packet_timeout after the
    ///  original send
    pub packet_timeout: Duration,
    /// attempts before a pending request fails
    pub packet_timeout_threshold: u32,
    /// a multipart gap retransmits the request only once this many attempts were made
    pub multipart_resend_threshold: u32,
}

impl Default for ConnectionConfig {
    fn default() -> ConnectionConfig {
        ConnectionConfig {
            reconnect: true,
            reconnect_timeout: Duration::from_millis(500),
            keep_alive: true,
            keep_alive_interval: Duration::from_secs(15),
            timeout: true,
            timeout_interval: Duration::from_secs(1),
            server_timeout: Duration::from_secs(30),
            packet_timeout: Duration::from_secs(1),
            packet_timeout_threshold: 5,
            multipart_resend_threshold: 5,
        }
    }
}
