use std::time::Duration;

use crate::constants::{
    ACK_THRESHOLD, DEFAULT_HEARTBEAT_SECS, MAX_FRAME_SIZE, MAX_HEARTBEAT_SECS,
    MAX_WEBSOCKET_MESSAGE_SIZE, SEND_BUFFER_SIZE,
};

#[derive(Clone, Debug)]
/// Configuration options to tune protocol and transport behavior.
pub struct Config {
    /// Interval between WebSocket PING frames. None disables heartbeats.
    /// Values are clamped to at most one hour when the connection opens.
    pub heartbeat_interval: Option<Duration>,
    /// How long to wait for any inbound traffic before closing with a
    /// timeout. None derives the default of twice the heartbeat interval.
    pub response_timeout: Option<Duration>,
    /// Per-message unacknowledged byte window before an ACK is emitted.
    pub ack_threshold: u64,
    /// Soft cap on the payload bytes of a single outgoing frame.
    pub max_frame_size: usize,
    /// Outgoing bytes buffered in the transport above which `send`
    /// reports back-pressure.
    pub send_buffer_size: usize,
    /// Largest complete incoming WebSocket message accepted before the
    /// connection closes with status 1009.
    pub max_message_size: usize,
}

impl Config {
    /// Returns the heartbeat interval clamped to [0, 1 hour].
    pub fn clamped_heartbeat(&self) -> Option<Duration> {
        self.heartbeat_interval
            .map(|hb| hb.min(Duration::from_secs(MAX_HEARTBEAT_SECS)))
            .filter(|hb| !hb.is_zero())
    }

    /// Returns the response timeout, defaulting to twice the heartbeat.
    pub fn effective_response_timeout(&self) -> Option<Duration> {
        self.response_timeout.or_else(|| self.clamped_heartbeat().map(|hb| hb * 2))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval: Some(Duration::from_secs(DEFAULT_HEARTBEAT_SECS)),
            response_timeout: None, // Derived: 2x heartbeat
            ack_threshold: ACK_THRESHOLD,
            max_frame_size: MAX_FRAME_SIZE,
            send_buffer_size: SEND_BUFFER_SIZE,
            max_message_size: MAX_WEBSOCKET_MESSAGE_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_clamped_to_one_hour() {
        let mut config = Config::default();
        config.heartbeat_interval = Some(Duration::from_secs(7200));
        assert_eq!(config.clamped_heartbeat(), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_zero_heartbeat_disables_pings() {
        let mut config = Config::default();
        config.heartbeat_interval = Some(Duration::ZERO);
        assert_eq!(config.clamped_heartbeat(), None);
        assert_eq!(config.effective_response_timeout(), None);
    }

    #[test]
    fn test_response_timeout_defaults_to_twice_heartbeat() {
        let config = Config::default();
        assert_eq!(
            config.effective_response_timeout(),
            Some(Duration::from_secs(2 * DEFAULT_HEARTBEAT_SECS))
        );
    }

    #[test]
    fn test_explicit_response_timeout_wins() {
        let mut config = Config::default();
        config.response_timeout = Some(Duration::from_secs(30));
        assert_eq!(config.effective_response_timeout(), Some(Duration::from_secs(30)));
    }
}
