//! Multiplexer tuning knobs.

const DEFAULT_REQUEST_BUFFER: usize = 16;
const DEFAULT_DATA_BUFFER: usize = 64;
const DEFAULT_INCOMING_BUFFER: usize = 16;
const DEFAULT_MAX_CHANNELS: usize = 1024;
const DEFAULT_MAX_FRAME_LEN: usize = 256 * 1024;
const DEFAULT_WINDOW_SIZE: u32 = 2 * 1024 * 1024;
const DEFAULT_MAX_PACKET: u32 = 32 * 1024;

/// Buffer sizes and limits used by the multiplexer.
///
/// The request buffers bound how far the peer can run ahead of a consumer
/// that is not draining its `Requests` stream. Once one fills up, the demux
/// loop waits for space and every channel on the connection stalls with it,
/// so raising these only postpones the stall; consumers still have to drain
/// (see [`discard_requests`](crate::discard_requests)).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxConfig {
    /// Capacity of each `Requests` stream (global and per channel).
    pub request_buffer: usize,
    /// Capacity of each channel's incoming data queue, in messages.
    pub data_buffer: usize,
    /// Capacity of the inbound channel-open stream.
    pub incoming_buffer: usize,
    /// Inbound opens beyond this many live channels are refused with
    /// `resource shortage`.
    pub max_channels: usize,
    /// Largest encoded message accepted by framed streams.
    pub max_frame_len: usize,
    /// Window advertised in channel opens. Not enforced.
    pub window_size: u32,
    /// Maximum packet size advertised in channel opens. Not enforced.
    pub max_packet: u32,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            request_buffer: DEFAULT_REQUEST_BUFFER,
            data_buffer: DEFAULT_DATA_BUFFER,
            incoming_buffer: DEFAULT_INCOMING_BUFFER,
            max_channels: DEFAULT_MAX_CHANNELS,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            window_size: DEFAULT_WINDOW_SIZE,
            max_packet: DEFAULT_MAX_PACKET,
        }
    }
}

impl MuxConfig {
    /// Defaults, overridden by `SSHCONN_*` environment variables.
    ///
    /// Recognised: `SSHCONN_REQUEST_BUFFER`, `SSHCONN_DATA_BUFFER`,
    /// `SSHCONN_INCOMING_BUFFER`, `SSHCONN_MAX_CHANNELS`,
    /// `SSHCONN_MAX_FRAME_LEN`. Unparseable or zero values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str, default: usize| {
            lookup(key)
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default)
        };

        let defaults = Self::default();
        Self {
            request_buffer: read("SSHCONN_REQUEST_BUFFER", defaults.request_buffer),
            data_buffer: read("SSHCONN_DATA_BUFFER", defaults.data_buffer),
            incoming_buffer: read("SSHCONN_INCOMING_BUFFER", defaults.incoming_buffer),
            max_channels: read("SSHCONN_MAX_CHANNELS", defaults.max_channels),
            max_frame_len: read("SSHCONN_MAX_FRAME_LEN", defaults.max_frame_len),
            ..defaults
        }
    }

    pub fn with_request_buffer(mut self, n: usize) -> Self {
        self.request_buffer = n.max(1);
        self
    }

    pub fn with_data_buffer(mut self, n: usize) -> Self {
        self.data_buffer = n.max(1);
        self
    }

    pub fn with_incoming_buffer(mut self, n: usize) -> Self {
        self.incoming_buffer = n.max(1);
        self
    }

    pub fn with_max_channels(mut self, n: usize) -> Self {
        self.max_channels = n;
        self
    }

    pub fn with_max_frame_len(mut self, n: usize) -> Self {
        self.max_frame_len = n;
        self
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn env_overrides_apply_and_bad_values_fall_back() {
        let env: HashMap<&str, &str> = [
            ("SSHCONN_REQUEST_BUFFER", "4"),
            ("SSHCONN_DATA_BUFFER", "not-a-number"),
            ("SSHCONN_MAX_CHANNELS", "0"),
        ]
        .into_iter()
        .collect();

        let config = MuxConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.request_buffer, 4);
        assert_eq!(config.data_buffer, DEFAULT_DATA_BUFFER);
        assert_eq!(config.max_channels, DEFAULT_MAX_CHANNELS);
        assert_eq!(config.incoming_buffer, DEFAULT_INCOMING_BUFFER);
    }

    #[test]
    fn buffers_never_drop_to_zero() {
        let config = MuxConfig::default()
            .with_request_buffer(0)
            .with_data_buffer(0)
            .with_incoming_buffer(0);
        assert_eq!(config.request_buffer, 1);
        assert_eq!(config.data_buffer, 1);
        assert_eq!(config.incoming_buffer, 1);
    }
}
