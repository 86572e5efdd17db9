use std::{fmt::Display, time::Duration};

use ts::PACKET_SIZE;

use crate::PipelineError;

/// Default ring size: 16 MiB worth of packets.
pub const DEFAULT_BUFFER_PACKETS: usize = 16 * 1024 * 1024 / PACKET_SIZE;

/// Default number of packets requested from the input plugin per call.
pub const DEFAULT_MAX_INPUT_PACKETS: usize = 128;

/// Default number of packets a processor handles before handing off.
pub const DEFAULT_MAX_FLUSHED_PACKETS: usize = 10_000;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Capacity of the shared packet ring, in packets
    pub buffer_packets: usize,

    /// Maximum time a stage waits for work before aborting (None = forever)
    pub stage_timeout: Option<Duration>,

    /// Maximum packets requested from the input plugin per receive call
    pub max_input_packets: usize,

    /// Maximum packets a processor stage handles before passing them on
    pub max_flushed_packets: usize,

    /// Maximum packets per output send call (0 = unlimited)
    pub max_output_packets: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_packets: DEFAULT_BUFFER_PACKETS,
            stage_timeout: None,
            max_input_packets: DEFAULT_MAX_INPUT_PACKETS,
            max_flushed_packets: DEFAULT_MAX_FLUSHED_PACKETS,
            max_output_packets: 0,
        }
    }
}

impl Display for PipelineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let timeout_display = match self.stage_timeout {
            Some(timeout) => format!("{:.2}s", timeout.as_secs_f64()),
            None => "none".to_string(),
        };

        let max_output_display = if self.max_output_packets == 0 {
            "unlimited".to_string()
        } else {
            self.max_output_packets.to_string()
        };

        write!(
            f,
            "PipelineConfig {{ buffer_packets: {}, stage_timeout: {}, max_input_packets: {}, max_flushed_packets: {}, max_output_packets: {} }}",
            self.buffer_packets,
            timeout_display,
            self.max_input_packets,
            self.max_flushed_packets,
            max_output_display
        )
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Reject configurations the executors cannot run with.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.buffer_packets == 0 {
            return Err(PipelineError::InvalidConfig(
                "buffer_packets must be at least 1".to_string(),
            ));
        }
        if self.max_input_packets == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_input_packets must be at least 1".to_string(),
            ));
        }
        if self.max_flushed_packets == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_flushed_packets must be at least 1".to_string(),
            ));
        }
        if self.stage_timeout.is_some_and(|t| t.is_zero()) {
            return Err(PipelineError::InvalidConfig(
                "stage_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn buffer_packets(mut self, buffer_packets: usize) -> Self {
        self.config.buffer_packets = buffer_packets;
        self
    }

    pub fn stage_timeout(mut self, timeout: Duration) -> Self {
        self.config.stage_timeout = Some(timeout);
        self
    }

    /// Timeout in seconds; values <= 0 disable the timeout.
    pub fn stage_timeout_s(mut self, timeout_s: f64) -> Self {
        self.config.stage_timeout = if timeout_s > 0.0 {
            Some(Duration::from_secs_f64(timeout_s))
        } else {
            None
        };
        self
    }

    pub fn max_input_packets(mut self, max_input_packets: usize) -> Self {
        self.config.max_input_packets = max_input_packets;
        self
    }

    pub fn max_flushed_packets(mut self, max_flushed_packets: usize) -> Self {
        self.config.max_flushed_packets = max_flushed_packets;
        self
    }

    pub fn max_output_packets(mut self, max_output_packets: usize) -> Self {
        self.config.max_output_packets = max_output_packets;
        self
    }

    pub fn build(self) -> PipelineConfig {
        self.config
    }
}
