use std::fmt;
use std::time::Duration;

use crate::callback_pump;
use crate::threshold_detector::MonitoredChannel;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Channel specification is empty")]
    EmptyChannelSpec,

    #[error("Invalid physical channel '{0}' (expected e.g. 'cDAQ1Mod1/ai0:3')")]
    InvalidChannel(String),

    #[error("Voltage range [{min}, {max}] is empty or not finite")]
    VoltageRange { min: f64, max: f64 },

    #[error("Sample rate {0} Hz must be positive with a representable callback period")]
    SampleRate(f64),

    #[error("Block size must be at least one sample per channel")]
    ZeroBlockSize,

    #[error("Samples per callback must be at least one")]
    ZeroSamplesPerCallback,

    #[error("Monitored channel {channel} is out of range for {channel_count} channels")]
    MonitoredChannelOutOfRange { channel: usize, channel_count: usize },

    #[error("Threshold for '{label}' is not finite")]
    NonFiniteThreshold { label: String },

    #[error("History of {blocks} blocks exceeds the limit of {max}")]
    HistoryTooLong { blocks: usize, max: usize },
}

/// Physical channels of one task, e.g. `cDAQ1Mod1/ai0:1, cDAQ1Mod1/ai2:3`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    raw: String,
    physical: Vec<String>,
}

impl ChannelSpec {
    /// Parse a comma separated list of `prefixN` or `prefixA:B` entries.
    /// Ranges may run downward (`ai3:0`), matching DAQ naming rules.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let mut physical = Vec::new();

        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (head, end) = match entry.rsplit_once(':') {
                Some((head, end)) => (head, Some(end.trim())),
                None => (entry, None),
            };

            let prefix = head.trim_end_matches(|c: char| c.is_ascii_digit());
            if prefix.is_empty() || prefix.len() == head.len() {
                return Err(ConfigError::InvalidChannel(entry.to_string()));
            }
            let start: u32 = head[prefix.len()..]
                .parse()
                .map_err(|_| ConfigError::InvalidChannel(entry.to_string()))?;
            let end: u32 = match end {
                Some(end) => end
                    .parse()
                    .map_err(|_| ConfigError::InvalidChannel(entry.to_string()))?,
                None => start,
            };

            if start <= end {
                physical.extend((start..=end).map(|n| format!("{prefix}{n}")));
            } else {
                physical.extend((end..=start).rev().map(|n| format!("{prefix}{n}")));
            }
        }

        if physical.is_empty() {
            return Err(ConfigError::EmptyChannelSpec);
        }

        Ok(Self {
            raw: spec.trim().to_string(),
            physical,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Expanded physical channel names in acquisition order.
    pub fn physical_channels(&self) -> &[String] {
        &self.physical
    }

    pub fn channel_count(&self) -> usize {
        self.physical.len()
    }
}

impl fmt::Display for ChannelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Everything needed to create one acquisition session.
#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    channels: ChannelSpec,
    min_voltage: f64,
    max_voltage: f64,
    sample_rate: f64,
    block_size: usize,
    samples_per_callback: usize,
    monitored: Vec<MonitoredChannel>,
    read_timeout: Duration,
    history_blocks: usize,
    callback_period: Duration,
}

impl AcquisitionConfig {
    pub const DEFAULT_MIN_VOLTAGE: f64 = -10.0;
    pub const DEFAULT_MAX_VOLTAGE: f64 = 10.0;
    pub const DEFAULT_SAMPLE_RATE: f64 = 250.0;
    pub const DEFAULT_BLOCK_SIZE: usize = 200;
    pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);
    pub const MAX_HISTORY_BLOCKS: usize = 1 << 20;

    pub fn builder(channels: &str) -> AcquisitionConfigBuilder {
        AcquisitionConfigBuilder::new(channels)
    }

    pub fn channels(&self) -> &ChannelSpec {
        &self.channels
    }

    pub fn channel_count(&self) -> usize {
        self.channels.channel_count()
    }

    pub fn voltage_range(&self) -> (f64, f64) {
        (self.min_voltage, self.max_voltage)
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn samples_per_callback(&self) -> usize {
        self.samples_per_callback
    }

    pub fn monitored(&self) -> &[MonitoredChannel] {
        &self.monitored
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn history_blocks(&self) -> usize {
        self.history_blocks
    }

    /// Nominal time between two block callbacks.
    pub fn callback_period(&self) -> Duration {
        self.callback_period
    }
}

#[derive(Debug)]
pub struct AcquisitionConfigBuilder {
    channels: String,
    min_voltage: f64,
    max_voltage: f64,
    sample_rate: f64,
    block_size: usize,
    samples_per_callback: Option<usize>,
    monitored: Vec<MonitoredChannel>,
    read_timeout: Duration,
    history_blocks: usize,
}

impl AcquisitionConfigBuilder {
    pub fn new(channels: &str) -> Self {
        Self {
            channels: channels.to_string(),
            min_voltage: AcquisitionConfig::DEFAULT_MIN_VOLTAGE,
            max_voltage: AcquisitionConfig::DEFAULT_MAX_VOLTAGE,
            sample_rate: AcquisitionConfig::DEFAULT_SAMPLE_RATE,
            block_size: AcquisitionConfig::DEFAULT_BLOCK_SIZE,
            samples_per_callback: None,
            monitored: Vec::new(),
            read_timeout: AcquisitionConfig::DEFAULT_READ_TIMEOUT,
            history_blocks: 0,
        }
    }

    pub fn voltage_range(mut self, min: f64, max: f64) -> Self {
        self.min_voltage = min;
        self.max_voltage = max;
        self
    }

    pub fn sample_rate(mut self, hz: f64) -> Self {
        self.sample_rate = hz;
        self
    }

    pub fn block_size(mut self, samples_per_channel: usize) -> Self {
        self.block_size = samples_per_channel;
        self
    }

    /// Callback granularity; defaults to the block size.
    pub fn samples_per_callback(mut self, samples: usize) -> Self {
        self.samples_per_callback = Some(samples);
        self
    }

    pub fn monitor(mut self, channel: MonitoredChannel) -> Self {
        self.monitored.push(channel);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Keep the averages of the last `blocks` blocks; 0 disables history.
    pub fn history_blocks(mut self, blocks: usize) -> Self {
        self.history_blocks = blocks;
        self
    }

    pub fn build(self) -> Result<AcquisitionConfig, ConfigError> {
        let channels = ChannelSpec::parse(&self.channels)?;

        if !(self.min_voltage.is_finite()
            && self.max_voltage.is_finite()
            && self.min_voltage < self.max_voltage)
        {
            return Err(ConfigError::VoltageRange {
                min: self.min_voltage,
                max: self.max_voltage,
            });
        }
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(ConfigError::SampleRate(self.sample_rate));
        }
        if self.block_size == 0 {
            return Err(ConfigError::ZeroBlockSize);
        }
        let samples_per_callback = self.samples_per_callback.unwrap_or(self.block_size);
        if samples_per_callback == 0 {
            return Err(ConfigError::ZeroSamplesPerCallback);
        }
        let callback_period =
            callback_pump::callback_period(samples_per_callback, self.sample_rate)
                .ok_or(ConfigError::SampleRate(self.sample_rate))?;
        if self.history_blocks > AcquisitionConfig::MAX_HISTORY_BLOCKS {
            return Err(ConfigError::HistoryTooLong {
                blocks: self.history_blocks,
                max: AcquisitionConfig::MAX_HISTORY_BLOCKS,
            });
        }

        let channel_count = channels.channel_count();
        for monitored in &self.monitored {
            if monitored.channel() >= channel_count {
                return Err(ConfigError::MonitoredChannelOutOfRange {
                    channel: monitored.channel(),
                    channel_count,
                });
            }
            if !monitored.threshold().is_finite() {
                return Err(ConfigError::NonFiniteThreshold {
                    label: monitored.label().to_string(),
                });
            }
        }

        Ok(AcquisitionConfig {
            channels,
            min_voltage: self.min_voltage,
            max_voltage: self.max_voltage,
            sample_rate: self.sample_rate,
            block_size: self.block_size,
            samples_per_callback,
            monitored: self.monitored,
            read_timeout: self.read_timeout,
            history_blocks: self.history_blocks,
            callback_period,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_split_ranges() {
        let spec = ChannelSpec::parse("cDAQ1Mod1/ai0:1, cDAQ1Mod1/ai2:3").unwrap();
        assert_eq!(spec.channel_count(), 4);
        assert_eq!(
            spec.physical_channels(),
            &[
                "cDAQ1Mod1/ai0",
                "cDAQ1Mod1/ai1",
                "cDAQ1Mod1/ai2",
                "cDAQ1Mod1/ai3"
            ]
        );
    }

    #[test]
    fn test_parse_single_and_descending() {
        let spec = ChannelSpec::parse("Dev1/ai5").unwrap();
        assert_eq!(spec.physical_channels(), &["Dev1/ai5"]);

        let spec = ChannelSpec::parse("Dev1/ai3:1").unwrap();
        assert_eq!(spec.physical_channels(), &["Dev1/ai3", "Dev1/ai2", "Dev1/ai1"]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(ChannelSpec::parse(" , "), Err(ConfigError::EmptyChannelSpec));
        assert!(matches!(
            ChannelSpec::parse("Dev1/ai"),
            Err(ConfigError::InvalidChannel(_))
        ));
        assert!(matches!(
            ChannelSpec::parse("42"),
            Err(ConfigError::InvalidChannel(_))
        ));
        assert!(matches!(
            ChannelSpec::parse("Dev1/ai0:x"),
            Err(ConfigError::InvalidChannel(_))
        ));
    }

    #[test]
    fn test_builder_defaults() {
        let config = AcquisitionConfig::builder("cDAQ1Mod1/ai0:3").build().unwrap();
        assert_eq!(config.channel_count(), 4);
        assert_eq!(config.voltage_range(), (-10.0, 10.0));
        assert_eq!(config.block_size(), 200);
        assert_eq!(config.samples_per_callback(), 200);
        assert_eq!(config.read_timeout(), Duration::from_secs(10));
        assert!(config.monitored().is_empty());
        assert_eq!(config.callback_period(), Duration::from_millis(800));
    }

    #[test]
    fn test_builder_validation() {
        let err = AcquisitionConfig::builder("Dev1/ai0:3")
            .voltage_range(5.0, -5.0)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::VoltageRange { .. }));

        let err = AcquisitionConfig::builder("Dev1/ai0:3")
            .sample_rate(0.0)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::SampleRate(0.0));

        let err = AcquisitionConfig::builder("Dev1/ai0:3")
            .sample_rate(1e-18)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::SampleRate(1e-18));

        let err = AcquisitionConfig::builder("Dev1/ai0:3")
            .history_blocks(usize::MAX)
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::HistoryTooLong {
                blocks: usize::MAX,
                max: AcquisitionConfig::MAX_HISTORY_BLOCKS
            }
        );

        let err = AcquisitionConfig::builder("Dev1/ai0:3")
            .block_size(0)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::ZeroBlockSize);

        let err = AcquisitionConfig::builder("Dev1/ai0:3")
            .samples_per_callback(0)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::ZeroSamplesPerCallback);

        let err = AcquisitionConfig::builder("Dev1/ai0:3")
            .monitor(MonitoredChannel::on_channel(4).rising_above(6.9))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::MonitoredChannelOutOfRange {
                channel: 4,
                channel_count: 4
            }
        );

        let err = AcquisitionConfig::builder("Dev1/ai0:3")
            .monitor(MonitoredChannel::on_channel(1).rising_above(f64::NAN))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::NonFiniteThreshold { .. }));
    }
}
