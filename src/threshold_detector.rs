use std::fmt;

/// Default level for pump and purge shot inputs, in volts.
pub const DEFAULT_SHOT_THRESHOLD: f64 = 6.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LatchState {
    #[default]
    Below,
    Above,
}

/// Rising-edge latch watching one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorState {
    pub channel: usize,
    pub threshold: f64,
    pub latch: LatchState,
}

impl DetectorState {
    pub fn new(channel: usize, threshold: f64) -> Self {
        Self {
            channel,
            threshold,
            latch: LatchState::Below,
        }
    }

    pub fn is_above(&self) -> bool {
        self.latch == LatchState::Above
    }

    /// Feed one average, returning `true` on a `Below -> Above` transition.
    pub fn observe(&mut self, average: f64) -> bool {
        let (next, fired) = update(self, average);
        *self = next;
        fired
    }
}

/// Advance `state` with a new average. Only `Below -> Above` fires; dropping
/// to or below the threshold re-arms silently.
pub fn update(state: &DetectorState, average: f64) -> (DetectorState, bool) {
    let latch = if average > state.threshold {
        LatchState::Above
    } else {
        LatchState::Below
    };
    let fired = state.latch == LatchState::Below && latch == LatchState::Above;

    (DetectorState { latch, ..*state }, fired)
}

/// A channel the operator wants shot notifications for.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredChannel {
    label: String,
    channel: usize,
    threshold: f64,
}

impl MonitoredChannel {
    pub fn new(label: &str, channel: usize, threshold: f64) -> Self {
        Self {
            label: label.to_string(),
            channel,
            threshold,
        }
    }

    pub fn on_channel(channel: usize) -> MonitoredChannelBuilder {
        MonitoredChannelBuilder {
            label: None,
            channel,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn initial_state(&self) -> DetectorState {
        DetectorState::new(self.channel, self.threshold)
    }
}

#[derive(Debug)]
pub struct MonitoredChannelBuilder {
    label: Option<String>,
    channel: usize,
}

impl MonitoredChannelBuilder {
    pub fn named(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn rising_above(self, threshold: f64) -> MonitoredChannel {
        let label = self
            .label
            .unwrap_or_else(|| format!("channel {}", self.channel));
        MonitoredChannel {
            label,
            channel: self.channel,
            threshold,
        }
    }

    /// Trigger at [`DEFAULT_SHOT_THRESHOLD`].
    pub fn shot(self) -> MonitoredChannel {
        self.rising_above(DEFAULT_SHOT_THRESHOLD)
    }
}

/// One detected rising edge.
#[derive(Debug, Clone, PartialEq)]
pub struct ShotEvent {
    pub label: String,
    pub channel: usize,
    pub average: f64,
    pub threshold: f64,
    /// Zero-based index of the block in which the edge was seen.
    pub block: u64,
}

impl fmt::Display for ShotEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} detected on channel {} at block {}: {:.2} V > {:.2} V",
            self.label, self.channel, self.block, self.average, self.threshold
        )
    }
}
