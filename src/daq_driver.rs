use std::fmt;
use std::ops::ControlFlow;
use std::time::Duration;

use crate::config::ChannelSpec;
use crate::serial_terminal::DaqTerminalError;

/// Opaque identifier of one driver task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(u64);

impl TaskHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Order of samples in a block handed back by [`DaqDriver::read_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleLayout {
    /// Channel `c` occupies `[c * n, (c + 1) * n)`.
    GroupByChannel,
    /// Sample `k` of channel `c` sits at `k * channel_count + c`.
    GroupByScanNumber,
}

impl SampleLayout {
    /// Flat index of sample `sample` of channel `channel`.
    pub fn index(
        self,
        channel: usize,
        sample: usize,
        channel_count: usize,
        samples_per_channel: usize,
    ) -> usize {
        match self {
            Self::GroupByChannel => channel * samples_per_channel + sample,
            Self::GroupByScanNumber => sample * channel_count + channel,
        }
    }
}

/// Sample clock mode. Acquisition always runs continuously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleMode {
    Continuous,
}

impl SampleMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continuous => "cont",
        }
    }
}

/// Invoked by the driver every time `samples` samples per channel have been
/// acquired into its buffer. Returning `Break` stops further deliveries.
pub type BlockCallback = Box<dyn FnMut(TaskHandle, usize) -> ControlFlow<()> + Send>;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Driver rejected the request: {0}")]
    Rejected(String),

    #[error("Unknown task {0}")]
    UnknownTask(TaskHandle),

    #[error("Task {0} is not running")]
    NotRunning(TaskHandle),

    #[error("Short read: expected {expected} samples per channel, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("Destination holds {actual} values but {required} are needed")]
    DestinationTooSmall { required: usize, actual: usize },

    #[error("Could not spawn callback thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Serial terminal error: {0}")]
    Terminal(#[from] DaqTerminalError),

    #[error("Failed to parse sample data: {0}")]
    Parse(#[from] polars::prelude::PolarsError),
}

/// Operations of an analog-input acquisition driver.
///
/// Methods take `&self` because the block callback calls back into the
/// driver (`read_block`, and on failure `stop_task`/`clear_task`) from the
/// driver's own delivery thread.
pub trait DaqDriver: Send + Sync {
    fn create_task(&self) -> Result<TaskHandle, DriverError>;

    fn configure_voltage_channels(
        &self,
        task: TaskHandle,
        channels: &ChannelSpec,
        min_voltage: f64,
        max_voltage: f64,
    ) -> Result<(), DriverError>;

    fn configure_sample_clock(
        &self,
        task: TaskHandle,
        rate_hz: f64,
        mode: SampleMode,
        block_size: usize,
    ) -> Result<(), DriverError>;

    fn register_block_callback(
        &self,
        task: TaskHandle,
        samples_per_callback: usize,
        callback: BlockCallback,
    ) -> Result<(), DriverError>;

    fn start_task(&self, task: TaskHandle) -> Result<(), DriverError>;

    /// Reads `samples_per_channel` samples of every channel into `out` using
    /// `layout`, returning the number of samples per channel actually read.
    fn read_block(
        &self,
        task: TaskHandle,
        samples_per_channel: usize,
        timeout: Duration,
        layout: SampleLayout,
        out: &mut [f64],
    ) -> Result<usize, DriverError>;

    /// Stops delivery. Safe on unknown, stopped, or cleared tasks, and from
    /// inside the block callback.
    fn stop_task(&self, task: TaskHandle);

    /// Releases the task. Idempotent.
    fn clear_task(&self, task: TaskHandle);

    fn last_error_detail(&self) -> String;
}
