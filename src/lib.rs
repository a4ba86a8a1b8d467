//! # shotwatch-rs
//!
//! Continuous multi-channel analog acquisition with per-block averaging and
//! debounced threshold detection, used to spot discrete physical events such
//! as pump shots and purge shots on a DAQ voltage input.
//!
//! ## Features
//!
//! - **Session lifecycle**: one acquisition task at a time, with full rollback on
//!   configuration, start, and mid-stream failures
//! - **Block pipeline**: grow-only sample buffer, channel-major averaging, and
//!   rising-edge latches that fire once per physical event
//! - **Driver seam**: the [`DaqDriver`] trait, with a simulated device and a
//!   serial command-shell driver bundled
//! - **DataFrame output**: recent block averages as a `polars` `DataFrame`
//!
//! ## Examples
//!
//! ### Detecting shots on a simulated device
//!
//! ```rust
//! use shotwatch_rs::{
//!     AcquisitionConfig, AcquisitionController, MonitoredChannel, SimulatedDriver,
//! };
//! use std::sync::{mpsc, Arc};
//!
//! let driver = Arc::new(SimulatedDriver::new());
//! let (tx, rx) = mpsc::channel();
//! let mut controller = AcquisitionController::new(Arc::clone(&driver)).with_event_sink(tx);
//!
//! let config = AcquisitionConfig::builder("cDAQ1Mod1/ai0:3")
//!     .sample_rate(250.0)
//!     .block_size(200)
//!     .monitor(MonitoredChannel::on_channel(2).named("Pump shot").shot())
//!     .monitor(MonitoredChannel::on_channel(3).named("Purge shot").shot())
//!     .build()?;
//! controller.create_session(config)?;
//! controller.start_session()?;
//!
//! driver.queue_block(vec![vec![0.0; 200], vec![0.0; 200], vec![7.0; 200], vec![3.0; 200]])?;
//! driver.deliver_block();
//!
//! let event = rx.try_recv()?;
//! assert_eq!(event.channel, 2);
//! controller.clear_session();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Debouncing a signal by hand
//!
//! ```rust
//! use shotwatch_rs::threshold_detector::DetectorState;
//!
//! let mut pump = DetectorState::new(2, 6.9);
//! let fired: Vec<bool> = [5.0, 8.0, 8.0, 4.0, 9.0]
//!     .iter()
//!     .map(|&avg| pump.observe(avg))
//!     .collect();
//! assert_eq!(fired, [false, true, false, false, true]);
//! ```

pub mod acquisition;
pub mod callback_pump;
pub mod channel_reducer;
pub mod config;
pub mod daq_driver;
pub mod history;
pub mod sample_buffer;
pub mod serial_driver;
pub mod serial_terminal;
pub mod sim_driver;
pub mod threshold_detector;

// Re-export the main types for convenience
pub use acquisition::{
    AcquisitionController, AcquisitionError, BlockPipeline, ConfigStep, Session, SessionState,
};

pub use config::{AcquisitionConfig, AcquisitionConfigBuilder, ChannelSpec, ConfigError};

pub use daq_driver::{BlockCallback, DaqDriver, DriverError, SampleLayout, SampleMode, TaskHandle};

pub use threshold_detector::{
    DetectorState, LatchState, MonitoredChannel, ShotEvent, DEFAULT_SHOT_THRESHOLD,
};

pub use sim_driver::{Fault, SimulatedDriver};

pub use serial_driver::SerialDaqDriver;

pub use serial_terminal::{DaqTerminal, DaqTerminalError};
