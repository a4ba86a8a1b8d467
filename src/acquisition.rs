//! Session lifecycle and the per-block pipeline.
//!
//! The controller owns at most one [`Session`]. Creating a new session tears
//! down the current one first. Once started, the driver calls back every
//! `samples_per_callback` samples; the callback reads the block, averages
//! every channel, runs the monitored detectors and publishes [`ShotEvent`]s.
//! Any failure inside the callback tears the whole session down and stops
//! further deliveries.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use polars::prelude::{DataFrame, PolarsResult};

use crate::channel_reducer::{self, ReduceError};
use crate::config::AcquisitionConfig;
use crate::daq_driver::{
    BlockCallback, DaqDriver, DriverError, SampleLayout, SampleMode, TaskHandle,
};
use crate::history::AverageHistory;
use crate::sample_buffer::{BufferError, SampleBuffer};
use crate::threshold_detector::{DetectorState, ShotEvent};

/// Step of session creation that the driver refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigStep {
    CreateTask,
    VoltageChannels,
    SampleClock,
}

impl fmt::Display for ConfigStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CreateTask => "task creation",
            Self::VoltageChannels => "channel creation",
            Self::SampleClock => "timing configuration",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Running,
    Stopped,
    Cleared,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Cleared => "cleared",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error("Device configuration failed during {step}: {detail}")]
    DeviceConfiguration {
        step: ConfigStep,
        detail: String,
        #[source]
        source: DriverError,
    },

    #[error("Task failed to start: {detail}")]
    DeviceStart {
        detail: String,
        #[source]
        source: DriverError,
    },

    #[error("Block read failed: {detail}")]
    DeviceRead {
        detail: String,
        #[source]
        source: DriverError,
    },

    #[error("Out of memory: {0}")]
    OutOfMemory(#[from] BufferError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(#[from] ReduceError),

    #[error("No session can be started (state: {state})")]
    NotStartable { state: String },
}

/// Driver diagnostic, falling back to the error itself when the driver has
/// nothing more specific.
fn diagnostic<D: DaqDriver + ?Sized>(driver: &D, err: &DriverError) -> String {
    let detail = driver.last_error_detail();
    if detail.is_empty() {
        err.to_string()
    } else {
        detail
    }
}

/// Buffer, averages and detector latches of one running session.
pub struct BlockPipeline {
    channel_count: usize,
    layout: SampleLayout,
    read_timeout: std::time::Duration,
    buffer: SampleBuffer,
    averages: Vec<f64>,
    detectors: Vec<DetectorState>,
    labels: Vec<String>,
    history: AverageHistory,
    blocks: u64,
}

impl BlockPipeline {
    /// Pipeline with its buffer already sized for one callback's block.
    pub fn new(config: &AcquisitionConfig) -> Result<Self, BufferError> {
        let channel_count = config.channel_count();
        let mut buffer = SampleBuffer::new();
        buffer.ensure_capacity(channel_count.saturating_mul(config.samples_per_callback()))?;

        Ok(Self {
            channel_count,
            layout: SampleLayout::GroupByChannel,
            read_timeout: config.read_timeout(),
            buffer,
            averages: vec![0.0; channel_count],
            detectors: config
                .monitored()
                .iter()
                .map(|m| m.initial_state())
                .collect(),
            labels: config
                .monitored()
                .iter()
                .map(|m| m.label().to_string())
                .collect(),
            history: AverageHistory::new(
                channel_count,
                config.samples_per_callback(),
                config.sample_rate(),
                config.history_blocks(),
            ),
            blocks: 0,
        })
    }

    /// Handle one delivery of `samples_per_channel` samples per channel.
    pub fn on_block_delivered<D: DaqDriver + ?Sized>(
        &mut self,
        driver: &D,
        task: TaskHandle,
        samples_per_channel: usize,
        mut emit: impl FnMut(ShotEvent),
    ) -> Result<(), AcquisitionError> {
        #[cfg(feature = "cpu-profiling")]
        let _span = tracy_client::span!("on_block_delivered");

        let required = samples_per_channel
            .checked_mul(self.channel_count)
            .ok_or(BufferError::OutOfMemory {
                requested: usize::MAX,
            })?;
        let block = self.buffer.ensure_capacity(required)?;

        let read = driver
            .read_block(task, samples_per_channel, self.read_timeout, self.layout, block)
            .map_err(|source| AcquisitionError::DeviceRead {
                detail: diagnostic(driver, &source),
                source,
            })?;
        if read != samples_per_channel {
            let source = DriverError::ShortRead {
                expected: samples_per_channel,
                actual: read,
            };
            return Err(AcquisitionError::DeviceRead {
                detail: source.to_string(),
                source,
            });
        }

        channel_reducer::reduce_all(block, samples_per_channel, &mut self.averages)?;

        let mut fired = 0;
        for (detector, label) in self.detectors.iter_mut().zip(&self.labels) {
            let average = self.averages[detector.channel];
            if detector.observe(average) {
                fired += 1;
                emit(ShotEvent {
                    label: label.clone(),
                    channel: detector.channel,
                    average,
                    threshold: detector.threshold,
                    block: self.blocks,
                });
            }
        }

        self.history.push(self.blocks, &self.averages, fired);
        self.blocks += 1;
        Ok(())
    }

    pub fn averages(&self) -> &[f64] {
        &self.averages
    }

    pub fn detectors(&self) -> &[DetectorState] {
        &self.detectors
    }

    pub fn blocks_processed(&self) -> u64 {
        self.blocks
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn history(&self) -> &AverageHistory {
        &self.history
    }
}

struct SessionCore {
    state: SessionState,
    pipeline: Option<BlockPipeline>,
    fault: Option<AcquisitionError>,
}

/// The single live acquisition task.
pub struct Session {
    handle: TaskHandle,
    config: AcquisitionConfig,
    core: Arc<Mutex<SessionCore>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.handle)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Session {
    fn core(&self) -> MutexGuard<'_, SessionCore> {
        lock_core(&self.core)
    }

    pub fn handle(&self) -> TaskHandle {
        self.handle
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.core().state
    }

    /// Latest per-channel averages, `None` once buffers are released.
    pub fn averages(&self) -> Option<Vec<f64>> {
        self.core().pipeline.as_ref().map(|p| p.averages().to_vec())
    }

    pub fn detector_states(&self) -> Option<Vec<DetectorState>> {
        self.core().pipeline.as_ref().map(|p| p.detectors().to_vec())
    }

    pub fn blocks_processed(&self) -> u64 {
        self.core()
            .pipeline
            .as_ref()
            .map_or(0, BlockPipeline::blocks_processed)
    }

    pub fn buffer_capacity(&self) -> usize {
        self.core()
            .pipeline
            .as_ref()
            .map_or(0, BlockPipeline::buffer_capacity)
    }

    /// The error that tore the session down from inside the callback.
    pub fn take_fault(&self) -> Option<AcquisitionError> {
        self.core().fault.take()
    }

    pub fn history_frame(&self) -> Option<PolarsResult<DataFrame>> {
        self.core()
            .pipeline
            .as_ref()
            .map(|p| p.history().to_dataframe())
    }

    pub fn history_summary(&self) -> Option<PolarsResult<DataFrame>> {
        self.core().pipeline.as_ref().map(|p| p.history().summary())
    }
}

fn lock_core(core: &Mutex<SessionCore>) -> MutexGuard<'_, SessionCore> {
    core.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stop, clear and release everything. Safe to repeat.
fn teardown<D: DaqDriver + ?Sized>(driver: &D, task: TaskHandle, core: &mut SessionCore) {
    driver.stop_task(task);
    driver.clear_task(task);
    if core.pipeline.take().is_some() {
        log::debug!("Released buffers of {}", task);
    }
    core.state = SessionState::Cleared;
}

pub struct AcquisitionController<D: DaqDriver + 'static> {
    driver: Arc<D>,
    session: Option<Session>,
    events: Option<Sender<ShotEvent>>,
}

impl<D: DaqDriver + 'static> AcquisitionController<D> {
    pub fn new(driver: Arc<D>) -> Self {
        Self {
            driver,
            session: None,
            events: None,
        }
    }

    /// Also publish every fired event on `events`. Sending never blocks.
    pub fn with_event_sink(mut self, events: Sender<ShotEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    fn configuration_error(&self, step: ConfigStep, source: DriverError) -> AcquisitionError {
        let detail = diagnostic(self.driver.as_ref(), &source);
        log::error!("DAQ {} failed: {}", step, detail);
        AcquisitionError::DeviceConfiguration {
            step,
            detail,
            source,
        }
    }

    /// Tear down any current session, then create and configure a new task.
    /// On failure no task handle is left behind.
    #[tracing::instrument(skip_all, fields(channels = %config.channels()))]
    pub fn create_session(
        &mut self,
        config: AcquisitionConfig,
    ) -> Result<&Session, AcquisitionError> {
        self.clear_session();

        let handle = self
            .driver
            .create_task()
            .map_err(|e| self.configuration_error(ConfigStep::CreateTask, e))?;

        let (min, max) = config.voltage_range();
        let configured = self
            .driver
            .configure_voltage_channels(handle, config.channels(), min, max)
            .map_err(|e| self.configuration_error(ConfigStep::VoltageChannels, e))
            .and_then(|()| {
                self.driver
                    .configure_sample_clock(
                        handle,
                        config.sample_rate(),
                        SampleMode::Continuous,
                        config.block_size(),
                    )
                    .map_err(|e| self.configuration_error(ConfigStep::SampleClock, e))
            });
        let pipeline = configured.and_then(|()| {
            BlockPipeline::new(&config).map_err(|e| {
                log::error!("Failed to allocate buffers for {}: {}", handle, e);
                AcquisitionError::from(e)
            })
        });
        let pipeline = match pipeline {
            Ok(pipeline) => pipeline,
            Err(e) => {
                self.driver.clear_task(handle);
                return Err(e);
            }
        };

        log::debug!(
            "Created {} for {} channels at {} Hz",
            handle,
            config.channel_count(),
            config.sample_rate()
        );
        let core = SessionCore {
            state: SessionState::Created,
            pipeline: Some(pipeline),
            fault: None,
        };
        Ok(&*self.session.insert(Session {
            handle,
            config,
            core: Arc::new(Mutex::new(core)),
        }))
    }

    fn block_callback(&self, session: &Session) -> BlockCallback {
        let driver = Arc::clone(&self.driver);
        let core = Arc::clone(&session.core);
        let events = self.events.clone();

        Box::new(move |task, samples_per_channel| {
            let mut guard = lock_core(&core);
            let core = &mut *guard;
            if core.state != SessionState::Running {
                return ControlFlow::Break(());
            }
            let Some(pipeline) = core.pipeline.as_mut() else {
                return ControlFlow::Break(());
            };

            let result = pipeline.on_block_delivered(
                driver.as_ref(),
                task,
                samples_per_channel,
                |event| {
                    log::info!("{}", event);
                    if let Some(events) = &events {
                        // A dropped receiver only means nobody is listening.
                        let _ = events.send(event);
                    }
                },
            );

            match result {
                Ok(()) => ControlFlow::Continue(()),
                Err(e) => {
                    log::error!("DAQ error on {}: {}", task, e);
                    teardown(driver.as_ref(), task, core);
                    core.fault = Some(e);
                    ControlFlow::Break(())
                }
            }
        })
    }

    /// Register the block callback and start the hardware clock. Failure
    /// tears the session down.
    #[tracing::instrument(skip_all)]
    pub fn start_session(&mut self) -> Result<(), AcquisitionError> {
        let Some(session) = self.session.as_ref() else {
            return Err(AcquisitionError::NotStartable {
                state: "no session".to_string(),
            });
        };
        {
            let mut core = session.core();
            if core.state != SessionState::Created {
                return Err(AcquisitionError::NotStartable {
                    state: core.state.to_string(),
                });
            }
            core.state = SessionState::Running;
        }

        let handle = session.handle;
        let callback = self.block_callback(session);
        let started = self
            .driver
            .register_block_callback(handle, session.config.samples_per_callback(), callback)
            .and_then(|()| self.driver.start_task(handle));

        if let Err(source) = started {
            let detail = diagnostic(self.driver.as_ref(), &source);
            log::error!("DAQ task {} failed to start: {}", handle, detail);
            self.clear_session();
            return Err(AcquisitionError::DeviceStart { detail, source });
        }

        log::debug!(
            "Started {}, callback every {} samples",
            handle,
            session.config.samples_per_callback()
        );
        Ok(())
    }

    /// Stop deliveries. Averages stay readable. Idempotent.
    pub fn stop_session(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        // Unregister first and without the core lock: an in-flight callback
        // may still need it to finish.
        self.driver.stop_task(session.handle);

        let mut core = session.core();
        if core.state == SessionState::Running || core.state == SessionState::Created {
            log::debug!("Stopped {}", session.handle);
            core.state = SessionState::Stopped;
        }
    }

    /// Stop, clear the task and release all buffers. Idempotent.
    pub fn clear_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        self.driver.stop_task(session.handle);

        let mut core = session.core();
        teardown(self.driver.as_ref(), session.handle, &mut core);
        log::debug!("Cleared {}", session.handle);
    }
}

impl<D: DaqDriver + 'static> Drop for AcquisitionController<D> {
    fn drop(&mut self) {
        self.clear_session();
    }
}
