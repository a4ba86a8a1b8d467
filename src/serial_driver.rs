use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use polars::prelude::*;

use crate::callback_pump::{self, CallbackPump, CallbackSlot};
use crate::config::ChannelSpec;
use crate::daq_driver::{
    BlockCallback, DaqDriver, DriverError, SampleLayout, SampleMode, TaskHandle,
};
use crate::serial_terminal::DaqTerminal;

struct SerialTask {
    handle: TaskHandle,
    channel_count: usize,
    sample_rate: f64,
    slot: Option<Arc<CallbackSlot>>,
    pump: Option<CallbackPump>,
    running: bool,
}

#[derive(Default)]
struct SerialState {
    next_handle: u64,
    task: Option<SerialTask>,
    last_error: String,
}

/// [`DaqDriver`] for acquisition front-ends driven over a serial command
/// shell (see [`DaqTerminal`]).
///
/// The device owns one task at a time. `read <n>` answers with `n` lines of
/// comma separated voltages, one scan per line. Any reply starting with
/// `error` is a rejection whose text becomes the last error detail.
pub struct SerialDaqDriver {
    terminal: Mutex<DaqTerminal>,
    state: Mutex<SerialState>,
    command_timeout: Duration,
}

impl SerialDaqDriver {
    pub fn open(port: &str, baud_rate: u32) -> Result<Self, DriverError> {
        log::debug!("Opening serial DAQ on {} at {} baud", port, baud_rate);
        Ok(Self::new(DaqTerminal::open(port, baud_rate)?))
    }

    pub fn new(terminal: DaqTerminal) -> Self {
        Self {
            terminal: Mutex::new(terminal),
            state: Mutex::new(SerialState::default()),
            command_timeout: DaqTerminal::DEFAULT_COMMAND_TIMEOUT,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SerialState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, detail: String) -> String {
        self.lock().last_error.clone_from(&detail);
        detail
    }

    /// Run one shell command. Never called with the state lock held.
    fn command(&self, command: &str, timeout: Duration) -> Result<String, DriverError> {
        let reply = self
            .terminal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .exec(command, Some(timeout));

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                self.record(e.to_string());
                return Err(e.into());
            }
        };

        if let Some(message) = reply.strip_prefix("error") {
            let detail = message.trim_start_matches(':').trim().to_string();
            log::debug!("Device rejected '{}': {}", command, detail);
            return Err(DriverError::Rejected(self.record(detail)));
        }
        Ok(reply)
    }

    fn check_task(&self, task: TaskHandle) -> Result<(), DriverError> {
        let mut state = self.lock();
        if state.task.as_ref().is_some_and(|t| t.handle == task) {
            Ok(())
        } else {
            state.last_error = format!("Task {task} does not exist");
            Err(DriverError::UnknownTask(task))
        }
    }

    fn with_task<T>(
        &self,
        task: TaskHandle,
        f: impl FnOnce(&mut SerialTask) -> T,
    ) -> Result<T, DriverError> {
        let mut state = self.lock();
        match state.task.as_mut() {
            Some(t) if t.handle == task => Ok(f(t)),
            _ => Err(DriverError::UnknownTask(task)),
        }
    }
}

/// Parse `read` output (one scan per CSV line) into `out` using `layout`.
pub fn parse_scans(
    text: &str,
    channel_count: usize,
    samples_per_channel: usize,
    layout: SampleLayout,
    out: &mut [f64],
) -> Result<usize, DriverError> {
    let required = channel_count * samples_per_channel;
    if out.len() < required {
        return Err(DriverError::DestinationTooSmall {
            required,
            actual: out.len(),
        });
    }

    let df = CsvReadOptions::default()
        .with_has_header(false)
        .into_reader_with_file_handle(Cursor::new(text.as_bytes()))
        .finish()?;

    if df.width() != channel_count {
        return Err(DriverError::Rejected(format!(
            "Device sent {} channels, task has {channel_count}",
            df.width()
        )));
    }
    if df.height() < samples_per_channel {
        return Err(DriverError::ShortRead {
            expected: samples_per_channel,
            actual: df.height(),
        });
    }
    if df.height() > samples_per_channel {
        return Err(DriverError::Rejected(format!(
            "Device sent {} scans, {samples_per_channel} were requested",
            df.height()
        )));
    }

    for (channel, column) in df.get_columns().iter().enumerate() {
        let column = column.cast(&DataType::Float64)?;
        let values = column.f64()?;
        if values.null_count() > 0 {
            return Err(DriverError::Rejected(format!(
                "Device sent {} unreadable samples on channel {channel}",
                values.null_count()
            )));
        }
        for (k, value) in values.into_no_null_iter().enumerate() {
            out[layout.index(channel, k, channel_count, samples_per_channel)] = value;
        }
    }

    Ok(samples_per_channel)
}

impl DaqDriver for SerialDaqDriver {
    fn create_task(&self) -> Result<TaskHandle, DriverError> {
        if self.lock().task.is_some() {
            let detail = self.record("Device supports a single task at a time".to_string());
            return Err(DriverError::Rejected(detail));
        }

        self.command("task create", self.command_timeout)?;

        let mut state = self.lock();
        state.next_handle += 1;
        let handle = TaskHandle::new(state.next_handle);
        state.task = Some(SerialTask {
            handle,
            channel_count: 0,
            sample_rate: 0.0,
            slot: None,
            pump: None,
            running: false,
        });
        Ok(handle)
    }

    fn configure_voltage_channels(
        &self,
        task: TaskHandle,
        channels: &ChannelSpec,
        min_voltage: f64,
        max_voltage: f64,
    ) -> Result<(), DriverError> {
        self.check_task(task)?;
        self.command(
            &format!(
                "ai {} {} {}",
                channels.physical_channels().join(","),
                min_voltage,
                max_voltage
            ),
            self.command_timeout,
        )?;
        self.with_task(task, |t| t.channel_count = channels.channel_count())
    }

    fn configure_sample_clock(
        &self,
        task: TaskHandle,
        rate_hz: f64,
        mode: SampleMode,
        block_size: usize,
    ) -> Result<(), DriverError> {
        self.check_task(task)?;
        self.command(
            &format!("clock {} {} {}", rate_hz, mode.as_str(), block_size),
            self.command_timeout,
        )?;
        self.with_task(task, |t| t.sample_rate = rate_hz)
    }

    fn register_block_callback(
        &self,
        task: TaskHandle,
        samples_per_callback: usize,
        callback: BlockCallback,
    ) -> Result<(), DriverError> {
        let slot = Arc::new(CallbackSlot::new(samples_per_callback, callback));
        self.with_task(task, |t| t.slot = Some(slot))
    }

    fn start_task(&self, task: TaskHandle) -> Result<(), DriverError> {
        let (slot, rate) = self.with_task(task, |t| (t.slot.clone(), t.sample_rate))?;
        if rate <= 0.0 {
            let detail = self.record("Sample clock is not configured".to_string());
            return Err(DriverError::Rejected(detail));
        }
        let period = match &slot {
            Some(slot) => {
                let samples = slot.samples_per_callback();
                let Some(period) = callback_pump::callback_period(samples, rate) else {
                    let detail = self.record(format!(
                        "Callback every {samples} samples at {rate} Hz has no representable period"
                    ));
                    return Err(DriverError::Rejected(detail));
                };
                Some(period)
            }
            None => None,
        };

        self.command("start", self.command_timeout)?;

        let pump = match slot.zip(period) {
            Some((slot, period)) => Some(CallbackPump::spawn(task, period, slot)?),
            None => None,
        };
        self.with_task(task, |t| {
            t.pump = pump;
            t.running = true;
        })
    }

    fn read_block(
        &self,
        task: TaskHandle,
        samples_per_channel: usize,
        timeout: Duration,
        layout: SampleLayout,
        out: &mut [f64],
    ) -> Result<usize, DriverError> {
        let (channel_count, running) = self.with_task(task, |t| (t.channel_count, t.running))?;
        if !running {
            self.record(format!("Task {task} is not running"));
            return Err(DriverError::NotRunning(task));
        }

        let reply = self.command(&format!("read {samples_per_channel}"), timeout)?;
        parse_scans(&reply, channel_count, samples_per_channel, layout, out).inspect_err(|e| {
            self.record(e.to_string());
        })
    }

    fn stop_task(&self, task: TaskHandle) {
        let Ok((pump, was_running)) = self.with_task(task, |t| {
            let was_running = t.running;
            t.running = false;
            (t.pump.take(), was_running)
        }) else {
            return;
        };

        if let Some(mut pump) = pump {
            pump.stop();
        }
        if was_running {
            if let Err(e) = self.command("stop", self.command_timeout) {
                log::error!("Failed to stop {}: {}", task, e);
            }
        }
    }

    fn clear_task(&self, task: TaskHandle) {
        self.stop_task(task);

        let removed = {
            let mut state = self.lock();
            match state.task.take() {
                Some(t) if t.handle == task => Some(t),
                other => {
                    state.task = other;
                    None
                }
            }
        };

        if removed.is_some() {
            if let Err(e) = self.command("task clear", self.command_timeout) {
                log::error!("Failed to clear {}: {}", task, e);
            }
        }
    }

    fn last_error_detail(&self) -> String {
        self.lock().last_error.clone()
    }
}
