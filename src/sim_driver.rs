//! In-process acquisition device.
//!
//! Blocks come either from a queue filled by the caller or from a synthetic
//! signal. Callbacks are delivered on demand ([`SimulatedDriver::deliver_block`])
//! or, for a paced driver, from a background pump at the configured rate.
//! One-shot faults can be injected at every driver step.

use std::collections::{BTreeMap, VecDeque};
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::callback_pump::{self, CallbackPump, CallbackSlot};
use crate::config::ChannelSpec;
use crate::daq_driver::{
    BlockCallback, DaqDriver, DriverError, SampleLayout, SampleMode, TaskHandle,
};

/// Voltage as a function of `(channel, sample_index)`.
pub type SignalFn = Box<dyn Fn(usize, u64) -> f64 + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    CreateTask,
    ConfigureChannels,
    ConfigureClock,
    RegisterCallback,
    StartTask,
    ReadBlock,
}

struct SimTask {
    channel_count: usize,
    sample_rate: f64,
    clock_configured: bool,
    slot: Option<Arc<CallbackSlot>>,
    pump: Option<CallbackPump>,
    running: bool,
    queued: VecDeque<Vec<Vec<f64>>>,
    samples_read: u64,
}

#[derive(Default)]
struct SimState {
    next_handle: u64,
    tasks: BTreeMap<TaskHandle, SimTask>,
    faults: Vec<Fault>,
    last_error: String,
    tasks_created: usize,
}

impl SimState {
    fn take_fault(&mut self, fault: Fault) -> bool {
        match self.faults.iter().position(|f| *f == fault) {
            Some(index) => {
                self.faults.remove(index);
                true
            }
            None => false,
        }
    }

    fn reject(&mut self, detail: impl Into<String>) -> DriverError {
        let detail = detail.into();
        self.last_error.clone_from(&detail);
        DriverError::Rejected(detail)
    }

    fn task_mut(&mut self, task: TaskHandle) -> Result<&mut SimTask, DriverError> {
        if !self.tasks.contains_key(&task) {
            self.last_error = format!("Task {task} does not exist");
            return Err(DriverError::UnknownTask(task));
        }
        self.tasks
            .get_mut(&task)
            .ok_or(DriverError::UnknownTask(task))
    }

    fn active_task(&self) -> Option<TaskHandle> {
        self.tasks.keys().next_back().copied()
    }
}

pub struct SimulatedDriver {
    state: Mutex<SimState>,
    signal: SignalFn,
    paced: bool,
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDriver {
    /// Device range of the simulated analog input module.
    pub const MAX_ABS_VOLTAGE: f64 = 10.0;
    pub const MAX_SAMPLE_RATE: f64 = 250_000.0;

    /// Driver whose callbacks only fire through [`Self::deliver_block`].
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            signal: Box::new(|_, _| 0.0),
            paced: false,
        }
    }

    /// Driver that fires callbacks from a background thread at the
    /// configured sample rate, synthesising samples from `signal`.
    pub fn paced(signal: SignalFn) -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            signal,
            paced: true,
        }
    }

    /// Replace the synthetic signal used when no block is queued.
    pub fn with_signal(mut self, signal: SignalFn) -> Self {
        self.signal = signal;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next call of the given step fail.
    pub fn inject_fault(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    /// Queue one block (one `Vec` of samples per channel) on the most
    /// recently created task.
    pub fn queue_block(&self, channels: Vec<Vec<f64>>) -> Result<(), DriverError> {
        let mut state = self.lock();
        let task = state
            .active_task()
            .ok_or_else(|| DriverError::Rejected("No task to queue samples on".to_string()))?;
        state.task_mut(task)?.queued.push_back(channels);
        Ok(())
    }

    /// Fire the registered callback of the most recently created running
    /// task on the calling thread. `None` if nothing is registered.
    pub fn deliver_block(&self) -> Option<ControlFlow<()>> {
        let (task, slot) = {
            let state = self.lock();
            let task = state.active_task()?;
            let sim = state.tasks.get(&task)?;
            if !sim.running {
                return None;
            }
            (task, Arc::clone(sim.slot.as_ref()?))
        };

        let flow = slot.fire(task);
        if flow.is_break() {
            if let Some(sim) = self.lock().tasks.get_mut(&task) {
                sim.running = false;
            }
        }
        Some(flow)
    }

    /// Tasks created and not yet cleared.
    pub fn live_tasks(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn tasks_created(&self) -> usize {
        self.lock().tasks_created
    }

    pub fn is_running(&self, task: TaskHandle) -> bool {
        self.lock().tasks.get(&task).is_some_and(|sim| sim.running)
    }
}

impl DaqDriver for SimulatedDriver {
    fn create_task(&self) -> Result<TaskHandle, DriverError> {
        let mut state = self.lock();
        if state.take_fault(Fault::CreateTask) {
            return Err(state.reject("Simulated device is not responding"));
        }

        state.next_handle += 1;
        let task = TaskHandle::new(state.next_handle);
        state.tasks.insert(
            task,
            SimTask {
                channel_count: 0,
                sample_rate: 0.0,
                clock_configured: false,
                slot: None,
                pump: None,
                running: false,
                queued: VecDeque::new(),
                samples_read: 0,
            },
        );
        state.tasks_created += 1;
        log::debug!("Simulated driver created {}", task);
        Ok(task)
    }

    fn configure_voltage_channels(
        &self,
        task: TaskHandle,
        channels: &ChannelSpec,
        min_voltage: f64,
        max_voltage: f64,
    ) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.task_mut(task)?;
        if state.take_fault(Fault::ConfigureChannels) {
            return Err(state.reject(format!("Physical channel {channels} does not exist")));
        }
        if min_voltage < -Self::MAX_ABS_VOLTAGE || max_voltage > Self::MAX_ABS_VOLTAGE {
            return Err(state.reject(format!(
                "Requested range [{min_voltage}, {max_voltage}] V exceeds the device range of \u{b1}{} V",
                Self::MAX_ABS_VOLTAGE
            )));
        }

        state.task_mut(task)?.channel_count = channels.channel_count();
        Ok(())
    }

    fn configure_sample_clock(
        &self,
        task: TaskHandle,
        rate_hz: f64,
        mode: SampleMode,
        block_size: usize,
    ) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.task_mut(task)?;
        if state.take_fault(Fault::ConfigureClock) {
            return Err(state.reject("Sample clock rate is not supported"));
        }
        if !(rate_hz > 0.0 && rate_hz <= Self::MAX_SAMPLE_RATE) || block_size == 0 {
            return Err(state.reject(format!(
                "Invalid timing: {rate_hz} Hz, {} with {block_size} samples",
                mode.as_str()
            )));
        }

        let sim = state.task_mut(task)?;
        sim.sample_rate = rate_hz;
        sim.clock_configured = true;
        Ok(())
    }

    fn register_block_callback(
        &self,
        task: TaskHandle,
        samples_per_callback: usize,
        callback: BlockCallback,
    ) -> Result<(), DriverError> {
        let mut state = self.lock();
        if state.task_mut(task)?.running {
            return Err(state.reject("Cannot register a callback on a running task"));
        }
        if state.take_fault(Fault::RegisterCallback) {
            return Err(state.reject("Every N samples event is not supported"));
        }

        state.task_mut(task)?.slot = Some(Arc::new(CallbackSlot::new(
            samples_per_callback,
            callback,
        )));
        Ok(())
    }

    fn start_task(&self, task: TaskHandle) -> Result<(), DriverError> {
        let mut state = self.lock();
        let sim = state.task_mut(task)?;
        let ready = sim.channel_count > 0 && sim.clock_configured;
        if !ready {
            return Err(state.reject("Task has no channels or sample clock configured"));
        }
        if state.take_fault(Fault::StartTask) {
            return Err(state.reject("Analog input resource is reserved by another task"));
        }

        let sim = state.task_mut(task)?;
        let paced_slot = sim.slot.clone().filter(|_| self.paced);
        let sample_rate = sim.sample_rate;
        if let Some(slot) = paced_slot {
            let period = callback_pump::callback_period(slot.samples_per_callback(), sample_rate);
            let Some(period) = period else {
                return Err(state.reject(format!(
                    "Callback every {} samples at {sample_rate} Hz has no representable period",
                    slot.samples_per_callback()
                )));
            };
            state.task_mut(task)?.pump = Some(CallbackPump::spawn(task, period, slot)?);
        }
        state.task_mut(task)?.running = true;
        log::debug!("Simulated driver started {}", task);
        Ok(())
    }

    fn read_block(
        &self,
        task: TaskHandle,
        samples_per_channel: usize,
        _timeout: Duration,
        layout: SampleLayout,
        out: &mut [f64],
    ) -> Result<usize, DriverError> {
        let mut state = self.lock();
        if state.take_fault(Fault::ReadBlock) {
            return Err(state.reject(
                "Onboard device memory overflow. Samples were lost before they could be read",
            ));
        }
        let (running, channel_count, origin) = {
            let sim = state.task_mut(task)?;
            (sim.running, sim.channel_count, sim.samples_read)
        };
        if !running {
            state.last_error = format!("Task {task} is not running");
            return Err(DriverError::NotRunning(task));
        }

        let required = channel_count * samples_per_channel;
        if out.len() < required {
            return Err(DriverError::DestinationTooSmall {
                required,
                actual: out.len(),
            });
        }

        let queued = state.task_mut(task)?.queued.pop_front();
        match queued {
            Some(block) => {
                if block.len() < channel_count {
                    return Err(state.reject(format!(
                        "Queued block has {} channels, task has {channel_count}",
                        block.len()
                    )));
                }
                for (channel, samples) in block.iter().take(channel_count).enumerate() {
                    if samples.len() < samples_per_channel {
                        return Err(DriverError::ShortRead {
                            expected: samples_per_channel,
                            actual: samples.len(),
                        });
                    }
                    for (k, &value) in samples.iter().take(samples_per_channel).enumerate() {
                        out[layout.index(channel, k, channel_count, samples_per_channel)] = value;
                    }
                }
            }
            None => {
                for channel in 0..channel_count {
                    for k in 0..samples_per_channel {
                        out[layout.index(channel, k, channel_count, samples_per_channel)] =
                            (self.signal)(channel, origin + k as u64);
                    }
                }
            }
        }

        state.task_mut(task)?.samples_read += samples_per_channel as u64;
        Ok(samples_per_channel)
    }

    fn stop_task(&self, task: TaskHandle) {
        let pump = {
            let mut state = self.lock();
            match state.tasks.get_mut(&task) {
                Some(sim) => {
                    sim.running = false;
                    sim.pump.take()
                }
                None => None,
            }
        };
        // Joined outside the lock: an in-flight callback may still read.
        if let Some(mut pump) = pump {
            pump.stop();
        }
    }

    fn clear_task(&self, task: TaskHandle) {
        let removed = self.lock().tasks.remove(&task);
        if let Some(mut sim) = removed {
            if let Some(mut pump) = sim.pump.take() {
                pump.stop();
            }
            log::debug!("Simulated driver cleared {}", task);
        }
    }

    fn last_error_detail(&self) -> String {
        self.lock().last_error.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured(driver: &SimulatedDriver) -> TaskHandle {
        let task = driver.create_task().unwrap();
        let spec = ChannelSpec::parse("Sim1/ai0:1").unwrap();
        driver
            .configure_voltage_channels(task, &spec, -10.0, 10.0)
            .unwrap();
        driver
            .configure_sample_clock(task, 1000.0, SampleMode::Continuous, 4)
            .unwrap();
        task
    }

    #[test]
    fn test_paced_start_rejects_unrepresentable_period() {
        let driver = SimulatedDriver::paced(Box::new(|_, _| 0.0));
        let task = driver.create_task().unwrap();
        let spec = ChannelSpec::parse("Sim1/ai0:1").unwrap();
        driver
            .configure_voltage_channels(task, &spec, -10.0, 10.0)
            .unwrap();
        driver
            .configure_sample_clock(task, 1e-18, SampleMode::Continuous, 200)
            .unwrap();
        driver
            .register_block_callback(task, 200, Box::new(|_, _| ControlFlow::Continue(())))
            .unwrap();

        assert!(matches!(driver.start_task(task), Err(DriverError::Rejected(_))));
        assert!(!driver.is_running(task));
        assert!(driver.last_error_detail().contains("representable period"));
        driver.clear_task(task);
    }

    #[test]
    fn test_read_respects_layout() {
        let driver = SimulatedDriver::new();
        let task = configured(&driver);
        driver.start_task(task).unwrap();

        driver
            .queue_block(vec![vec![1.0, 2.0, 3.0], vec![10.0, 20.0, 30.0]])
            .unwrap();
        let mut out = [0.0; 6];
        let read = driver
            .read_block(task, 3, Duration::from_secs(1), SampleLayout::GroupByChannel, &mut out)
            .unwrap();
        assert_eq!(read, 3);
        assert_eq!(out, [1.0, 2.0, 3.0, 10.0, 20.0, 30.0]);

        driver
            .queue_block(vec![vec![1.0, 2.0, 3.0], vec![10.0, 20.0, 30.0]])
            .unwrap();
        driver
            .read_block(task, 3, Duration::from_secs(1), SampleLayout::GroupByScanNumber, &mut out)
            .unwrap();
        assert_eq!(out, [1.0, 10.0, 2.0, 20.0, 3.0, 30.0]);
    }

    #[test]
    fn test_synthetic_signal() {
        let driver =
            SimulatedDriver::new().with_signal(Box::new(|channel, k| channel as f64 + k as f64));
        let task = configured(&driver);
        driver.start_task(task).unwrap();

        let mut out = [0.0; 4];
        driver
            .read_block(task, 2, Duration::from_secs(1), SampleLayout::GroupByChannel, &mut out)
            .unwrap();
        assert_eq!(out, [0.0, 1.0, 1.0, 2.0]);

        // Sample index continues across blocks
        driver
            .read_block(task, 2, Duration::from_secs(1), SampleLayout::GroupByChannel, &mut out)
            .unwrap();
        assert_eq!(out, [2.0, 3.0, 3.0, 4.0]);
    }

    #[test]
    fn test_faults_are_one_shot_and_reported() {
        let driver = SimulatedDriver::new();
        driver.inject_fault(Fault::CreateTask);
        assert!(driver.create_task().is_err());
        assert_eq!(driver.last_error_detail(), "Simulated device is not responding");
        assert!(driver.create_task().is_ok());
    }

    #[test]
    fn test_rejects_range_beyond_device() {
        let driver = SimulatedDriver::new();
        let task = driver.create_task().unwrap();
        let spec = ChannelSpec::parse("Sim1/ai0").unwrap();
        let err = driver
            .configure_voltage_channels(task, &spec, -20.0, 20.0)
            .unwrap_err();
        assert!(matches!(err, DriverError::Rejected(_)));
        assert!(driver.last_error_detail().contains("exceeds the device range"));
    }

    #[test]
    fn test_read_requires_running_task() {
        let driver = SimulatedDriver::new();
        let task = configured(&driver);
        let mut out = [0.0; 8];
        assert!(matches!(
            driver.read_block(task, 4, Duration::from_secs(1), SampleLayout::GroupByChannel, &mut out),
            Err(DriverError::NotRunning(_))
        ));
    }

    #[test]
    fn test_stop_and_clear_are_idempotent() {
        let driver = SimulatedDriver::new();
        let task = configured(&driver);
        driver.start_task(task).unwrap();

        driver.stop_task(task);
        driver.stop_task(task);
        assert!(!driver.is_running(task));
        driver.clear_task(task);
        driver.clear_task(task);
        driver.stop_task(task);
        assert_eq!(driver.live_tasks(), 0);
    }

    #[test]
    fn test_deliver_block_fires_callback() {
        let driver = SimulatedDriver::new();
        let task = configured(&driver);
        assert_eq!(driver.deliver_block(), None);

        driver
            .register_block_callback(task, 4, Box::new(|_, _| ControlFlow::Break(())))
            .unwrap();
        driver.start_task(task).unwrap();
        assert_eq!(driver.deliver_block(), Some(ControlFlow::Break(())));
        assert!(!driver.is_running(task));
        assert_eq!(driver.deliver_block(), None);
    }
}
