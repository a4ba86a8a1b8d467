use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::daq_driver::{BlockCallback, TaskHandle};

/// Time between two callbacks of `samples` samples at `sample_rate` Hz.
/// `None` when the period does not fit a [`Duration`].
pub fn callback_period(samples: usize, sample_rate: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(samples as f64 / sample_rate).ok()
}

/// A registered callback. Invocations are serialized by the inner mutex.
pub struct CallbackSlot {
    samples_per_callback: usize,
    callback: Mutex<BlockCallback>,
}

impl CallbackSlot {
    pub fn new(samples_per_callback: usize, callback: BlockCallback) -> Self {
        Self {
            samples_per_callback,
            callback: Mutex::new(callback),
        }
    }

    pub fn samples_per_callback(&self) -> usize {
        self.samples_per_callback
    }

    /// Invoke the callback once. The caller must not hold locks the callback
    /// may need through the driver.
    pub fn fire(&self, task: TaskHandle) -> ControlFlow<()> {
        let mut guard = self.callback.lock().unwrap_or_else(PoisonError::into_inner);
        let callback = &mut *guard;
        callback(task, self.samples_per_callback)
    }
}

/// Background thread firing a [`CallbackSlot`] at a fixed period.
pub struct CallbackPump {
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl CallbackPump {
    pub fn spawn(
        task: TaskHandle,
        period: Duration,
        slot: Arc<CallbackSlot>,
    ) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let worker = thread::Builder::new()
            .name(format!("daq-{task}"))
            .spawn(move || {
                log::debug!("Callback pump for {} started, period {:?}", task, period);
                let mut next = Instant::now() + period;
                while flag.load(Ordering::Acquire) {
                    let now = Instant::now();
                    if now < next {
                        thread::park_timeout(next - now);
                        continue;
                    }
                    next += period;

                    if slot.fire(task).is_break() {
                        flag.store(false, Ordering::Release);
                    }
                }
                log::debug!("Callback pump for {} stopped", task);
            })?;

        Ok(Self {
            running,
            worker: Some(worker),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the pump and wait for an in-flight callback to return. From the
    /// pump's own thread this only flags the stop.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() == thread::current().id() {
                return;
            }
            worker.thread().unpark();
            if worker.join().is_err() {
                log::error!("Callback pump thread panicked");
            }
        }
    }
}

impl Drop for CallbackPump {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_callback_period() {
        assert_eq!(callback_period(200, 250.0), Some(Duration::from_millis(800)));
        assert_eq!(callback_period(200, 1e-18), None);
        assert_eq!(callback_period(200, 0.0), None);
    }

    #[test]
    fn test_slot_passes_samples() {
        let seen = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&seen);
        let slot = CallbackSlot::new(
            250,
            Box::new(move |_, samples| {
                sink.store(samples, Ordering::SeqCst);
                ControlFlow::Continue(())
            }),
        );
        assert!(slot.fire(TaskHandle::new(1)).is_continue());
        assert_eq!(seen.load(Ordering::SeqCst), 250);
    }

    #[test]
    fn test_pump_stops_on_break() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let slot = Arc::new(CallbackSlot::new(
            1,
            Box::new(move |_, _| {
                if counter.fetch_add(1, Ordering::SeqCst) + 1 >= 3 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            }),
        ));

        let mut pump =
            CallbackPump::spawn(TaskHandle::new(9), Duration::from_millis(2), slot).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while pump.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        pump.stop();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
