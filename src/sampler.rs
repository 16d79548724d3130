//! Background resource observation during a cell's measuring phase.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use sysinfo::{CpuRefreshKind, Pid, RefreshKind, System};
use tracing::debug;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// One observation of the process under test.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResourceSample {
    /// CPU usage in percent of the whole machine.
    pub cpu_percent: f64,
    /// Resident memory in MB.
    pub memory_mb: f64,
}

/// Source of resource observations.
pub trait ResourceProbe: Send {
    /// Takes one observation, or `None` when the target is gone.
    fn sample(&mut self) -> Option<ResourceSample>;
}

/// Probe shared between the sweep and the sampling thread.
pub type SharedProbe = Arc<Mutex<dyn ResourceProbe>>;

/// Observes a process through `sysinfo`.
pub struct ProcessProbe {
    system: System,
    pid: Pid,
    cores: f64,
}

impl ProcessProbe {
    /// Observes the current process, which hosts the embedded backends.
    pub fn current() -> Option<Self> {
        sysinfo::get_current_pid().ok().map(Self::with_pid)
    }

    /// Observes an arbitrary process.
    pub fn for_pid(pid: u32) -> Self {
        Self::with_pid(Pid::from_u32(pid))
    }

    fn with_pid(pid: Pid) -> Self {
        let mut system =
            System::new_with_specifics(RefreshKind::new().with_cpu(CpuRefreshKind::new()));
        let cores = system.cpus().len().max(1) as f64;
        // cpu_usage is computed between two refreshes; prime the first one
        system.refresh_process(pid);
        Self { system, pid, cores }
    }
}

impl ResourceProbe for ProcessProbe {
    fn sample(&mut self) -> Option<ResourceSample> {
        if !self.system.refresh_process(self.pid) {
            return None;
        }
        let process = self.system.process(self.pid)?;
        Some(ResourceSample {
            cpu_percent: f64::from(process.cpu_usage()) / self.cores,
            memory_mb: process.memory() as f64 / BYTES_PER_MB,
        })
    }
}

/// Probe that never observes anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullProbe;

impl ResourceProbe for NullProbe {
    fn sample(&mut self) -> Option<ResourceSample> {
        None
    }
}

/// Average resource usage over one measuring window.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ResourceAverage {
    /// Mean CPU percent.
    pub cpu_percent: Option<f64>,
    /// Mean resident memory in MB.
    pub memory_mb: Option<f64>,
    /// Background samples that went into the mean.
    pub samples: usize,
}

impl ResourceAverage {
    /// Reduces samples to their mean. An empty window falls back to a single
    /// instantaneous observation, or to nothing.
    pub fn reduce(
        samples: &[ResourceSample],
        instant: impl FnOnce() -> Option<ResourceSample>,
    ) -> Self {
        if samples.is_empty() {
            return match instant() {
                Some(sample) => Self {
                    cpu_percent: Some(sample.cpu_percent),
                    memory_mb: Some(sample.memory_mb),
                    samples: 0,
                },
                None => Self::default(),
            };
        }
        let n = samples.len() as f64;
        Self {
            cpu_percent: Some(samples.iter().map(|s| s.cpu_percent).sum::<f64>() / n),
            memory_mb: Some(samples.iter().map(|s| s.memory_mb).sum::<f64>() / n),
            samples: samples.len(),
        }
    }
}

/// Starts sampling windows at a fixed interval.
#[derive(Clone)]
pub struct ResourceSampler {
    probe: SharedProbe,
    interval: Duration,
}

impl ResourceSampler {
    /// Sampler over `probe` ticking every `interval`.
    pub fn new(probe: SharedProbe, interval: Duration) -> Self {
        Self { probe, interval }
    }

    /// Sampler that reports nothing.
    pub fn disabled() -> Self {
        Self::new(Arc::new(Mutex::new(NullProbe)), Duration::from_millis(250))
    }

    /// Spawns the sampling thread for one measuring phase.
    pub fn start(&self) -> SamplingWindow {
        let (stop, stopped) = mpsc::channel::<()>();
        let probe = Arc::clone(&self.probe);
        let interval = self.interval;
        let worker = thread::spawn(move || {
            let mut samples = Vec::new();
            loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Some(sample) = probe.lock().sample() {
                            samples.push(sample);
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            samples
        });
        SamplingWindow {
            stop,
            worker,
            probe: Arc::clone(&self.probe),
        }
    }
}

/// A running sampling thread.
pub struct SamplingWindow {
    stop: Sender<()>,
    worker: JoinHandle<Vec<ResourceSample>>,
    probe: SharedProbe,
}

impl SamplingWindow {
    /// Stops the thread and reduces what it saw.
    pub fn finish(self) -> ResourceAverage {
        let _ = self.stop.send(());
        let samples = self.worker.join().unwrap_or_default();
        let probe = self.probe;
        let average = ResourceAverage::reduce(&samples, || probe.lock().sample());
        debug!(
            samples = average.samples,
            cpu = ?average.cpu_percent,
            mem_mb = ?average.memory_mb,
            "sampling window closed"
        );
        average
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ramp {
        next: f64,
    }

    impl ResourceProbe for Ramp {
        fn sample(&mut self) -> Option<ResourceSample> {
            self.next += 1.0;
            Some(ResourceSample {
                cpu_percent: self.next,
                memory_mb: 100.0,
            })
        }
    }

    #[test]
    fn reduce_averages_samples() {
        let samples = [
            ResourceSample {
                cpu_percent: 10.0,
                memory_mb: 50.0,
            },
            ResourceSample {
                cpu_percent: 30.0,
                memory_mb: 70.0,
            },
        ];
        let avg = ResourceAverage::reduce(&samples, || None);
        assert_eq!(avg.cpu_percent, Some(20.0));
        assert_eq!(avg.memory_mb, Some(60.0));
        assert_eq!(avg.samples, 2);
    }

    #[test]
    fn empty_window_uses_instant_sample_or_nothing() {
        let instant = ResourceSample {
            cpu_percent: 5.0,
            memory_mb: 12.0,
        };
        let avg = ResourceAverage::reduce(&[], || Some(instant));
        assert_eq!(avg.cpu_percent, Some(5.0));
        assert_eq!(avg.samples, 0);
        assert_eq!(ResourceAverage::reduce(&[], || None), ResourceAverage::default());
    }

    #[test]
    fn background_thread_collects_samples() {
        let sampler = ResourceSampler::new(
            Arc::new(Mutex::new(Ramp { next: 0.0 })),
            Duration::from_millis(5),
        );
        let window = sampler.start();
        thread::sleep(Duration::from_millis(60));
        let avg = window.finish();
        assert!(avg.samples >= 1);
        assert_eq!(avg.memory_mb, Some(100.0));
    }

    #[test]
    fn short_window_never_divides_by_zero() {
        let sampler = ResourceSampler::new(
            Arc::new(Mutex::new(Ramp { next: 0.0 })),
            Duration::from_secs(30),
        );
        let avg = sampler.start().finish();
        assert_eq!(avg.samples, 0);
        assert_eq!(avg.cpu_percent, Some(1.0));
        assert_eq!(ResourceSampler::disabled().start().finish(), ResourceAverage::default());
    }

    #[test]
    fn process_probe_sees_itself() {
        let mut probe = ProcessProbe::current().unwrap();
        let sample = probe.sample().unwrap();
        assert!(sample.memory_mb > 0.0);
        assert!(sample.cpu_percent >= 0.0);
    }
}
