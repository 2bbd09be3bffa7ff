//! Test harness: host threads standing in for cores

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::SmpConfig;
use crate::kern::processor::Smp;
use crate::kern::thread::Thread;
use crate::platform::HostedPlatform;
use crate::types::CpuId;

/// Hosted instance with default tuning
pub(crate) fn new_smp(ncpus: usize) -> Arc<Smp> {
    new_smp_with(SmpConfig::new(ncpus))
}

/// Hosted instance with custom tuning
pub(crate) fn new_smp_with(config: SmpConfig) -> Arc<Smp> {
    let platform = Arc::new(HostedPlatform::new(config.ncpus));
    match Smp::new(config, platform) {
        Ok(smp) => smp,
        Err(e) => panic!("bad test config: {}", e),
    }
}

pub(crate) fn thread(name: &str) -> Arc<Thread> {
    Thread::new(name)
}

/// Poll `cond` until it holds or `timeout` passes
pub(crate) fn spin_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::yield_now();
    }
    cond()
}

/// Host thread polling one core until dropped
pub(crate) struct CpuLoop {
    smp: Arc<Smp>,
    cpu: CpuId,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

pub(crate) fn spawn_cpu_loop(smp: &Arc<Smp>, cpu: CpuId) -> CpuLoop {
    let stop = Arc::new(AtomicBool::new(false));
    let handle = {
        let smp = smp.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            let mut c = smp.enter(cpu, &Thread::new("cpu-loop"));
            c.idle_until(|_| stop.load(Ordering::SeqCst));
        })
    };
    CpuLoop {
        smp: smp.clone(),
        cpu,
        stop,
        handle: Some(handle),
    }
}

impl Drop for CpuLoop {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.smp.notify(self.cpu);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Host thread ticking every core's clock once per millisecond
pub(crate) struct Clock {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

pub(crate) fn spawn_clock(smp: &Arc<Smp>) -> Clock {
    let stop = Arc::new(AtomicBool::new(false));
    let handle = {
        let smp = smp.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
                for cpu in 0..smp.ncpus() {
                    smp.hardclock(CpuId(cpu));
                }
            }
        })
    };
    Clock {
        stop,
        handle: Some(handle),
    }
}

impl Drop for Clock {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
