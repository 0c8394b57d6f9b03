#![allow(unsafe_code)]
//! Real-time priority and CPU affinity for stage threads.
//!
//! Applied to a thread from the outside right after it is spawned. On Linux this sets
//! `SCHED_FIFO` with the configured priority and pins the thread to a CPU list.
//! Lacking `CAP_SYS_NICE` is common outside production hosts, so callers log the
//! error and keep going.

use std::thread::JoinHandle;
use thiserror::Error;

/// Highest `SCHED_FIFO` priority.
pub const MAX_PRIORITY: u8 = 99;

/// CPU ids must fit in a `cpu_set_t`.
#[cfg(target_os = "linux")]
pub const MAX_CPUS: usize = libc::CPU_SETSIZE as usize;
/// CPU ids must fit in a `cpu_set_t`.
#[cfg(not(target_os = "linux"))]
pub const MAX_CPUS: usize = 1024;

/// Scheduling failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// CPU list did not parse
    #[error("Invalid CPU list '{0}'")]
    InvalidCpuList(String),
    /// Priority outside 0..=99
    #[error("Invalid real-time priority {0} (expected 0-99)")]
    InvalidPriority(u8),
    /// The OS refused the request
    #[error("{op} failed with errno {errno}")]
    Os {
        /// Call that failed
        op: &'static str,
        /// Error number
        errno: i32,
    },
}

/// Parse a Linux cpulist such as `"0-3,8,10-11"`. Empty input means no pinning.
///
/// Ids at or above [`MAX_CPUS`] are rejected.
pub fn parse_cpu_list(list: &str) -> Result<Vec<usize>, SchedError> {
    let invalid = || SchedError::InvalidCpuList(list.to_string());
    let cpu = |s: &str| -> Result<usize, SchedError> {
        match s.trim().parse::<usize>() {
            Ok(id) if id < MAX_CPUS => Ok(id),
            _ => Err(invalid()),
        }
    };
    let mut cpus = Vec::new();
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if let Some((lo, hi)) = part.split_once('-') {
            let (lo, hi) = (cpu(lo)?, cpu(hi)?);
            if lo > hi {
                return Err(invalid());
            }
            cpus.extend(lo..=hi);
        } else {
            cpus.push(cpu(part)?);
        }
    }
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

/// Priority and affinity for one stage thread.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedPolicy {
    /// `SCHED_FIFO` priority, 0 keeps the default policy
    pub priority: u8,
    /// CPUs to pin to, empty keeps the inherited mask
    pub cpus: Vec<usize>,
}

impl SchedPolicy {
    /// Build from a priority and a cpulist string.
    pub fn new(priority: u8, cpus: &str) -> Result<Self, SchedError> {
        if priority > MAX_PRIORITY {
            return Err(SchedError::InvalidPriority(priority));
        }
        Ok(Self {
            priority,
            cpus: parse_cpu_list(cpus)?,
        })
    }

    /// True when applying this policy changes nothing.
    pub fn is_default(&self) -> bool {
        self.priority == 0 && self.cpus.is_empty()
    }

    /// Apply to a running thread.
    #[cfg(target_os = "linux")]
    pub fn apply<T>(&self, handle: &JoinHandle<T>) -> Result<(), SchedError> {
        use std::os::unix::thread::JoinHandleExt;

        let thread = handle.as_pthread_t();

        if self.priority > 0 {
            // SAFETY: sched_param is plain data; zeroed is a valid starting value.
            let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
            param.sched_priority = i32::from(self.priority);
            // SAFETY: thread is a live pthread owned by handle; param outlives the call.
            let rc = unsafe { libc::pthread_setschedparam(thread, libc::SCHED_FIFO, &param) };
            if rc != 0 {
                return Err(SchedError::Os {
                    op: "pthread_setschedparam",
                    errno: rc,
                });
            }
        }

        if !self.cpus.is_empty() {
            // SAFETY: cpu_set_t is plain data; CPU_ZERO/CPU_SET only touch the set.
            let rc = unsafe {
                let mut set: libc::cpu_set_t = std::mem::zeroed();
                libc::CPU_ZERO(&mut set);
                for &cpu in self.cpus.iter().filter(|&&cpu| cpu < MAX_CPUS) {
                    libc::CPU_SET(cpu, &mut set);
                }
                libc::pthread_setaffinity_np(thread, std::mem::size_of::<libc::cpu_set_t>(), &set)
            };
            if rc != 0 {
                return Err(SchedError::Os {
                    op: "pthread_setaffinity_np",
                    errno: rc,
                });
            }
        }
        Ok(())
    }

    /// Scheduling attributes are only supported on Linux.
    #[cfg(not(target_os = "linux"))]
    pub fn apply<T>(&self, _handle: &JoinHandle<T>) -> Result<(), SchedError> {
        Ok(())
    }
}
