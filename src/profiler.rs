use std::iter;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::arch::{CpuState, Word};
use crate::config::ProfilerConfig;
use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::memory::{AreaId, SharedArea};
use crate::message::ProfilerUpdate;
use crate::thread::Thread;

/// Per-thread sampling state. The sample buffer is a debugger area mapped
/// into the kernel and kept locked until profiling stops.
#[derive(Debug)]
pub struct ProfileInfo {
    interval: Duration,
    interval_left: Duration,
    samples: Arc<SharedArea>,
    max_samples: usize,
    flush_threshold: usize,
    sample_count: usize,
    dropped_ticks: u32,
    stack_depth: u32,
    variable_stack_depth: bool,
    image_event: u32,
    buffer_full: bool,
    flush_pending: bool,
}

impl ProfileInfo {
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    pub fn dropped_ticks(&self) -> u32 {
        self.dropped_ticks
    }

    pub fn flush_pending(&self) -> bool {
        self.flush_pending
    }

    fn update(&self, stopped: bool) -> ProfilerUpdate {
        ProfilerUpdate {
            image_event: self.image_event,
            stack_depth: self.stack_depth,
            variable_stack_depth: self.variable_stack_depth,
            sample_count: self.sample_count,
            dropped_ticks: self.dropped_ticks,
            stopped,
        }
    }

    fn sample(&mut self, cpu: &CpuState, image_event: u32) {
        // samples of different image generations must not share a buffer
        if image_event != self.image_event {
            if self.sample_count > 0 {
                self.buffer_full = true;
                self.flush_pending = true;
            } else {
                self.image_event = image_event;
            }
        }

        if self.buffer_full {
            self.dropped_ticks += 1;
            return;
        }

        let depth = self.stack_depth as usize;
        let frames: Vec<Word> = iter::once(cpu.ip)
            .chain(cpu.frames.iter().copied())
            .take(depth)
            .collect();

        let needed = if self.variable_stack_depth {
            frames.len() + 1
        } else {
            depth
        };

        if self.sample_count + needed > self.max_samples {
            self.buffer_full = true;
            self.flush_pending = true;
            self.dropped_ticks += 1;
            return;
        }

        let mut index = self.sample_count;
        let slots = if self.variable_stack_depth {
            self.samples.write_word(index, frames.len() as Word);
            index += 1;
            frames.len()
        } else {
            depth
        };
        for i in 0..slots {
            self.samples.write_word(index + i, frames.get(i).copied().unwrap_or(0));
        }
        self.sample_count += needed;

        if self.sample_count >= self.flush_threshold {
            self.flush_pending = true;
        }
    }

    fn reset(&mut self, image_event: u32) {
        self.sample_count = 0;
        self.dropped_ticks = 0;
        self.buffer_full = false;
        self.flush_pending = false;
        self.image_event = image_event;
    }
}

/// Starts sampling `thread` into the area `sample_area`. Returns the
/// interval actually used.
pub fn start_profiler(
    kernel: &Kernel,
    thread: &Thread,
    interval: Duration,
    sample_area: AreaId,
    stack_depth: u32,
    variable_stack_depth: bool,
) -> Result<Duration> {
    let config: &ProfilerConfig = &kernel.config().profiler;

    let interval = interval.max(config.min_interval());
    let stack_depth = stack_depth.clamp(1, config.max_stack_depth);

    let samples = kernel.clone_area(sample_area)?;
    let max_samples = samples.words();
    let per_sample = stack_depth as usize + variable_stack_depth as usize;
    if max_samples < per_sample {
        return Err(Error::BadValue);
    }

    let image_event = thread.team().debug_info().lock().image_event;

    let mut info = thread.debug_info().lock();
    if info.profile.is_some() {
        return Err(Error::Busy);
    }

    samples.lock_memory();
    info.profile = Some(ProfileInfo {
        interval,
        interval_left: interval,
        samples,
        max_samples,
        flush_threshold: max_samples * config.flush_threshold_percent as usize / 100,
        sample_count: 0,
        dropped_ticks: 0,
        stack_depth,
        variable_stack_depth,
        image_event,
        buffer_full: false,
        flush_pending: false,
    });

    debug!(
        thread = %thread.id(),
        interval_us = interval.as_micros() as u64,
        stack_depth,
        max_samples,
        "profiler started"
    );
    Ok(interval)
}

/// Stops sampling, unlocks the buffer and returns the final counts.
pub fn stop_profiler(thread: &Thread) -> Result<ProfilerUpdate> {
    let profile = thread
        .debug_info()
        .lock()
        .profile
        .take()
        .ok_or(Error::BadValue)?;
    Ok(release(thread, profile))
}

pub(crate) fn release(thread: &Thread, profile: ProfileInfo) -> ProfilerUpdate {
    profile.samples.unlock_memory();
    let update = profile.update(true);
    debug!(
        thread = %thread.id(),
        samples = update.sample_count,
        dropped = update.dropped_ticks,
        "profiler stopped"
    );
    update
}

/// Timer hook: accounts `elapsed` against the sampling interval and takes
/// a sample when it runs out. Returns whether a flush is due.
pub fn profiler_tick(thread: &Thread, elapsed: Duration) -> bool {
    let image_event = thread.team().debug_info().lock().image_event;
    let cpu = thread.cpu_state();

    let mut info = thread.debug_info().lock();
    let profile = match info.profile.as_mut() {
        Some(profile) => profile,
        None => return false,
    };

    if elapsed < profile.interval_left {
        profile.interval_left -= elapsed;
        return profile.flush_pending;
    }

    profile.interval_left = profile.interval;
    profile.sample(&cpu, image_event);
    trace!(thread = %thread.id(), ip = cpu.ip, samples = profile.sample_count, "profiler sample");
    profile.flush_pending
}

pub(crate) fn pending_update(thread: &Thread) -> Option<ProfilerUpdate> {
    let info = thread.debug_info().lock();
    info.profile
        .as_ref()
        .filter(|p| p.flush_pending)
        .map(|p| p.update(false))
}

pub(crate) fn flushed(thread: &Thread) {
    let image_event = thread.team().debug_info().lock().image_event;
    if let Some(profile) = thread.debug_info().lock().profile.as_mut() {
        profile.reset(image_event);
    }
}
