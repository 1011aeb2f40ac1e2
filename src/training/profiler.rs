//! Step profiler with a wait -> warmup -> active window schedule.
//!
//! Each cycle sits idle for `wait` steps, runs `warmup` steps without
//! recording, then records `active` steps to a JSONL trace file. The cycle
//! repeats `repeat` times; `repeat == 0` repeats until training ends.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::utils::memory::MemoryInfo;

#[derive(Debug, Clone, Copy)]
pub struct ProfilerSchedule {
    pub wait: usize,
    pub warmup: usize,
    pub active: usize,
    pub repeat: usize,
}

impl ProfilerSchedule {
    pub fn cycle_len(&self) -> usize {
        self.wait + self.warmup + self.active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfilerPhase {
    Wait,
    Warmup,
    Active,
    Done,
}

#[derive(Serialize)]
struct TraceRecord {
    step: usize,
    cycle: usize,
    duration_ms: f64,
    loss: f32,
    rss_bytes: u64,
    timestamp: String,
}

pub struct StepProfiler {
    schedule: ProfilerSchedule,
    trace_path: PathBuf,
    step_in_cycle: usize,
    cycles_done: usize,
    step_start: Option<Instant>,
    records_written: usize,
}

impl StepProfiler {
    pub fn new(schedule: ProfilerSchedule, trace_path: &Path) -> Result<Self> {
        anyhow::ensure!(schedule.active > 0, "Profiler schedule needs active > 0");

        if let Some(parent) = trace_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create trace directory: {:?}", parent))?;
        }
        // Truncate any trace left over from a previous run
        fs::write(trace_path, "")
            .with_context(|| format!("Failed to create trace file: {:?}", trace_path))?;

        info!(
            "Profiler enabled: wait={} warmup={} active={} repeat={} -> {:?}",
            schedule.wait, schedule.warmup, schedule.active, schedule.repeat, trace_path
        );

        Ok(Self {
            schedule,
            trace_path: trace_path.to_path_buf(),
            step_in_cycle: 0,
            cycles_done: 0,
            step_start: None,
            records_written: 0,
        })
    }

    pub fn phase(&self) -> ProfilerPhase {
        if self.schedule.repeat > 0 && self.cycles_done >= self.schedule.repeat {
            return ProfilerPhase::Done;
        }
        if self.step_in_cycle < self.schedule.wait {
            ProfilerPhase::Wait
        } else if self.step_in_cycle < self.schedule.wait + self.schedule.warmup {
            ProfilerPhase::Warmup
        } else {
            ProfilerPhase::Active
        }
    }

    pub fn records_written(&self) -> usize {
        self.records_written
    }

    pub fn step_begin(&mut self) {
        if self.phase() == ProfilerPhase::Active {
            self.step_start = Some(Instant::now());
        }
    }

    /// Record the step that `step_begin` opened, then advance the schedule.
    pub fn step_end(&mut self, step: usize, loss: f32) -> Result<()> {
        if let Some(start) = self.step_start.take() {
            let rss_bytes = MemoryInfo::current().map(|m| m.rss_bytes).unwrap_or(0);
            let record = TraceRecord {
                step,
                cycle: self.cycles_done,
                duration_ms: start.elapsed().as_secs_f64() * 1000.0,
                loss,
                rss_bytes,
                timestamp: chrono::Utc::now().to_rfc3339(),
            };

            let mut file = fs::OpenOptions::new()
                .append(true)
                .open(&self.trace_path)
                .with_context(|| format!("Failed to open trace file: {:?}", self.trace_path))?;
            writeln!(file, "{}", serde_json::to_string(&record)?)?;
            self.records_written += 1;
        }

        if self.phase() != ProfilerPhase::Done {
            self.step_in_cycle += 1;
            if self.step_in_cycle >= self.schedule.cycle_len() {
                self.step_in_cycle = 0;
                self.cycles_done += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> ProfilerSchedule {
        ProfilerSchedule {
            wait: 1,
            warmup: 1,
            active: 2,
            repeat: 1,
        }
    }

    #[test]
    fn test_phase_progression() {
        let dir = tempfile::tempdir().unwrap();
        let mut profiler = StepProfiler::new(schedule(), &dir.path().join("trace.jsonl")).unwrap();

        let mut phases = Vec::new();
        for step in 0..6 {
            phases.push(profiler.phase());
            profiler.step_begin();
            profiler.step_end(step, 1.0).unwrap();
        }

        assert_eq!(
            phases,
            vec![
                ProfilerPhase::Wait,
                ProfilerPhase::Warmup,
                ProfilerPhase::Active,
                ProfilerPhase::Active,
                ProfilerPhase::Done,
                ProfilerPhase::Done,
            ]
        );
    }

    #[test]
    fn test_records_only_active_steps() {
        let dir = tempfile::tempdir().unwrap();
        let trace = dir.path().join("trace.jsonl");
        let mut profiler = StepProfiler::new(schedule(), &trace).unwrap();

        for step in 0..10 {
            profiler.step_begin();
            profiler.step_end(step, 0.5).unwrap();
        }

        assert_eq!(profiler.records_written(), 2);
        let contents = std::fs::read_to_string(&trace).unwrap();
        assert_eq!(contents.lines().count(), 2);
        let first: serde_json::Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(first["step"], 2);
        assert!(first["duration_ms"].as_f64().unwrap() >= 0.0);
    }

    #[test]
    fn test_repeat_zero_cycles_forever() {
        let dir = tempfile::tempdir().unwrap();
        let mut sched = schedule();
        sched.repeat = 0;
        let mut profiler =
            StepProfiler::new(sched, &dir.path().join("trace.jsonl")).unwrap();

        for step in 0..12 {
            profiler.step_begin();
            profiler.step_end(step, 0.5).unwrap();
        }

        // 3 full cycles of 4 steps, 2 active each
        assert_eq!(profiler.records_written(), 6);
    }

    #[test]
    fn test_rejects_zero_active() {
        let dir = tempfile::tempdir().unwrap();
        let mut sched = schedule();
        sched.active = 0;
        assert!(StepProfiler::new(sched, &dir.path().join("trace.jsonl")).is_err());
    }
}
