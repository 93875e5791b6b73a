//! Job table for background and suspended pipelines.
//!
//! Jobs are numbered POSIX style: the lowest free number, reused once a job
//! is gone. The table also keeps a most-recently-manipulated ordering, which
//! is what gives `[1]+` / `[2]-` markers and the default target for `fg`.
//! A detached pipeline can be parked here and taken back out when it is
//! brought to the foreground.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::debug;

use oxsh_types::{JobId, JobInfo, JobStatus};

use crate::pipeline::CommandPipeline;

struct JobEntry {
    info: JobInfo,
    /// Handle for a detached pipeline, taken on foreground resume.
    pipeline: Option<CommandPipeline>,
}

impl JobEntry {
    /// A job is dead once its pipeline's last stage has ended, or, with no
    /// parked pipeline, once none of its pids exist.
    fn is_dead(&mut self) -> bool {
        match &mut self.pipeline {
            Some(pipeline) => pipeline.poll().is_some(),
            None => self
                .info
                .pids
                .iter()
                .flatten()
                .all(|&pid| nix::sys::signal::kill(Pid::from_raw(pid as i32), None).is_err()),
        }
    }

    fn signal(&self, signal: Signal) -> crate::error::ProcsResult<()> {
        match self.info.pgid {
            Some(pgid) => {
                nix::sys::signal::killpg(Pid::from_raw(pgid), signal)?;
            }
            None => {
                for pid in self.info.pids.iter().flatten() {
                    let _ = nix::sys::signal::kill(Pid::from_raw(*pid as i32), signal);
                }
            }
        }
        Ok(())
    }
}

struct TableState {
    jobs: HashMap<u64, JobEntry>,
    /// Job numbers, most recently manipulated first.
    order: VecDeque<u64>,
}

impl TableState {
    fn clear_dead(&mut self) {
        let jobs = &mut self.jobs;
        self.order.retain(|num| match jobs.get_mut(num) {
            Some(entry) => {
                if entry.is_dead() {
                    jobs.remove(num);
                    false
                } else {
                    true
                }
            }
            None => false,
        });
    }

    fn front(&mut self, num: u64) {
        self.order.retain(|&n| n != num);
        self.order.push_front(num);
    }

    fn position(&self, num: u64) -> &'static str {
        if self.order.front() == Some(&num) {
            "+"
        } else if self.order.get(1) == Some(&num) {
            "-"
        } else {
            " "
        }
    }
}

/// Session-wide registry of running, stopped, and background pipelines.
pub struct JobTable {
    inner: Mutex<TableState>,
}

impl JobTable {
    pub fn new() -> Self {
        JobTable {
            inner: Mutex::new(TableState {
                jobs: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a launched pipeline, assigning the lowest free job number.
    /// `pipeline` parks a detached handle for a later [`take_pipeline`].
    ///
    /// [`take_pipeline`]: JobTable::take_pipeline
    pub fn add_job(
        &self,
        command: String,
        pids: Vec<Option<u32>>,
        pgid: Option<i32>,
        background: bool,
        pipeline: Option<CommandPipeline>,
    ) -> JobId {
        let mut state = self.lock();
        state.clear_dead();
        let mut num = 1;
        while state.jobs.contains_key(&num) {
            num += 1;
        }
        let info = JobInfo {
            id: JobId(num),
            command,
            status: JobStatus::Running,
            pids,
            pgid,
            background,
            started: SystemTime::now(),
        };
        debug!(job = num, command = %info.command, background, "job added");
        state.jobs.insert(num, JobEntry { info, pipeline });
        state.order.push_front(num);
        JobId(num)
    }

    pub fn get(&self, id: JobId) -> Option<JobInfo> {
        self.lock().jobs.get(&id.0).map(|entry| entry.info.clone())
    }

    /// Jobs in most-recently-manipulated order.
    pub fn list(&self) -> Vec<JobInfo> {
        let mut state = self.lock();
        state.clear_dead();
        state
            .order
            .iter()
            .filter_map(|num| state.jobs.get(num).map(|entry| entry.info.clone()))
            .collect()
    }

    pub fn update_status(&self, id: JobId, status: JobStatus) {
        if let Some(entry) = self.lock().jobs.get_mut(&id.0) {
            entry.info.status = status;
        }
    }

    /// The job `fg` targets by default: the most recently manipulated
    /// non-background job that is still running. Moves it to the front.
    pub fn foreground_job(&self) -> Option<JobId> {
        let mut state = self.lock();
        state.clear_dead();
        let num = state.order.iter().copied().find(|num| {
            state.jobs.get(num).is_some_and(|entry| {
                !entry.info.background && entry.info.status == JobStatus::Running
            })
        })?;
        state.front(num);
        Some(JobId(num))
    }

    /// Take a parked pipeline out for a foreground resume: the job moves to
    /// the front, drops its background mark, and reads as running.
    pub fn take_pipeline(&self, id: JobId) -> Option<CommandPipeline> {
        let mut state = self.lock();
        let entry = state.jobs.get_mut(&id.0)?;
        let pipeline = entry.pipeline.take();
        entry.info.background = false;
        entry.info.status = JobStatus::Running;
        state.front(id.0);
        pipeline
    }

    /// Park a detached pipeline's handle on an existing job.
    pub fn park_pipeline(&self, id: JobId, pipeline: CommandPipeline) {
        if let Some(entry) = self.lock().jobs.get_mut(&id.0) {
            entry.pipeline = Some(pipeline);
        }
    }

    /// Continue a stopped job and mark it running.
    pub fn continue_job(&self, id: JobId) -> crate::error::ProcsResult<()> {
        let mut state = self.lock();
        let Some(entry) = state.jobs.get_mut(&id.0) else {
            return Ok(());
        };
        entry.signal(Signal::SIGCONT)?;
        entry.info.status = JobStatus::Running;
        Ok(())
    }

    /// Deliver a signal to the job's process group, or to each pid when the
    /// job never owned a group.
    pub fn signal_job(&self, id: JobId, signal: Signal) -> crate::error::ProcsResult<()> {
        match self.lock().jobs.get(&id.0) {
            Some(entry) => entry.signal(signal),
            None => Ok(()),
        }
    }

    /// Hang up every remaining job. Called when the shell exits.
    pub fn hup_all(&self) {
        let mut state = self.lock();
        state.clear_dead();
        for entry in state.jobs.values() {
            let _ = entry.signal(Signal::SIGHUP);
        }
    }

    /// Drop finished jobs; the number of live ones left.
    pub fn clean(&self) -> usize {
        let mut state = self.lock();
        state.clear_dead();
        state.jobs.len()
    }

    /// One `jobs`-style line: `[1]+ running: sleep 10 & (4711)`.
    pub fn format_job_line(&self, id: JobId) -> Option<String> {
        let state = self.lock();
        let entry = state.jobs.get(&id.0)?;
        let info = &entry.info;
        let pos = state.position(id.0);
        let bg = if info.background { " &" } else { "" };
        let pids: Vec<String> = info.pids.iter().flatten().map(u32::to_string).collect();
        let pid = if pids.is_empty() {
            String::new()
        } else {
            format!(" ({})", pids.join(","))
        };
        Some(format!(
            "[{}]{} {}: {}{}{}",
            id.0, pos, info.status, info.command, bg, pid
        ))
    }

    /// Print the job's line to stdout, the way an interactive shell
    /// announces `&` launches.
    pub fn announce_job(&self, id: JobId) {
        if let Some(line) = self.format_job_line(id) {
            println!("{line}");
        }
    }
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for JobTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("JobTable")
            .field("jobs", &state.jobs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{cmds_to_specs, PipelineItem};
    use crate::session::SessionContext;
    use oxsh_types::CaptureKind;

    fn live_pids() -> Vec<Option<u32>> {
        vec![Some(std::process::id())]
    }

    #[test]
    fn numbers_reuse_the_lowest_free_slot() {
        let table = JobTable::new();
        let a = table.add_job("first".into(), live_pids(), None, false, None);
        // no pids and no pipeline reads as dead on the next sweep
        let b = table.add_job("second".into(), Vec::new(), None, false, None);
        assert_eq!(a, JobId(1));
        assert_eq!(b, JobId(2));

        let c = table.add_job("third".into(), live_pids(), None, false, None);
        assert_eq!(c, JobId(2));
        assert!(table.get(JobId(1)).is_some());
    }

    #[test]
    fn job_lines_carry_position_markers() {
        let table = JobTable::new();
        let pid = std::process::id();
        let a = table.add_job("sleep 100".into(), live_pids(), None, true, None);
        let b = table.add_job("cat file".into(), live_pids(), None, false, None);

        assert_eq!(
            table.format_job_line(b).unwrap(),
            format!("[2]+ running: cat file ({pid})")
        );
        assert_eq!(
            table.format_job_line(a).unwrap(),
            format!("[1]- running: sleep 100 & ({pid})")
        );
    }

    #[test]
    fn foreground_job_skips_background_entries() {
        let table = JobTable::new();
        let fg = table.add_job("vi notes".into(), live_pids(), None, false, None);
        let bg = table.add_job("make -j".into(), live_pids(), None, true, None);

        assert_eq!(table.foreground_job(), Some(fg));
        // the pick moved it to the front
        assert_eq!(table.list()[0].id, fg);
        assert_eq!(table.get(bg).unwrap().status, JobStatus::Running);
    }

    #[test]
    fn parked_pipelines_are_taken_once() {
        let ctx = SessionContext::new();
        let specs = cmds_to_specs(
            vec![PipelineItem::command(["echo", "bg"])],
            CaptureKind::HiddenObject,
            &ctx,
        )
        .unwrap();
        let pipeline = CommandPipeline::new(specs, &ctx);
        let pids = pipeline.pids();

        let table = JobTable::new();
        let id = table.add_job("echo bg".into(), pids, None, true, Some(pipeline));
        let mut taken = table.take_pipeline(id).unwrap();
        assert!(table.take_pipeline(id).is_none());
        assert!(!table.get(id).unwrap().background);
        assert_eq!(taken.returncode(), 0);
    }

    #[test]
    fn hup_terminates_remaining_children() {
        use std::os::unix::process::ExitStatusExt;

        let mut child = std::process::Command::new("sleep")
            .arg("5")
            .spawn()
            .unwrap();
        let table = JobTable::new();
        table.add_job("sleep 5".into(), vec![Some(child.id())], None, true, None);

        table.hup_all();
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGHUP));
    }

    #[test]
    fn continue_marks_a_stopped_job_running() {
        let table = JobTable::new();
        let id = table.add_job("nap".into(), live_pids(), None, false, None);
        table.update_status(id, JobStatus::Stopped);
        assert_eq!(table.get(id).unwrap().status, JobStatus::Stopped);

        table.continue_job(id).unwrap();
        assert_eq!(table.get(id).unwrap().status, JobStatus::Running);
    }
}
