//! The cooperative scheduler runtime: the worker pool that drains the
//! connection queue, fixed-interval timers, and cron/wall-clock schedules.
//!
//! Timers and schedules live in the runtime registries behind the server
//! lockable. A clock coroutine wakes every second, collects due jobs under
//! the lock, and enqueues them onto the same worker pool that serves
//! connections. Timer ticks are not reentrant: a tick that fires while the
//! previous one is still running is skipped.

pub mod cron;
pub mod restart;

use crate::context::{Lockable, ServerContext};
use crate::error::{Error, Result};
use chrono::{DateTime, NaiveTime, Utc};
use may::sync::mpsc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Signals the run loop listens for while the server is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Graceful shutdown-and-reinit.
    Restart,
    /// Graceful shutdown and exit.
    Shutdown,
}

/// A timer or schedule handler.
pub type JobHandler = dyn Fn(&JobEvent) -> anyhow::Result<()> + Send + Sync;

pub fn job<F>(f: F) -> Arc<JobHandler>
where
    F: Fn(&JobEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Timer,
    Schedule,
}

/// What a timer or schedule handler receives on each run.
pub struct JobEvent {
    pub name: String,
    pub kind: JobKind,
    pub fired_at: DateTime<Utc>,
    /// The server-wide lockable, for shared-state access.
    pub runtime: Arc<Lockable>,
}

impl JobEvent {
    pub fn with_state<R>(&self, f: impl FnOnce(&mut crate::state::SharedState) -> R) -> R {
        let mut runtime = self.runtime.lock().unwrap();
        f(&mut runtime.state)
    }
}

/// A fixed-interval job.
pub struct Timer {
    pub name: String,
    pub interval: Duration,
    /// Skip the first N ticks.
    pub skip: u64,
    /// Remove the timer after N executions; 0 means unlimited.
    pub limit: u64,
    ticks: u64,
    count: u64,
    next_run: DateTime<Utc>,
    handler: Arc<JobHandler>,
    running: Arc<AtomicBool>,
}

impl Timer {
    pub fn new<F>(name: impl Into<String>, interval: Duration, handler: F) -> Self
    where
        F: Fn(&JobEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let interval = interval.max(Duration::from_secs(1));
        Self {
            name: name.into(),
            interval,
            skip: 0,
            limit: 0,
            ticks: 0,
            count: 0,
            next_run: Utc::now()
                + chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::seconds(1)),
            handler: Arc::new(handler),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_skip(mut self, skip: u64) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    pub fn executions(&self) -> u64 {
        self.count
    }
}

/// A cron- or wall-clock-triggered job.
pub struct Schedule {
    pub name: String,
    crons: Vec<::cron::Schedule>,
    times: Vec<NaiveTime>,
    /// Remove the schedule after N executions; 0 means unlimited.
    pub limit: u64,
    count: u64,
    /// Optional activation window.
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
    handler: Arc<JobHandler>,
}

impl Schedule {
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&JobEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            crons: Vec::new(),
            times: Vec::new(),
            limit: 0,
            count: 0,
            start: None,
            end: None,
            next_run: None,
            handler: Arc::new(handler),
        }
    }

    /// Add a cron trigger (five-field or `@shortcut`).
    pub fn with_cron(mut self, expr: &str) -> Result<Self> {
        self.crons.push(cron::parse_cron(expr)?);
        self.next_run = None;
        Ok(self)
    }

    /// Add wall-clock triggers (`HH:MM`).
    pub fn with_times(mut self, times: &[&str]) -> Result<Self> {
        for t in times {
            self.times.push(cron::parse_time(t)?);
        }
        self.next_run = None;
        Ok(self)
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    pub fn between(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    pub fn executions(&self) -> u64 {
        self.count
    }

    fn has_triggers(&self) -> bool {
        !self.crons.is_empty() || !self.times.is_empty()
    }

    fn refresh(&mut self, now: DateTime<Utc>) {
        self.next_run = cron::next_trigger(&self.crons, &self.times, now);
    }

    fn in_window(&self, now: DateTime<Utc>) -> bool {
        self.start.map(|s| now >= s).unwrap_or(true) && self.end.map(|e| now <= e).unwrap_or(true)
    }
}

/// A due job lifted out of the registries, ready for a worker.
pub struct ScheduledJob {
    pub name: String,
    pub kind: JobKind,
    pub fired_at: DateTime<Utc>,
    handler: Arc<JobHandler>,
    /// Present for timers: cleared when the run finishes, enforcing
    /// non-reentrancy.
    running: Option<Arc<AtomicBool>>,
}

impl ScheduledJob {
    /// Run the job on a worker. Errors and panics are logged; the next tick
    /// proceeds regardless.
    pub fn run(self, runtime: Arc<Lockable>) {
        let event = JobEvent {
            name: self.name.clone(),
            kind: self.kind,
            fired_at: self.fired_at,
            runtime,
        };
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            (self.handler)(&event)
        }));
        match outcome {
            Ok(Ok(())) => {
                debug!(job = %self.name, kind = ?self.kind, "job completed");
            }
            Ok(Err(err)) => {
                error!(job = %self.name, kind = ?self.kind, error = %err, "job failed");
            }
            Err(panic) => {
                error!(job = %self.name, kind = ?self.kind, panic = ?panic, "job panicked");
            }
        }
        if let Some(flag) = &self.running {
            flag.store(false, Ordering::SeqCst);
        }
    }
}

/// Collect every due timer and schedule job at `now`, updating bookkeeping
/// under the lock. Exposed separately from the clock coroutine so the tick
/// logic is testable without a running pool.
pub fn collect_due_jobs(runtime: &Arc<Lockable>, now: DateTime<Utc>) -> Vec<ScheduledJob> {
    let mut jobs = Vec::new();
    let mut rt = runtime.lock().unwrap();

    let mut exhausted = Vec::new();
    for (name, timer) in rt.timers.iter_mut() {
        if now < timer.next_run {
            continue;
        }
        timer.next_run = now
            + chrono::Duration::from_std(timer.interval).unwrap_or(chrono::Duration::seconds(1));
        timer.ticks += 1;
        if timer.ticks <= timer.skip {
            debug!(timer = %name, tick = timer.ticks, "timer tick skipped (skip count)");
            continue;
        }
        // Previous tick still running: skip this one.
        if timer.running.swap(true, Ordering::SeqCst) {
            warn!(timer = %name, "timer tick skipped (previous tick still running)");
            continue;
        }
        timer.count += 1;
        jobs.push(ScheduledJob {
            name: name.clone(),
            kind: JobKind::Timer,
            fired_at: now,
            handler: timer.handler.clone(),
            running: Some(timer.running.clone()),
        });
        if timer.limit > 0 && timer.count >= timer.limit {
            exhausted.push(name.clone());
        }
    }
    for name in exhausted {
        info!(timer = %name, "timer reached its limit, removing");
        rt.timers.remove(&name);
    }

    let mut exhausted = Vec::new();
    for (name, schedule) in rt.schedules.iter_mut() {
        if !schedule.has_triggers() {
            continue;
        }
        let due = match schedule.next_run {
            None => {
                schedule.refresh(now);
                false
            }
            Some(next) => now >= next,
        };
        if !due {
            continue;
        }
        schedule.refresh(now);
        if !schedule.in_window(now) {
            debug!(schedule = %name, "schedule trigger outside its window");
            continue;
        }
        schedule.count += 1;
        jobs.push(ScheduledJob {
            name: name.clone(),
            kind: JobKind::Schedule,
            fired_at: now,
            handler: schedule.handler.clone(),
            running: None,
        });
        if schedule.limit > 0 && schedule.count >= schedule.limit {
            exhausted.push(name.clone());
        }
    }
    for name in exhausted {
        info!(schedule = %name, "schedule reached its limit, removing");
        rt.schedules.remove(&name);
    }

    jobs
}

/// Enqueue a registered timer or schedule by name, out of band, without
/// disturbing its cadence.
pub fn invoke_now(
    runtime: &Arc<Lockable>,
    queue: &mpsc::Sender<WorkItem>,
    name: &str,
) -> Result<()> {
    let rt = runtime.lock().unwrap();
    let job = if let Some(timer) = rt.timers.get(name) {
        ScheduledJob {
            name: name.to_string(),
            kind: JobKind::Timer,
            fired_at: Utc::now(),
            handler: timer.handler.clone(),
            running: None,
        }
    } else if let Some(schedule) = rt.schedules.get(name) {
        ScheduledJob {
            name: name.to_string(),
            kind: JobKind::Schedule,
            fired_at: Utc::now(),
            handler: schedule.handler.clone(),
            running: None,
        }
    } else {
        return Err(Error::config(format!("no timer or schedule named '{name}'")));
    };
    drop(rt);
    queue
        .send(WorkItem::Job(job))
        .map_err(|_| Error::config("worker pool is not running"))?;
    Ok(())
}

/// Spawn the clock coroutine: wakes every second and feeds due jobs to the
/// worker queue until the stop flag is set.
pub fn spawn_clock(
    runtime: Arc<Lockable>,
    queue: mpsc::Sender<WorkItem>,
    stop: Arc<AtomicBool>,
    stack_size: usize,
) -> std::io::Result<may::coroutine::JoinHandle<()>> {
    unsafe {
        may::coroutine::Builder::new()
            .name("pode-clock".to_string())
            .stack_size(stack_size)
            .spawn(move || {
                debug!("clock coroutine started");
                while !stop.load(Ordering::SeqCst) {
                    may::coroutine::sleep(Duration::from_secs(1));
                    let jobs = collect_due_jobs(&runtime, Utc::now());
                    for job in jobs {
                        if queue.send(WorkItem::Job(job)).is_err() {
                            debug!("worker queue closed, clock exiting");
                            return;
                        }
                    }
                }
                debug!("clock coroutine stopped");
            })
    }
}

/// Work fed to the pool: an accepted connection, or a scheduler job.
pub enum WorkItem {
    Connection(crate::connection::RequestContext),
    Job(ScheduledJob),
}

/// The cooperative worker pool. Workers share one queue receiver and each
/// runs a work item to completion before taking the next.
pub struct WorkerPool {
    sender: mpsc::Sender<WorkItem>,
    active: Arc<AtomicUsize>,
    handles: Vec<may::coroutine::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `threads` worker coroutines over a shared queue.
    pub fn start(ctx: Arc<ServerContext>, threads: usize, stack_size: usize) -> Self {
        let (tx, rx) = mpsc::channel::<WorkItem>();
        let rx = Arc::new(rx);
        let active = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(threads);

        info!(threads, stack_size, "starting worker pool");
        for worker_id in 0..threads {
            let rx = rx.clone();
            let ctx = ctx.clone();
            let active = active.clone();
            let spawn_result = unsafe {
                may::coroutine::Builder::new()
                    .name(format!("pode-worker-{worker_id}"))
                    .stack_size(stack_size)
                    .spawn(move || {
                        debug!(worker_id, "worker started");
                        while let Ok(item) = rx.recv() {
                            active.fetch_add(1, Ordering::SeqCst);
                            match item {
                                WorkItem::Connection(conn) => {
                                    crate::connection::handle_connection(&ctx, conn);
                                }
                                WorkItem::Job(job) => {
                                    job.run(ctx.runtime());
                                }
                            }
                            active.fetch_sub(1, Ordering::SeqCst);
                        }
                        debug!(worker_id, "worker exiting");
                    })
            };
            match spawn_result {
                Ok(handle) => handles.push(handle),
                Err(e) => error!(worker_id, error = %e, "failed to spawn worker"),
            }
        }

        Self {
            sender: tx,
            active,
            handles,
        }
    }

    pub fn sender(&self) -> mpsc::Sender<WorkItem> {
        self.sender.clone()
    }

    /// Work items currently being processed.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Graceful stop: close the queue, wait for in-flight items up to the
    /// grace period, then cancel whatever remains.
    pub fn shutdown(self, grace: Duration) {
        drop(self.sender);
        let deadline = std::time::Instant::now() + grace;
        while self.active.load(Ordering::SeqCst) > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        let remaining = self.active.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!(remaining, "grace period elapsed, cancelling workers");
        }
        for handle in self.handles {
            unsafe {
                handle.coroutine().cancel();
            }
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ServerContext;
    use chrono::TimeZone;
    use serde_json::json;

    fn runtime() -> Arc<Lockable> {
        ServerContext::new().runtime()
    }

    #[test]
    fn timer_fires_after_interval() {
        let rt = runtime();
        {
            let mut guard = rt.lock().unwrap();
            guard
                .add_timer(Timer::new("t", Duration::from_secs(60), |_| Ok(())))
                .unwrap();
        }
        let now = Utc::now();
        assert!(collect_due_jobs(&rt, now).is_empty());
        let later = now + chrono::Duration::seconds(61);
        let jobs = collect_due_jobs(&rt, later);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "t");
        assert_eq!(jobs[0].kind, JobKind::Timer);
    }

    #[test]
    fn timer_skip_and_limit() {
        let rt = runtime();
        {
            let mut guard = rt.lock().unwrap();
            guard
                .add_timer(
                    Timer::new("t", Duration::from_secs(1), |_| Ok(()))
                        .with_skip(1)
                        .with_limit(2),
                )
                .unwrap();
        }
        let mut now = Utc::now();
        let mut fired = 0;
        for _ in 0..5 {
            now += chrono::Duration::seconds(2);
            for job in collect_due_jobs(&rt, now) {
                fired += 1;
                job.run(rt.clone());
            }
        }
        // First tick skipped, two executions, then the timer is removed.
        assert_eq!(fired, 2);
        assert!(rt.lock().unwrap().timers.is_empty());
    }

    #[test]
    fn running_timer_tick_is_skipped() {
        let rt = runtime();
        {
            let mut guard = rt.lock().unwrap();
            guard
                .add_timer(Timer::new("slow", Duration::from_secs(1), |_| Ok(())))
                .unwrap();
        }
        let now = Utc::now() + chrono::Duration::seconds(2);
        let jobs = collect_due_jobs(&rt, now);
        assert_eq!(jobs.len(), 1);
        // The job has not finished; the next due tick must be skipped.
        let later = now + chrono::Duration::seconds(2);
        assert!(collect_due_jobs(&rt, later).is_empty());
        // After the run completes, ticks resume.
        for job in jobs {
            job.run(rt.clone());
        }
        let again = later + chrono::Duration::seconds(2);
        assert_eq!(collect_due_jobs(&rt, again).len(), 1);
    }

    #[test]
    fn schedule_fires_on_cron_trigger() {
        let rt = runtime();
        {
            let mut guard = rt.lock().unwrap();
            guard
                .add_schedule(
                    Schedule::new("every-minute", |_| Ok(()))
                        .with_cron("@minutely")
                        .unwrap(),
                )
                .unwrap();
        }
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 30).unwrap();
        // First pass computes the next trigger.
        assert!(collect_due_jobs(&rt, now).is_empty());
        let jobs = collect_due_jobs(&rt, Utc.with_ymd_and_hms(2024, 3, 1, 10, 1, 0).unwrap());
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, JobKind::Schedule);
    }

    #[test]
    fn schedule_limit_removes() {
        let rt = runtime();
        {
            let mut guard = rt.lock().unwrap();
            guard
                .add_schedule(
                    Schedule::new("once", |_| Ok(()))
                        .with_cron("@minutely")
                        .unwrap()
                        .with_limit(1),
                )
                .unwrap();
        }
        let mut now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 30).unwrap();
        collect_due_jobs(&rt, now);
        let mut fired = 0;
        for _ in 0..3 {
            now += chrono::Duration::minutes(1);
            fired += collect_due_jobs(&rt, now).len();
        }
        assert_eq!(fired, 1);
        assert!(rt.lock().unwrap().schedules.is_empty());
    }

    #[test]
    fn job_error_does_not_poison_later_ticks() {
        let rt = runtime();
        {
            let mut guard = rt.lock().unwrap();
            guard
                .add_timer(Timer::new("failing", Duration::from_secs(1), |_| {
                    anyhow::bail!("tick exploded")
                }))
                .unwrap();
        }
        let now = Utc::now() + chrono::Duration::seconds(2);
        let jobs = collect_due_jobs(&rt, now);
        for job in jobs {
            job.run(rt.clone());
        }
        let later = now + chrono::Duration::seconds(2);
        assert_eq!(collect_due_jobs(&rt, later).len(), 1);
    }

    #[test]
    fn job_event_reaches_shared_state() {
        let rt = runtime();
        {
            let mut guard = rt.lock().unwrap();
            guard
                .add_timer(Timer::new("stateful", Duration::from_secs(1), |event| {
                    event.with_state(|state| {
                        state.set("ticked", json!(true));
                    });
                    Ok(())
                }))
                .unwrap();
        }
        let jobs = collect_due_jobs(&rt, Utc::now() + chrono::Duration::seconds(2));
        for job in jobs {
            job.run(rt.clone());
        }
        assert_eq!(
            rt.lock().unwrap().state.get("ticked"),
            Some(&json!(true))
        );
    }
}
