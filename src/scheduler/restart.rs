//! Auto-restart installation from `server.restart` configuration.
//!
//! `period` installs a timer, `times` and `crons` install schedules; any
//! combination may coexist. All of them fire a graceful
//! shutdown-and-reinit through the control channel.

use super::{ControlSignal, Schedule, Timer};
use crate::config::RestartConfig;
use crate::context::Lockable;
use crate::error::Result;
use may::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const RESTART_PERIOD_TIMER: &str = "__pode_restart_period__";
pub const RESTART_TIMES_SCHEDULE: &str = "__pode_restart_times__";
pub const RESTART_CRONS_SCHEDULE: &str = "__pode_restart_crons__";

/// Install the restart timer/schedules described by the configuration.
/// Absent keys install nothing.
pub fn install_restart_jobs(
    config: &RestartConfig,
    runtime: &Arc<Lockable>,
    control: mpsc::Sender<ControlSignal>,
) -> Result<()> {
    if config.is_empty() {
        return Ok(());
    }
    let mut rt = runtime.lock().unwrap();

    if let Some(minutes) = config.period {
        let control = control.clone();
        rt.add_timer(Timer::new(
            RESTART_PERIOD_TIMER,
            Duration::from_secs(minutes * 60),
            move |event| {
                info!(timer = %event.name, "restart period reached");
                let _ = control.send(ControlSignal::Restart);
                Ok(())
            },
        ))?;
        info!(minutes, "restart period timer installed");
    }

    if !config.times.is_empty() {
        let control_times = control.clone();
        let times: Vec<&str> = config.times.iter().map(String::as_str).collect();
        rt.add_schedule(
            Schedule::new(RESTART_TIMES_SCHEDULE, move |event| {
                info!(schedule = %event.name, "restart time reached");
                let _ = control_times.send(ControlSignal::Restart);
                Ok(())
            })
            .with_times(&times)?,
        )?;
        info!(times = ?config.times, "restart times schedule installed");
    }

    if !config.crons.is_empty() {
        let control_crons = control.clone();
        let mut schedule = Schedule::new(RESTART_CRONS_SCHEDULE, move |event| {
            info!(schedule = %event.name, "restart cron fired");
            let _ = control_crons.send(ControlSignal::Restart);
            Ok(())
        });
        for expr in &config.crons {
            schedule = schedule.with_cron(expr)?;
        }
        rt.add_schedule(schedule)?;
        info!(crons = ?config.crons, "restart cron schedule installed");
    }

    Ok(())
}

/// Convenience used by the file watcher: push a restart signal.
pub fn request_restart(control: &mpsc::Sender<ControlSignal>) {
    let _ = control.send(ControlSignal::Restart);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::context::ServerContext;

    fn runtime() -> Arc<Lockable> {
        ServerContext::new().runtime()
    }

    #[test]
    fn period_and_crons_install_expected_jobs() {
        let cfg = ServerConfig::from_json(
            r#"{ "server": { "restart": { "period": 180, "crons": ["@minutely"] } } }"#,
        )
        .unwrap();
        let rt = runtime();
        let (tx, _rx) = mpsc::channel();
        install_restart_jobs(&cfg.server.restart, &rt, tx).unwrap();

        let guard = rt.lock().unwrap();
        assert_eq!(guard.timers.len(), 1);
        assert!(guard.timers.contains_key(RESTART_PERIOD_TIMER));
        assert_eq!(guard.schedules.len(), 1);
        assert!(guard.schedules.contains_key(RESTART_CRONS_SCHEDULE));
    }

    #[test]
    fn times_install_schedule() {
        let cfg = ServerConfig::from_json(
            r#"{ "server": { "restart": { "times": ["02:00", "14:30"] } } }"#,
        )
        .unwrap();
        let rt = runtime();
        let (tx, _rx) = mpsc::channel();
        install_restart_jobs(&cfg.server.restart, &rt, tx).unwrap();

        let guard = rt.lock().unwrap();
        assert!(guard.timers.is_empty());
        assert_eq!(guard.schedules.len(), 1);
        assert!(guard.schedules.contains_key(RESTART_TIMES_SCHEDULE));
    }

    #[test]
    fn absent_keys_install_nothing() {
        let cfg = ServerConfig::from_json("{}").unwrap();
        let rt = runtime();
        let (tx, _rx) = mpsc::channel();
        install_restart_jobs(&cfg.server.restart, &rt, tx).unwrap();

        let guard = rt.lock().unwrap();
        assert!(guard.timers.is_empty());
        assert!(guard.schedules.is_empty());
    }

    #[test]
    fn period_timer_signals_restart() {
        let cfg =
            ServerConfig::from_json(r#"{ "server": { "restart": { "period": 1 } } }"#).unwrap();
        let rt = runtime();
        let (tx, rx) = mpsc::channel();
        install_restart_jobs(&cfg.server.restart, &rt, tx).unwrap();

        let now = chrono::Utc::now() + chrono::Duration::seconds(61);
        let jobs = super::super::collect_due_jobs(&rt, now);
        assert_eq!(jobs.len(), 1);
        for job in jobs {
            job.run(rt.clone());
        }
        assert_eq!(rx.try_recv().ok(), Some(ControlSignal::Restart));
    }

    #[test]
    fn invalid_cron_rejected() {
        let cfg = ServerConfig::from_json(
            r#"{ "server": { "restart": { "crons": ["not a cron"] } } }"#,
        )
        .unwrap();
        let rt = runtime();
        let (tx, _rx) = mpsc::channel();
        assert!(install_restart_jobs(&cfg.server.restart, &rt, tx).is_err());
    }
}
