// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Durable cron scheduler.
//!
//! Jobs live in a single SQLite table; the tick loop fires every job whose
//! `next_run` has passed and then recomputes `next_run` strictly forward.
//! Because the update happens *after* the callback, delivery is
//! at-least-once across crashes.
//!
//! Schedules use the familiar five-field minute-granularity cron syntax.
//! The `cron` crate wants a seconds field, so a literal `0` is prepended
//! before parsing; the stored text stays in the user's five-field form.

use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use rusqlite::{params, Connection};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Session id cron prompts are enqueued under.
pub const CRON_SESSION_ID: &str = "cron";

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler is closed")]
    Closed,
    #[error("invalid cron schedule {0:?}: {1}")]
    InvalidSchedule(String, String),
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error("no such job: {0}")]
    NotFound(i64),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, Clone, PartialEq)]
pub struct CronJob {
    pub id: i64,
    pub schedule: String,
    pub prompt: String,
    pub next_run: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Injectable time source so tests can advance the clock by hand.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct CronScheduler {
    conn: Mutex<Option<Connection>>,
    clock: Arc<dyn Clock>,
    tick: Duration,
    stop_tx: watch::Sender<bool>,
}

impl CronScheduler {
    pub fn open(db_path: &Path) -> Result<Self> {
        Self::open_with(db_path, Arc::new(SystemClock), Duration::from_secs(60))
    }

    pub fn open_with(db_path: &Path, clock: Arc<dyn Clock>, tick: Duration) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::from_conn(conn, clock, tick)
    }

    pub fn open_in_memory_with(clock: Arc<dyn Clock>, tick: Duration) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_conn(conn, clock, tick)
    }

    fn from_conn(conn: Connection, clock: Arc<dyn Clock>, tick: Duration) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cron_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                schedule TEXT NOT NULL,
                prompt TEXT NOT NULL,
                next_run TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )?;
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            clock,
            tick,
            stop_tx,
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock().expect("scheduler mutex poisoned");
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(SchedulerError::Closed),
        }
    }

    // ── Job management ────────────────────────────────────────────────────────

    pub fn add_job(&self, schedule: &str, prompt: &str) -> Result<i64> {
        if prompt.trim().is_empty() {
            return Err(SchedulerError::EmptyPrompt);
        }
        let parsed = parse_schedule(schedule)?;
        let now = self.clock.now();
        // Smallest time satisfying the schedule that is >= now.
        let next = next_occurrence(&parsed, now - chrono::Duration::seconds(1))
            .ok_or_else(|| {
                SchedulerError::InvalidSchedule(schedule.into(), "no future occurrence".into())
            })?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cron_jobs (schedule, prompt, next_run, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    schedule,
                    prompt,
                    next.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                    now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn remove_job(&self, id: i64) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM cron_jobs WHERE id = ?1", params![id])?;
            if changed == 0 {
                return Err(SchedulerError::NotFound(id));
            }
            Ok(())
        })
    }

    pub fn list_jobs(&self) -> Result<Vec<CronJob>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, schedule, prompt, next_run, created_at FROM cron_jobs ORDER BY id",
            )?;
            let rows = stmt.query_map([], row_to_job)?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
    }

    pub fn get_job(&self, id: i64) -> Result<Option<CronJob>> {
        Ok(self.list_jobs()?.into_iter().find(|j| j.id == id))
    }

    // ── Tick loop ─────────────────────────────────────────────────────────────

    /// Run the tick loop until [`CronScheduler::stop`] is called.
    ///
    /// `fire` is invoked once per due job with (`"cron"`, prompt).  A
    /// transient DB error on a tick is logged and retried on the next tick.
    pub async fn run<F, Fut>(self: Arc<Self>, fire: F)
    where
        F: Fn(String, String) -> Fut + Send + Sync,
        Fut: Future<Output = ()> + Send,
    {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        debug!(tick = ?self.tick, "cron scheduler started");
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stop_rx.changed() => break,
            }
            if *stop_rx.borrow() {
                break;
            }
            if let Err(e) = self.tick_once(&fire).await {
                match e {
                    SchedulerError::Closed => break,
                    other => warn!("cron tick failed (retrying next tick): {other}"),
                }
            }
        }
        debug!("cron scheduler stopped");
    }

    /// One pass over due jobs.  Public for tests.
    pub async fn tick_once<F, Fut>(&self, fire: &F) -> Result<()>
    where
        F: Fn(String, String) -> Fut + Send + Sync,
        Fut: Future<Output = ()> + Send,
    {
        let now = self.clock.now();
        let due: Vec<CronJob> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, schedule, prompt, next_run, created_at FROM cron_jobs
                 WHERE next_run <= ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)], row_to_job)?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })?;

        for job in due {
            debug!(job_id = job.id, "firing cron job");
            fire(CRON_SESSION_ID.to_string(), job.prompt.clone()).await;

            // Recompute strictly forward from the later of (now, next_run) so
            // a delayed tick cannot schedule a time already in the past.
            let parsed = match parse_schedule(&job.schedule) {
                Ok(p) => p,
                Err(e) => {
                    warn!(job_id = job.id, "stored schedule unparseable: {e}");
                    continue;
                }
            };
            let base = now.max(job.next_run);
            if let Some(next) = next_occurrence(&parsed, base) {
                self.with_conn(|conn| {
                    conn.execute(
                        "UPDATE cron_jobs SET next_run = ?2 WHERE id = ?1",
                        params![job.id, next.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)],
                    )?;
                    Ok(())
                })?;
            }
        }
        Ok(())
    }

    /// Signal the run loop to exit.  Idempotent; the loop returns within one
    /// tick.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Release the database.  Idempotent; later operations fail with
    /// [`SchedulerError::Closed`].
    pub fn close(&self) {
        let mut guard = self.conn.lock().expect("scheduler mutex poisoned");
        if guard.take().is_some() {
            debug!("cron scheduler db closed");
        }
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<CronJob> {
    let next: String = row.get(3)?;
    let created: String = row.get(4)?;
    Ok(CronJob {
        id: row.get(0)?,
        schedule: row.get(1)?,
        prompt: row.get(2)?,
        next_run: parse_ts(&next),
        created_at: parse_ts(&created),
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

/// Parse a five-field cron expression by pinning the seconds field to 0.
fn parse_schedule(five_field: &str) -> Result<Schedule> {
    let fields = five_field.split_whitespace().count();
    if fields != 5 {
        return Err(SchedulerError::InvalidSchedule(
            five_field.into(),
            format!("expected 5 fields, got {fields}"),
        ));
    }
    Schedule::from_str(&format!("0 {five_field}"))
        .map_err(|e| SchedulerError::InvalidSchedule(five_field.into(), e.to_string()))
}

/// Smallest schedule occurrence strictly after `after`.
fn next_occurrence(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Clock whose time only moves when the test says so.
    struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        fn at(start: &str) -> Arc<Self> {
            Arc::new(Self {
                now: Mutex::new(start.parse().unwrap()),
            })
        }
        fn advance_minutes(&self, m: i64) {
            let mut now = self.now.lock().unwrap();
            *now += chrono::Duration::minutes(m);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }

    fn scheduler(clock: Arc<ManualClock>) -> Arc<CronScheduler> {
        Arc::new(
            CronScheduler::open_in_memory_with(clock, Duration::from_millis(5)).unwrap(),
        )
    }

    async fn noop(_: String, _: String) {}

    // ── Job management ────────────────────────────────────────────────────────

    #[test]
    fn add_job_computes_next_run_at_or_after_now() {
        let clock = ManualClock::at("2026-03-01T10:30:30Z");
        let s = scheduler(clock.clone());
        let id = s.add_job("*/5 * * * *", "ping").unwrap();
        let job = s.get_job(id).unwrap().unwrap();
        assert_eq!(job.next_run, "2026-03-01T10:35:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn add_job_rejects_bad_schedule() {
        let s = scheduler(ManualClock::at("2026-03-01T00:00:00Z"));
        assert!(matches!(
            s.add_job("not a cron", "p"),
            Err(SchedulerError::InvalidSchedule(..))
        ));
        assert!(matches!(
            s.add_job("* * * *", "p"),
            Err(SchedulerError::InvalidSchedule(..))
        ));
    }

    #[test]
    fn add_job_rejects_empty_prompt() {
        let s = scheduler(ManualClock::at("2026-03-01T00:00:00Z"));
        assert!(matches!(
            s.add_job("* * * * *", "  "),
            Err(SchedulerError::EmptyPrompt)
        ));
    }

    #[test]
    fn remove_job_deletes_and_errors_on_missing() {
        let s = scheduler(ManualClock::at("2026-03-01T00:00:00Z"));
        let id = s.add_job("* * * * *", "p").unwrap();
        s.remove_job(id).unwrap();
        assert!(s.list_jobs().unwrap().is_empty());
        assert!(matches!(s.remove_job(id), Err(SchedulerError::NotFound(_))));
    }

    #[test]
    fn job_ids_are_monotonic() {
        let s = scheduler(ManualClock::at("2026-03-01T00:00:00Z"));
        let a = s.add_job("* * * * *", "a").unwrap();
        let b = s.add_job("* * * * *", "b").unwrap();
        assert!(b > a);
    }

    // ── Firing ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn due_job_fires_once_and_next_run_moves_strictly_forward() {
        let clock = ManualClock::at("2026-03-01T10:00:30Z");
        let s = scheduler(clock.clone());
        let id = s.add_job("* * * * *", "ping").unwrap();
        let before = s.get_job(id).unwrap().unwrap().next_run;

        clock.advance_minutes(1);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        s.tick_once(&move |sid, prompt| {
            let fired = fired2.clone();
            async move {
                assert_eq!(sid, CRON_SESSION_ID);
                assert_eq!(prompt, "ping");
                fired.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await
        .unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        let after = s.get_job(id).unwrap().unwrap().next_run;
        assert!(after > before, "next_run must advance: {before} -> {after}");

        // Immediately ticking again without moving the clock fires nothing.
        s.tick_once(&move |_, _| async {}).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn job_not_due_does_not_fire() {
        let clock = ManualClock::at("2026-03-01T10:00:10Z");
        let s = scheduler(clock.clone());
        s.add_job("0 12 * * *", "noon").unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        s.tick_once(&move |_, _| {
            let fired = fired2.clone();
            async move {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await
        .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn next_run_is_smallest_satisfying_time_after_fire() {
        let clock = ManualClock::at("2026-03-01T10:04:00Z");
        let s = scheduler(clock.clone());
        let id = s.add_job("*/5 * * * *", "p").unwrap();
        clock.advance_minutes(1); // 10:05, due
        s.tick_once(&noop).await.unwrap();
        let job = s.get_job(id).unwrap().unwrap();
        assert_eq!(
            job.next_run,
            "2026-03-01T10:10:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn stop_terminates_run_loop() {
        let clock = ManualClock::at("2026-03-01T00:00:00Z");
        let s = scheduler(clock);
        let handle = tokio::spawn(s.clone().run(noop));
        tokio::time::sleep(Duration::from_millis(20)).await;
        s.stop();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("run loop must exit within a tick")
            .unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let s = scheduler(ManualClock::at("2026-03-01T00:00:00Z"));
        s.stop();
        s.stop();
    }

    #[test]
    fn operations_after_close_fail() {
        let s = scheduler(ManualClock::at("2026-03-01T00:00:00Z"));
        s.close();
        assert!(matches!(s.list_jobs(), Err(SchedulerError::Closed)));
        assert!(matches!(
            s.add_job("* * * * *", "p"),
            Err(SchedulerError::Closed)
        ));
    }

    #[test]
    fn persisted_jobs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cron.sqlite");
        let clock = ManualClock::at("2026-03-01T00:00:00Z");
        {
            let s = CronScheduler::open_with(&path, clock.clone(), Duration::from_secs(60))
                .unwrap();
            s.add_job("* * * * *", "durable").unwrap();
            s.close();
        }
        let s = CronScheduler::open_with(&path, clock, Duration::from_secs(60)).unwrap();
        let jobs = s.list_jobs().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].prompt, "durable");
    }
}
