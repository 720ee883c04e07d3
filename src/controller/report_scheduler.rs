//! Decides which ticks actually put a report on the wire.
//!
//! Identical payloads are sent once; after that only the keep-alive gap (or
//! an engine-forced neutral) triggers a resend, so the console never sees the
//! link go quiet for longer than `max_gap`.

use super::buttons::{ControllerKind, InputPayload};
use super::input_engine::EngineTick;
use super::protocol;
use chrono::{DateTime, Local};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transmission {
    /// Payload differs from the last one sent
    Changed,
    /// Engine asked for an explicit neutral report
    Forced,
    /// Unchanged payload resent before the console times us out
    KeepAlive,
}

#[derive(Debug)]
struct ReportStats {
    ticks: u64,
    changed: u64,
    forced: u64,
    keep_alive: u64,
    window_start: DateTime<Local>,
}

impl ReportStats {
    fn new() -> Self {
        Self {
            ticks: 0,
            changed: 0,
            forced: 0,
            keep_alive: 0,
            window_start: Local::now(),
        }
    }
}

#[derive(Debug)]
pub struct ReportScheduler {
    kind: ControllerKind,
    max_gap: Duration,
    cached_payload: Option<InputPayload>,
    tick_counter: u64,
    last_transmit: Option<Instant>,
    timer: u8,
    stats: ReportStats,
}

impl ReportScheduler {
    pub fn new(kind: ControllerKind, max_gap: Duration) -> Self {
        Self {
            kind,
            max_gap,
            cached_payload: None,
            tick_counter: 0,
            last_transmit: None,
            timer: 0,
            stats: ReportStats::new(),
        }
    }

    /// Ticks since the last distinct payload went out
    pub fn tick_counter(&self) -> u64 {
        self.tick_counter
    }

    pub fn cached_payload(&self) -> Option<InputPayload> {
        self.cached_payload
    }

    /// Timer byte for the next frame; shared by input reports and subcommand replies
    pub fn next_timer(&mut self) -> u8 {
        let timer = self.timer;
        self.timer = self.timer.wrapping_add(1);
        timer
    }

    /// Returns the report to send for this tick, if any
    pub fn schedule(&mut self, tick: EngineTick, now: Instant) -> Option<(Transmission, Vec<u8>)> {
        self.stats.ticks += 1;

        let changed = self.cached_payload != Some(tick.payload);
        let keep_alive_due = self
            .last_transmit
            .map_or(true, |last| now.duration_since(last) >= self.max_gap);

        let reason = if changed {
            self.tick_counter = 0;
            self.cached_payload = Some(tick.payload);
            self.stats.changed += 1;
            Transmission::Changed
        } else {
            self.tick_counter += 1;
            if tick.force {
                self.stats.forced += 1;
                Transmission::Forced
            } else if keep_alive_due {
                self.stats.keep_alive += 1;
                Transmission::KeepAlive
            } else {
                return None;
            }
        };

        self.last_transmit = Some(now);
        let timer = self.next_timer();
        Some((reason, protocol::input_report(timer, self.kind, &tick.payload)))
    }

    /// Logs and resets the counters of the current window
    pub fn log_stats(&mut self, label: &str) {
        let now = Local::now();
        let elapsed_seconds = (now - self.stats.window_start).num_seconds().max(1);
        let sent = self.stats.changed + self.stats.forced + self.stats.keep_alive;
        info!(
            "Report stats [{}]: {} ticks, {} reports ({} changed, {} forced, {} keep-alive) in {} seconds",
            label,
            self.stats.ticks,
            sent,
            self.stats.changed,
            self.stats.forced,
            self.stats.keep_alive,
            elapsed_seconds
        );
        self.stats = ReportStats::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::buttons::{Button, ButtonMask};

    const TICK: Duration = Duration::from_millis(15);

    fn tick(payload: InputPayload) -> EngineTick {
        EngineTick {
            payload,
            force: false,
        }
    }

    fn pressed(button: Button) -> InputPayload {
        InputPayload {
            buttons: ButtonMask::NONE.with(button),
            ..InputPayload::NEUTRAL
        }
    }

    #[tokio::test(start_paused = true)]
    async fn identical_payloads_sent_once() {
        let mut scheduler = ReportScheduler::new(ControllerKind::ProController, Duration::from_secs(10));
        let start = Instant::now();
        let payload = pressed(Button::A);

        let mut sent = 0;
        for i in 0..20u32 {
            if scheduler.schedule(tick(payload), start + TICK * i).is_some() {
                sent += 1;
            }
            assert_eq!(scheduler.tick_counter(), u64::from(i));
        }
        assert_eq!(sent, 1);

        let changed = scheduler.schedule(tick(pressed(Button::B)), start + TICK * 20);
        assert!(matches!(changed, Some((Transmission::Changed, _))));
        assert_eq!(scheduler.tick_counter(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_resends_without_resetting_counter() {
        let mut scheduler =
            ReportScheduler::new(ControllerKind::ProController, Duration::from_millis(60));
        let start = Instant::now();
        let neutral = tick(InputPayload::NEUTRAL);

        assert!(scheduler.schedule(neutral, start).is_some());
        let mut reasons = Vec::new();
        for i in 1..=8u32 {
            if let Some((reason, _)) = scheduler.schedule(neutral, start + TICK * i) {
                reasons.push((i, reason));
            }
        }
        assert_eq!(
            reasons,
            vec![(4, Transmission::KeepAlive), (8, Transmission::KeepAlive)]
        );
        assert_eq!(scheduler.tick_counter(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_neutral_is_always_sent() {
        let mut scheduler = ReportScheduler::new(ControllerKind::ProController, Duration::from_secs(10));
        let start = Instant::now();
        let forced = EngineTick {
            payload: InputPayload::NEUTRAL,
            force: true,
        };
        scheduler.schedule(forced, start);
        let again = scheduler.schedule(forced, start + TICK);
        assert!(matches!(again, Some((Transmission::Forced, _))));
        assert_eq!(scheduler.tick_counter(), 1);
    }

    #[test]
    fn timer_wraps() {
        let mut scheduler = ReportScheduler::new(ControllerKind::JoyConL, Duration::from_secs(1));
        for _ in 0..255 {
            scheduler.next_timer();
        }
        assert_eq!(scheduler.next_timer(), 255);
        assert_eq!(scheduler.next_timer(), 0);
    }
}
