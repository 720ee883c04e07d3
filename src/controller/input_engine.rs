//! # Input Engine
//!
//! Turns queued commands and macros into the payload for each report tick.
//!
//! ## Why This Module Exists
//!
//! The console treats a controller that changes state too abruptly between
//! scripted sequences as flaky and may drop it. The engine therefore
//! serializes all input through one state machine:
//!
//! - Direct commands are applied only while no macro work is pending.
//! - Macros run their steps back to back on an absolute schedule, so step
//!   boundaries never drift with tick jitter.
//! - When a macro finishes, a fixed number of all-neutral ticks is emitted and
//!   the next macro is held back until a cooldown has elapsed.
//!
//! The engine never looks at a clock itself. The session passes `now` into
//! [`InputEngine::tick`], which keeps every transition deterministic and
//! testable with plain `Instant` arithmetic.

use super::buttons::{ButtonMask, ControllerKind, InputPayload, StickPosition};
use super::macro_parser::MacroStep;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Handle returned for every submitted macro
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MacroId(pub u64);

impl fmt::Display for MacroId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "macro-{}", self.0)
    }
}

/// Direct input from a caller
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Command {
    /// Buttons held while the command is active
    pub buttons: ButtonMask,
    /// `None` keeps the current stick position
    pub left_stick: Option<StickPosition>,
    pub right_stick: Option<StickPosition>,
    /// `None` latches the state until the next command
    pub hold: Option<Duration>,
    /// Neutral pause after a timed hold before the next command may apply
    pub release: Option<Duration>,
}

impl Command {
    /// Latches a full input state
    pub fn set(payload: InputPayload) -> Self {
        Self {
            buttons: payload.buttons,
            left_stick: Some(payload.left_stick),
            right_stick: Some(payload.right_stick),
            hold: None,
            release: None,
        }
    }

    /// Press, hold for `down`, release, then stay neutral for `up`
    pub fn press(buttons: ButtonMask, down: Duration, up: Duration) -> Self {
        Self {
            buttons,
            left_stick: None,
            right_stick: None,
            hold: Some(down),
            release: Some(up),
        }
    }

    pub fn neutral() -> Self {
        Self::set(InputPayload::NEUTRAL)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    LiveInput,
    MacroCooldown,
    MacroRunning,
    PostMacroNeutral,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub macro_cooldown: Duration,
    pub post_macro_neutral_required: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            macro_cooldown: Duration::from_millis(100),
            post_macro_neutral_required: 10,
        }
    }
}

/// Payload for one tick. `force` asks the transport to send even if unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineTick {
    pub payload: InputPayload,
    pub force: bool,
}

#[derive(Debug)]
struct QueuedMacro {
    id: MacroId,
    steps: Vec<MacroStep>,
}

#[derive(Debug)]
struct RunningMacro {
    id: MacroId,
    current: InputPayload,
    step_ends_at: Instant,
    remaining: VecDeque<MacroStep>,
}

#[derive(Debug)]
pub struct InputEngine {
    kind: ControllerKind,
    settings: EngineSettings,
    state: EngineState,
    current: InputPayload,
    input_queue: VecDeque<Command>,
    macro_queue: VecDeque<QueuedMacro>,
    running: Option<RunningMacro>,
    hold_until: Option<Instant>,
    release_until: Option<Instant>,
    macro_cooldown_deadline: Option<Instant>,
    post_macro_neutral_remaining: u32,
    finished: Vec<MacroId>,
}

impl InputEngine {
    pub fn new(kind: ControllerKind, settings: EngineSettings) -> Self {
        Self {
            kind,
            settings,
            state: EngineState::Idle,
            current: InputPayload::NEUTRAL,
            input_queue: VecDeque::new(),
            macro_queue: VecDeque::new(),
            running: None,
            hold_until: None,
            release_until: None,
            macro_cooldown_deadline: None,
            post_macro_neutral_remaining: 0,
            finished: Vec::new(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn current_payload(&self) -> InputPayload {
        self.current
    }

    pub fn post_macro_neutral_remaining(&self) -> u32 {
        self.post_macro_neutral_remaining
    }

    pub fn macro_cooldown_deadline(&self) -> Option<Instant> {
        self.macro_cooldown_deadline
    }

    pub fn pending_commands(&self) -> usize {
        self.input_queue.len()
    }

    pub fn pending_macros(&self) -> usize {
        self.macro_queue.len() + usize::from(self.running.is_some())
    }

    pub fn running_macro(&self) -> Option<MacroId> {
        self.running.as_ref().map(|running| running.id)
    }

    pub fn enqueue_command(&mut self, command: Command) {
        self.input_queue.push_back(command);
    }

    /// Steps must come from a successful parse; an empty list finishes immediately
    pub fn enqueue_macro(&mut self, id: MacroId, steps: Vec<MacroStep>) {
        debug!("Queued {} with {} steps", id, steps.len());
        self.macro_queue.push_back(QueuedMacro { id, steps });
    }

    /// Drops a queued macro or cuts a running one short.
    /// A stopped running macro still goes through the full neutral release,
    /// starting with the next tick.
    pub fn stop_macro(&mut self, id: MacroId, now: Instant) -> bool {
        if let Some(pos) = self.macro_queue.iter().position(|queued| queued.id == id) {
            self.macro_queue.remove(pos);
            self.finished.push(id);
            return true;
        }
        if self.running_macro() == Some(id) {
            self.begin_release(now);
            return true;
        }
        false
    }

    pub fn clear_macros(&mut self, now: Instant) {
        for queued in self.macro_queue.drain(..) {
            self.finished.push(queued.id);
        }
        if self.running.is_some() {
            self.begin_release(now);
        }
    }

    /// Macros completed or stopped since the last call
    pub fn take_finished(&mut self) -> Vec<MacroId> {
        std::mem::take(&mut self.finished)
    }

    /// Advances the state machine and returns the payload for this tick
    pub fn tick(&mut self, now: Instant) -> EngineTick {
        match self.state {
            EngineState::PostMacroNeutral => self.emit_neutral(),
            EngineState::MacroRunning => self.advance_macro(now),
            EngineState::MacroCooldown => {
                if self.cooldown_elapsed(now) {
                    self.start_next_macro(now)
                } else {
                    self.hold()
                }
            }
            EngineState::Idle | EngineState::LiveInput => self.live_tick(now),
        }
    }

    fn hold(&self) -> EngineTick {
        EngineTick {
            payload: self.current,
            force: false,
        }
    }

    fn cooldown_elapsed(&self, now: Instant) -> bool {
        self.macro_cooldown_deadline
            .map_or(true, |deadline| now >= deadline)
    }

    fn live_tick(&mut self, now: Instant) -> EngineTick {
        if let Some(until) = self.hold_until {
            if now < until {
                return self.hold();
            }
            // Release is always visible for at least one tick
            self.hold_until = None;
            self.current = InputPayload::NEUTRAL;
            self.settle_live_state();
            return self.hold();
        }
        if let Some(until) = self.release_until {
            if now < until {
                return self.hold();
            }
            self.release_until = None;
        }

        if !self.macro_queue.is_empty() {
            if self.cooldown_elapsed(now) {
                return self.start_next_macro(now);
            }
            self.state = EngineState::MacroCooldown;
            return self.hold();
        }

        if let Some(command) = self.input_queue.pop_front() {
            self.apply_command(command, now);
        }
        self.settle_live_state();
        self.hold()
    }

    fn apply_command(&mut self, command: Command, now: Instant) {
        let allowed = self.kind.buttons();
        self.current.buttons = command.buttons.intersect(allowed);
        if let Some(stick) = command.left_stick {
            self.current.left_stick = stick;
        }
        if let Some(stick) = command.right_stick {
            self.current.right_stick = stick;
        }
        if let Some(hold) = command.hold {
            // a hold past the end of the clock latches
            let released_at = now.checked_add(hold);
            self.hold_until = released_at;
            self.release_until = released_at
                .zip(command.release)
                .and_then(|(at, release)| at.checked_add(release));
        }
    }

    fn settle_live_state(&mut self) {
        let busy = self.hold_until.is_some() || self.release_until.is_some();
        self.state = if busy || !self.current.is_neutral() {
            EngineState::LiveInput
        } else {
            EngineState::Idle
        };
    }

    fn start_next_macro(&mut self, now: Instant) -> EngineTick {
        let Some(queued) = self.macro_queue.pop_front() else {
            self.settle_live_state();
            return self.hold();
        };

        // A macro takes over from any live input
        self.hold_until = None;
        self.release_until = None;

        let mut remaining: VecDeque<MacroStep> = queued.steps.into();
        let Some(first) = remaining.pop_front() else {
            self.finished.push(queued.id);
            self.settle_live_state();
            return self.hold();
        };

        info!("Starting {}", queued.id);
        let Some(step_ends_at) = now.checked_add(first.duration) else {
            warn!("{} step of {:?} overflows the clock, ending it", queued.id, first.duration);
            self.finished.push(queued.id);
            self.begin_release(now);
            return self.emit_neutral();
        };
        self.running = Some(RunningMacro {
            id: queued.id,
            current: first.payload().masked(self.kind.buttons()),
            step_ends_at,
            remaining,
        });
        self.state = EngineState::MacroRunning;
        self.advance_macro(now)
    }

    fn advance_macro(&mut self, now: Instant) -> EngineTick {
        let allowed = self.kind.buttons();
        let Some(running) = self.running.as_mut() else {
            self.settle_live_state();
            return self.hold();
        };

        while now >= running.step_ends_at {
            let Some(next) = running.remaining.pop_front() else {
                self.begin_release(now);
                return self.emit_neutral();
            };
            match running.step_ends_at.checked_add(next.duration) {
                Some(ends_at) => {
                    running.step_ends_at = ends_at;
                    running.current = next.payload().masked(allowed);
                }
                None => {
                    warn!("{} step of {:?} overflows the clock, ending it", running.id, next.duration);
                    self.begin_release(now);
                    return self.emit_neutral();
                }
            }
        }

        self.current = running.current;
        self.hold()
    }

    /// Ends the running macro and arms the neutral release and cooldown.
    /// Emits nothing: every one of the required neutral ticks is sent by a
    /// later call to [`emit_neutral`](Self::emit_neutral).
    fn begin_release(&mut self, now: Instant) {
        if let Some(running) = self.running.take() {
            info!("Finished {}", running.id);
            self.finished.push(running.id);
        }
        self.current = InputPayload::NEUTRAL;
        self.post_macro_neutral_remaining = self.settings.post_macro_neutral_required;
        self.macro_cooldown_deadline =
            Some(now.checked_add(self.settings.macro_cooldown).unwrap_or(now));
        self.state = EngineState::PostMacroNeutral;
    }

    fn emit_neutral(&mut self) -> EngineTick {
        self.current = InputPayload::NEUTRAL;
        self.post_macro_neutral_remaining = self.post_macro_neutral_remaining.saturating_sub(1);
        if self.post_macro_neutral_remaining == 0 {
            self.state = EngineState::Idle;
        }
        EngineTick {
            payload: InputPayload::NEUTRAL,
            force: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::buttons::Button;
    use crate::controller::macro_parser::parse_macro;

    const TICK: Duration = Duration::from_millis(15);

    fn engine() -> InputEngine {
        InputEngine::new(ControllerKind::ProController, EngineSettings::default())
    }

    fn a_button() -> ButtonMask {
        ButtonMask::NONE.with(Button::A)
    }

    #[tokio::test(start_paused = true)]
    async fn latched_command_persists() {
        let mut engine = engine();
        let start = Instant::now();
        engine.enqueue_command(Command::set(InputPayload {
            buttons: a_button(),
            ..InputPayload::NEUTRAL
        }));

        let first = engine.tick(start);
        assert_eq!(first.payload.buttons, a_button());
        assert_eq!(engine.state(), EngineState::LiveInput);

        let later = engine.tick(start + Duration::from_secs(5));
        assert_eq!(later.payload.buttons, a_button());
    }

    #[tokio::test(start_paused = true)]
    async fn timed_press_releases_then_pauses() {
        let mut engine = engine();
        let start = Instant::now();
        engine.enqueue_command(Command::press(
            a_button(),
            Duration::from_millis(100),
            Duration::from_millis(100),
        ));
        engine.enqueue_command(Command::press(
            ButtonMask::NONE.with(Button::B),
            Duration::from_millis(100),
            Duration::ZERO,
        ));

        assert_eq!(engine.tick(start).payload.buttons, a_button());
        assert_eq!(engine.tick(start + Duration::from_millis(50)).payload.buttons, a_button());
        assert!(engine.tick(start + Duration::from_millis(100)).payload.is_neutral());
        // still in the release pause
        assert!(engine.tick(start + Duration::from_millis(150)).payload.is_neutral());
        let next = engine.tick(start + Duration::from_millis(200));
        assert!(next.payload.buttons.contains(Button::B));
    }

    #[tokio::test(start_paused = true)]
    async fn commands_wait_for_macro_to_finish() {
        let mut engine = engine();
        let start = Instant::now();
        engine.enqueue_macro(MacroId(1), parse_macro("X 45ms").unwrap());
        engine.tick(start);
        assert_eq!(engine.state(), EngineState::MacroRunning);

        engine.enqueue_command(Command::set(InputPayload {
            buttons: a_button(),
            ..InputPayload::NEUTRAL
        }));
        let mid = engine.tick(start + TICK);
        assert!(mid.payload.buttons.contains(Button::X));
        assert_eq!(engine.pending_commands(), 1);

        let mut now = start + TICK * 3;
        while engine.state() != EngineState::Idle {
            assert!(engine.tick(now).payload.is_neutral());
            now += TICK;
        }
        assert_eq!(engine.tick(now).payload.buttons, a_button());
    }

    #[tokio::test(start_paused = true)]
    async fn macro_end_emits_required_neutral_ticks() {
        let mut engine = engine();
        let start = Instant::now();
        engine.enqueue_macro(MacroId(1), parse_macro("A 30ms").unwrap());
        engine.enqueue_macro(MacroId(2), parse_macro("B 30ms").unwrap());

        let mut now = start;
        let mut neutral_between = 0;
        let mut saw_first = false;
        let mut first_b_at = None;
        let mut last_a_at = None;
        for _ in 0..40 {
            let tick = engine.tick(now);
            if tick.payload.buttons.contains(Button::A) {
                saw_first = true;
                last_a_at = Some(now);
            } else if tick.payload.buttons.contains(Button::B) {
                first_b_at = Some(now);
                break;
            } else if saw_first {
                assert!(tick.force);
                neutral_between += 1;
            }
            now += TICK;
        }

        let (Some(last_a), Some(first_b)) = (last_a_at, first_b_at) else {
            panic!("both macros should have produced input");
        };
        assert!(neutral_between >= 10, "only {} neutral ticks", neutral_between);
        assert!(first_b - last_a >= Duration::from_millis(100));
        assert_eq!(engine.take_finished(), vec![MacroId(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn steps_follow_absolute_schedule() {
        let mut engine = engine();
        let start = Instant::now();
        engine.enqueue_macro(MacroId(7), parse_macro("A 20ms\nB 20ms\nX 20ms").unwrap());

        assert!(engine.tick(start).payload.buttons.contains(Button::A));
        // a late tick skips straight to the step that should be active
        let late = engine.tick(start + Duration::from_millis(45));
        assert!(late.payload.buttons.contains(Button::X));
        let done = engine.tick(start + Duration::from_millis(60));
        assert!(done.payload.is_neutral());
        assert_eq!(engine.state(), EngineState::PostMacroNeutral);
        assert_eq!(engine.post_macro_neutral_remaining(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn macro_waits_for_cooldown_deadline() {
        let settings = EngineSettings {
            macro_cooldown: Duration::from_millis(500),
            post_macro_neutral_required: 1,
        };
        let mut engine = InputEngine::new(ControllerKind::ProController, settings);
        let start = Instant::now();
        engine.enqueue_macro(MacroId(1), parse_macro("A 15ms").unwrap());
        engine.tick(start);
        engine.tick(start + TICK);
        assert_eq!(engine.state(), EngineState::Idle);

        engine.enqueue_macro(MacroId(2), parse_macro("B 15ms").unwrap());
        let blocked = engine.tick(start + TICK * 2);
        assert_eq!(engine.state(), EngineState::MacroCooldown);
        assert!(blocked.payload.is_neutral());

        let released = engine.tick(start + Duration::from_millis(520));
        assert!(released.payload.buttons.contains(Button::B));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_and_clear_mark_macros_finished() {
        let mut engine = engine();
        let start = Instant::now();
        engine.enqueue_macro(MacroId(1), parse_macro("A 1s").unwrap());
        engine.enqueue_macro(MacroId(2), parse_macro("B 1s").unwrap());
        engine.enqueue_macro(MacroId(3), parse_macro("X 1s").unwrap());
        engine.tick(start);

        assert!(engine.stop_macro(MacroId(2), start));
        assert!(!engine.stop_macro(MacroId(42), start));
        engine.clear_macros(start + TICK);
        assert_eq!(engine.state(), EngineState::PostMacroNeutral);
        assert_eq!(engine.pending_macros(), 0);

        let mut finished = engine.take_finished();
        finished.sort();
        assert_eq!(finished, vec![MacroId(1), MacroId(2), MacroId(3)]);
    }

    /// Counts neutral ticks from `now` until the engine is idle again
    fn neutral_ticks_until_idle(engine: &mut InputEngine, mut now: Instant) -> u32 {
        let mut count = 0;
        while engine.state() == EngineState::PostMacroNeutral {
            let tick = engine.tick(now);
            assert!(tick.payload.is_neutral());
            assert!(tick.force);
            count += 1;
            now += TICK;
        }
        count
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_macro_sends_every_neutral_tick() {
        let mut engine = engine();
        let start = Instant::now();
        engine.enqueue_macro(MacroId(1), parse_macro("A 1s").unwrap());
        assert!(engine.tick(start).payload.buttons.contains(Button::A));

        assert!(engine.stop_macro(MacroId(1), start + TICK));
        assert_eq!(engine.post_macro_neutral_remaining(), 10);
        assert_eq!(neutral_ticks_until_idle(&mut engine, start + TICK * 2), 10);
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn cleared_macro_sends_every_neutral_tick() {
        let mut engine = engine();
        let start = Instant::now();
        engine.enqueue_macro(MacroId(1), parse_macro("A 1s").unwrap());
        engine.enqueue_macro(MacroId(2), parse_macro("B 1s").unwrap());
        engine.tick(start);

        engine.clear_macros(start + TICK);
        assert_eq!(neutral_ticks_until_idle(&mut engine, start + TICK * 2), 10);
        assert_eq!(engine.take_finished(), vec![MacroId(2), MacroId(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_macro_sends_every_neutral_tick() {
        let mut engine = engine();
        let start = Instant::now();
        engine.enqueue_macro(MacroId(1), parse_macro("A 30ms").unwrap());
        engine.tick(start);
        engine.tick(start + TICK);

        // the tick that ends the macro carries the first neutral report
        let end = engine.tick(start + TICK * 2);
        assert!(end.payload.is_neutral() && end.force);
        let rest = neutral_ticks_until_idle(&mut engine, start + TICK * 3);
        assert_eq!(rest + 1, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn step_past_the_clock_ends_the_macro() {
        let mut engine = engine();
        let start = Instant::now();
        let mut steps = parse_macro("A 15ms\nB 1s").unwrap();
        steps[1].duration = Duration::MAX;
        engine.enqueue_macro(MacroId(1), steps);
        engine.enqueue_macro(
            MacroId(2),
            vec![MacroStep {
                duration: Duration::MAX,
                ..parse_macro("X 1s").unwrap().remove(0)
            }],
        );

        assert!(engine.tick(start).payload.buttons.contains(Button::A));
        let cut = engine.tick(start + TICK);
        assert!(cut.payload.is_neutral());
        assert_eq!(engine.take_finished(), vec![MacroId(1)]);

        let mut now = start + TICK * 2;
        while engine.take_finished().is_empty() {
            assert!(!engine.tick(now).payload.buttons.contains(Button::X));
            now += TICK;
        }
        assert_eq!(engine.state(), EngineState::PostMacroNeutral);
        assert_eq!(engine.running_macro(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn press_past_the_clock_latches() {
        let mut engine = engine();
        let start = Instant::now();
        engine.enqueue_command(Command::press(a_button(), Duration::MAX, Duration::MAX));
        assert_eq!(engine.tick(start).payload.buttons, a_button());
        assert_eq!(
            engine.tick(start + Duration::from_secs(3600)).payload.buttons,
            a_button()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn joycon_drops_buttons_it_lacks() {
        let mut engine = InputEngine::new(ControllerKind::JoyConL, EngineSettings::default());
        engine.enqueue_command(Command::set(InputPayload {
            buttons: ButtonMask::NONE.with(Button::A).with(Button::L),
            ..InputPayload::NEUTRAL
        }));
        let tick = engine.tick(Instant::now());
        assert!(tick.payload.buttons.contains(Button::L));
        assert!(!tick.payload.buttons.contains(Button::A));
    }
}
