//! Emulated controller: input model, wire protocol and the per-session pipeline
//!
//! 1. [`buttons`] - buttons, sticks and controller kinds
//! 2. [`protocol`] - HID report encoding and subcommand replies
//! 3. [`macro_parser`] - text macros to timed steps
//! 4. [`input_engine`] - live commands and macro playback per tick
//! 5. [`report_scheduler`] - which ticks go on the wire
//! 6. [`session`] - connection state machine and report loop
//!
//! # Architecture
//!
//! ```text
//! requests ──► InputEngine ──► ReportScheduler ──► Transport
//!              (payload/tick)   (dedup, keep-alive)
//! ```

pub mod buttons;
pub mod input_engine;
pub mod macro_parser;
pub mod protocol;
pub mod report_scheduler;
pub mod session;
