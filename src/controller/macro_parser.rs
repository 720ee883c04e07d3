//! Macro script parsing
//!
//! A macro is plain text, one step per line:
//!
//! ```text
//! # mash A, then walk right
//! LOOP 3
//!     A 0.1s
//!     0.1s
//! L_STICK@+100+000 DPAD_UP 1.5s
//! ```
//!
//! Each step is a set of buttons and stick directives held for a duration.
//! A line that only holds a duration is a neutral wait. `LOOP n` repeats the
//! indented block below it. Parsing is all-or-nothing: any bad token rejects
//! the whole macro.

use super::buttons::{Button, ButtonMask, InputPayload, StickPosition};
use std::time::Duration;
use thiserror::Error;

/// Longest a single step may hold its input
pub const MAX_STEP_DURATION: Duration = Duration::from_secs(24 * 60 * 60);
/// Upper bound on steps after `LOOP` expansion
pub const MAX_MACRO_STEPS: usize = 100_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MacroParseError {
    #[error("line {line}: unknown token `{token}`")]
    UnknownToken { line: usize, token: String },

    #[error("line {line}: invalid duration `{token}`")]
    InvalidDuration { line: usize, token: String },

    #[error("line {line}: step `{token}` has no duration")]
    MissingDuration { line: usize, token: String },

    #[error("line {line}: invalid stick directive `{token}`")]
    InvalidStick { line: usize, token: String },

    #[error("line {line}: invalid loop count `{token}`")]
    InvalidLoopCount { line: usize, token: String },

    #[error("line {line}: `{token}` has no indented body")]
    EmptyLoop { line: usize, token: String },

    #[error("line {line}: `{token}` expands past {} steps", MAX_MACRO_STEPS)]
    TooManySteps { line: usize, token: String },

    #[error("macro contains no steps")]
    Empty,
}

/// One parsed macro step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroStep {
    pub buttons: ButtonMask,
    pub left_stick: StickPosition,
    pub right_stick: StickPosition,
    pub duration: Duration,
}

impl MacroStep {
    pub fn payload(&self) -> InputPayload {
        InputPayload {
            buttons: self.buttons,
            left_stick: self.left_stick,
            right_stick: self.right_stick,
        }
    }
}

struct Line<'a> {
    number: usize,
    indent: usize,
    text: &'a str,
}

pub fn parse_macro(text: &str) -> Result<Vec<MacroStep>, MacroParseError> {
    let lines: Vec<Line<'_>> = text
        .lines()
        .enumerate()
        .filter_map(|(i, raw)| {
            let content = raw.split('#').next().unwrap_or_default();
            let trimmed = content.trim();
            if trimmed.is_empty() {
                return None;
            }
            Some(Line {
                number: i + 1,
                indent: indent_width(content),
                text: trimmed,
            })
        })
        .collect();

    let steps = parse_block(&lines)?;
    if steps.is_empty() {
        return Err(MacroParseError::Empty);
    }
    Ok(steps)
}

/// Total time the macro holds input, cooldowns excluded
pub fn total_duration(steps: &[MacroStep]) -> Duration {
    steps.iter().map(|step| step.duration).sum()
}

fn indent_width(line: &str) -> usize {
    line.chars()
        .take_while(|c| c.is_whitespace())
        .map(|c| if c == '\t' { 4 } else { 1 })
        .sum()
}

fn parse_block(lines: &[Line<'_>]) -> Result<Vec<MacroStep>, MacroParseError> {
    let mut steps = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = &lines[i];
        let mut tokens = line.text.split_whitespace();
        let first = tokens.next().unwrap_or_default();

        if !first.eq_ignore_ascii_case("LOOP") {
            if steps.len() >= MAX_MACRO_STEPS {
                return Err(MacroParseError::TooManySteps {
                    line: line.number,
                    token: line.text.to_string(),
                });
            }
            steps.push(parse_step(line)?);
            i += 1;
            continue;
        }

        let count_token = tokens.next().unwrap_or_default();
        let count: usize = count_token
            .parse()
            .map_err(|_| MacroParseError::InvalidLoopCount {
                line: line.number,
                token: count_token.to_string(),
            })?;
        if let Some(extra) = tokens.next() {
            return Err(MacroParseError::UnknownToken {
                line: line.number,
                token: extra.to_string(),
            });
        }

        let body_start = i + 1;
        let mut body_end = body_start;
        while body_end < lines.len() && lines[body_end].indent > line.indent {
            body_end += 1;
        }
        if body_end == body_start {
            return Err(MacroParseError::EmptyLoop {
                line: line.number,
                token: line.text.to_string(),
            });
        }

        let body = parse_block(&lines[body_start..body_end])?;
        let expanded = body
            .len()
            .checked_mul(count)
            .and_then(|n| n.checked_add(steps.len()))
            .filter(|&n| n <= MAX_MACRO_STEPS);
        if expanded.is_none() {
            return Err(MacroParseError::TooManySteps {
                line: line.number,
                token: line.text.to_string(),
            });
        }
        for _ in 0..count {
            steps.extend(body.iter().cloned());
        }
        i = body_end;
    }

    Ok(steps)
}

fn parse_step(line: &Line<'_>) -> Result<MacroStep, MacroParseError> {
    let tokens: Vec<&str> = line.text.split_whitespace().collect();
    let Some((last, inputs)) = tokens.split_last() else {
        return Err(MacroParseError::Empty);
    };

    let duration = match parse_duration(last) {
        Some(duration) => duration,
        None if looks_like_duration(last) => {
            return Err(MacroParseError::InvalidDuration {
                line: line.number,
                token: last.to_string(),
            })
        }
        None => {
            return Err(MacroParseError::MissingDuration {
                line: line.number,
                token: last.to_string(),
            })
        }
    };

    let mut step = MacroStep {
        buttons: ButtonMask::NONE,
        left_stick: StickPosition::CENTER,
        right_stick: StickPosition::CENTER,
        duration,
    };

    for token in inputs {
        if let Some((stick, value)) = token.split_once('@') {
            let position = parse_stick(value).ok_or_else(|| MacroParseError::InvalidStick {
                line: line.number,
                token: token.to_string(),
            })?;
            match stick.to_ascii_uppercase().as_str() {
                "L_STICK" => step.left_stick = position,
                "R_STICK" => step.right_stick = position,
                _ => {
                    return Err(MacroParseError::InvalidStick {
                        line: line.number,
                        token: token.to_string(),
                    })
                }
            }
            continue;
        }

        let button: Button = token.parse().map_err(|_| MacroParseError::UnknownToken {
            line: line.number,
            token: token.to_string(),
        })?;
        step.buttons = step.buttons.with(button);
    }

    Ok(step)
}

fn looks_like_duration(token: &str) -> bool {
    token.starts_with(|c: char| c.is_ascii_digit() || c == '.')
}

/// `0.5s`, `500ms`. Anything above [`MAX_STEP_DURATION`] is rejected.
fn parse_duration(token: &str) -> Option<Duration> {
    let lower = token.to_ascii_lowercase();
    let (number, scale) = if let Some(ms) = lower.strip_suffix("ms") {
        (ms, 0.001)
    } else if let Some(s) = lower.strip_suffix('s') {
        (s, 1.0)
    } else {
        return None;
    };
    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(value * scale)
        .ok()
        .filter(|duration| *duration <= MAX_STEP_DURATION)
}

/// `+000+100` => x = 0, y = 100
fn parse_stick(value: &str) -> Option<StickPosition> {
    if !value.starts_with(['+', '-']) {
        return None;
    }
    let split = value[1..].find(['+', '-'])? + 1;
    let (x, y) = value.split_at(split);
    let x: i16 = x.parse().ok()?;
    let y: i16 = y.parse().ok()?;
    if !(-100..=100).contains(&x) || !(-100..=100).contains(&y) {
        return None;
    }
    Some(StickPosition::new(x as i8, y as i8))
}
