//! Readiness and error-output detection over PTY output.
//!
//! One checker of each kind exists per runner generation; restarts get fresh
//! instances. Both keep at most [`OUTPUT_BUFFER_CAP`] bytes of history,
//! dropping the head so patterns arriving late still match against the tail.

use std::collections::HashMap;

use crate::color::strip_ansi;
use crate::config::{ErrorMatcher, ReadyPattern};

/// Cap on the match buffers; the tail is kept when it overflows.
pub const OUTPUT_BUFFER_CAP: usize = 64 * 1024;

/// Decides when a process counts as ready.
#[derive(Debug)]
pub struct ReadinessChecker {
    pattern: Option<ReadyPattern>,
    persistent: bool,
    buffer: String,
    matched: bool,
    captures: HashMap<String, String>,
}

impl ReadinessChecker {
    pub fn new(persistent: bool, pattern: Option<ReadyPattern>) -> Self {
        // A one-shot is ready when it exits cleanly; a pattern on it has no
        // effect (the validator warns about the combination).
        let pattern = if persistent { pattern } else { None };
        Self {
            pattern,
            persistent,
            buffer: String::new(),
            matched: false,
            captures: HashMap::new(),
        }
    }

    /// Persistent processes without a pattern are ready the moment they spawn.
    pub fn is_immediately_ready(&self) -> bool {
        self.persistent && self.pattern.is_none()
    }

    /// One-shot processes are ready when they exit cleanly.
    pub fn depends_on_exit(&self) -> bool {
        !self.persistent
    }

    /// Feeds a decoded output chunk; returns `true` the first time the
    /// pattern matches. Matching runs against ANSI-stripped text.
    pub fn feed(&mut self, chunk: &str) -> bool {
        if self.matched {
            return false;
        }
        let Some(pattern) = &self.pattern else {
            return false;
        };
        self.buffer.push_str(&strip_ansi(chunk));
        trim_to_tail(&mut self.buffer);
        let Some(found) = pattern.regex().captures(&self.buffer) else {
            return false;
        };
        self.matched = true;
        if pattern.keeps_captures() {
            let names: Vec<Option<&str>> = pattern.regex().capture_names().collect();
            for (index, group) in found.iter().enumerate().skip(1) {
                let Some(group) = group else { continue };
                self.captures
                    .insert(index.to_string(), group.as_str().to_string());
                if let Some(Some(name)) = names.get(index) {
                    self.captures.insert((*name).to_string(), group.as_str().to_string());
                }
            }
        }
        true
    }

    /// Capture groups from the first match; populated only for compiled
    /// patterns, keyed by group name and 1-based index.
    pub fn captures(&self) -> &HashMap<String, String> {
        &self.captures
    }
}

/// One-shot detector for error output.
#[derive(Debug)]
pub struct ErrorChecker {
    matcher: ErrorMatcher,
    raw: String,
    stripped: String,
    fired: bool,
}

impl ErrorChecker {
    pub fn new(matcher: ErrorMatcher) -> Self {
        Self {
            matcher,
            raw: String::new(),
            stripped: String::new(),
            fired: false,
        }
    }

    /// Feeds a decoded output chunk; returns `true` at most once.
    pub fn feed(&mut self, chunk: &str) -> bool {
        if self.fired {
            return false;
        }
        let hit = match &self.matcher {
            ErrorMatcher::AnsiRed => {
                self.raw.push_str(chunk);
                trim_to_tail(&mut self.raw);
                sgr_selects_red(&self.raw)
            }
            ErrorMatcher::Pattern(regex) => {
                self.stripped.push_str(&strip_ansi(chunk));
                trim_to_tail(&mut self.stripped);
                regex.is_match(&self.stripped)
            }
        };
        if hit {
            self.fired = true;
        }
        hit
    }
}

fn trim_to_tail(buffer: &mut String) {
    if buffer.len() <= OUTPUT_BUFFER_CAP {
        return;
    }
    let mut cut = buffer.len() - OUTPUT_BUFFER_CAP;
    while !buffer.is_char_boundary(cut) {
        cut += 1;
    }
    buffer.drain(..cut);
}

/// Scans SGR sequences for a parameter selecting red (31) or bright red (91).
fn sgr_selects_red(text: &str) -> bool {
    let mut rest = text;
    while let Some(start) = rest.find("\u{1b}[") {
        rest = &rest[start + 2..];
        let Some(end) = rest.find(|c| ('@'..='~').contains(&c)) else {
            return false;
        };
        let (params, tail) = rest.split_at(end);
        if tail.starts_with('m')
            && params
                .split(';')
                .any(|param| matches!(param.parse::<i32>(), Ok(31) | Ok(91)))
        {
            return true;
        }
        rest = &tail[1..];
    }
    false
}
