//! Abuse containment for inbound sessions.
//!
//! Every command class keeps its own counter. Past the class threshold each
//! further command is delayed, doubling each time, so a client that hammers
//! one command slows itself down without affecting well behaved peers. Bad
//! commands are counted separately and end the session at a hard cap.

use std::time::Duration;

use serde::Deserialize;
use tern_common::{EnhancedStatus, Reply, Status};

use crate::command::Verb;

const MAX_DELAY: Duration = Duration::from_secs(240);

const fn default_bad_commands() -> u32 {
    25
}

const fn default_noise() -> u32 {
    20
}

const fn default_structural() -> u32 {
    3
}

const fn default_vrfy() -> u32 {
    6
}

const fn default_etrn() -> u32 {
    8
}

const fn default_rcpt() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThrottleConfig {
    /// Bad commands tolerated before the session is dropped
    #[serde(default = "default_bad_commands")]
    pub bad_commands: u32,
    /// `NOOP`, `VERB`, `HELP` and `RSET`
    #[serde(default = "default_noise")]
    pub noise: u32,
    /// `HELO`, `EHLO`, `STARTTLS` and `AUTH`
    #[serde(default = "default_structural")]
    pub structural: u32,
    /// `VRFY` and `EXPN`
    #[serde(default = "default_vrfy")]
    pub vrfy: u32,
    #[serde(default = "default_etrn")]
    pub etrn: u32,
    /// Recipients per transaction accepted without delay (`0` disables)
    #[serde(default = "default_rcpt")]
    pub rcpt: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            bad_commands: default_bad_commands(),
            noise: default_noise(),
            structural: default_structural(),
            vrfy: default_vrfy(),
            etrn: default_etrn(),
            rcpt: default_rcpt(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    Noise,
    Structural,
    Vrfy,
    Etrn,
}

impl Class {
    const fn of(verb: Verb) -> Option<Self> {
        match verb {
            Verb::Noop | Verb::Verb | Verb::Help | Verb::Rset => Some(Self::Noise),
            Verb::Helo | Verb::Ehlo | Verb::StartTls | Verb::Auth => Some(Self::Structural),
            Verb::Vrfy | Verb::Expn => Some(Self::Vrfy),
            Verb::Etrn => Some(Self::Etrn),
            _ => None,
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Noise => 0,
            Self::Structural => 1,
            Self::Vrfy => 2,
            Self::Etrn => 3,
        }
    }
}

fn backoff(count: u32, threshold: u32) -> Option<Duration> {
    if count <= threshold {
        return None;
    }

    let exponent = (count - threshold - 1).min(8);
    Some(Duration::from_secs(1u64 << exponent).min(MAX_DELAY))
}

#[derive(Debug)]
pub struct Throttle {
    config: ThrottleConfig,
    counts: [u32; 4],
    bad: u32,
    rcpts: u32,
}

impl Throttle {
    pub const fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            counts: [0; 4],
            bad: 0,
            rcpts: 0,
        }
    }

    const fn threshold(&self, class: Class) -> u32 {
        match class {
            Class::Noise => self.config.noise,
            Class::Structural => self.config.structural,
            Class::Vrfy => self.config.vrfy,
            Class::Etrn => self.config.etrn,
        }
    }

    /// Counts a command and returns how long to stall before answering it
    pub fn command(&mut self, verb: Verb) -> Option<Duration> {
        let class = Class::of(verb)?;
        let count = &mut self.counts[class.index()];
        *count = count.saturating_add(1);
        let count = *count;

        backoff(count, self.threshold(class))
    }

    /// Counts a recipient in the current transaction
    pub fn recipient(&mut self) -> Option<Duration> {
        self.rcpts = self.rcpts.saturating_add(1);
        if self.config.rcpt == 0 {
            return None;
        }
        backoff(self.rcpts, self.config.rcpt)
    }

    pub const fn reset_transaction(&mut self) {
        self.rcpts = 0;
    }

    /// Counts a rejected command.
    ///
    /// Returns the reply that ends the session once the cap is reached.
    pub fn bad_command(&mut self, hostname: &str) -> Option<Reply> {
        self.bad = self.bad.saturating_add(1);

        (self.config.bad_commands > 0 && self.bad >= self.config.bad_commands).then(|| {
            Reply::new(
                Status::Unavailable,
                Some(EnhancedStatus::new(4, 7, 0)),
                format!("{hostname} Too many bad commands; closing connection"),
            )
        })
    }

    pub const fn bad_commands(&self) -> u32 {
        self.bad
    }
}
