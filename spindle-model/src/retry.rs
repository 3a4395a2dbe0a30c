//! Retry schedules.
//!
//! A schedule is an ordered list of `(interval, attempts)` pairs; the last
//! pair may allow unlimited attempts (`+`). Each failure consumes one
//! attempt of the current pair; a successful refresh resets the whole
//! schedule.

use crate::types::ModelError;
use std::time::Duration;

/// Attempt budget for one schedule step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Attempts {
    Finite(u32),
    Forever,
}

/// Immutable configured schedule.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RetrySchedule {
    steps: Vec<(u64, Attempts)>,
}

impl RetrySchedule {
    /// Parse the `"interval count interval count ..."` directive form, where
    /// count is a number or `+` for forever. `+` is only valid on the last
    /// pair.
    pub fn parse(raw: &str) -> Result<Self, ModelError> {
        let toks: Vec<&str> = raw.split_whitespace().collect();
        if toks.is_empty() || toks.len() % 2 != 0 {
            return Err(ModelError::BadRetry(format!(
                "expected interval/count pairs, got {raw:?}"
            )));
        }
        let mut steps = Vec::with_capacity(toks.len() / 2);
        for (i, pair) in toks.chunks(2).enumerate() {
            let secs: u64 = pair[0]
                .parse()
                .map_err(|_| ModelError::BadRetry(format!("bad interval {:?}", pair[0])))?;
            let attempts = if pair[1] == "+" {
                if (i + 1) * 2 != toks.len() {
                    return Err(ModelError::BadRetry(
                        "unlimited count only allowed on the last pair".into(),
                    ));
                }
                Attempts::Forever
            } else {
                let n: u32 = pair[1]
                    .parse()
                    .map_err(|_| ModelError::BadRetry(format!("bad count {:?}", pair[1])))?;
                Attempts::Finite(n)
            };
            steps.push((secs, attempts));
        }
        Ok(RetrySchedule { steps })
    }

    pub fn state(&self) -> RetryState {
        RetryState {
            schedule: self.clone(),
            remaining: self.steps.iter().map(|(_, a)| *a).collect(),
        }
    }
}

/// Mutable per-source retry position.
#[derive(Debug, Clone)]
pub struct RetryState {
    schedule: RetrySchedule,
    remaining: Vec<Attempts>,
}

impl RetryState {
    /// Consume one failure. Returns the interval to wait before the next
    /// attempt, or `None` when the schedule is exhausted (remove the task).
    pub fn next_failure(&mut self) -> Option<Duration> {
        for (i, remaining) in self.remaining.iter_mut().enumerate() {
            match remaining {
                Attempts::Forever => {
                    return Some(Duration::from_secs(self.schedule.steps[i].0));
                }
                Attempts::Finite(0) => continue,
                Attempts::Finite(n) => {
                    *n -= 1;
                    return Some(Duration::from_secs(self.schedule.steps[i].0));
                }
            }
        }
        None
    }

    /// Reinitialize every counter. Called after meaningful progress
    /// (a refresh that reached refreshDone).
    pub fn reset(&mut self) {
        self.remaining = self.schedule.steps.iter().map(|(_, a)| *a).collect();
    }
}
