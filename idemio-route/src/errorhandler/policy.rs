use crate::exchange::Exchange;
use crate::expression::SharedPredicate;
use crate::logger::LoggingLevel;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DelayPatternError {
    #[error("Delay pattern group '{group}' must be of the form 'threshold:delay'")]
    MalformedGroup { group: String },

    #[error("Delay pattern group '{group}' contains an invalid number")]
    InvalidNumber { group: String },
}

impl DelayPatternError {
    #[inline]
    const fn malformed_group(group: String) -> Self {
        Self::MalformedGroup { group }
    }

    #[inline]
    const fn invalid_number(group: String) -> Self {
        Self::InvalidNumber { group }
    }
}

/// A lookup table of attempt thresholds to delays, written as `threshold:delayMs;...`.
///
/// Groups are read left to right; the delay of the last group whose threshold does not
/// exceed the attempt wins. Attempts below the first threshold get no delay.
///
/// ```rust
/// use idemio_route::errorhandler::DelayPattern;
///
/// let pattern: DelayPattern = "0:1000;5:5000;10:20000".parse().unwrap();
/// assert_eq!(pattern.delay_for(4), 1000);
/// assert_eq!(pattern.delay_for(5), 5000);
/// assert_eq!(pattern.delay_for(20), 20000);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DelayPattern {
    groups: Vec<(u32, u64)>,
}

impl DelayPattern {
    pub fn groups(&self) -> &[(u32, u64)] {
        &self.groups
    }

    pub fn delay_for(&self, attempt: u32) -> u64 {
        let mut delay = 0;
        for &(threshold, group_delay) in &self.groups {
            if threshold > attempt {
                break;
            }
            delay = group_delay;
        }
        delay
    }
}

impl FromStr for DelayPattern {
    type Err = DelayPatternError;

    fn from_str(pattern: &str) -> Result<Self, Self::Err> {
        let mut groups = Vec::new();
        for group in pattern.split(';').map(str::trim).filter(|g| !g.is_empty()) {
            let Some((threshold, delay)) = group.split_once(':') else {
                return Err(DelayPatternError::malformed_group(group.to_string()));
            };
            let threshold = threshold
                .trim()
                .parse::<u32>()
                .map_err(|_| DelayPatternError::invalid_number(group.to_string()))?;
            let delay = delay
                .trim()
                .parse::<u64>()
                .map_err(|_| DelayPatternError::invalid_number(group.to_string()))?;
            groups.push((threshold, delay));
        }
        Ok(Self { groups })
    }
}

impl TryFrom<String> for DelayPattern {
    type Error = DelayPatternError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DelayPattern> for String {
    fn from(pattern: DelayPattern) -> Self {
        pattern.to_string()
    }
}

impl Display for DelayPattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let text = self
            .groups
            .iter()
            .map(|(threshold, delay)| format!("{}:{}", threshold, delay))
            .collect::<Vec<_>>()
            .join(";");
        f.write_str(&text)
    }
}

/// How often and how fast an error handler redelivers, and what it logs while doing so.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedeliveryPolicy {
    #[serde(alias = "redeliveryDelay")]
    pub redelivery_delay_ms: u64,
    /// Negative means redeliver forever.
    #[serde(alias = "maximumRedeliveries")]
    pub maximum_redeliveries: i32,
    #[serde(alias = "maximumRedeliveryDelay")]
    pub maximum_redelivery_delay_ms: u64,
    #[serde(alias = "backOffMultiplier")]
    pub back_off_multiplier: f64,
    #[serde(alias = "useExponentialBackOff")]
    pub use_exponential_back_off: bool,
    #[serde(alias = "collisionAvoidanceFactor")]
    pub collision_avoidance_factor: f64,
    #[serde(alias = "useCollisionAvoidance")]
    pub use_collision_avoidance: bool,
    #[serde(alias = "delayPattern")]
    pub delay_pattern: Option<DelayPattern>,
    #[serde(alias = "retriesExhaustedLogLevel")]
    pub retries_exhausted_log_level: LoggingLevel,
    #[serde(alias = "retryAttemptedLogLevel")]
    pub retry_attempted_log_level: LoggingLevel,
    #[serde(alias = "retryAttemptedLogInterval")]
    pub retry_attempted_log_interval: u32,
    #[serde(alias = "logStackTrace")]
    pub log_stack_trace: bool,
    #[serde(alias = "logRetryStackTrace")]
    pub log_retry_stack_trace: bool,
    #[serde(alias = "logHandled")]
    pub log_handled: bool,
    #[serde(alias = "logContinued")]
    pub log_continued: bool,
    #[serde(alias = "logExhausted")]
    pub log_exhausted: bool,
    #[serde(alias = "logNewException")]
    pub log_new_exception: bool,
    #[serde(alias = "logRetryAttempted")]
    pub log_retry_attempted: bool,
    #[serde(alias = "allowRedeliveryWhileStopping")]
    pub allow_redelivery_while_stopping: bool,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            redelivery_delay_ms: 1000,
            maximum_redeliveries: 0,
            maximum_redelivery_delay_ms: 60_000,
            back_off_multiplier: 2.0,
            use_exponential_back_off: false,
            collision_avoidance_factor: 0.15,
            use_collision_avoidance: false,
            delay_pattern: None,
            retries_exhausted_log_level: LoggingLevel::ERROR,
            retry_attempted_log_level: LoggingLevel::DEBUG,
            retry_attempted_log_interval: 1,
            log_stack_trace: true,
            log_retry_stack_trace: false,
            log_handled: false,
            log_continued: false,
            log_exhausted: true,
            log_new_exception: true,
            log_retry_attempted: true,
            allow_redelivery_while_stopping: true,
        }
    }
}

impl RedeliveryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn maximum_redeliveries(mut self, maximum: i32) -> Self {
        self.maximum_redeliveries = maximum;
        self
    }

    pub fn redelivery_delay(mut self, delay_ms: u64) -> Self {
        self.redelivery_delay_ms = delay_ms;
        self
    }

    pub fn maximum_redelivery_delay(mut self, delay_ms: u64) -> Self {
        self.maximum_redelivery_delay_ms = delay_ms;
        self
    }

    pub fn exponential_back_off(mut self, multiplier: f64) -> Self {
        self.use_exponential_back_off = true;
        self.back_off_multiplier = multiplier;
        self
    }

    pub fn collision_avoidance(mut self, factor: f64) -> Self {
        self.use_collision_avoidance = true;
        self.collision_avoidance_factor = factor;
        self
    }

    pub fn delay_pattern(mut self, pattern: DelayPattern) -> Self {
        self.delay_pattern = Some(pattern);
        self
    }

    pub fn allow_redelivery_while_stopping(mut self, allow: bool) -> Self {
        self.allow_redelivery_while_stopping = allow;
        self
    }

    pub fn retries_exhausted_log_level(mut self, level: LoggingLevel) -> Self {
        self.retries_exhausted_log_level = level;
        self
    }

    pub fn retry_attempted_log_level(mut self, level: LoggingLevel) -> Self {
        self.retry_attempted_log_level = level;
        self
    }

    pub fn log_handled(mut self, log: bool) -> Self {
        self.log_handled = log;
        self
    }

    pub fn log_continued(mut self, log: bool) -> Self {
        self.log_continued = log;
        self
    }

    pub fn log_exhausted(mut self, log: bool) -> Self {
        self.log_exhausted = log;
        self
    }

    pub fn log_retry_attempted(mut self, log: bool) -> Self {
        self.log_retry_attempted = log;
        self
    }

    pub fn log_stack_trace(mut self, log: bool) -> Self {
        self.log_stack_trace = log;
        self
    }

    /// Whether attempt `counter` (1 for the first redelivery) should go ahead.
    ///
    /// A `retry_while` predicate decides on its own; otherwise a negative maximum redelivers
    /// forever.
    pub fn should_redeliver(
        &self,
        exchange: &Exchange,
        counter: u32,
        retry_while: Option<&SharedPredicate>,
    ) -> bool {
        if let Some(retry_while) = retry_while {
            return retry_while.matches(exchange);
        }
        if self.maximum_redeliveries < 0 {
            return true;
        }
        counter <= self.maximum_redeliveries as u32
    }

    /// The delay before redelivery `counter`, given the delay used before the previous one.
    pub fn calculate_redelivery_delay(&self, previous_delay: u64, counter: u32) -> u64 {
        if let Some(pattern) = &self.delay_pattern
            && !pattern.groups.is_empty()
        {
            return pattern.delay_for(counter);
        }

        let mut delay = if previous_delay == 0 {
            self.redelivery_delay_ms
        } else if self.use_exponential_back_off && self.back_off_multiplier > 1.0 {
            (self.back_off_multiplier * previous_delay as f64).round() as u64
        } else {
            previous_delay
        };

        if self.use_collision_avoidance {
            let mut rng = rand::rng();
            let direction = if rng.random_bool(0.5) { 1.0 } else { -1.0 };
            let variance = direction * self.collision_avoidance_factor * rng.random::<f64>();
            delay = (delay as f64 + delay as f64 * variance).max(0.0) as u64;
        }

        if self.maximum_redelivery_delay_ms > 0 && delay > self.maximum_redelivery_delay_ms {
            delay = self.maximum_redelivery_delay_ms;
        }
        delay
    }

    /// Whether retry attempt `counter` falls on the logging interval.
    pub(crate) fn is_retry_logged(&self, counter: u32) -> bool {
        let interval = self.retry_attempted_log_interval.max(1);
        counter % interval == 0
    }
}

/// Values an exception policy changes on the error handler's redelivery policy.
///
/// Unset fields keep the error handler's value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedeliveryPolicyOverride {
    #[serde(alias = "redeliveryDelay")]
    pub redelivery_delay_ms: Option<u64>,
    #[serde(alias = "maximumRedeliveries")]
    pub maximum_redeliveries: Option<i32>,
    #[serde(alias = "maximumRedeliveryDelay")]
    pub maximum_redelivery_delay_ms: Option<u64>,
    #[serde(alias = "backOffMultiplier")]
    pub back_off_multiplier: Option<f64>,
    #[serde(alias = "useExponentialBackOff")]
    pub use_exponential_back_off: Option<bool>,
    #[serde(alias = "useCollisionAvoidance")]
    pub use_collision_avoidance: Option<bool>,
    #[serde(alias = "delayPattern")]
    pub delay_pattern: Option<DelayPattern>,
    #[serde(alias = "retriesExhaustedLogLevel")]
    pub retries_exhausted_log_level: Option<LoggingLevel>,
    #[serde(alias = "retryAttemptedLogLevel")]
    pub retry_attempted_log_level: Option<LoggingLevel>,
    #[serde(alias = "logHandled")]
    pub log_handled: Option<bool>,
    #[serde(alias = "logContinued")]
    pub log_continued: Option<bool>,
    #[serde(alias = "logExhausted")]
    pub log_exhausted: Option<bool>,
    #[serde(alias = "logRetryAttempted")]
    pub log_retry_attempted: Option<bool>,
    #[serde(alias = "allowRedeliveryWhileStopping")]
    pub allow_redelivery_while_stopping: Option<bool>,
}

impl RedeliveryPolicyOverride {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&self, base: &RedeliveryPolicy) -> RedeliveryPolicy {
        let mut policy = base.clone();
        if let Some(value) = self.redelivery_delay_ms {
            policy.redelivery_delay_ms = value;
        }
        if let Some(value) = self.maximum_redeliveries {
            policy.maximum_redeliveries = value;
        }
        if let Some(value) = self.maximum_redelivery_delay_ms {
            policy.maximum_redelivery_delay_ms = value;
        }
        if let Some(value) = self.back_off_multiplier {
            policy.back_off_multiplier = value;
        }
        if let Some(value) = self.use_exponential_back_off {
            policy.use_exponential_back_off = value;
        }
        if let Some(value) = self.use_collision_avoidance {
            policy.use_collision_avoidance = value;
        }
        if let Some(value) = &self.delay_pattern {
            policy.delay_pattern = Some(value.clone());
        }
        if let Some(value) = self.retries_exhausted_log_level {
            policy.retries_exhausted_log_level = value;
        }
        if let Some(value) = self.retry_attempted_log_level {
            policy.retry_attempted_log_level = value;
        }
        if let Some(value) = self.log_handled {
            policy.log_handled = value;
        }
        if let Some(value) = self.log_continued {
            policy.log_continued = value;
        }
        if let Some(value) = self.log_exhausted {
            policy.log_exhausted = value;
        }
        if let Some(value) = self.log_retry_attempted {
            policy.log_retry_attempted = value;
        }
        if let Some(value) = self.allow_redelivery_while_stopping {
            policy.allow_redelivery_while_stopping = value;
        }
        policy
    }
}
