//! Reconnect schedules and circuit breakers for external collaborators
//!
//! Backoff comes from `backon`, circuit breaking from `failsafe`. Both are
//! driven by the configuration types in [`crate::config`] so operators can
//! tune them without a rebuild.

pub mod backoff {
    //! Exponential reconnect delays with jitter and no attempt cap

    use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
    use std::time::Duration;

    use crate::config::RetryPolicy;

    /// Build an unbounded exponential schedule from a policy
    #[must_use]
    pub fn schedule(policy: &RetryPolicy) -> ExponentialBackoff {
        let mut builder = ExponentialBuilder::default()
            .with_min_delay(policy.min_delay())
            .with_max_delay(policy.max_delay())
            .with_factor(policy.factor)
            .without_max_times();
        if policy.jitter {
            builder = builder.with_jitter();
        }
        builder.build()
    }

    /// Stateful reconnect schedule that can be rewound after a healthy session
    pub struct Backoff {
        policy: RetryPolicy,
        schedule: ExponentialBackoff,
    }

    impl Backoff {
        #[must_use]
        pub fn new(policy: RetryPolicy) -> Self {
            Self {
                schedule: schedule(&policy),
                policy,
            }
        }

        /// Delay to wait before the next attempt, rounded to whole
        /// milliseconds and never above the policy maximum (jitter included)
        pub fn next_delay(&mut self) -> Duration {
            let max = self.policy.max_delay();
            let delay = self.schedule.next().unwrap_or(max);
            let millis = u64::try_from((delay.as_micros() + 500) / 1000).unwrap_or(u64::MAX);
            Duration::from_millis(millis).min(max)
        }

        /// Start over from the minimum delay
        pub fn reset(&mut self) {
            self.schedule = schedule(&self.policy);
        }

        #[must_use]
        pub const fn policy(&self) -> &RetryPolicy {
            &self.policy
        }
    }
}

pub mod circuit_breaker {
    //! Circuit breaker pattern for external services
    //!
    //! Uses the `failsafe` crate; a policy with a zero failure threshold
    //! yields a breaker that always permits calls.

    use std::time::Duration;

    use crate::config::BreakerPolicy;

    pub type StateMachine = failsafe::StateMachine<
        failsafe::failure_policy::ConsecutiveFailures<failsafe::backoff::Exponential>,
        (),
    >;

    /// Create a circuit breaker that opens after `failure_threshold`
    /// consecutive failures and stays open for an exponentially growing
    /// period between `min_backoff` and `max_backoff`.
    #[must_use]
    pub fn create(failure_threshold: u32, min_backoff: Duration, max_backoff: Duration) -> StateMachine {
        // failsafe requires the open period to start at one second or more
        let min_backoff = min_backoff.max(Duration::from_secs(1));
        let max_backoff = max_backoff.max(min_backoff);
        let backoff = failsafe::backoff::exponential(min_backoff, max_backoff);
        let policy = failsafe::failure_policy::consecutive_failures(failure_threshold, backoff);
        failsafe::Config::new().failure_policy(policy).build()
    }

    /// Breaker built from configuration, possibly disabled
    pub struct Breaker {
        inner: Option<StateMachine>,
    }

    impl Breaker {
        #[must_use]
        pub fn from_policy(policy: &BreakerPolicy) -> Self {
            let inner = policy.is_enabled().then(|| {
                create(
                    policy.failure_threshold,
                    Duration::from_secs(policy.min_backoff_seconds),
                    Duration::from_secs(policy.max_backoff_seconds),
                )
            });
            Self { inner }
        }

        #[must_use]
        pub fn is_call_permitted(&self) -> bool {
            self.inner.as_ref().is_none_or(|inner| inner.is_call_permitted())
        }

        pub fn on_success(&self) {
            if let Some(inner) = &self.inner {
                inner.on_success();
            }
        }

        pub fn on_error(&self) {
            if let Some(inner) = &self.inner {
                inner.on_error();
            }
        }
    }
}
