use std::collections::HashMap;
use std::time::Duration;

use backoff::strategy::exponential::Exponential;
use eventflow_shared::stream::StartPosition;

use crate::error::{Error, Result};
use crate::handler::FailurePolicy;

pub const DEFAULT_CONSUMER_GROUP: &str = "$Default";

const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(3);
const DEFAULT_RENEW_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_READ_RETRY_WINDOW: Duration = Duration::from_secs(30);
const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_WAIT_TIME: Duration = Duration::from_millis(100);
const DEFAULT_CHANNEL_CAPACITY: usize = 500;

const ENV_STREAM_ID: &str = "EVENTFLOW_STREAM_ID";
const ENV_CONSUMER_GROUP: &str = "EVENTFLOW_CONSUMER_GROUP";
const ENV_INSTANCE_ID: &str = "EVENTFLOW_INSTANCE_ID";
const ENV_LEASE_DURATION_MS: &str = "EVENTFLOW_LEASE_DURATION_MS";
const ENV_RENEW_INTERVAL_MS: &str = "EVENTFLOW_RENEW_INTERVAL_MS";
const ENV_RENEW_TIMEOUT_MS: &str = "EVENTFLOW_RENEW_TIMEOUT_MS";
const ENV_BALANCE_INTERVAL_MS: &str = "EVENTFLOW_BALANCE_INTERVAL_MS";
const ENV_HANDLER_TIMEOUT_MS: &str = "EVENTFLOW_HANDLER_TIMEOUT_MS";
const ENV_SHUTDOWN_TIMEOUT_MS: &str = "EVENTFLOW_SHUTDOWN_TIMEOUT_MS";
const ENV_MAX_BATCH_SIZE: &str = "EVENTFLOW_MAX_BATCH_SIZE";
const ENV_MAX_WAIT_TIME_MS: &str = "EVENTFLOW_MAX_WAIT_TIME_MS";
const ENV_CHECKPOINT_EVERY: &str = "EVENTFLOW_CHECKPOINT_EVERY";
const ENV_START_POSITION: &str = "EVENTFLOW_START_POSITION";
const ENV_FAILURE_POLICY: &str = "EVENTFLOW_FAILURE_POLICY";

/// Exponential backoff settings for a retried operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u16,
    pub base_interval: Duration,
    pub max_interval: Duration,
    pub factor: f64,
    pub jitter: f64,
}

impl RetryConfig {
    pub fn new(max_retries: u16, base_interval: Duration, max_interval: Duration) -> Self {
        Self {
            max_retries,
            base_interval,
            max_interval,
            factor: 2.0,
            jitter: 0.1,
        }
    }

    pub fn backoff(&self) -> Exponential {
        Exponential::new(
            self.base_interval,
            self.max_interval,
            self.factor,
            self.jitter,
            Some(self.max_retries),
        )
    }
}

/// Configuration of an [`EventProcessor`](crate::processor::EventProcessor).
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorConfig {
    pub stream_id: String,
    /// Instances in the same group share the partitions, different groups read independently.
    pub consumer_group: String,
    /// Unique per processor instance, defaults to a random UUID.
    pub instance_id: String,
    /// How long a lease stays valid without renewal.
    pub lease_duration: Duration,
    pub renew_interval: Duration,
    /// A renewal slower than this counts as ownership loss.
    pub renew_timeout: Duration,
    /// Defaults to half the renewal interval when unset.
    pub balance_interval: Option<Duration>,
    /// Upper bound of a single cursor read, cancellation is observed at this granularity.
    pub read_timeout: Duration,
    /// Total backoff spent on consecutive transient read errors before the partition faults.
    pub read_retry_window: Duration,
    pub read_retry: RetryConfig,
    pub handler_timeout: Duration,
    pub handler_retry: RetryConfig,
    pub failure_policy: FailurePolicy,
    pub store_retry: RetryConfig,
    pub shutdown_timeout: Duration,
    /// Where a partition without checkpoint starts.
    pub default_start_position: StartPosition,
    pub max_batch_size: usize,
    /// How long a batch waits to fill up before it is handed to the handler anyway.
    pub max_wait_time: Duration,
    /// Number of successful batches between checkpoint writes.
    pub checkpoint_every: usize,
    /// Records buffered between a partition's reader and its handler.
    pub channel_capacity: usize,
}

impl ProcessorConfig {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_interval: DEFAULT_RENEW_INTERVAL,
            renew_timeout: DEFAULT_RENEW_TIMEOUT,
            balance_interval: None,
            read_timeout: DEFAULT_READ_TIMEOUT,
            read_retry_window: DEFAULT_READ_RETRY_WINDOW,
            read_retry: RetryConfig::new(
                u16::MAX,
                Duration::from_millis(100),
                Duration::from_secs(5),
            ),
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            handler_retry: RetryConfig::new(3, Duration::from_millis(100), Duration::from_secs(2)),
            failure_policy: FailurePolicy::default(),
            store_retry: RetryConfig::new(3, Duration::from_millis(50), Duration::from_secs(1)),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            default_start_position: StartPosition::Earliest,
            max_batch_size: 1,
            max_wait_time: DEFAULT_MAX_WAIT_TIME,
            checkpoint_every: 1,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = consumer_group.into();
        self
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn with_renew_interval(mut self, renew_interval: Duration) -> Self {
        self.renew_interval = renew_interval;
        self
    }

    pub fn with_renew_timeout(mut self, renew_timeout: Duration) -> Self {
        self.renew_timeout = renew_timeout;
        self
    }

    pub fn with_balance_interval(mut self, balance_interval: Duration) -> Self {
        self.balance_interval = Some(balance_interval);
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_read_retry_window(mut self, read_retry_window: Duration) -> Self {
        self.read_retry_window = read_retry_window;
        self
    }

    pub fn with_handler_timeout(mut self, handler_timeout: Duration) -> Self {
        self.handler_timeout = handler_timeout;
        self
    }

    pub fn with_handler_retry(mut self, handler_retry: RetryConfig) -> Self {
        self.handler_retry = handler_retry;
        self
    }

    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    pub fn with_store_retry(mut self, store_retry: RetryConfig) -> Self {
        self.store_retry = store_retry;
        self
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    pub fn with_default_start_position(mut self, position: StartPosition) -> Self {
        self.default_start_position = position;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_max_wait_time(mut self, max_wait_time: Duration) -> Self {
        self.max_wait_time = max_wait_time;
        self
    }

    pub fn with_checkpoint_every(mut self, checkpoint_every: usize) -> Self {
        self.checkpoint_every = checkpoint_every;
        self
    }

    /// Interval of the balancing loop.
    pub fn balance_period(&self) -> Duration {
        self.balance_interval.unwrap_or(self.renew_interval / 2)
    }

    /// Backoff for transient read errors, bounded by the read retry window.
    pub(crate) fn read_backoff(&self) -> Exponential {
        self.read_retry
            .backoff()
            .with_retry_window(self.read_retry_window)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("stream_id", &self.stream_id),
            ("consumer_group", &self.consumer_group),
            ("instance_id", &self.instance_id),
        ] {
            if value.is_empty() {
                return Err(Error::Config(format!("{name} must not be empty")));
            }
            if value.contains('/') {
                return Err(Error::Config(format!("{name} must not contain '/': {value}")));
            }
        }

        if self.lease_duration.is_zero() {
            return Err(Error::Config("lease_duration must be positive".to_string()));
        }
        if self.renew_interval.is_zero() || self.renew_interval >= self.lease_duration {
            return Err(Error::Config(format!(
                "renew_interval ({:?}) must be positive and shorter than lease_duration ({:?})",
                self.renew_interval, self.lease_duration
            )));
        }
        if self.renew_timeout.is_zero() || self.renew_timeout >= self.lease_duration {
            return Err(Error::Config(format!(
                "renew_timeout ({:?}) must be positive and shorter than lease_duration ({:?})",
                self.renew_timeout, self.lease_duration
            )));
        }
        // an owner that cannot renew must give up before its lease can be taken
        if self.renew_interval + self.renew_timeout >= self.lease_duration {
            return Err(Error::Config(format!(
                "renew_interval ({:?}) plus renew_timeout ({:?}) must be shorter than lease_duration ({:?})",
                self.renew_interval, self.renew_timeout, self.lease_duration
            )));
        }
        if self.balance_period().is_zero() {
            return Err(Error::Config("balance interval must be positive".to_string()));
        }
        if self.read_timeout.is_zero() || self.handler_timeout.is_zero() {
            return Err(Error::Config(
                "read_timeout and handler_timeout must be positive".to_string(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(Error::Config("max_batch_size must be at least 1".to_string()));
        }
        if self.checkpoint_every == 0 {
            return Err(Error::Config("checkpoint_every must be at least 1".to_string()));
        }
        if self.channel_capacity == 0 {
            return Err(Error::Config("channel_capacity must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Loads the configuration from `EVENTFLOW_*` environment variables, durations are in
    /// milliseconds. Only the stream id is required.
    pub fn load(
        env_vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Result<Self> {
        let env_vars: HashMap<String, String> = env_vars
            .into_iter()
            .map(|(key, val)| (key.into(), val.into()))
            .filter(|(key, _val)| key.starts_with("EVENTFLOW_"))
            .collect();

        let stream_id = env_vars
            .get(ENV_STREAM_ID)
            .ok_or_else(|| Error::Config(format!("Environment variable {ENV_STREAM_ID} is not set")))?;
        let mut config = Self::new(stream_id.as_str());

        if let Some(group) = env_vars.get(ENV_CONSUMER_GROUP) {
            config.consumer_group = group.clone();
        }
        if let Some(instance_id) = env_vars.get(ENV_INSTANCE_ID) {
            config.instance_id = instance_id.clone();
        }

        let millis = |var: &str| -> Result<Option<Duration>> {
            env_vars
                .get(var)
                .map(|v| {
                    v.parse::<u64>()
                        .map(Duration::from_millis)
                        .map_err(|e| Error::Config(format!("Invalid {var}={v}: {e}")))
                })
                .transpose()
        };
        let count = |var: &str| -> Result<Option<usize>> {
            env_vars
                .get(var)
                .map(|v| {
                    v.parse::<usize>()
                        .map_err(|e| Error::Config(format!("Invalid {var}={v}: {e}")))
                })
                .transpose()
        };

        if let Some(d) = millis(ENV_LEASE_DURATION_MS)? {
            config.lease_duration = d;
        }
        if let Some(d) = millis(ENV_RENEW_INTERVAL_MS)? {
            config.renew_interval = d;
        }
        if let Some(d) = millis(ENV_RENEW_TIMEOUT_MS)? {
            config.renew_timeout = d;
        }
        config.balance_interval = millis(ENV_BALANCE_INTERVAL_MS)?;
        if let Some(d) = millis(ENV_HANDLER_TIMEOUT_MS)? {
            config.handler_timeout = d;
        }
        if let Some(d) = millis(ENV_SHUTDOWN_TIMEOUT_MS)? {
            config.shutdown_timeout = d;
        }
        if let Some(d) = millis(ENV_MAX_WAIT_TIME_MS)? {
            config.max_wait_time = d;
        }
        if let Some(n) = count(ENV_MAX_BATCH_SIZE)? {
            config.max_batch_size = n;
        }
        if let Some(n) = count(ENV_CHECKPOINT_EVERY)? {
            config.checkpoint_every = n;
        }

        if let Some(position) = env_vars.get(ENV_START_POSITION) {
            config.default_start_position = match position.to_lowercase().as_str() {
                "earliest" => StartPosition::Earliest,
                "latest" => StartPosition::Latest,
                other => {
                    return Err(Error::Config(format!(
                        "Invalid {ENV_START_POSITION}={other}, expected earliest or latest"
                    )));
                }
            };
        }
        if let Some(policy) = env_vars.get(ENV_FAILURE_POLICY) {
            config.failure_policy = policy.parse()?;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ProcessorConfig::new("orders");
        assert_eq!(config.consumer_group, "$Default");
        assert_eq!(config.failure_policy, FailurePolicy::StopPartition);
        assert_eq!(config.balance_period(), Duration::from_millis(1500));
        assert_eq!(config.max_batch_size, 1);
        assert!(config.validate().is_ok());

        // every instance gets its own id
        assert_ne!(config.instance_id, ProcessorConfig::new("orders").instance_id);
    }

    #[test]
    fn test_validate_rejects_inconsistent_timings() {
        let config = ProcessorConfig::new("orders")
            .with_lease_duration(Duration::from_secs(1))
            .with_renew_interval(Duration::from_secs(2));
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = ProcessorConfig::new("orders").with_renew_timeout(Duration::from_secs(60));
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        // each is shorter than the lease, but a renewal can still time out after it expired
        let config = ProcessorConfig::new("orders")
            .with_lease_duration(Duration::from_millis(600))
            .with_renew_interval(Duration::from_millis(550))
            .with_renew_timeout(Duration::from_millis(500));
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = ProcessorConfig::new("orders")
            .with_lease_duration(Duration::from_millis(600))
            .with_renew_interval(Duration::from_millis(300))
            .with_renew_timeout(Duration::from_millis(300));
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = ProcessorConfig::new("orders")
            .with_lease_duration(Duration::from_millis(600))
            .with_renew_interval(Duration::from_millis(300))
            .with_renew_timeout(Duration::from_millis(200));
        assert!(config.validate().is_ok());

        let config = ProcessorConfig::new("orders").with_max_batch_size(0);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = ProcessorConfig::new("orders").with_consumer_group("a/b");
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_from_env() {
        let env_vars = [
            (ENV_STREAM_ID, "orders"),
            (ENV_CONSUMER_GROUP, "billing"),
            (ENV_INSTANCE_ID, "pod-1"),
            (ENV_LEASE_DURATION_MS, "6000"),
            (ENV_RENEW_INTERVAL_MS, "2000"),
            (ENV_MAX_BATCH_SIZE, "50"),
            (ENV_START_POSITION, "Latest"),
            (ENV_FAILURE_POLICY, "skip"),
            ("UNRELATED", "ignored"),
        ];
        let config = ProcessorConfig::load(env_vars).unwrap();

        assert_eq!(config.stream_id, "orders");
        assert_eq!(config.consumer_group, "billing");
        assert_eq!(config.instance_id, "pod-1");
        assert_eq!(config.lease_duration, Duration::from_secs(6));
        assert_eq!(config.balance_period(), Duration::from_secs(1));
        assert_eq!(config.max_batch_size, 50);
        assert_eq!(config.default_start_position, StartPosition::Latest);
        assert_eq!(config.failure_policy, FailurePolicy::SkipAndCheckpoint);
    }

    #[test]
    fn test_load_errors() {
        let missing: [(&str, &str); 0] = [];
        assert!(matches!(
            ProcessorConfig::load(missing),
            Err(Error::Config(msg)) if msg.contains(ENV_STREAM_ID)
        ));

        let bad_duration = [(ENV_STREAM_ID, "orders"), (ENV_LEASE_DURATION_MS, "soon")];
        assert!(matches!(
            ProcessorConfig::load(bad_duration),
            Err(Error::Config(_))
        ));

        let bad_position = [(ENV_STREAM_ID, "orders"), (ENV_START_POSITION, "middle")];
        assert!(ProcessorConfig::load(bad_position).is_err());
    }
}
