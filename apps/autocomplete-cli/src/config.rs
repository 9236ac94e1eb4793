//! Environment-backed runtime configuration for `autocomplete-cli`.

use std::{env, error::Error, fmt, time::Duration};

use dispatch_core::{
    BackoffPlan, DEFAULT_QUERY_TIMEOUT, PipelineConfig, RetryPolicy, SharedTimeSource,
};
use dispatch_sim::{
    DEFAULT_MATCH_COUNT, DelayStrategy, InMemoryQueryService, MatchGenerator, ReliabilityStrategy,
};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
const DEFAULT_SIM_DELAY_MS: u64 = 1_000;

/// How delivered results are written to stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// `term: match, match, ...`
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Failure injection selected for the simulated backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimReliability {
    #[default]
    NeverFail,
    AlwaysFail,
    EveryNth(u64),
}

/// Runtime configuration used by the CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliConfig {
    /// Retry and timeout settings for the pipeline.
    pub pipeline: PipelineConfig,
    /// Round-robin delays for the simulated backend. `None` means no delay.
    pub sim_delays: Option<Vec<Duration>>,
    pub sim_reliability: SimReliability,
    /// Matches produced per successful simulated query.
    pub sim_matches: usize,
    pub output: OutputFormat,
}

impl CliConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let max_attempts =
            parse_u64_or("AUTOCOMPLETE_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS.into(), &mut lookup)?;
        let max_attempts = u32::try_from(max_attempts).map_err(|err| ConfigError::InvalidValue {
            key: "AUTOCOMPLETE_MAX_ATTEMPTS",
            value: max_attempts.to_string(),
            reason: err.to_string(),
        })?;
        let timeout_ms = parse_u64_or(
            "AUTOCOMPLETE_TIMEOUT_MS",
            DEFAULT_QUERY_TIMEOUT.as_millis() as u64,
            &mut lookup,
        )?;
        let backoff = parse_backoff(&mut lookup)?;

        let retry = RetryPolicy::new(max_attempts, backoff)
            .map_err(|err| ConfigError::from_core("AUTOCOMPLETE_MAX_ATTEMPTS", err))?;
        let pipeline = PipelineConfig::new(retry, Duration::from_millis(timeout_ms))
            .map_err(|err| ConfigError::from_core("AUTOCOMPLETE_TIMEOUT_MS", err))?;

        let sim_delays = match optional_trimmed_env("AUTOCOMPLETE_SIM_DELAYS_MS", &mut lookup) {
            None => Some(vec![Duration::from_millis(DEFAULT_SIM_DELAY_MS)]),
            Some(value) if value.eq_ignore_ascii_case("none") => None,
            Some(value) => Some(parse_millis_list("AUTOCOMPLETE_SIM_DELAYS_MS", &value)?),
        };
        let sim_reliability = parse_reliability(&mut lookup)?;
        let sim_matches = parse_u64_or(
            "AUTOCOMPLETE_SIM_MATCHES",
            DEFAULT_MATCH_COUNT as u64,
            &mut lookup,
        )? as usize;
        let output = parse_output(&mut lookup)?;

        Ok(Self {
            pipeline,
            sim_delays,
            sim_reliability,
            sim_matches,
            output,
        })
    }

    /// Build the simulated backend described by this configuration.
    pub fn simulator(&self, time: SharedTimeSource) -> Result<InMemoryQueryService, ConfigError> {
        let delay = match &self.sim_delays {
            None => DelayStrategy::none(),
            Some(delays) => DelayStrategy::round_robin(delays.iter().copied())
                .map_err(|err| ConfigError::from_core("AUTOCOMPLETE_SIM_DELAYS_MS", err))?,
        };
        let reliability = match self.sim_reliability {
            SimReliability::NeverFail => ReliabilityStrategy::never_fail(),
            SimReliability::AlwaysFail => ReliabilityStrategy::always_fail(),
            SimReliability::EveryNth(n) => ReliabilityStrategy::succeed_every_nth(n)
                .map_err(|err| ConfigError::from_core("AUTOCOMPLETE_SIM_RELIABILITY", err))?,
        };

        Ok(InMemoryQueryService::with_strategies(time, delay, reliability)
            .with_matches(MatchGenerator::new(self.sim_matches)))
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed or was rejected.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    /// Attribute a construction error from the core crates to an env key.
    fn from_core(key: &'static str, err: dispatch_core::ConfigError) -> Self {
        let dispatch_core::ConfigError::InvalidValue { value, reason, .. } = err;
        Self::InvalidValue { key, value, reason }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_u64_or<F>(key: &'static str, default: u64, lookup: &mut F) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value.parse::<u64>().map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}

fn parse_millis_list(key: &'static str, value: &str) -> Result<Vec<Duration>, ConfigError> {
    value
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|err| ConfigError::InvalidValue {
                    key,
                    value: value.to_owned(),
                    reason: format!("'{}': {err}", part.trim()),
                })
        })
        .collect()
}

fn parse_backoff<F>(lookup: &mut F) -> Result<BackoffPlan, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(value) = optional_trimmed_env("AUTOCOMPLETE_BACKOFF_MS", lookup) {
        let delays = parse_millis_list("AUTOCOMPLETE_BACKOFF_MS", &value)?;
        return BackoffPlan::sequence(delays)
            .map_err(|err| ConfigError::from_core("AUTOCOMPLETE_BACKOFF_MS", err));
    }

    let base = parse_u64_or("AUTOCOMPLETE_BACKOFF_BASE_MS", DEFAULT_BACKOFF_BASE_MS, lookup)?;
    let max = parse_u64_or("AUTOCOMPLETE_BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS, lookup)?;
    if max < base {
        return Err(ConfigError::InvalidValue {
            key: "AUTOCOMPLETE_BACKOFF_MAX_MS",
            value: max.to_string(),
            reason: format!("must not be below AUTOCOMPLETE_BACKOFF_BASE_MS ({base})"),
        });
    }
    Ok(BackoffPlan::exponential(
        Duration::from_millis(base),
        Duration::from_millis(max),
    ))
}

fn parse_reliability<F>(lookup: &mut F) -> Result<SimReliability, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    const KEY: &str = "AUTOCOMPLETE_SIM_RELIABILITY";
    let Some(value) = optional_trimmed_env(KEY, lookup) else {
        return Ok(SimReliability::default());
    };
    let invalid = |reason: String| ConfigError::InvalidValue {
        key: KEY,
        value: value.clone(),
        reason,
    };

    match value.to_ascii_lowercase().as_str() {
        "never-fail" => Ok(SimReliability::NeverFail),
        "always-fail" => Ok(SimReliability::AlwaysFail),
        other => {
            let Some(n) = other.strip_prefix("every:") else {
                return Err(invalid(
                    "expected never-fail, always-fail or every:N".to_owned(),
                ));
            };
            let n = n.trim().parse::<u64>().map_err(|err| invalid(err.to_string()))?;
            if n == 0 {
                return Err(invalid("N must be at least 1".to_owned()));
            }
            Ok(SimReliability::EveryNth(n))
        }
    }
}

fn parse_output<F>(lookup: &mut F) -> Result<OutputFormat, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env("AUTOCOMPLETE_OUTPUT", lookup) else {
        return Ok(OutputFormat::default());
    };
    match value.to_ascii_lowercase().as_str() {
        "text" => Ok(OutputFormat::Text),
        "json" => Ok(OutputFormat::Json),
        _ => Err(ConfigError::InvalidValue {
            key: "AUTOCOMPLETE_OUTPUT",
            value,
            reason: "expected text or json".to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::VirtualTimeSource;
    use std::collections::HashMap;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<CliConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        CliConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn applies_defaults_when_env_is_empty() {
        let cfg = config_from_pairs(&[]).expect("empty config should parse");

        assert_eq!(cfg.pipeline, PipelineConfig::default());
        assert_eq!(cfg.sim_delays, Some(vec![Duration::from_secs(1)]));
        assert_eq!(cfg.sim_reliability, SimReliability::NeverFail);
        assert_eq!(cfg.sim_matches, DEFAULT_MATCH_COUNT);
        assert_eq!(cfg.output, OutputFormat::Text);
    }

    #[test]
    fn parses_pipeline_tuning() {
        let cfg = config_from_pairs(&[
            ("AUTOCOMPLETE_MAX_ATTEMPTS", "5"),
            ("AUTOCOMPLETE_TIMEOUT_MS", "750"),
            ("AUTOCOMPLETE_BACKOFF_MS", "100, 200,400"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.pipeline.retry().max_attempts(), 5);
        assert_eq!(cfg.pipeline.timeout(), Duration::from_millis(750));
        let backoff = cfg.pipeline.retry().backoff();
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(backoff.delay_for_attempt(9), Duration::from_millis(400));
    }

    #[test]
    fn exponential_backoff_respects_base_and_cap() {
        let cfg = config_from_pairs(&[
            ("AUTOCOMPLETE_BACKOFF_BASE_MS", "250"),
            ("AUTOCOMPLETE_BACKOFF_MAX_MS", "1000"),
        ])
        .expect("config should parse");

        let backoff = cfg.pipeline.retry().backoff();
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(250));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_millis(1000));
    }

    #[test]
    fn parses_simulator_settings() {
        let cfg = config_from_pairs(&[
            ("AUTOCOMPLETE_SIM_DELAYS_MS", "none"),
            ("AUTOCOMPLETE_SIM_RELIABILITY", "every:3"),
            ("AUTOCOMPLETE_SIM_MATCHES", "5"),
            ("AUTOCOMPLETE_OUTPUT", "JSON"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.sim_delays, None);
        assert_eq!(cfg.sim_reliability, SimReliability::EveryNth(3));
        assert_eq!(cfg.sim_matches, 5);
        assert_eq!(cfg.output, OutputFormat::Json);
    }

    #[test]
    fn rejects_zero_attempts_under_the_env_key() {
        let err = config_from_pairs(&[("AUTOCOMPLETE_MAX_ATTEMPTS", "0")])
            .expect_err("zero attempts should fail");

        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "AUTOCOMPLETE_MAX_ATTEMPTS",
                ..
            }
        ));
    }

    #[test]
    fn rejects_zero_timeout() {
        let err = config_from_pairs(&[("AUTOCOMPLETE_TIMEOUT_MS", "0")])
            .expect_err("zero timeout should fail");

        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "AUTOCOMPLETE_TIMEOUT_MS",
                ..
            }
        ));
    }

    #[test]
    fn rejects_malformed_values() {
        for (key, value) in [
            ("AUTOCOMPLETE_BACKOFF_MS", "100,,200"),
            ("AUTOCOMPLETE_SIM_DELAYS_MS", "fast"),
            ("AUTOCOMPLETE_SIM_RELIABILITY", "every:0"),
            ("AUTOCOMPLETE_SIM_RELIABILITY", "sometimes"),
            ("AUTOCOMPLETE_OUTPUT", "yaml"),
            ("AUTOCOMPLETE_BACKOFF_MAX_MS", "10"),
        ] {
            let err = config_from_pairs(&[(key, value)])
                .expect_err("malformed value should fail");
            let ConfigError::InvalidValue { key: reported, .. } = err;
            assert_eq!(reported, key, "{value} should be reported under {key}");
        }
    }

    #[tokio::test]
    async fn builds_simulator_from_settings() {
        let clock = VirtualTimeSource::new();
        let cfg = config_from_pairs(&[
            ("AUTOCOMPLETE_SIM_DELAYS_MS", "none"),
            ("AUTOCOMPLETE_SIM_RELIABILITY", "always-fail"),
        ])
        .expect("config should parse");

        let service = cfg.simulator(clock.shared()).expect("simulator should build");
        let outcome = dispatch_core::QueryService::query(&service, &"a".into()).await;

        assert!(outcome.is_err());
        assert_eq!(service.invocations(), 1);
    }
}
