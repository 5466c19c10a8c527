//! Worker targets and broker construction for the one-shot commands.

use a2a_broker::{Broker, BrokerConfig, BrokerV1, WorkerRegistration};
use a2a_common::protocol::{Capability, WorkerId};
use a2a_common::transport::HttpTransport;
use anyhow::{anyhow, Context, Result};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// An HTTP worker named on the command line as `name[:cap,cap]=url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerTarget {
    pub id: WorkerId,
    pub capabilities: BTreeSet<Capability>,
    pub url: String,
}

impl FromStr for WorkerTarget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (head, url) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("Invalid worker '{}': expected name[:cap,cap]=url", s))?;

        let (name, caps) = match head.split_once(':') {
            Some((name, caps)) => (name, caps),
            None => (head, ""),
        };
        if name.trim().is_empty() {
            return Err(anyhow!("Invalid worker '{}': name is empty", s));
        }

        let capabilities = caps
            .split(',')
            .filter(|c| !c.trim().is_empty())
            .map(Capability::from_str)
            .collect::<Result<BTreeSet<_>, _>>()?;

        validate_http_url(url, "worker url")?;

        Ok(Self {
            id: WorkerId::new(name.trim()),
            capabilities,
            url: url.to_string(),
        })
    }
}

/// Validates that a URL string starts with http://
pub fn validate_http_url(url: &str, description: &str) -> Result<()> {
    if url.starts_with("http://") {
        Ok(())
    } else {
        Err(anyhow!(
            "Invalid {}: '{}' must start with http://",
            description,
            url
        ))
    }
}

/// Command-line overrides applied on top of [`BrokerConfig::from_env`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub max_attempts: Option<u32>,
    pub failure_threshold: Option<u32>,
    pub cool_down_ms: Option<u64>,
    pub fan_out_deadline_ms: Option<u64>,
}

impl ConfigOverrides {
    pub fn apply(&self, mut config: BrokerConfig) -> Result<BrokerConfig> {
        if let Some(n) = self.max_attempts {
            config.retry.max_attempts = n;
        }
        if let Some(n) = self.failure_threshold {
            config.circuit_breaker.failure_threshold = n;
        }
        if let Some(ms) = self.cool_down_ms {
            config.circuit_breaker.cool_down = Duration::from_millis(ms);
        }
        if let Some(ms) = self.fan_out_deadline_ms {
            config.default_fan_out_deadline = Some(Duration::from_millis(ms));
        }
        config.validate()?;
        Ok(config)
    }
}

/// Starts a broker and registers every target over HTTP.
pub fn start_broker(targets: &[WorkerTarget], overrides: ConfigOverrides) -> Result<BrokerV1> {
    if targets.is_empty() {
        return Err(anyhow!("No workers given. Use --worker name=url to add one."));
    }

    let config = overrides.apply(BrokerConfig::from_env()?)?;
    let broker = BrokerV1::start(config)?;

    for target in targets {
        let transport = HttpTransport::new(target.url.clone())
            .with_context(|| format!("worker '{}'", target.id))?;
        broker.register(WorkerRegistration::new(
            target.id.clone(),
            target.capabilities.iter().copied(),
            Arc::new(transport),
        ))?;
        tracing::debug!("Registered worker {} at {}", target.id, target.url);
    }

    Ok(broker)
}
