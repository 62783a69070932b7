use std::fmt;
use std::sync::Arc;

use crate::config::{ChannelConfig, CloudWatchSettings, ConfigRepository};
use crate::error::{Error, Result};
use crate::formatter::{FormatterRegistry, LogFormatter};
use crate::logger::{CloudWatchHandler, Logger};

/// Name of the logging channel read by [`ResolutionPolicy::Registered`].
pub const CLOUDWATCH_CHANNEL: &str = "cloudwatch";

/// What the factory needs from the host application.
#[derive(Clone)]
pub struct HostContext {
    config: Arc<dyn ConfigRepository>,
    formatters: FormatterRegistry,
}

impl HostContext {
    pub fn new<R>(config: R, formatters: FormatterRegistry) -> Self
    where
        R: ConfigRepository + 'static,
    {
        Self {
            config: Arc::new(config),
            formatters,
        }
    }

    pub fn config(&self) -> &dyn ConfigRepository {
        self.config.as_ref()
    }

    pub fn formatters(&self) -> &FormatterRegistry {
        &self.formatters
    }
}

impl fmt::Debug for HostContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostContext")
            .field("formatters", &self.formatters)
            .finish()
    }
}

/// Where the factory takes the CloudWatch settings from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionPolicy {
    /// The config passed to [`LoggerFactory::build`], with defaults for all
    /// but `region`.
    Inline,
    /// The host's `cloudwatch` logging channel, which must name its own
    /// logger, group, stream and retention.
    Registered,
}

impl Default for ResolutionPolicy {
    fn default() -> Self {
        ResolutionPolicy::Inline
    }
}

/// Builds CloudWatch [`Logger`]s from logging channel configuration.
#[derive(Debug, Clone, Default)]
pub struct LoggerFactory {
    host: Option<HostContext>,
    policy: ResolutionPolicy,
}

impl LoggerFactory {
    pub fn new(host: HostContext) -> Self {
        Self {
            host: Some(host),
            policy: ResolutionPolicy::Inline,
        }
    }

    pub fn with_host(mut self, host: HostContext) -> Self {
        self.host = Some(host);
        self
    }

    pub fn with_policy(mut self, policy: ResolutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> ResolutionPolicy {
        self.policy
    }

    fn host(&self) -> Result<&HostContext> {
        self.host.as_ref().ok_or_else(|| {
            Error::Environment(
                "CloudWatch logging is usable only inside a host application context".to_string(),
            )
        })
    }

    pub fn build(&self, config: &ChannelConfig) -> Result<Logger> {
        let host = self.host()?;

        let registered;
        let config = match self.policy {
            ResolutionPolicy::Inline => config,
            ResolutionPolicy::Registered => {
                registered = host
                    .config
                    .logging_channel(CLOUDWATCH_CHANNEL)
                    .ok_or_else(|| {
                        Error::config(format!(
                            "CloudWatch requires a `{}` entry in the logging channels",
                            CLOUDWATCH_CHANNEL
                        ))
                    })?;
                &registered
            }
        };
        let settings = match self.policy {
            ResolutionPolicy::Inline => CloudWatchSettings::from_inline(config)?,
            ResolutionPolicy::Registered => CloudWatchSettings::from_registered(config)?,
        };

        let client = settings.credentials.client()?;
        let writer = crate::writer(&settings.group_name, &settings.stream_name)
            .with_client(client)
            .retention(settings.retention_days)
            .batch_size(settings.batch_size)
            .tags(settings.tags.clone())
            .create_group(settings.create_group)
            .build()?;

        let mut handler = CloudWatchHandler::new(writer, settings.level, settings.bubble);
        handler.set_formatter(host.formatters.resolve(config)?);

        Ok(Logger::new(&settings.name, handler))
    }

    /// Resolves the formatter `config` asks for.
    pub fn resolve_formatter(&self, config: &ChannelConfig) -> Result<Arc<dyn LogFormatter>> {
        self.host()?.formatters.resolve(config)
    }
}
