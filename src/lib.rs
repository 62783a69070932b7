//! Builds `tracing` loggers that ship to AWS CloudWatch Logs from a logging
//! channel configuration.
//!
//! ```no_run
//! use std::collections::HashMap;
//!
//! use tracing_cloudwatch_factory::{ChannelConfig, FormatterRegistry, HostContext};
//!
//! let host = HostContext::new(
//!     HashMap::<String, ChannelConfig>::new(),
//!     FormatterRegistry::with_builtin(),
//! );
//! let config = ChannelConfig::new()
//!     .set("region", "eu-west-1")
//!     .set("group_name", "shop")
//!     .set("retention", 30);
//!
//! let logger = tracing_cloudwatch_factory::factory(host).build(&config)?;
//! logger.init()?;
//! tracing::info!(order = 1042, "order placed");
//! # Ok::<(), tracing_cloudwatch_factory::Error>(())
//! ```

mod config;
mod error;
mod factory;
mod formatter;
mod logger;
mod worker;
mod writer;

const CLOUDWATCH_MAX_BATCH_EVENTS_LENGTH: usize = 10_000;
const CLOUDWATCH_MAX_BATCH_SIZE: usize = 1024 * 1024;
const CLOUDWATCH_EXTRA_MSG_PAYLOAD_SIZE: usize = 26;

pub use config::{
    parse_level, AccessKey, ChannelConfig, CloudWatchSettings, ConfigRepository, Credentials,
    FormatterFactory, LoggingConfig, DEFAULT_BATCH_SIZE, DEFAULT_GROUP_NAME, DEFAULT_LEVEL,
    DEFAULT_NAME, DEFAULT_RETENTION_DAYS, DEFAULT_STREAM_NAME, DEFAULT_VERSION, RETENTION_DAYS,
};
pub use error::{Error, Result, RusotoLogsError};
pub use factory::{HostContext, LoggerFactory, ResolutionPolicy, CLOUDWATCH_CHANNEL};
pub use formatter::{
    level_name, severity, FormatterRegistry, JsonFormatter, LineFormatter, LogFormatter, LogRecord,
    DEFAULT_LINE_FORMAT,
};
pub use logger::{CloudWatchHandler, Logger};
pub use writer::{CloudWatchLineWriter, CloudWatchWriter, CloudWatchWriterBuilder, LogTarget};

pub fn factory(host: HostContext) -> LoggerFactory {
    LoggerFactory::new(host)
}

pub fn writer(log_group: &str, log_stream: &str) -> CloudWatchWriterBuilder<()> {
    CloudWatchWriterBuilder::new(log_group, log_stream)
}
