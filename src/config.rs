//! Logging channel configuration.
//!
//! A [`ChannelConfig`] is the loosely typed mapping a host application keeps
//! for a logging channel. [`CloudWatchSettings`] is the validated form the
//! factory works with; it is produced by one of two policies:
//! [`CloudWatchSettings::from_inline`] applies defaults to everything except
//! `region`, while [`CloudWatchSettings::from_registered`] insists on the
//! channel naming its own group, stream, retention and logger name.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use rusoto_core::credential::{DefaultCredentialsProvider, StaticProvider};
use rusoto_core::{HttpClient, Region};
use rusoto_logs::CloudWatchLogsClient;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use tracing_subscriber::filter::LevelFilter;

use crate::error::{Error, Result};
use crate::formatter::LogFormatter;
use crate::CLOUDWATCH_MAX_BATCH_EVENTS_LENGTH;

pub const DEFAULT_NAME: &str = "logger";
pub const DEFAULT_VERSION: &str = "latest";
pub const DEFAULT_GROUP_NAME: &str = "general";
pub const DEFAULT_STREAM_NAME: &str = "default";
pub const DEFAULT_RETENTION_DAYS: i64 = 14;
pub const DEFAULT_BATCH_SIZE: usize = 10_000;
pub const DEFAULT_LEVEL: LevelFilter = LevelFilter::DEBUG;

/// Retention periods CloudWatch Logs accepts for `PutRetentionPolicy`.
pub const RETENTION_DAYS: &[i64] = &[
    1, 3, 5, 7, 14, 30, 60, 90, 120, 150, 180, 365, 400, 545, 731, 1096, 1827, 2192, 2557, 2922,
    3288, 3653,
];

/// Builds a formatter from the channel it is configured on.
pub type FormatterFactory = Arc<dyn Fn(&ChannelConfig) -> Arc<dyn LogFormatter> + Send + Sync>;

/// The raw configuration of one logging channel.
#[derive(Clone, Default)]
pub struct ChannelConfig {
    values: Map<String, Value>,
    formatter_factory: Option<FormatterFactory>,
}

impl ChannelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    /// Uses `factory` as the channel's formatter. It takes the place of any
    /// `formatter` entry and is called with the whole channel config.
    pub fn with_formatter_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&ChannelConfig) -> Arc<dyn LogFormatter> + Send + Sync + 'static,
    {
        self.values.remove("formatter");
        self.formatter_factory = Some(Arc::new(factory));
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self.values.get(key) {
            Some(Value::Null) | None => None,
            Some(value) => Some(value),
        }
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub(crate) fn formatter_factory(&self) -> Option<&FormatterFactory> {
        self.formatter_factory.as_ref()
    }

    fn string(&self, key: &str) -> Result<Option<String>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(other) => Err(Error::config(format!(
                "CloudWatch param `{}` must be a string, got {}",
                key, other
            ))),
        }
    }

    fn required_string(&self, key: &str) -> Result<String> {
        match self.string(key)? {
            Some(s) if !s.is_empty() => Ok(s),
            _ => Err(Error::config(format!(
                "CloudWatch requires param: `{}`. Add it to the `cloudwatch` logging channel",
                key
            ))),
        }
    }

    fn integer(&self, key: &str) -> Result<Option<i64>> {
        let value = match self.get(key) {
            None => return Ok(None),
            Some(value) => value,
        };
        let parsed = match value {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        };
        parsed.map(Some).ok_or_else(|| {
            Error::config(format!(
                "CloudWatch param `{}` must be an integer, got {}",
                key, value
            ))
        })
    }

    fn flag(&self, key: &str) -> Option<bool> {
        self.get(key).map(truthy)
    }
}

impl fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("values", &self.values)
            .field("formatter_factory", &self.formatter_factory.is_some())
            .finish()
    }
}

impl From<Map<String, Value>> for ChannelConfig {
    fn from(values: Map<String, Value>) -> Self {
        Self {
            values,
            formatter_factory: None,
        }
    }
}

impl<'de> Deserialize<'de> for ChannelConfig {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Map::deserialize(deserializer).map(Self::from)
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !(s.is_empty() || s == "0" || s.eq_ignore_ascii_case("false")),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Access key pair for a static credentials provider.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessKey {
    pub key: String,
    pub secret: String,
    pub token: Option<String>,
}

impl fmt::Debug for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessKey")
            .field("key", &self.key)
            .field("secret", &"**********")
            .field("token", &self.token.as_ref().map(|_| "**********"))
            .finish()
    }
}

/// Everything needed to construct the CloudWatch Logs client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub region: String,
    pub version: String,
    pub endpoint: Option<String>,
    pub access_key: Option<AccessKey>,
}

impl Credentials {
    fn from_channel(config: &ChannelConfig) -> Result<Self> {
        let region = config.required_string("region")?;
        let version = config
            .string("version")?
            .unwrap_or_else(|| DEFAULT_VERSION.to_string());
        let endpoint = config.string("endpoint")?;

        let access_key = match config.get("credentials") {
            None => None,
            Some(Value::Object(credentials)) => match credentials.get("key") {
                None | Some(Value::Null) => None,
                Some(Value::String(key)) => {
                    let secret = match credentials.get("secret") {
                        Some(Value::String(secret)) => secret.clone(),
                        _ => {
                            return Err(Error::config(
                                "CloudWatch param `credentials.secret` is required when `credentials.key` is set",
                            ))
                        }
                    };
                    let token = match credentials.get("token") {
                        Some(Value::String(token)) => Some(token.clone()),
                        _ => None,
                    };
                    Some(AccessKey {
                        key: key.clone(),
                        secret,
                        token,
                    })
                }
                Some(other) => {
                    return Err(Error::config(format!(
                        "CloudWatch param `credentials.key` must be a string, got {}",
                        other
                    )))
                }
            },
            Some(other) => {
                return Err(Error::config(format!(
                    "CloudWatch param `credentials` must be an object, got {}",
                    other
                )))
            }
        };

        Ok(Self {
            region,
            version,
            endpoint,
            access_key,
        })
    }

    pub fn rusoto_region(&self) -> Result<Region> {
        match &self.endpoint {
            Some(endpoint) => Ok(Region::Custom {
                name: self.region.clone(),
                endpoint: endpoint.clone(),
            }),
            None => self.region.parse::<Region>().map_err(|err| {
                Error::config(format!("invalid CloudWatch region `{}`: {}", self.region, err))
            }),
        }
    }

    /// Builds the client. Without an access key the client falls back to
    /// rusoto's default credentials chain. HTTP client and provider failures
    /// are returned, never panicked on.
    pub fn client(&self) -> Result<CloudWatchLogsClient> {
        let region = self.rusoto_region()?;
        match &self.access_key {
            Some(access_key) => {
                let provider = StaticProvider::new(
                    access_key.key.clone(),
                    access_key.secret.clone(),
                    access_key.token.clone(),
                    None,
                );
                Ok(CloudWatchLogsClient::new_with(
                    HttpClient::new()?,
                    provider,
                    region,
                ))
            }
            None => Ok(CloudWatchLogsClient::new_with(
                HttpClient::new()?,
                DefaultCredentialsProvider::new()?,
                region,
            )),
        }
    }
}

/// Validated settings for one CloudWatch logger.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudWatchSettings {
    pub credentials: Credentials,
    /// Logger (channel) name. Default `"logger"`.
    pub name: String,
    /// Default `"general"`.
    pub group_name: String,
    /// Default `"default"`.
    pub stream_name: String,
    /// Default 14.
    pub retention_days: i64,
    /// Events per `PutLogEvents` call. Default 10000, which is also the
    /// CloudWatch maximum.
    pub batch_size: usize,
    /// Tags applied when the log group is created. Default none.
    pub tags: HashMap<String, String>,
    /// Minimum level shipped. Default debug.
    pub level: LevelFilter,
    /// Default true.
    pub bubble: bool,
    /// Create the log group when it does not exist. Default true.
    pub create_group: bool,
}

impl CloudWatchSettings {
    /// Only `region` is required; every other field falls back to its
    /// default.
    pub fn from_inline(config: &ChannelConfig) -> Result<Self> {
        let credentials = Credentials::from_channel(config)?;
        let retention_days = match config.integer("retention")? {
            Some(days) => validate_retention(days)?,
            None => DEFAULT_RETENTION_DAYS,
        };
        Ok(Self {
            credentials,
            name: config
                .string("name")?
                .unwrap_or_else(|| DEFAULT_NAME.to_string()),
            group_name: config
                .string("group_name")?
                .unwrap_or_else(|| DEFAULT_GROUP_NAME.to_string()),
            stream_name: config
                .string("stream_name")?
                .unwrap_or_else(|| DEFAULT_STREAM_NAME.to_string()),
            retention_days,
            batch_size: batch_size(config)?,
            tags: tags(config)?,
            level: level(config)?,
            bubble: config.flag("bubble").unwrap_or(true),
            create_group: config.flag("createGroup").unwrap_or(true),
        })
    }

    /// `region`, `name`, `group_name`, `stream_name` and `retention` are
    /// required; only `batch_size` and the handler flags have defaults.
    pub fn from_registered(config: &ChannelConfig) -> Result<Self> {
        let credentials = Credentials::from_channel(config)?;
        let retention_days = match config.integer("retention")? {
            Some(days) => validate_retention(days)?,
            None => {
                return Err(Error::config(
                    "CloudWatch requires param: `retention`. Add it to the `cloudwatch` logging channel",
                ))
            }
        };
        Ok(Self {
            credentials,
            name: config.required_string("name")?,
            group_name: config.required_string("group_name")?,
            stream_name: config.required_string("stream_name")?,
            retention_days,
            batch_size: batch_size(config)?,
            tags: tags(config)?,
            level: level(config)?,
            bubble: config.flag("bubble").unwrap_or(true),
            create_group: config.flag("createGroup").unwrap_or(true),
        })
    }
}

fn validate_retention(days: i64) -> Result<i64> {
    if RETENTION_DAYS.contains(&days) {
        Ok(days)
    } else {
        Err(Error::config(format!(
            "CloudWatch param `retention` must be one of {:?}, got {}",
            RETENTION_DAYS, days
        )))
    }
}

fn batch_size(config: &ChannelConfig) -> Result<usize> {
    match config.integer("batch_size")? {
        None => Ok(DEFAULT_BATCH_SIZE),
        Some(size) if size >= 1 && size as usize <= CLOUDWATCH_MAX_BATCH_EVENTS_LENGTH => {
            Ok(size as usize)
        }
        Some(size) => Err(Error::config(format!(
            "CloudWatch param `batch_size` must be between 1 and {}, got {}",
            CLOUDWATCH_MAX_BATCH_EVENTS_LENGTH, size
        ))),
    }
}

fn tags(config: &ChannelConfig) -> Result<HashMap<String, String>> {
    match config.get("tags") {
        None => Ok(HashMap::new()),
        Some(Value::Object(tags)) => tags
            .iter()
            .map(|(key, value)| match value {
                Value::String(s) => Ok((key.clone(), s.clone())),
                Value::Number(_) | Value::Bool(_) => Ok((key.clone(), value.to_string())),
                other => Err(Error::config(format!(
                    "CloudWatch tag `{}` must be a scalar, got {}",
                    key, other
                ))),
            })
            .collect(),
        Some(Value::Array(tags)) if tags.is_empty() => Ok(HashMap::new()),
        Some(other) => Err(Error::config(format!(
            "CloudWatch param `tags` must be an object, got {}",
            other
        ))),
    }
}

fn level(config: &ChannelConfig) -> Result<LevelFilter> {
    match config.string("level")? {
        None => Ok(DEFAULT_LEVEL),
        Some(name) => parse_level(&name)
            .ok_or_else(|| Error::config(format!("unknown CloudWatch log level `{}`", name))),
    }
}

/// Maps syslog-style severity names onto tracing's five levels.
pub fn parse_level(name: &str) -> Option<LevelFilter> {
    match name.to_ascii_lowercase().as_str() {
        "off" | "none" => Some(LevelFilter::OFF),
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "info" | "notice" => Some(LevelFilter::INFO),
        "warn" | "warning" => Some(LevelFilter::WARN),
        "error" | "critical" | "alert" | "emergency" => Some(LevelFilter::ERROR),
        _ => None,
    }
}

/// The host application's registry of logging channels.
pub trait ConfigRepository: Send + Sync {
    fn logging_channel(&self, name: &str) -> Option<ChannelConfig>;
}

impl ConfigRepository for HashMap<String, ChannelConfig> {
    fn logging_channel(&self, name: &str) -> Option<ChannelConfig> {
        self.get(name).cloned()
    }
}

/// A logging configuration document:
///
/// ```json
/// { "channels": { "cloudwatch": { "region": "eu-west-1", "retention": 30 } } }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub channels: HashMap<String, ChannelConfig>,
}

impl LoggingConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|err| Error::config(format!("invalid logging configuration: {}", err)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|err| {
            Error::config(format!(
                "failed to read logging configuration {}: {}",
                path.display(),
                err
            ))
        })?;
        Self::from_json_str(&json)
    }
}

impl ConfigRepository for LoggingConfig {
    fn logging_channel(&self, name: &str) -> Option<ChannelConfig> {
        self.channels.logging_channel(name)
    }
}
