use std::error::Error as StdError;
use std::fmt;
use std::io;

use rusoto_core::credential::CredentialsError;
use rusoto_core::request::TlsError;
use rusoto_core::RusotoError;
use rusoto_logs::{
    CreateLogGroupError, CreateLogStreamError, DescribeLogGroupsError, DescribeLogStreamsError,
    PutLogEventsError, PutRetentionPolicyError,
};
use tracing_core::dispatcher::SetGlobalDefaultError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while building a [`Logger`](crate::Logger).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No host application context was handed to the factory.
    #[error("{0}")]
    Environment(String),
    /// A required field is missing, a value is malformed, or the formatter
    /// specification cannot be resolved.
    #[error("{0}")]
    Configuration(String),
    #[error("failed to create CloudWatch Logs HTTP client: {0}")]
    HttpClient(#[from] TlsError),
    #[error("failed to set up CloudWatch Logs credentials: {0}")]
    Credentials(#[from] CredentialsError),
    #[error("failed to start CloudWatch Logs runtime: {0}")]
    Runtime(#[from] io::Error),
    #[error("failed to install logger as global default: {0}")]
    SetGlobalDefault(#[from] SetGlobalDefaultError),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }
}

/// Failure of a CloudWatch Logs call made by the shipping worker.
#[derive(Debug)]
pub enum RusotoLogsError {
    RusotoError(RusotoError<std::convert::Infallible>),
    CreateLogGroupError(CreateLogGroupError),
    PutRetentionPolicyError(PutRetentionPolicyError),
    DescribeLogGroupsError(DescribeLogGroupsError),
    DescribeLogStreamsError(DescribeLogStreamsError),
    CreateLogStreamError(CreateLogStreamError),
    PutLogEventsError(PutLogEventsError),
}

macro_rules! impl_from_rusoto_error {
    ($($service:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<RusotoError<$service>> for RusotoLogsError {
                fn from(error: RusotoError<$service>) -> Self {
                    match error {
                        RusotoError::Service(error) => Self::$variant(error),
                        RusotoError::HttpDispatch(err) => Self::RusotoError(RusotoError::HttpDispatch(err)),
                        RusotoError::Credentials(err) => Self::RusotoError(RusotoError::Credentials(err)),
                        RusotoError::Validation(msg) => Self::RusotoError(RusotoError::Validation(msg)),
                        RusotoError::ParseError(msg) => Self::RusotoError(RusotoError::ParseError(msg)),
                        RusotoError::Unknown(resp) => Self::RusotoError(RusotoError::Unknown(resp)),
                        RusotoError::Blocking => Self::RusotoError(RusotoError::Blocking),
                    }
                }
            }
        )*
    };
}

impl_from_rusoto_error! {
    CreateLogGroupError => CreateLogGroupError,
    PutRetentionPolicyError => PutRetentionPolicyError,
    DescribeLogGroupsError => DescribeLogGroupsError,
    DescribeLogStreamsError => DescribeLogStreamsError,
    CreateLogStreamError => CreateLogStreamError,
    PutLogEventsError => PutLogEventsError,
}

impl fmt::Display for RusotoLogsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RusotoLogsError::RusotoError(err) => write!(f, "{}", err),
            RusotoLogsError::CreateLogGroupError(err) => write!(f, "{}", err),
            RusotoLogsError::PutRetentionPolicyError(err) => write!(f, "{}", err),
            RusotoLogsError::DescribeLogGroupsError(err) => write!(f, "{}", err),
            RusotoLogsError::DescribeLogStreamsError(err) => write!(f, "{}", err),
            RusotoLogsError::CreateLogStreamError(err) => write!(f, "{}", err),
            RusotoLogsError::PutLogEventsError(err) => write!(f, "{}", err),
        }
    }
}

impl StdError for RusotoLogsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            RusotoLogsError::RusotoError(ref err) => StdError::source(err),
            RusotoLogsError::CreateLogGroupError(ref err) => StdError::source(err),
            RusotoLogsError::PutRetentionPolicyError(ref err) => StdError::source(err),
            RusotoLogsError::DescribeLogGroupsError(ref err) => StdError::source(err),
            RusotoLogsError::DescribeLogStreamsError(ref err) => StdError::source(err),
            RusotoLogsError::CreateLogStreamError(ref err) => StdError::source(err),
            RusotoLogsError::PutLogEventsError(ref err) => StdError::source(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_errors_keep_their_operation() {
        let err: RusotoLogsError = RusotoError::Service(PutLogEventsError::InvalidSequenceToken(
            "expected 42".to_string(),
        ))
        .into();
        assert!(matches!(
            err,
            RusotoLogsError::PutLogEventsError(PutLogEventsError::InvalidSequenceToken(_))
        ));
    }

    #[test]
    fn transport_errors_are_flattened() {
        let err: RusotoLogsError =
            RusotoError::<CreateLogStreamError>::Validation("bad name".to_string()).into();
        assert!(matches!(
            err,
            RusotoLogsError::RusotoError(RusotoError::Validation(ref msg)) if msg == "bad name"
        ));
        assert_eq!(err.to_string(), "bad name");
    }
}
