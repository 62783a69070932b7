use std::sync::Arc;

use rusoto_logs::{CloudWatchLogs, CloudWatchLogsClient};
use tracing::Level;
use tracing_core::Dispatch;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, Registry};

use crate::error::Result;
use crate::formatter::{ChannelFormat, LineFormatter, LogFormatter};
use crate::writer::{CloudWatchWriter, LogTarget};

/// The CloudWatch writer together with the options that decide which events
/// reach it and how they are rendered.
pub struct CloudWatchHandler<C = CloudWatchLogsClient> {
    writer: CloudWatchWriter<C>,
    level: LevelFilter,
    bubble: bool,
    formatter: Arc<dyn LogFormatter>,
}

impl<C> CloudWatchHandler<C> {
    pub fn new(writer: CloudWatchWriter<C>, level: LevelFilter, bubble: bool) -> Self {
        Self {
            writer,
            level,
            bubble,
            formatter: Arc::new(LineFormatter::default()),
        }
    }

    pub fn set_formatter(&mut self, formatter: Arc<dyn LogFormatter>) {
        self.formatter = formatter;
    }

    pub fn formatter(&self) -> &Arc<dyn LogFormatter> {
        &self.formatter
    }

    pub fn target(&self) -> &LogTarget {
        self.writer.target()
    }

    pub fn writer(&self) -> &CloudWatchWriter<C> {
        &self.writer
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }

    /// Whether events continue to other handlers after this one. The
    /// subscriber built by [`Logger`] has no other handler, so the flag is
    /// informational there.
    pub fn bubble(&self) -> bool {
        self.bubble
    }
}

/// A named logger shipping to CloudWatch.
///
/// Events can be emitted through the severity methods, or with `tracing`'s
/// macros inside [`Logger::in_scope`] or after [`Logger::init`].
pub struct Logger<C = CloudWatchLogsClient> {
    name: String,
    handler: CloudWatchHandler<C>,
    dispatch: Dispatch,
}

impl<C> Logger<C>
where
    C: CloudWatchLogs + Send + Sync + 'static,
{
    pub fn new(name: &str, handler: CloudWatchHandler<C>) -> Self {
        let layer = fmt::layer()
            .event_format(ChannelFormat::new(name, handler.formatter.clone()))
            .with_writer(handler.writer.clone());
        let subscriber = Registry::default().with(handler.level).with(layer);
        Self {
            name: name.to_string(),
            handler,
            dispatch: Dispatch::new(subscriber),
        }
    }
}

impl<C> Logger<C> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> &CloudWatchHandler<C> {
        &self.handler
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Runs `f` with this logger as the thread's default subscriber.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }

    /// Installs this logger as the process-wide default subscriber.
    pub fn init(&self) -> Result<()> {
        tracing::dispatcher::set_global_default(self.dispatch.clone())?;
        Ok(())
    }

    pub fn log(&self, level: Level, message: &str) {
        self.in_scope(|| match level {
            Level::TRACE => tracing::trace!("{}", message),
            Level::DEBUG => tracing::debug!("{}", message),
            Level::INFO => tracing::info!("{}", message),
            Level::WARN => tracing::warn!("{}", message),
            Level::ERROR => tracing::error!("{}", message),
        })
    }

    pub fn trace(&self, message: &str) {
        self.log(Level::TRACE, message)
    }

    pub fn debug(&self, message: &str) {
        self.log(Level::DEBUG, message)
    }

    pub fn info(&self, message: &str) {
        self.log(Level::INFO, message)
    }

    pub fn warn(&self, message: &str) {
        self.log(Level::WARN, message)
    }

    pub fn error(&self, message: &str) {
        self.log(Level::ERROR, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::time::{Duration, Instant};

    use parking_lot::Mutex;
    use rusoto_core::signature::{SignedRequest, SignedRequestPayload};
    use rusoto_core::Region;
    use rusoto_mock::{
        MockCredentialsProvider, MockRequestDispatcher, MultipleMockRequestDispatcher,
    };

    fn handler(level: LevelFilter) -> CloudWatchHandler {
        let client = CloudWatchLogsClient::new_with(
            MockRequestDispatcher::default(),
            MockCredentialsProvider,
            Region::UsEast1,
        );
        let writer = crate::writer("general", "default")
            .with_client(client)
            .build()
            .unwrap();
        CloudWatchHandler::new(writer, level, true)
    }

    fn enabled(logger: &Logger, level: Level) -> bool {
        logger.in_scope(|| match level {
            Level::TRACE => tracing::enabled!(Level::TRACE),
            Level::DEBUG => tracing::enabled!(Level::DEBUG),
            Level::INFO => tracing::enabled!(Level::INFO),
            Level::WARN => tracing::enabled!(Level::WARN),
            Level::ERROR => tracing::enabled!(Level::ERROR),
        })
    }

    #[test]
    fn respects_minimum_level() {
        let logger = Logger::new("app", handler(LevelFilter::WARN));
        assert_eq!(logger.name(), "app");
        assert!(!enabled(&logger, Level::INFO));
        assert!(enabled(&logger, Level::WARN));
        assert!(enabled(&logger, Level::ERROR));
    }

    #[test]
    fn attaches_formatter_to_handler() {
        let mut handler = handler(LevelFilter::DEBUG);
        let formatter: Arc<dyn LogFormatter> = Arc::new(crate::JsonFormatter);
        handler.set_formatter(formatter.clone());
        let logger = Logger::new("app", handler);
        assert!(Arc::ptr_eq(logger.handler().formatter(), &formatter));
        assert!(logger.handler().bubble());
    }

    type Requests = Arc<Mutex<Vec<(String, String)>>>;

    fn recording(requests: &Requests, body: &str) -> MockRequestDispatcher {
        let requests = requests.clone();
        MockRequestDispatcher::default()
            .with_body(body)
            .with_request_checker(move |request: &SignedRequest| {
                let operation = request
                    .headers
                    .get("x-amz-target")
                    .and_then(|values| values.first())
                    .map(|value| String::from_utf8_lossy(value).into_owned())
                    .unwrap_or_default();
                let payload = match &request.payload {
                    Some(SignedRequestPayload::Buffer(bytes)) => {
                        String::from_utf8_lossy(bytes).into_owned()
                    }
                    _ => String::new(),
                };
                requests.lock().push((operation, payload));
            })
    }

    fn payload_of(requests: &Requests, operation: &str) -> Option<String> {
        requests
            .lock()
            .iter()
            .find(|(target, _)| target.ends_with(operation))
            .map(|(_, payload)| payload.clone())
    }

    #[test]
    fn ships_formatted_events_to_cloudwatch() {
        let requests = Requests::default();
        let client = CloudWatchLogsClient::new_with(
            MultipleMockRequestDispatcher::new(vec![
                recording(&requests, r#"{"logGroups":[]}"#),
                recording(&requests, "{}"),
                recording(&requests, "{}"),
                recording(&requests, r#"{"logStreams":[]}"#),
                recording(&requests, "{}"),
                recording(&requests, r#"{"nextSequenceToken":"1"}"#),
            ]),
            MockCredentialsProvider,
            Region::UsEast1,
        );
        let mut tags = HashMap::new();
        tags.insert("team".to_string(), "payments".to_string());
        let writer = crate::writer("shop", "checkout")
            .with_client(client)
            .retention(30)
            .tags(tags)
            .build()
            .unwrap();
        let logger = Logger::new("api", CloudWatchHandler::new(writer, LevelFilter::DEBUG, true));

        logger.trace("below the minimum level");
        logger.info("order placed");

        let deadline = Instant::now() + Duration::from_secs(10);
        let put = loop {
            if let Some(payload) = payload_of(&requests, ".PutLogEvents") {
                break payload;
            }
            assert!(Instant::now() < deadline, "no PutLogEvents request was sent");
            std::thread::sleep(Duration::from_millis(50));
        };

        assert!(put.contains(r#""message":"api: INFO: order placed {} {}""#));
        assert!(!put.contains("below the minimum level"));
        assert!(put.contains(r#""logGroupName":"shop""#));
        assert!(put.contains(r#""logStreamName":"checkout""#));

        let create_group = payload_of(&requests, ".CreateLogGroup").unwrap();
        assert!(create_group.contains(r#""tags":{"team":"payments"}"#));
        let retention = payload_of(&requests, ".PutRetentionPolicy").unwrap();
        assert!(retention.contains(r#""retentionInDays":30"#));
        assert!(payload_of(&requests, ".CreateLogStream").is_some());
    }
}
