use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use parking_lot::RwLock;
use rusoto_logs::{CloudWatchLogs, InputLogEvent};
use tokio::runtime::{Builder, Handle};
use tokio::sync::mpsc::{channel, Sender};
use tracing_core::{Dispatch, Metadata};
use tracing_subscriber::fmt::MakeWriter;

use crate::worker::rusoto_worker_loop;
use crate::{
    CLOUDWATCH_EXTRA_MSG_PAYLOAD_SIZE, CLOUDWATCH_MAX_BATCH_EVENTS_LENGTH,
    CLOUDWATCH_MAX_BATCH_SIZE,
};

const MAX_MESSAGE_SIZE: usize = CLOUDWATCH_MAX_BATCH_SIZE - CLOUDWATCH_EXTRA_MSG_PAYLOAD_SIZE;

/// Where a writer ships its events and how the destination is prepared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTarget {
    pub log_group: String,
    pub log_stream: String,
    /// Applied when the worker creates the log group.
    pub retention_days: Option<i64>,
    pub batch_size: usize,
    pub tags: HashMap<String, String>,
    pub create_group: bool,
}

pub struct CloudWatchWriterBuilder<C> {
    client: Arc<C>,
    target: LogTarget,
}

impl CloudWatchWriterBuilder<()> {
    pub fn new(log_group: &str, log_stream: &str) -> Self {
        Self {
            client: Arc::new(()),
            target: LogTarget {
                log_group: log_group.to_string(),
                log_stream: log_stream.to_string(),
                retention_days: None,
                batch_size: CLOUDWATCH_MAX_BATCH_EVENTS_LENGTH,
                tags: HashMap::new(),
                create_group: true,
            },
        }
    }
}

impl<C> CloudWatchWriterBuilder<C> {
    pub fn with_client<C2>(self, client: C2) -> CloudWatchWriterBuilder<C2>
    where
        C2: CloudWatchLogs + Send + Sync + 'static,
    {
        CloudWatchWriterBuilder {
            client: Arc::new(client),
            target: self.target,
        }
    }

    pub fn retention(mut self, days: i64) -> Self {
        self.target.retention_days = Some(days);
        self
    }

    /// Clamped to `1..=10000`, the range `PutLogEvents` accepts.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.target.batch_size = batch_size.max(1).min(CLOUDWATCH_MAX_BATCH_EVENTS_LENGTH);
        self
    }

    pub fn tags(mut self, tags: HashMap<String, String>) -> Self {
        self.target.tags = tags;
        self
    }

    pub fn create_group(mut self, create_group: bool) -> Self {
        self.target.create_group = create_group;
        self
    }
}

impl<C> CloudWatchWriterBuilder<C>
where
    C: CloudWatchLogs + Send + Sync + 'static,
{
    /// Starts the runtime thread the shipping worker runs on.
    pub fn build(self) -> io::Result<CloudWatchWriter<C>> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let runtime_handle = runtime.handle().clone();
        std::thread::Builder::new()
            .name("cloudwatch-logs".to_string())
            .spawn(move || {
                // Events from rusoto and hyper on this thread must not be
                // shipped back to CloudWatch.
                tracing_core::dispatcher::with_default(&Dispatch::none(), || {
                    runtime.block_on(std::future::pending::<()>());
                });
            })?;
        Ok(CloudWatchWriter {
            client: self.client,
            target: Arc::new(self.target),
            channel: Arc::new(RwLock::new(None)),
            runtime_handle,
        })
    }
}

/// `MakeWriter` that turns every written line into a CloudWatch log event.
pub struct CloudWatchWriter<C> {
    client: Arc<C>,
    target: Arc<LogTarget>,
    channel: Arc<RwLock<Option<Sender<InputLogEvent>>>>,
    runtime_handle: Handle,
}

impl<C> Clone for CloudWatchWriter<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            target: self.target.clone(),
            channel: self.channel.clone(),
            runtime_handle: self.runtime_handle.clone(),
        }
    }
}

impl<C> CloudWatchWriter<C> {
    pub fn target(&self) -> &LogTarget {
        &self.target
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

impl<C> CloudWatchWriter<C>
where
    C: CloudWatchLogs + Send + Sync + 'static,
{
    fn get_or_spawn_worker(&self) -> Sender<InputLogEvent> {
        let read_guard = self.channel.read();
        if let Some(sender) = read_guard.as_ref() {
            if !sender.is_closed() {
                return sender.clone();
            }
        }
        drop(read_guard);
        let mut write_guard = self.channel.write();
        if let Some(sender) = write_guard.as_ref() {
            if !sender.is_closed() {
                return sender.clone();
            }
        }
        let (sender, receiver) = channel(CLOUDWATCH_MAX_BATCH_EVENTS_LENGTH);
        self.runtime_handle.spawn(rusoto_worker_loop(
            self.client.clone(),
            receiver,
            self.target.clone(),
        ));
        *write_guard = Some(sender.clone());
        sender
    }
}

impl<C> MakeWriter for CloudWatchWriter<C>
where
    C: CloudWatchLogs + Send + Sync + 'static,
{
    type Writer = CloudWatchLineWriter;

    fn make_writer(&self) -> Self::Writer {
        CloudWatchLineWriter::new(self.get_or_spawn_worker(), self.runtime_handle.clone())
    }

    fn make_writer_for(&self, _metadata: &Metadata<'_>) -> Self::Writer {
        self.make_writer()
    }
}

pub struct CloudWatchLineWriter {
    line_writer: io::LineWriter<Inner>,
}

impl CloudWatchLineWriter {
    fn new(channel: Sender<InputLogEvent>, runtime_handle: Handle) -> Self {
        let inner = Inner {
            channel,
            runtime_handle,
        };
        let line_writer = io::LineWriter::new(inner);
        Self { line_writer }
    }
}

impl io::Write for CloudWatchLineWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.line_writer.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.line_writer.flush()
    }

    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        self.line_writer.write_vectored(bufs)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.line_writer.write_all(buf)
    }

    fn write_fmt(&mut self, fmt: std::fmt::Arguments<'_>) -> io::Result<()> {
        self.line_writer.write_fmt(fmt)
    }
}

#[derive(Clone)]
struct Inner {
    channel: Sender<InputLogEvent>,
    runtime_handle: Handle,
}

impl io::Write for Inner {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let buf_len = buf.len();
        let timestamp = timestamp();

        let buf = buf.strip_suffix(b"\n").unwrap_or(buf);

        let mut message = String::from_utf8_lossy(buf).into_owned();
        if message.len() > MAX_MESSAGE_SIZE {
            eprintln!("Message size exceeds max payload size, truncated");
            let mut end = MAX_MESSAGE_SIZE;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            message.truncate(end);
        }
        let channel = self.channel.clone();
        self.runtime_handle.spawn(async move {
            let _ = channel.send(InputLogEvent { message, timestamp }).await;
        });

        Ok(buf_len)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.write(buf).map(|_| ())
    }
}

/// Returns current unix timestamp in milliseconds
fn timestamp() -> i64 {
    use std::convert::TryFrom;
    use std::time::SystemTime;
    match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(duration) => i64::try_from(duration.as_millis()).unwrap_or(i64::MAX),
        Err(err) => -i64::try_from(err.duration().as_millis()).unwrap_or(i64::MAX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use rusoto_core::Region;
    use rusoto_logs::CloudWatchLogsClient;
    use rusoto_mock::{MockCredentialsProvider, MockRequestDispatcher};

    fn inner(sender: Sender<InputLogEvent>) -> Inner {
        Inner {
            channel: sender,
            runtime_handle: Handle::current(),
        }
    }

    #[tokio::test]
    async fn strips_trailing_newline() {
        let (sender, mut receiver) = channel(4);
        let mut inner = inner(sender);
        assert_eq!(inner.write(b"payment accepted\n").unwrap(), 17);

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.message, "payment accepted");
        assert!(event.timestamp > 0);
    }

    #[tokio::test]
    async fn truncates_oversized_messages() {
        let (sender, mut receiver) = channel(4);
        let mut inner = inner(sender);
        let huge = vec![b'a'; CLOUDWATCH_MAX_BATCH_SIZE + 10];
        inner.write_all(&huge).unwrap();

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.message.len(), MAX_MESSAGE_SIZE);
    }

    #[tokio::test]
    async fn truncation_keeps_whole_characters() {
        let (sender, mut receiver) = channel(4);
        let mut inner = inner(sender);
        let mut message = "a".repeat(MAX_MESSAGE_SIZE - 1);
        message.push_str(&"é".repeat(10));
        inner.write_all(message.as_bytes()).unwrap();

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.message.len(), MAX_MESSAGE_SIZE - 1);
        assert!(event.message.chars().all(|c| c == 'a'));
        assert!(event.message.len() + CLOUDWATCH_EXTRA_MSG_PAYLOAD_SIZE <= CLOUDWATCH_MAX_BATCH_SIZE);
    }

    #[tokio::test]
    async fn line_writer_emits_one_event_per_line() {
        let (sender, mut receiver) = channel(4);
        let mut writer = CloudWatchLineWriter::new(sender, Handle::current());
        writer.write_all(b"first\n").unwrap();
        writer.write_all(b"second\n").unwrap();
        drop(writer);

        assert_eq!(receiver.recv().await.unwrap().message, "first");
        assert_eq!(receiver.recv().await.unwrap().message, "second");
    }

    #[test]
    fn builder_configures_target() {
        let client = CloudWatchLogsClient::new_with(
            MockRequestDispatcher::default(),
            MockCredentialsProvider,
            Region::UsEast1,
        );
        let writer = crate::writer("app", "web")
            .with_client(client)
            .retention(30)
            .batch_size(50_000)
            .create_group(false)
            .build()
            .unwrap();
        let target = writer.target();
        assert_eq!(target.log_group, "app");
        assert_eq!(target.log_stream, "web");
        assert_eq!(target.retention_days, Some(30));
        assert_eq!(target.batch_size, CLOUDWATCH_MAX_BATCH_EVENTS_LENGTH);
        assert!(!target.create_group);
    }
}
