use std::sync::Arc;
use std::time::Duration;

use rusoto_core::RusotoError;
use rusoto_logs::{
    CloudWatchLogs, CreateLogGroupError, CreateLogGroupRequest, CreateLogStreamError,
    CreateLogStreamRequest, DescribeLogGroupsRequest, DescribeLogStreamsRequest, InputLogEvent,
    LogStream, PutLogEventsError, PutLogEventsRequest, PutRetentionPolicyRequest,
};
use tokio::sync::mpsc::Receiver;
use tokio::time::{timeout_at, Instant};

use crate::error::RusotoLogsError;
use crate::writer::LogTarget;
use crate::{CLOUDWATCH_EXTRA_MSG_PAYLOAD_SIZE, CLOUDWATCH_MAX_BATCH_SIZE};

/// How long a partially filled batch waits for more events.
pub(crate) const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

const SEQUENCE_TOKEN_RETRIES: usize = 3;

pub(crate) async fn rusoto_worker_loop<C>(
    client: Arc<C>,
    receiver: Receiver<InputLogEvent>,
    target: Arc<LogTarget>,
) where
    C: CloudWatchLogs + Send + Sync + 'static,
{
    let mut sequence_token = match prepare_destination(client.as_ref(), &target).await {
        Ok(sequence_token) => sequence_token,
        Err(err) => {
            eprintln!(
                "Failed to prepare CloudWatch log stream {}/{}: {}",
                target.log_group, target.log_stream, err
            );
            None
        }
    };

    let mut batcher = Batcher::new(receiver, target.batch_size, FLUSH_INTERVAL);
    while let Some(batch) = batcher.next_batch().await {
        match put_batch(
            client.as_ref(),
            &target,
            batch,
            sequence_token.take(),
            SEQUENCE_TOKEN_RETRIES,
        )
        .await
        {
            Ok(next_token) => sequence_token = next_token,
            Err(err) => eprintln!(
                "Failed to put log events to {}/{}: {}",
                target.log_group, target.log_stream, err
            ),
        }
    }
}

/// Creates the log group (with tags and retention) and the log stream when
/// they are missing. Returns the stream's upload sequence token.
pub(crate) async fn prepare_destination<C>(
    client: &C,
    target: &LogTarget,
) -> Result<Option<String>, RusotoLogsError>
where
    C: CloudWatchLogs + Send + Sync,
{
    if target.create_group && !log_group_exists(client, target).await? {
        let request = CreateLogGroupRequest {
            log_group_name: target.log_group.clone(),
            tags: if target.tags.is_empty() {
                None
            } else {
                Some(target.tags.clone())
            },
            ..Default::default()
        };
        match client.create_log_group(request).await {
            Ok(()) | Err(RusotoError::Service(CreateLogGroupError::ResourceAlreadyExists(_))) => {}
            Err(err) => return Err(err.into()),
        }
        if let Some(retention_in_days) = target.retention_days {
            client
                .put_retention_policy(PutRetentionPolicyRequest {
                    log_group_name: target.log_group.clone(),
                    retention_in_days,
                })
                .await?;
        }
    }

    if let Some(stream) = find_log_stream(client, target).await? {
        return Ok(stream.upload_sequence_token);
    }
    let request = CreateLogStreamRequest {
        log_group_name: target.log_group.clone(),
        log_stream_name: target.log_stream.clone(),
    };
    match client.create_log_stream(request).await {
        Ok(()) | Err(RusotoError::Service(CreateLogStreamError::ResourceAlreadyExists(_))) => {
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

async fn log_group_exists<C>(client: &C, target: &LogTarget) -> Result<bool, RusotoLogsError>
where
    C: CloudWatchLogs + Send + Sync,
{
    let response = client
        .describe_log_groups(DescribeLogGroupsRequest {
            log_group_name_prefix: Some(target.log_group.clone()),
            ..Default::default()
        })
        .await?;
    Ok(response
        .log_groups
        .unwrap_or_default()
        .iter()
        .any(|group| group.log_group_name.as_deref() == Some(target.log_group.as_str())))
}

async fn find_log_stream<C>(
    client: &C,
    target: &LogTarget,
) -> Result<Option<LogStream>, RusotoLogsError>
where
    C: CloudWatchLogs + Send + Sync,
{
    let response = client
        .describe_log_streams(DescribeLogStreamsRequest {
            log_group_name: target.log_group.clone(),
            log_stream_name_prefix: Some(target.log_stream.clone()),
            ..Default::default()
        })
        .await?;
    Ok(response
        .log_streams
        .unwrap_or_default()
        .into_iter()
        .find(|stream| stream.log_stream_name.as_deref() == Some(target.log_stream.as_str())))
}

async fn upload_sequence_token<C>(
    client: &C,
    target: &LogTarget,
) -> Result<Option<String>, RusotoLogsError>
where
    C: CloudWatchLogs + Send + Sync,
{
    Ok(find_log_stream(client, target)
        .await?
        .and_then(|stream| stream.upload_sequence_token))
}

/// Sends one batch. A rejected sequence token is refreshed from the stream
/// and the batch resent, at most `retries` times.
pub(crate) async fn put_batch<C>(
    client: &C,
    target: &LogTarget,
    log_events: Vec<InputLogEvent>,
    mut sequence_token: Option<String>,
    mut retries: usize,
) -> Result<Option<String>, RusotoLogsError>
where
    C: CloudWatchLogs + Send + Sync,
{
    loop {
        let request = PutLogEventsRequest {
            log_events: log_events.clone(),
            log_group_name: target.log_group.clone(),
            log_stream_name: target.log_stream.clone(),
            sequence_token,
        };
        match client.put_log_events(request).await {
            Ok(response) => return Ok(response.next_sequence_token),
            Err(RusotoError::Service(PutLogEventsError::InvalidSequenceToken(_))) if retries > 0 => {
                retries -= 1;
                sequence_token = upload_sequence_token(client, target).await?;
            }
            Err(RusotoError::Service(PutLogEventsError::DataAlreadyAccepted(_))) => {
                return upload_sequence_token(client, target).await
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Groups incoming events into `PutLogEvents` sized batches.
pub(crate) struct Batcher {
    receiver: Receiver<InputLogEvent>,
    batch_size: usize,
    flush_interval: Duration,
    pending: Option<InputLogEvent>,
}

impl Batcher {
    pub(crate) fn new(
        receiver: Receiver<InputLogEvent>,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Self {
        Self {
            receiver,
            batch_size,
            flush_interval,
            pending: None,
        }
    }

    /// Waits for at least one event, then collects more until the batch is
    /// full, the payload limit is reached or the flush interval passes.
    /// Returns `None` once every sender is gone and nothing is left.
    pub(crate) async fn next_batch(&mut self) -> Option<Vec<InputLogEvent>> {
        let first = match self.pending.take() {
            Some(event) => event,
            None => self.receiver.recv().await?,
        };
        let deadline = Instant::now() + self.flush_interval;
        let mut payload_size = event_size(&first);
        let mut batch = vec![first];

        while batch.len() < self.batch_size {
            match timeout_at(deadline, self.receiver.recv()).await {
                Ok(Some(event)) => {
                    let size = event_size(&event);
                    if payload_size + size > CLOUDWATCH_MAX_BATCH_SIZE {
                        self.pending = Some(event);
                        break;
                    }
                    payload_size += size;
                    batch.push(event);
                }
                Ok(None) | Err(_) => break,
            }
        }

        batch.sort_by_key(|event| event.timestamp);
        Some(batch)
    }
}

fn event_size(event: &InputLogEvent) -> usize {
    event.message.len() + CLOUDWATCH_EXTRA_MSG_PAYLOAD_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use rusoto_core::Region;
    use rusoto_logs::CloudWatchLogsClient;
    use rusoto_mock::{
        MockCredentialsProvider, MockRequestDispatcher, MultipleMockRequestDispatcher,
    };
    use tokio::sync::mpsc::channel;

    fn target() -> LogTarget {
        LogTarget {
            log_group: "general".to_string(),
            log_stream: "default".to_string(),
            retention_days: Some(14),
            batch_size: 10_000,
            tags: HashMap::new(),
            create_group: true,
        }
    }

    fn event(message: &str, timestamp: i64) -> InputLogEvent {
        InputLogEvent {
            message: message.to_string(),
            timestamp,
        }
    }

    fn client(responses: Vec<MockRequestDispatcher>) -> CloudWatchLogsClient {
        CloudWatchLogsClient::new_with(
            MultipleMockRequestDispatcher::new(responses),
            MockCredentialsProvider,
            Region::UsEast1,
        )
    }

    #[tokio::test]
    async fn batches_are_capped_and_sorted() {
        let (sender, receiver) = channel(16);
        for (message, timestamp) in &[("c", 3), ("a", 1), ("b", 2)] {
            sender.send(event(message, *timestamp)).await.unwrap();
        }
        let mut batcher = Batcher::new(receiver, 2, Duration::from_millis(10));

        let batch = batcher.next_batch().await.unwrap();
        let messages: Vec<_> = batch.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["a", "c"]);

        let batch = batcher.next_batch().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].message, "b");

        drop(sender);
        assert!(batcher.next_batch().await.is_none());
    }

    #[tokio::test]
    async fn oversized_payload_carries_over() {
        let (sender, receiver) = channel(4);
        let large = "x".repeat(CLOUDWATCH_MAX_BATCH_SIZE / 2);
        for timestamp in 0..3 {
            sender.send(event(&large, timestamp)).await.unwrap();
        }
        drop(sender);
        let mut batcher = Batcher::new(receiver, 10_000, Duration::from_millis(10));

        assert_eq!(batcher.next_batch().await.unwrap().len(), 1);
        assert_eq!(batcher.next_batch().await.unwrap().len(), 1);
        assert_eq!(batcher.next_batch().await.unwrap().len(), 1);
        assert!(batcher.next_batch().await.is_none());
    }

    #[tokio::test]
    async fn put_batch_returns_next_token() {
        let client = client(vec![MockRequestDispatcher::default()
            .with_body(r#"{"nextSequenceToken":"49590302"}"#)]);
        let token = put_batch(&client, &target(), vec![event("hello", 1)], None, 3)
            .await
            .unwrap();
        assert_eq!(token.as_deref(), Some("49590302"));
    }

    #[tokio::test]
    async fn put_batch_refreshes_invalid_sequence_token() {
        let client = client(vec![
            MockRequestDispatcher::with_status(400).with_body(
                r#"{"__type":"InvalidSequenceTokenException","message":"The given sequenceToken is invalid"}"#,
            ),
            MockRequestDispatcher::default().with_body(
                r#"{"logStreams":[{"logStreamName":"default","uploadSequenceToken":"777"}]}"#,
            ),
            MockRequestDispatcher::default().with_body(r#"{"nextSequenceToken":"778"}"#),
        ]);
        let token = put_batch(&client, &target(), vec![event("hello", 1)], Some("1".into()), 3)
            .await
            .unwrap();
        assert_eq!(token.as_deref(), Some("778"));
    }

    #[tokio::test]
    async fn put_batch_gives_up_on_other_errors() {
        let client = client(vec![MockRequestDispatcher::with_status(400).with_body(
            r#"{"__type":"ResourceNotFoundException","message":"The specified log stream does not exist."}"#,
        )]);
        let err = put_batch(&client, &target(), vec![event("hello", 1)], None, 3)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RusotoLogsError::PutLogEventsError(PutLogEventsError::ResourceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn prepare_creates_missing_group_and_stream() {
        let client = client(vec![
            MockRequestDispatcher::default().with_body(r#"{"logGroups":[]}"#),
            MockRequestDispatcher::default().with_body("{}"),
            MockRequestDispatcher::default().with_body("{}"),
            MockRequestDispatcher::default().with_body(r#"{"logStreams":[]}"#),
            MockRequestDispatcher::default().with_body("{}"),
        ]);
        let token = prepare_destination(&client, &target()).await.unwrap();
        assert_eq!(token, None);
    }

    #[tokio::test]
    async fn prepare_reuses_existing_stream() {
        let mut target = target();
        target.create_group = false;
        let client = client(vec![MockRequestDispatcher::default().with_body(
            r#"{"logStreams":[{"logStreamName":"default-old"},{"logStreamName":"default","uploadSequenceToken":"12"}]}"#,
        )]);
        let token = prepare_destination(&client, &target).await.unwrap();
        assert_eq!(token.as_deref(), Some("12"));
    }
}
