mod common;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crawl_pipeline::{
        cdx::CdxRecord,
        rabbitmq::{
            decode_batch, encode_batch, ErrorKind, QueueChannel, QueueError, MAX_RETRIES,
        },
    };
    use serde_json::json;

    use crate::common::RecordingTransport;

    fn transport_error() -> QueueError {
        QueueError::Transport("connection reset by peer".to_string())
    }

    fn auth_error() -> QueueError {
        QueueError::Auth("ACCESS_REFUSED".to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn publish_gives_up_after_three_attempts() {
        let mut queue = QueueChannel::new(RecordingTransport::failing(u32::MAX, transport_error));
        let started = tokio::time::Instant::now();

        let err = queue.publish(b"[]").await.unwrap_err();

        assert!(matches!(
            err,
            QueueError::PublishExhausted { attempts: 3, .. }
        ));
        assert_eq!(queue.transport().attempts, MAX_RETRIES);
        assert_eq!(queue.transport().reconnects, 2);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(queue.retry_state().last_error, Some(ErrorKind::Transport));
    }

    #[tokio::test(start_paused = true)]
    async fn publish_recovers_after_reconnecting() {
        let mut queue = QueueChannel::new(RecordingTransport::failing(2, transport_error));

        queue.publish(b"[1]").await.unwrap();

        assert_eq!(queue.transport().published, vec![b"[1]".to_vec()]);
        assert_eq!(queue.transport().reconnects, 2);
        assert_eq!(queue.retry_state().attempt, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_errors_are_not_retried() {
        let mut queue = QueueChannel::new(RecordingTransport::failing(u32::MAX, auth_error));
        let started = tokio::time::Instant::now();

        let err = queue.publish(b"[]").await.unwrap_err();

        assert!(matches!(err, QueueError::Auth(_)));
        assert!(err.is_fatal());
        assert_eq!(queue.transport().attempts, 1);
        assert_eq!(queue.transport().reconnects, 0);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn custom_policy_without_delay() {
        let mut queue = QueueChannel::with_policy(
            RecordingTransport::failing(u32::MAX, transport_error),
            5,
            Duration::ZERO,
        );
        assert!(queue.publish(b"[]").await.is_err());
        assert_eq!(queue.transport().attempts, 5);
    }

    #[test]
    fn batches_survive_the_wire_format() {
        let batch = vec![
            CdxRecord {
                surt_url: "com,example)/".to_string(),
                timestamp: "20240722120756".to_string(),
                metadata: json!({"status": "200", "languages": "eng", "offset": "3499"})
                    .as_object()
                    .cloned()
                    .unwrap(),
            },
            CdxRecord {
                surt_url: "org,example)/about".to_string(),
                timestamp: "20240723213521".to_string(),
                metadata: json!({"status": "200", "languages": ["eng"], "length": 689})
                    .as_object()
                    .cloned()
                    .unwrap(),
            },
        ];
        let payload = encode_batch(&batch).unwrap();
        let wire: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(wire[0]["surt_url"], "com,example)/");
        assert_eq!(decode_batch(&payload).unwrap(), batch);
    }
}
