mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{object, payload, wait_until, Call, MemoryTransport, Op};
use dog_transfer::transport::GetObjectRequest;
use dog_transfer::{
    ByteRange, DownloadEngine, DownloadRequest, DownloadResumeContext, DownloadStrategy, FileSink, MemorySink,
    ObjectTransport, ResumeToken, TransferConfig, TransferError, TransferState,
};
use futures_util::StreamExt;

fn engine(transport: &Arc<MemoryTransport>, max_concurrency: usize) -> DownloadEngine {
    let config = TransferConfig::new()
        .with_part_size(4)
        .with_multipart_threshold(4)
        .with_max_concurrency(max_concurrency);
    DownloadEngine::new(transport.clone(), config).unwrap()
}

/// Five parts of four bytes
fn seeded(transport: &MemoryTransport) -> (Bytes, String) {
    let data = payload(20);
    let etag = transport.insert_object(&object("obj"), data.clone(), Some(4));
    (data, etag)
}

async fn download_with(strategy: DownloadStrategy) -> (Arc<MemoryTransport>, Bytes, Arc<MemorySink>) {
    let transport = MemoryTransport::new();
    let (data, etag) = seeded(&transport);
    let sink = MemorySink::shared();

    let output = engine(&transport, 2)
        .download(DownloadRequest::new(object("obj")).with_strategy(strategy), sink.clone())
        .join()
        .await
        .unwrap();

    assert_eq!(output.parts, 5);
    assert_eq!(output.bytes, 20);
    assert_eq!(output.etag.as_deref(), Some(etag.as_str()));
    (transport, data, sink)
}

#[tokio::test]
async fn serial_download_fetches_parts_in_order() {
    let (transport, data, sink) = download_with(DownloadStrategy::Serial).await;

    assert_eq!(sink.contents(), data);
    assert_eq!(transport.fetched_parts(), vec![1, 2, 3, 4, 5]);
    assert_eq!(transport.peak(), 1);
}

#[tokio::test]
async fn unordered_download_reassembles_the_object() {
    let (transport, data, sink) = download_with(DownloadStrategy::Unordered).await;

    assert_eq!(sink.contents(), data);
    assert_eq!(transport.fetched_parts(), vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn parallel_download_reassembles_the_object() {
    let (transport, data, sink) = download_with(DownloadStrategy::Parallel).await;

    assert_eq!(sink.contents(), data);
    let mut fetched = transport.fetched_parts();
    assert_eq!(fetched[0], 1);
    fetched.sort();
    assert_eq!(fetched, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn later_parts_are_pinned_to_the_first_etag() {
    let (transport, _, _) = download_with(DownloadStrategy::Parallel).await;
    // First object stored by a fresh transport
    let etag = "\"etag-1\"";

    let pins: Vec<Option<String>> = transport
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::Get {
                part_number: Some(n),
                if_match,
            } if n > 1 => Some(if_match),
            _ => None,
        })
        .collect();
    assert_eq!(pins.len(), 4);
    assert!(pins.iter().all(|pin| pin.as_deref() == Some(etag)));
}

#[tokio::test]
async fn replaced_object_fails_the_download() {
    let transport = MemoryTransport::new();
    seeded(&transport);
    transport.gate_parts_from(2);
    let sink = MemorySink::shared();

    let handle = engine(&transport, 2).download(DownloadRequest::new(object("obj")), sink);
    wait_until("parts 2 and 3 requested", || transport.fetched_parts().len() == 3).await;
    transport.insert_object(&object("obj"), payload(20), Some(4));
    transport.open_gate();

    let err = handle.join().await.unwrap_err();
    assert!(matches!(err, TransferError::Transport { .. }));
}

#[tokio::test]
async fn single_request_object_is_one_get() {
    let transport = MemoryTransport::new();
    let data = payload(10);
    transport.insert_object(&object("small"), data.clone(), None);
    let sink = MemorySink::shared();

    let output = engine(&transport, 4)
        .download(DownloadRequest::new(object("small")), sink.clone())
        .join()
        .await
        .unwrap();

    assert_eq!(output.parts, 1);
    assert_eq!(output.bytes, 10);
    assert_eq!(transport.fetched_parts(), vec![1]);
    assert_eq!(sink.contents(), data);
}

#[tokio::test]
async fn empty_object_downloads_as_empty() {
    let transport = MemoryTransport::new();
    transport.insert_object(&object("empty"), Bytes::new(), None);
    let sink = MemorySink::shared();

    let output = engine(&transport, 4)
        .download(DownloadRequest::new(object("empty")), sink.clone())
        .join()
        .await
        .unwrap();

    assert_eq!(output.bytes, 0);
    assert!(sink.is_empty());
}

#[tokio::test]
async fn parallel_window_holds_two_parts_in_flight() {
    let transport = MemoryTransport::new();
    let (data, _) = seeded(&transport);
    transport.gate_parts_from(2);
    let sink = MemorySink::shared();

    let handle = engine(&transport, 2).download(DownloadRequest::new(object("obj")), sink.clone());
    wait_until("two parts in flight", || transport.active() == 2).await;

    assert_eq!(transport.fetched_parts(), vec![1, 2, 3]);
    assert_eq!(handle.in_flight(), 2);

    transport.release(1);
    wait_until("a slot to refill", || transport.fetched_parts().len() == 4).await;
    assert!(handle.in_flight() <= 2);

    transport.open_gate();
    handle.join().await.unwrap();
    assert!(transport.peak() <= 2, "peak was {}", transport.peak());
    assert_eq!(sink.contents(), data);
}

#[tokio::test]
async fn part_failure_fails_the_download() {
    let transport = MemoryTransport::new();
    seeded(&transport);
    transport.fail_part(Op::Get, 3);

    for strategy in [DownloadStrategy::Serial, DownloadStrategy::Unordered, DownloadStrategy::Parallel] {
        let handle = engine(&transport, 2).download(
            DownloadRequest::new(object("obj")).with_strategy(strategy),
            MemorySink::shared(),
        );
        let err = handle.join().await.unwrap_err();
        assert!(
            matches!(err, TransferError::Transport { operation: "get_object", .. }),
            "{:?}: {}",
            strategy,
            err
        );
    }
}

#[tokio::test]
async fn cancel_stops_the_download() {
    let transport = MemoryTransport::new();
    seeded(&transport);
    transport.gate_parts_from(2);

    let handle = engine(&transport, 2).download(DownloadRequest::new(object("obj")), MemorySink::shared());
    wait_until("parts requested", || transport.fetched_parts().len() == 3).await;

    handle.cancel();
    assert!(matches!(handle.join().await, Err(TransferError::Cancelled)));
}

#[tokio::test]
async fn paused_download_resumes_with_only_missing_parts() {
    let transport = MemoryTransport::new();
    let (data, _) = seeded(&transport);
    transport.gate_parts_from(3);
    let sink = MemorySink::shared();
    let engine = engine(&transport, 2);

    let handle = engine.download(DownloadRequest::new(object("obj")), sink.clone());
    // Part 4 is only requested once part 2 is written and recorded
    wait_until("parts 3 and 4 requested", || transport.fetched_parts().len() == 4).await;

    let token = handle.pause().await.expect("pausable");
    assert_eq!(handle.state(), TransferState::Paused);
    assert!(matches!(handle.join().await, Err(TransferError::Paused)));

    let token = ResumeToken::decode(&token.encode().unwrap()).unwrap();
    let context = DownloadResumeContext::from_token(&token).unwrap();
    assert_eq!(context.highest_contiguous(), 2);
    assert_eq!(context.bytes_to_last_contiguous_part(), 8);
    assert_eq!(context.remaining_parts(), vec![3, 4, 5]);

    transport.open_gate();
    let before = transport.fetched_parts().len();
    let output = engine
        .resume_download(DownloadRequest::new(object("obj")), sink.clone(), context)
        .join()
        .await
        .unwrap();

    let mut resumed = transport.fetched_parts()[before..].to_vec();
    resumed.sort();
    assert_eq!(resumed, vec![3, 4, 5]);
    assert_eq!(output.bytes, 20);
    assert_eq!(sink.contents(), data);
}

#[tokio::test]
async fn resume_after_a_gap_counts_the_short_last_part_once() {
    let transport = MemoryTransport::new();
    let data = payload(20);
    let etag = transport.insert_object(&object("obj"), data.clone(), Some(8));

    // Parts 1 and 3 landed before the pause; part 3 is the short tail
    let mut paused = DownloadResumeContext::new(object("obj"), Some(etag), 3, 8);
    paused.record(1, 8).unwrap();
    paused.record(3, 4).unwrap();
    let token = ResumeToken::decode(&paused.to_token().encode().unwrap()).unwrap();
    let context = DownloadResumeContext::from_token(&token).unwrap();
    assert_eq!(context.bytes_to_last_contiguous_part(), 8);
    assert_eq!(context.remaining_parts(), vec![2]);

    let sink = MemorySink::shared();
    let output = engine(&transport, 2)
        .resume_download(DownloadRequest::new(object("obj")), sink.clone(), context)
        .join()
        .await
        .unwrap();

    assert_eq!(output.bytes, 20);
    assert_eq!(output.parts, 3);
    assert_eq!(transport.fetched_parts(), vec![2]);
    assert_eq!(sink.contents().slice(8..16), data.slice(8..16));
}

#[tokio::test]
async fn resume_context_for_another_object_is_rejected() {
    let transport = MemoryTransport::new();
    seeded(&transport);
    let mut context = DownloadResumeContext::new(object("other"), None, 5, 4);
    context.record(1, 4).unwrap();

    let err = engine(&transport, 2)
        .resume_download(DownloadRequest::new(object("obj")), MemorySink::shared(), context)
        .join()
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::Invalid { .. }));
}

#[tokio::test]
async fn download_into_a_file() {
    let transport = MemoryTransport::new();
    let (data, _) = seeded(&transport);
    transport.delay_part(2, Duration::from_millis(20));
    let path = std::env::temp_dir().join(format!("dog-transfer-{}.bin", uuid::Uuid::new_v4()));
    let sink = Arc::new(FileSink::create(&path).await.unwrap());

    engine(&transport, 3)
        .download(
            DownloadRequest::new(object("obj")).with_strategy(DownloadStrategy::Unordered),
            sink,
        )
        .join()
        .await
        .unwrap();

    let written = tokio::fs::read(&path).await.unwrap();
    let _ = tokio::fs::remove_file(&path).await;
    assert_eq!(Bytes::from(written), data);
}

#[tokio::test]
async fn ranged_get_returns_the_requested_slice() {
    let transport = MemoryTransport::new();
    let (data, etag) = seeded(&transport);

    let request = GetObjectRequest::range(object("obj"), ByteRange::new(6, 13)).with_if_match(Some(etag));
    let response = transport.get_object(request).await.unwrap();

    assert_eq!(response.parts_count, None);
    assert_eq!(response.content_range, Some((ByteRange::new(6, 13), 20)));
    let body: Vec<Bytes> = response.body.map(|chunk| chunk.unwrap()).collect().await;
    assert_eq!(Bytes::from(body.concat()), data.slice(6..14));
    assert_eq!(transport.fetched_parts(), Vec::<u32>::new());
}
