use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::*;

/// Three viewers on tiers {0, 1, 1} with two variants produced, then a
/// fourth viewer joins and is caught up on the last segment.
#[tokio::test]
async fn tiers_get_their_variant_and_late_joiner_catches_up() {
    let n = node(vec![p720()]);

    n.publish(segment(2_500, 1)).await;
    assert!(n.overlay.group_sends().is_empty(), "nobody to send to yet");

    for v in ["a", "b", "c"] {
        n.send(v, b"ping").await;
    }
    n.send("a", b"quality0").await;
    n.overlay.clear();

    let second = segment(2_500, 2);
    n.publish(second.clone()).await;

    // Source to tier 0.
    assert_eq!(n.overlay.received_by("a").len(), 3);
    assert_eq!(n.segments_of("a"), vec![(1, second.clone())]);

    // 720p (half size in the fake) to tier 1, as one group send per chunk.
    let lower = second.slice(..1_250);
    assert_eq!(n.segments_of("b"), vec![(1, lower.clone())]);
    assert_eq!(n.segments_of("c"), vec![(1, lower)]);
    let groups = n.overlay.group_sends();
    assert_eq!(groups.len(), 2);
    for (dests, _) in &groups {
        assert_eq!(dests, &vec!["b".to_string(), "c".to_string()]);
    }

    n.overlay.clear();
    n.send("d", b"ping").await;
    let got = n.overlay.received_by("d");
    assert_eq!(got.len(), 3 * SUB_CLIENTS);
    let routes: BTreeSet<String> = got.iter().map(|(route, _)| route.clone()).collect();
    assert_eq!(
        routes,
        (0..SUB_CLIENTS).map(|k| format!("__{k}__.d")).collect::<BTreeSet<_>>()
    );
    assert_eq!(n.segments_of("d"), vec![(1, second)]);
}

#[tokio::test]
async fn tier_above_highest_variant_gets_lowest_quality() {
    let n = node(vec![p720()]);
    n.publish(segment(1_500, 1)).await;
    n.send("v", b"ping").await;
    n.send("v", b"quality7").await;
    n.overlay.clear();

    let seg = segment(1_500, 2);
    n.publish(seg.clone()).await;
    assert_eq!(n.segments_of("v"), vec![(1, seg.slice(..750))]);
}

#[tokio::test]
async fn no_transcode_profiles_sends_source_to_every_tier() {
    let n = node(Vec::new());
    n.publish(segment(800, 1)).await;
    n.send("x", b"ping").await;
    n.send("y", b"ping").await;
    n.send("y", b"quality0").await;
    n.overlay.clear();

    let seg = segment(800, 2);
    n.publish(seg.clone()).await;
    assert_eq!(n.segments_of("x"), vec![(1, seg.clone())]);
    assert_eq!(n.segments_of("y"), vec![(1, seg)]);
}

#[tokio::test]
async fn departed_viewers_stop_receiving() {
    let n = node(Vec::new());
    n.publish(segment(100, 1)).await;
    for v in ["stay", "quit", "silent"] {
        n.send(v, b"ping").await;
    }
    n.send("quit", b"disconnect").await;

    // "stay" keeps pinging, "silent" does not.
    let later = Instant::now() + Duration::from_secs(31);
    n.streamer.viewers().add_or_touch_at("stay", later);
    let removed = n.streamer.viewers().sweep_at(later, Duration::from_secs(30));
    assert_eq!(removed, 1);
    n.overlay.clear();

    n.publish(segment(100, 2)).await;
    assert_eq!(n.segments_of("stay").len(), 1);
    assert!(n.overlay.received_by("quit").is_empty());
    assert!(n.overlay.received_by("silent").is_empty());
}

#[tokio::test]
async fn segment_ids_advance_per_publish() {
    let n = node(vec![p720()]);
    n.publish(segment(10, 1)).await;
    n.send("v", b"ping").await;
    n.overlay.clear();

    for i in 0..3u8 {
        n.publish(segment(10, i)).await;
    }
    let ids: Vec<u32> = n.segments_of("v").into_iter().map(|(id, _)| id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(n.streamer.segment_id(), 4);
}

#[tokio::test]
async fn live_stream_subscribes_to_discovery_topic() {
    let n = node(Vec::new());
    let (shutdown, _) = broadcast::channel(1);
    let task = tokio::spawn(n.streamer.clone().maintain_subscription(shutdown.subscribe()));

    n.publish(segment(10, 1)).await;
    // First tick fired before the stream went live; wait for the next one.
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(*n.overlay.topics.lock(), vec!["novon".to_string()]);

    shutdown.send(()).unwrap();
    task.await.unwrap();
}
