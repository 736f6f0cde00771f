use serde_json::Value;

use crate::*;

#[tokio::test]
async fn offline_broadcaster_only_answers_panels_and_channel_info() {
    let n = node(vec![p720()]);

    let panels = n.send("v", b"getpanels").await;
    assert_eq!(
        n.replies("v", panels),
        vec!["Welcome to the stream".to_string(); SUB_CLIENTS]
    );

    let info = n.send("v", b"channelinfo").await;
    assert_eq!(n.replies("v", info).len(), SUB_CLIENTS);

    for word in [&b"ping"[..], b"viewcount", b"donationid", b"quality0", b"thumbnail"] {
        let id = n.send("v", word).await;
        assert!(n.replies("v", id).is_empty(), "{} answered while offline", String::from_utf8_lossy(word));
    }
    assert!(n.streamer.viewers().is_empty());
}

#[tokio::test]
async fn channel_info_lists_quality_levels_and_owner_role() {
    let n = node(vec![p720()]);
    n.publish(segment(100, 1)).await;
    n.send("v", b"ping").await;

    let id = n.send(OWNER, b"channelinfo").await;
    let info: Value = serde_json::from_str(&n.replies(OWNER, id)[0]).unwrap();
    assert_eq!(info["role"], "owner");
    assert_eq!(info["viewers"], 1);
    assert_eq!(info["panels"], "Welcome to the stream");
    let levels: Vec<(u64, u64)> = info["qualityLevels"]
        .as_array()
        .unwrap()
        .iter()
        .map(|l| (l["resolution"].as_u64().unwrap(), l["framerate"].as_u64().unwrap()))
        .collect();
    assert_eq!(levels, vec![(1080, 30), (720, 30)]);

    let id = n.send("v", b"channelinfo").await;
    let info: Value = serde_json::from_str(&n.replies("v", id)[0]).unwrap();
    assert_eq!(info["role"], "");
}

#[tokio::test]
async fn live_control_words() {
    let n = node(Vec::new());
    n.publish(segment(100, 1)).await;
    n.publish(segment(100, 2)).await;

    n.send("v1", b"ping").await;
    n.send("v2", b"ping").await;

    let id = n.send("v1", b"viewcount").await;
    assert_eq!(n.replies("v1", id)[0], "2");

    // Replies with the id of the next segment.
    let id = n.send("v1", b"quality0").await;
    assert_eq!(n.replies("v1", id)[0], "2");
    assert_eq!(n.streamer.viewers().quality_of("v1"), Some(0));

    let id = n.send("v1", b"donationid").await;
    let donation = &n.replies("v1", id)[0];
    assert_eq!(donation.len(), 64);
    assert!(donation.chars().all(|c| c.is_ascii_hexdigit()));

    let id = n.send("v2", b"thumbnail").await;
    let thumb: Vec<_> = n
        .overlay
        .received_by("v2")
        .into_iter()
        .filter(|(_, p)| p.reply_to == Some(id))
        .collect();
    assert_eq!(thumb.len(), SUB_CLIENTS);
    assert_eq!(&thumb[0].1.data[..], b"\xff\xd8thumb");

    n.send("v2", b"disconnect").await;
    let id = n.send("v1", b"viewcount").await;
    assert_eq!(n.replies("v1", id)[0], "1");
}

#[tokio::test]
async fn near_miss_control_words_are_not_commands() {
    let n = node(Vec::new());
    n.publish(segment(100, 1)).await;

    for word in [&b"Ping"[..], b"ping ", b"quality10", b"qualityx", b"hello"] {
        let id = n.send("v", word).await;
        assert!(n.replies("v", id).is_empty());
    }
    assert!(n.streamer.viewers().is_empty());
}

#[tokio::test]
async fn chat_is_acknowledged_and_broadcast_once_per_viewer() {
    let n = node(Vec::new());
    n.publish(segment(100, 1)).await;
    for v in ["a", "b", "c"] {
        n.send(v, b"ping").await;
    }
    n.overlay.clear();

    let raw = novon_core::message::Envelope::chat("hello everyone", "")
        .unwrap()
        .to_bytes()
        .unwrap();
    let id = n.send("a", &raw).await;
    assert_eq!(n.replies("a", id), vec!["success".to_string(); SUB_CLIENTS]);

    let groups = n.overlay.group_sends();
    assert_eq!(groups.len(), 1);
    let (dests, payload) = &groups[0];
    assert_eq!(dests, &vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    let chat: Value = serde_json::from_slice(&payload.data).unwrap();
    assert_eq!(chat["id"], "0");
    assert_eq!(chat["text"], "hello everyone");
    assert_eq!(chat["src"], "a");
    assert_eq!(chat["role"], "");

    let id = n.send(OWNER, &raw).await;
    assert_eq!(n.replies(OWNER, id)[0], "success");
    let second: Vec<Value> = n
        .overlay
        .group_sends()
        .iter()
        .filter_map(|(_, p)| serde_json::from_slice::<Value>(&p.data).ok())
        .filter(|chat| chat["id"] == "1")
        .collect();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0]["role"], "owner");
    assert_eq!(second[0]["src"], OWNER);
}

#[tokio::test]
async fn only_owner_can_delete_chat_messages() {
    let n = node(Vec::new());
    n.publish(segment(100, 1)).await;
    n.send("a", b"ping").await;
    n.send("b", b"ping").await;
    n.overlay.clear();

    let raw = br#"{"type":"delete-chat-message","content":{"msgId":"0"}}"#;
    n.send("a", raw).await;
    assert!(n.overlay.group_sends().is_empty());

    n.send(OWNER, raw).await;
    let groups = n.overlay.group_sends();
    assert_eq!(groups.len(), 1);
    assert_eq!(&groups[0].1.data[..], &raw[..]);
}
