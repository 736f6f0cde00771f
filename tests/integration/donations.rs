use novon_core::message::Envelope;
use novon_services::DonationState;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::*;

const REJECTED: &str = "error: donation validation error - ";

struct Donor<'a> {
    node: &'a Node,
    addr: &'static str,
}

impl Donor<'_> {
    async fn donation_id(&self) -> String {
        let id = self.node.send(self.addr, b"donationid").await;
        self.node.replies(self.addr, id).remove(0)
    }

    async fn chat(&self, text: &str, hash: &str) -> String {
        let raw = Envelope::chat(text, hash).unwrap().to_bytes().unwrap();
        let id = self.node.send(self.addr, &raw).await;
        self.node.replies(self.addr, id).remove(0)
    }
}

async fn live_node() -> Node {
    let n = node(Vec::new());
    n.publish(segment(100, 1)).await;
    n.send("donor", b"ping").await;
    n.send("watcher", b"ping").await;
    n
}

fn broadcast_texts(n: &Node) -> Vec<String> {
    n.overlay
        .group_sends()
        .iter()
        .filter_map(|(_, p)| serde_json::from_slice::<Value>(&p.data).ok())
        .filter_map(|chat| chat["text"].as_str().map(str::to_string))
        .collect()
}

#[tokio::test]
async fn confirmed_donation_is_posted_once() {
    let n = live_node().await;
    let donor = Donor { node: &n, addr: "donor" };

    let donation = donor.donation_id().await;
    assert_eq!(n.streamer.ledger().state(&donation), DonationState::Unconsumed);
    n.ledger
        .confirmed
        .lock()
        .push(transfer_tx(&donation, &tx_hash(1), "donor", HOST_WALLET, 3));

    assert_eq!(donor.chat("donate3 great stream", &tx_hash(1)).await, "success");
    assert_eq!(broadcast_texts(&n), vec!["donate3 great stream".to_string()]);
    assert_eq!(
        n.streamer.ledger().state(&donation),
        DonationState::Consumed(tx_hash(1))
    );

    // Same transaction again.
    assert_eq!(
        donor.chat("donate3 again", &tx_hash(1)).await,
        format!("{REJECTED}this donation was already received")
    );
    assert_eq!(broadcast_texts(&n).len(), 1);
}

#[tokio::test]
async fn mempool_transaction_is_accepted() {
    let n = live_node().await;
    let donor = Donor { node: &n, addr: "donor" };

    let donation = donor.donation_id().await;
    n.ledger
        .mempool
        .lock()
        .push(transfer_tx(&donation, &tx_hash(2), "donor", HOST_WALLET, 1));

    assert_eq!(donor.chat("donate1", &tx_hash(2)).await, "success");
    assert!(matches!(
        n.streamer.ledger().state(&donation),
        DonationState::Consumed(_)
    ));
}

#[tokio::test]
async fn mismatched_transfers_are_rejected_without_consuming() {
    let n = live_node().await;
    let donor = Donor { node: &n, addr: "donor" };
    let donation = donor.donation_id().await;

    let cases = [
        (transfer_tx(&donation, &tx_hash(10), "donor", HOST_WALLET, 2), "transfer amount mismatch"),
        (transfer_tx(&donation, &tx_hash(11), "watcher", HOST_WALLET, 5), "transfer sender is not message src"),
        (transfer_tx(&donation, &tx_hash(12), "donor", "elsewhere", 5), "transfer recipient is not host address"),
        (transfer_tx(&"0".repeat(64), &tx_hash(13), "donor", HOST_WALLET, 5), "this donation id does not exist"),
    ];
    for (tx, reason) in cases {
        let hash = tx.hash.clone();
        n.ledger.confirmed.lock().push(tx);
        assert_eq!(
            donor.chat("donate5", &hash).await,
            format!("{REJECTED}{reason}")
        );
    }

    let mut wrong_type = transfer_tx(&donation, &tx_hash(14), "donor", HOST_WALLET, 5);
    wrong_type.tx_type = "COINBASE_TYPE".into();
    n.ledger.confirmed.lock().push(wrong_type);
    assert_eq!(
        donor.chat("donate5", &tx_hash(14)).await,
        format!("{REJECTED}incorrect txtype")
    );

    assert_eq!(n.streamer.ledger().state(&donation), DonationState::Unconsumed);
    assert!(broadcast_texts(&n).is_empty());

    // The id is still good for a correct payment.
    n.ledger
        .confirmed
        .lock()
        .push(transfer_tx(&donation, &tx_hash(15), "donor", HOST_WALLET, 5));
    assert_eq!(donor.chat("donate5", &tx_hash(15)).await, "success");
}

#[tokio::test]
async fn missing_or_unknown_transactions_are_rejected() {
    let n = live_node().await;
    let donor = Donor { node: &n, addr: "donor" };

    assert_eq!(
        donor.chat("donate2", "").await,
        format!("{REJECTED}no tx hash")
    );
    assert_eq!(
        donor.chat("donate2", &tx_hash(99)).await,
        format!("{REJECTED}transaction not found in time")
    );
    assert!(broadcast_texts(&n).is_empty());
}

#[tokio::test]
async fn expired_donation_id_is_no_longer_accepted() {
    let n = live_node().await;
    let donor = Donor { node: &n, addr: "donor" };
    let donation = donor.donation_id().await;

    let ttl = Duration::from_secs(3_600);
    let later = Instant::now() + ttl + Duration::from_secs(1);
    assert_eq!(n.streamer.ledger().prune_unconsumed_at(later, ttl), 1);
    assert_eq!(n.streamer.ledger().state(&donation), DonationState::Unknown);

    n.ledger
        .confirmed
        .lock()
        .push(transfer_tx(&donation, &tx_hash(20), "donor", HOST_WALLET, 1));
    assert_eq!(
        donor.chat("donate1", &tx_hash(20)).await,
        format!("{REJECTED}this donation id does not exist")
    );
}
