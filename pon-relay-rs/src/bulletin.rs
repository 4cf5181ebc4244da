//! Fire-and-forget notification bridge. Handlers drop typed events into
//! channels; a broker task renders them as human-readable strings and
//! publishes them over MQTT. A lost broker never fails a request.

use ethereum_consensus::primitives::Slot;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::Duration;
use tokio::sync::mpsc;

pub const HIGHEST_BID_TOPIC: &str = "topic/HighestBid";
pub const PROPOSER_HEADER_REQUEST_TOPIC: &str = "topic/ProposerSlotHeaderRequest";
pub const PROPOSER_PAYLOAD_REQUEST_TOPIC: &str = "topic/ProposerPayloadRequest";
pub const BOUNTY_BID_WON_TOPIC: &str = "topic/BountyBidWon";

const MQTT_CHANNEL_DEPTH: usize = 64;
const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct HighestBidEvent {
    pub slot: Slot,
    pub builder: String,
    pub amount: String,
}

#[derive(Debug, Clone)]
pub struct HeaderRequestEvent {
    pub slot: Slot,
    pub proposer: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
pub struct PayloadRequestEvent {
    pub slot: Slot,
    pub proposer: String,
}

#[derive(Debug, Clone)]
pub struct BountyWonEvent {
    pub slot: Slot,
    pub builder: String,
}

/// Handler-side sender half. Cloned into every component that announces.
#[derive(Debug, Clone)]
pub struct BulletinBoard {
    highest_bid: mpsc::UnboundedSender<HighestBidEvent>,
    header_request: mpsc::UnboundedSender<HeaderRequestEvent>,
    payload_request: mpsc::UnboundedSender<PayloadRequestEvent>,
    bounty_won: mpsc::UnboundedSender<BountyWonEvent>,
}

/// Broker-side receiver half.
pub struct BulletinChannels {
    pub highest_bid: mpsc::UnboundedReceiver<HighestBidEvent>,
    pub header_request: mpsc::UnboundedReceiver<HeaderRequestEvent>,
    pub payload_request: mpsc::UnboundedReceiver<PayloadRequestEvent>,
    pub bounty_won: mpsc::UnboundedReceiver<BountyWonEvent>,
}

impl BulletinBoard {
    pub fn new() -> (Self, BulletinChannels) {
        let (highest_bid, highest_bid_rx) = mpsc::unbounded_channel();
        let (header_request, header_request_rx) = mpsc::unbounded_channel();
        let (payload_request, payload_request_rx) = mpsc::unbounded_channel();
        let (bounty_won, bounty_won_rx) = mpsc::unbounded_channel();
        (
            Self { highest_bid, header_request, payload_request, bounty_won },
            BulletinChannels {
                highest_bid: highest_bid_rx,
                header_request: header_request_rx,
                payload_request: payload_request_rx,
                bounty_won: bounty_won_rx,
            },
        )
    }

    pub fn publish_highest_bid(&self, event: HighestBidEvent) {
        if self.highest_bid.send(event).is_err() {
            tracing::warn!("bulletin broker gone, dropping highest-bid event");
        }
    }

    pub fn publish_header_request(&self, event: HeaderRequestEvent) {
        if self.header_request.send(event).is_err() {
            tracing::warn!("bulletin broker gone, dropping header-request event");
        }
    }

    pub fn publish_payload_request(&self, event: PayloadRequestEvent) {
        if self.payload_request.send(event).is_err() {
            tracing::warn!("bulletin broker gone, dropping payload-request event");
        }
    }

    pub fn publish_bounty_won(&self, event: BountyWonEvent) {
        if self.bounty_won.send(event).is_err() {
            tracing::warn!("bulletin broker gone, dropping bounty event");
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Connects the broker task to an MQTT session and keeps both alive for the
/// life of the process. The session auto-reconnects inside the poll loop.
pub fn spawn_publisher(config: &MqttConfig, mut channels: BulletinChannels) {
    let mut options = MqttOptions::new(&config.client_id, &config.broker, config.port);
    options.set_keep_alive(MQTT_KEEP_ALIVE);
    if !config.username.is_empty() {
        options.set_credentials(&config.username, &config.password);
    }
    let (client, mut event_loop) = AsyncClient::new(options, MQTT_CHANNEL_DEPTH);

    tokio::spawn(async move {
        loop {
            if let Err(err) = event_loop.poll().await {
                tracing::warn!(%err, "mqtt session error, reconnecting");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    tokio::spawn(async move {
        loop {
            let (topic, payload) = tokio::select! {
                Some(event) = channels.highest_bid.recv() => (
                    HIGHEST_BID_TOPIC,
                    format!(
                        "slot: {}, builder: {}, amount: {}",
                        event.slot, event.builder, event.amount
                    ),
                ),
                Some(event) = channels.header_request.recv() => (
                    PROPOSER_HEADER_REQUEST_TOPIC,
                    format!(
                        "slot: {}, proposer: {}, timestamp: {}",
                        event.slot, event.proposer, event.timestamp
                    ),
                ),
                Some(event) = channels.payload_request.recv() => (
                    PROPOSER_PAYLOAD_REQUEST_TOPIC,
                    format!("slot: {}, proposer: {}", event.slot, event.proposer),
                ),
                Some(event) = channels.bounty_won.recv() => (
                    BOUNTY_BID_WON_TOPIC,
                    format!("slot: {}, builder: {}", event.slot, event.builder),
                ),
                else => break,
            };
            if let Err(err) = client.publish(topic, QoS::AtMostOnce, false, payload).await {
                tracing::warn!(%err, topic, "could not publish to bulletin board");
            }
        }
        tracing::info!("bulletin board senders closed, broker task exiting");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_the_broker_side() {
        let (board, mut channels) = BulletinBoard::new();
        board.publish_highest_bid(HighestBidEvent {
            slot: 100,
            builder: "0xabc".into(),
            amount: "1000".into(),
        });
        let event = channels.highest_bid.recv().await.unwrap();
        assert_eq!(event.slot, 100);
        assert_eq!(event.amount, "1000");
    }

    #[test]
    fn publishing_without_a_broker_is_non_fatal() {
        let (board, channels) = BulletinBoard::new();
        drop(channels);
        board.publish_payload_request(PayloadRequestEvent { slot: 1, proposer: "0xdef".into() });
    }
}
