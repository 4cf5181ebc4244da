//! Per-slot authoritative bid state over the key-value scratchpad, and the
//! auction that picks the winning header after every accepted submission.

use crate::{
    bulletin::{BulletinBoard, HighestBidEvent},
    store::KvStore,
    types::{HeaderEntry, HeaderResponse, PayloadUtils},
    Error,
};
use ethereum_consensus::primitives::Slot;
use std::{sync::Arc, time::Duration};

const BUILDER_BID_KEY: &str = "builder-bid";
const BUILDER_BID_TIME_KEY: &str = "builder-bid-time";
const BUILDER_BID_VALUE_KEY: &str = "builder-bid-value";
const WINNING_BID_KEY: &str = "builder-highest-bid";
const PAYLOAD_UTILS_KEY: &str = "builder-bid-utils";
const PAYLOAD_DELIVERED_KEY: &str = "slot-payload-delivered";
const BOUNTY_WINNER_KEY: &str = "slot-bounty-winner";

/// Sticky markers outlive the bid entries: they persist for the 64-slot
/// cleanup window so late submissions keep hitting the lockout.
const STICKY_MARKER_TTL: Duration = Duration::from_secs(64 * crate::network::SECONDS_PER_SLOT);

#[derive(Clone)]
pub struct BidBoard {
    store: Arc<dyn KvStore>,
    bulletin: BulletinBoard,
    bid_timeout: Duration,
}

impl BidBoard {
    pub fn new(store: Arc<dyn KvStore>, bulletin: BulletinBoard, bid_timeout: Duration) -> Self {
        Self { store, bulletin, bid_timeout }
    }

    /// Save one builder's bid: the replayable signed-header entry, its
    /// receipt time, and its value, all under the same TTL.
    pub async fn save_builder_bid(
        &self,
        slot: Slot,
        builder: &str,
        proposer: &str,
        received_at_millis: u64,
        header: &HeaderResponse,
    ) -> Result<(), Error> {
        let entry = HeaderEntry {
            slot,
            proposer_public_key: proposer.to_string(),
            bid: header.clone(),
        };
        let encoded = serde_json::to_string(&entry)
            .map_err(|err| Error::Internal(format!("could not encode bid entry: {err}")))?;

        self.store
            .hset(
                &format!("{BUILDER_BID_KEY}-{slot}"),
                builder,
                &encoded,
                Some(self.bid_timeout),
            )
            .await?;
        self.store
            .hset(
                &format!("{BUILDER_BID_TIME_KEY}-{slot}"),
                builder,
                &received_at_millis.to_string(),
                Some(self.bid_timeout),
            )
            .await?;
        self.store
            .hset(
                &format!("{BUILDER_BID_VALUE_KEY}-{slot}"),
                builder,
                &header.data.message.value.to_string(),
                Some(self.bid_timeout),
            )
            .await?;
        Ok(())
    }

    /// Remember how to unblind `block_hash` once the proposer returns it.
    pub async fn save_payload_utils(
        &self,
        slot: Slot,
        block_hash: &str,
        utils: &PayloadUtils,
    ) -> Result<(), Error> {
        let encoded = serde_json::to_string(utils)
            .map_err(|err| Error::Internal(format!("could not encode payload utils: {err}")))?;
        self.store
            .hset(
                &format!("{PAYLOAD_UTILS_KEY}-{slot}"),
                block_hash,
                &encoded,
                Some(self.bid_timeout),
            )
            .await?;
        Ok(())
    }

    pub async fn payload_utils(
        &self,
        slot: Slot,
        block_hash: &str,
    ) -> Result<Option<PayloadUtils>, Error> {
        let encoded =
            self.store.hget(&format!("{PAYLOAD_UTILS_KEY}-{slot}"), block_hash).await?;
        match encoded {
            Some(encoded) => {
                let utils = serde_json::from_str(&encoded).map_err(|err| {
                    Error::Internal(format!("stored payload utils are corrupt: {err}"))
                })?;
                Ok(Some(utils))
            }
            None => Ok(None),
        }
    }

    /// Evaluate the auction: largest stored value wins, first seen on a tie.
    /// The winner's signed-header entry is promoted to the winning key and
    /// the new top announced on the bulletin board.
    pub async fn auction_bid(&self, slot: Slot) -> Result<(String, u64), Error> {
        let values = self.store.hgetall(&format!("{BUILDER_BID_VALUE_KEY}-{slot}")).await?;

        let mut top_value = 0u64;
        let mut top_builder: Option<String> = None;
        for (builder, value) in values {
            let value = value.parse::<u64>().unwrap_or_default();
            if value > top_value || top_builder.is_none() {
                top_value = value;
                top_builder = Some(builder);
            }
        }
        let top_builder = top_builder
            .ok_or_else(|| Error::Internal(format!("no bids to auction for slot {slot}")))?;

        let entry = self
            .store
            .hget(&format!("{BUILDER_BID_KEY}-{slot}"), &top_builder)
            .await?
            .ok_or_else(|| {
                Error::Internal(format!("value entry without bid entry for {top_builder}"))
            })?;
        self.store.set(&format!("{WINNING_BID_KEY}-{slot}"), &entry, self.bid_timeout).await?;

        self.bulletin.publish_highest_bid(HighestBidEvent {
            slot,
            builder: top_builder.clone(),
            amount: top_value.to_string(),
        });
        Ok((top_builder, top_value))
    }

    /// Promote one builder's stored entry to the winning key directly,
    /// bypassing the value comparison. Used when a bounty displaces the
    /// auction outcome.
    pub async fn promote_winner(&self, slot: Slot, builder: &str) -> Result<(), Error> {
        let entry = self
            .store
            .hget(&format!("{BUILDER_BID_KEY}-{slot}"), builder)
            .await?
            .ok_or_else(|| Error::Internal(format!("no stored bid for builder {builder}")))?;
        self.store.set(&format!("{WINNING_BID_KEY}-{slot}"), &entry, self.bid_timeout).await?;
        Ok(())
    }

    pub async fn winning_bid(&self, slot: Slot) -> Result<HeaderEntry, Error> {
        let encoded = self
            .store
            .get(&format!("{WINNING_BID_KEY}-{slot}"))
            .await?
            .ok_or(Error::NoWinningBid(slot))?;
        serde_json::from_str(&encoded)
            .map_err(|err| Error::Internal(format!("stored winning bid is corrupt: {err}")))
    }

    /// Millisecond receipt time of the builder's last accepted bid.
    pub async fn builder_block_last(
        &self,
        slot: Slot,
        builder: &str,
    ) -> Result<Option<u64>, Error> {
        let stored = self.store.hget(&format!("{BUILDER_BID_TIME_KEY}-{slot}"), builder).await?;
        Ok(stored.and_then(|value| value.parse().ok()))
    }

    pub async fn get_payload_delivered(&self, slot: Slot) -> Result<Option<String>, Error> {
        Ok(self.store.get(&format!("{PAYLOAD_DELIVERED_KEY}-{slot}")).await?)
    }

    /// Sticky, idempotent: re-marking a delivered slot only refreshes it.
    pub async fn put_payload_delivered(&self, slot: Slot, builder: &str) -> Result<(), Error> {
        self.store
            .set(&format!("{PAYLOAD_DELIVERED_KEY}-{slot}"), builder, STICKY_MARKER_TTL)
            .await?;
        Ok(())
    }

    pub async fn get_bounty_bid(&self, slot: Slot) -> Result<Option<String>, Error> {
        Ok(self.store.get(&format!("{BOUNTY_WINNER_KEY}-{slot}")).await?)
    }

    /// Claim the bounty for `builder`. The backend's set-if-absent arbitrates
    /// concurrent claims; exactly one caller sees `true`.
    pub async fn set_bounty_bid(&self, slot: Slot, builder: &str) -> Result<bool, Error> {
        Ok(self
            .store
            .set_nx(&format!("{BOUNTY_WINNER_KEY}-{slot}"), builder, STICKY_MARKER_TTL)
            .await?)
    }

    /// Highest currently-stored regular-auction value, zero when quiet.
    pub async fn open_auction_highest_bid(&self, slot: Slot) -> Result<u64, Error> {
        let values = self.store.hgetall(&format!("{BUILDER_BID_VALUE_KEY}-{slot}")).await?;
        Ok(values
            .into_iter()
            .map(|(_, value)| value.parse::<u64>().unwrap_or_default())
            .max()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_utils::MemoryStore, types::SignedBuilderBid};
    use ethereum_consensus::ssz::prelude::U256;

    fn header_response(value: u64) -> HeaderResponse {
        let mut bid = SignedBuilderBid::default();
        bid.message.value = U256::from(value);
        HeaderResponse::capella(bid)
    }

    fn board() -> BidBoard {
        let (bulletin, _channels) = BulletinBoard::new();
        BidBoard::new(Arc::new(MemoryStore::default()), bulletin, Duration::from_secs(15))
    }

    #[tokio::test]
    async fn auction_picks_the_largest_value() {
        let board = board();
        board.save_builder_bid(100, "0xaa", "0xp", 1, &header_response(1000)).await.unwrap();
        board.save_builder_bid(100, "0xbb", "0xp", 2, &header_response(2000)).await.unwrap();
        board.save_builder_bid(100, "0xcc", "0xp", 3, &header_response(1500)).await.unwrap();

        let (builder, value) = board.auction_bid(100).await.unwrap();
        assert_eq!(builder, "0xbb");
        assert_eq!(value, 2000);

        let winner = board.winning_bid(100).await.unwrap();
        assert_eq!(winner.bid.data.message.value, U256::from(2000u64));
    }

    #[tokio::test]
    async fn resubmission_replaces_the_winner() {
        let board = board();
        board.save_builder_bid(100, "0xaa", "0xp", 1, &header_response(1000)).await.unwrap();
        board.auction_bid(100).await.unwrap();
        board.save_builder_bid(100, "0xaa", "0xp", 2, &header_response(3000)).await.unwrap();
        let (builder, value) = board.auction_bid(100).await.unwrap();
        assert_eq!((builder.as_str(), value), ("0xaa", 3000));
    }

    #[tokio::test]
    async fn auction_with_no_bids_fails() {
        let board = board();
        assert!(board.auction_bid(77).await.is_err());
        assert!(matches!(board.winning_bid(77).await, Err(Error::NoWinningBid(77))));
    }

    #[tokio::test]
    async fn winner_value_dominates_every_stored_value() {
        let board = board();
        let values = [400u64, 900, 100, 900, 850];
        for (i, value) in values.iter().enumerate() {
            let builder = format!("0x{i:02}");
            board
                .save_builder_bid(5, &builder, "0xp", i as u64, &header_response(*value))
                .await
                .unwrap();
        }
        let (_, top) = board.auction_bid(5).await.unwrap();
        assert!(values.iter().all(|value| top >= *value));
    }

    #[tokio::test]
    async fn bounty_claim_is_first_writer_wins() {
        let board = board();
        assert!(board.get_bounty_bid(200).await.unwrap().is_none());
        assert!(board.set_bounty_bid(200, "0xaa").await.unwrap());
        assert!(!board.set_bounty_bid(200, "0xbb").await.unwrap());
        assert_eq!(board.get_bounty_bid(200).await.unwrap().as_deref(), Some("0xaa"));
    }

    #[tokio::test]
    async fn delivered_marker_is_sticky_and_idempotent() {
        let board = board();
        assert!(board.get_payload_delivered(9).await.unwrap().is_none());
        board.put_payload_delivered(9, "0xaa").await.unwrap();
        board.put_payload_delivered(9, "0xaa").await.unwrap();
        assert_eq!(board.get_payload_delivered(9).await.unwrap().as_deref(), Some("0xaa"));
    }

    #[tokio::test]
    async fn open_auction_top_is_zero_when_quiet() {
        let board = board();
        assert_eq!(board.open_auction_highest_bid(4).await.unwrap(), 0);
        board.save_builder_bid(4, "0xaa", "0xp", 1, &header_response(500)).await.unwrap();
        assert_eq!(board.open_auction_highest_bid(4).await.unwrap(), 500);
    }
}
