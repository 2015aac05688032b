// SFU stream registry and RTP fan-out.
//
// One publisher and a bounded set of subscribers per stream. Fan-out writes
// every publisher packet straight into each subscriber's outbound track
// without per-packet task creation, so the publisher's RTP sequence numbers
// reach each subscriber in order. A failing subscriber is logged and
// isolated.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bandwidth::{BandwidthEstimator, CongestionController, EstimatorConfig};
use crate::config::SfuConfig;
use crate::error::{Error, Result};
use crate::peer::{self, Publisher, RtpFanout, Subscriber};

// ---------------------------------------------------------------------------
// SfuStream
// ---------------------------------------------------------------------------

/// Serialisable stream summary for API responses.
#[derive(Debug, Clone, Serialize)]
pub struct SfuStreamInfo {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub has_publisher: bool,
    pub subscriber_count: usize,
    pub estimated_bitrate: u64,
    pub congested: bool,
}

/// One live stream: at most one publisher, up to `max_subscribers` sinks.
pub struct SfuStream {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    max_subscribers: usize,
    publisher: RwLock<Option<Arc<Publisher>>>,
    subscribers: RwLock<HashMap<String, Arc<Subscriber>>>,
    estimator: Mutex<BandwidthEstimator>,
    congestion: Mutex<CongestionController>,
}

impl std::fmt::Debug for SfuStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SfuStream")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("created_at", &self.created_at)
            .field("max_subscribers", &self.max_subscribers)
            .finish_non_exhaustive()
    }
}

impl SfuStream {
    pub fn new(id: String, name: String, max_subscribers: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            name,
            created_at: Utc::now(),
            max_subscribers,
            publisher: RwLock::new(None),
            subscribers: RwLock::new(HashMap::new()),
            estimator: Mutex::new(BandwidthEstimator::new(EstimatorConfig::default())),
            congestion: Mutex::new(CongestionController::new()),
        })
    }

    /// Attach the publisher: refuse if one is already present, wire its RTP
    /// callbacks to this stream's fan-out, and start it. The slot check and
    /// assignment happen under one write lock.
    pub fn add_publisher(self: &Arc<Self>, publisher: Arc<Publisher>) -> Result<()> {
        let mut slot = self.publisher.write().unwrap();
        if slot.is_some() {
            return Err(Error::already_exists(format!(
                "stream '{}' already has a publisher",
                self.id
            )));
        }

        publisher.set_fanout(Arc::clone(self) as Arc<dyn RtpFanout>);
        publisher.start();
        info!(
            "stream '{}': publisher '{}' attached",
            self.id, publisher.id
        );
        *slot = Some(publisher);
        Ok(())
    }

    pub fn remove_publisher(&self) -> Option<Arc<Publisher>> {
        self.publisher.write().unwrap().take()
    }

    pub fn publisher(&self) -> Option<Arc<Publisher>> {
        self.publisher.read().unwrap().clone()
    }

    /// Attach a subscriber, enforcing the per-stream cap atomically.
    pub fn add_subscriber(&self, subscriber: Arc<Subscriber>) -> Result<()> {
        let mut subs = self.subscribers.write().unwrap();
        if subs.len() >= self.max_subscribers {
            return Err(Error::exhausted(format!(
                "stream '{}' reached its subscriber limit ({})",
                self.id, self.max_subscribers
            )));
        }
        subscriber.start();
        info!(
            "stream '{}': subscriber '{}' attached ({} total)",
            self.id,
            subscriber.id,
            subs.len() + 1
        );
        subs.insert(subscriber.id.clone(), subscriber);
        Ok(())
    }

    pub fn remove_subscriber(&self, subscriber_id: &str) -> Option<Arc<Subscriber>> {
        let removed = self.subscribers.write().unwrap().remove(subscriber_id);
        if removed.is_some() {
            info!("stream '{}': subscriber '{subscriber_id}' removed", self.id);
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap().len()
    }

    /// Snapshot of the current subscribers (iterate without holding the map
    /// lock).
    fn subscriber_snapshot(&self) -> Vec<Arc<Subscriber>> {
        self.subscribers.read().unwrap().values().cloned().collect()
    }

    pub fn info(&self) -> SfuStreamInfo {
        SfuStreamInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            created_at: self.created_at,
            has_publisher: self.publisher.read().unwrap().is_some(),
            subscriber_count: self.subscriber_count(),
            estimated_bitrate: self.estimated_bitrate(),
            congested: self.is_congested(),
        }
    }

    /// Stop the publisher, then every subscriber (snapshotted first).
    pub async fn stop_all(&self) {
        if let Some(publisher) = self.remove_publisher() {
            publisher.stop().await;
        }
        let subscribers = self.subscriber_snapshot();
        self.subscribers.write().unwrap().clear();
        for subscriber in subscribers {
            subscriber.stop().await;
        }
    }

    /// Feed the stream's estimator from the publisher's counters and flag
    /// congestion transitions. Called by the periodic monitor.
    fn sample_bandwidth(&self) {
        let Some(publisher) = self.publisher() else {
            return;
        };
        let snap = publisher.stats.snapshot();
        let bitrate = {
            let mut estimator = self.estimator.lock().unwrap();
            estimator.update(
                snap.bytes_received,
                snap.packets_lost,
                Duration::from_millis(snap.rtt_ms as u64),
            )
        };
        publisher.stats.update_metrics(snap.jitter, snap.rtt_ms, bitrate);

        let loss_rate = if snap.bytes_received > 0 {
            snap.packets_lost as f64 / snap.bytes_received as f64
        } else {
            0.0
        };
        self.congestion
            .lock()
            .unwrap()
            .observe(loss_rate, Duration::from_millis(snap.rtt_ms as u64));
    }

    pub fn is_congested(&self) -> bool {
        self.congestion.lock().unwrap().is_congested()
    }

    pub fn estimated_bitrate(&self) -> u64 {
        self.estimator.lock().unwrap().bitrate()
    }
}

#[async_trait]
impl RtpFanout for SfuStream {
    async fn forward_video(&self, pkt: &webrtc::rtp::packet::Packet) {
        for subscriber in self.subscriber_snapshot() {
            match subscriber.video_out.write_rtp(pkt).await {
                Ok(()) => subscriber.stats.record_sent(pkt.payload.len()),
                Err(err) => {
                    warn!(
                        "stream '{}': video write to subscriber '{}' failed: {err}",
                        self.id, subscriber.id
                    );
                }
            }
        }
    }

    async fn forward_audio(&self, pkt: &webrtc::rtp::packet::Packet) {
        for subscriber in self.subscriber_snapshot() {
            match subscriber.audio_out.write_rtp(pkt).await {
                Ok(()) => subscriber.stats.record_sent(pkt.payload.len()),
                Err(err) => {
                    warn!(
                        "stream '{}': audio write to subscriber '{}' failed: {err}",
                        self.id, subscriber.id
                    );
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sfu registry
// ---------------------------------------------------------------------------

/// Registry of live SFU streams.
pub struct Sfu {
    config: SfuConfig,
    streams: RwLock<HashMap<String, Arc<SfuStream>>>,
}

impl Sfu {
    pub fn new(config: SfuConfig) -> Self {
        Self {
            config,
            streams: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    pub fn create_stream(&self, id: &str, name: &str) -> Result<Arc<SfuStream>> {
        if id.is_empty() {
            return Err(Error::invalid_argument("stream id must not be empty"));
        }
        let mut streams = self.streams.write().unwrap();
        if streams.contains_key(id) {
            return Err(Error::already_exists(format!("stream '{id}'")));
        }
        let stream = SfuStream::new(
            id.to_string(),
            name.to_string(),
            self.config.max_subscribers_per_stream,
        );
        streams.insert(id.to_string(), Arc::clone(&stream));
        info!("SFU stream '{id}' created");
        Ok(stream)
    }

    /// Remove the stream and tear down its peers (publisher first, then the
    /// snapshotted subscribers).
    pub async fn delete_stream(&self, id: &str) -> Result<()> {
        let stream = {
            let mut streams = self.streams.write().unwrap();
            streams
                .remove(id)
                .ok_or_else(|| Error::not_found(format!("stream '{id}'")))?
        };
        stream.stop_all().await;
        info!("SFU stream '{id}' deleted");
        Ok(())
    }

    pub fn get_stream(&self, id: &str) -> Result<Arc<SfuStream>> {
        self.streams
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("stream '{id}'")))
    }

    pub fn stream_infos(&self) -> Vec<SfuStreamInfo> {
        self.streams
            .read()
            .unwrap()
            .values()
            .map(|s| s.info())
            .collect()
    }

    /// Build a publisher peer for `peer_id` and attach it to the stream.
    /// Returns the publisher so the caller can run the SDP exchange.
    pub async fn attach_publisher(&self, stream_id: &str, peer_id: &str) -> Result<Arc<Publisher>> {
        let stream = self.get_stream(stream_id)?;
        if stream.publisher().is_some() {
            return Err(Error::already_exists(format!(
                "stream '{stream_id}' already has a publisher"
            )));
        }

        let pc = peer::create_peer_connection(&self.config)
            .await
            .map_err(|e| Error::transient(format!("peer connection failed: {e}")))?;
        let publisher = Arc::new(Publisher::new(
            peer_id.to_string(),
            stream_id.to_string(),
            pc,
        ));
        stream.add_publisher(Arc::clone(&publisher))?;
        Ok(publisher)
    }

    /// Build a subscriber peer with its outbound tracks and attach it.
    pub async fn attach_subscriber(
        &self,
        stream_id: &str,
        peer_id: &str,
    ) -> Result<Arc<Subscriber>> {
        let stream = self.get_stream(stream_id)?;
        if stream.subscriber_count() >= self.config.max_subscribers_per_stream {
            return Err(Error::exhausted(format!(
                "stream '{stream_id}' reached its subscriber limit"
            )));
        }

        let pc = peer::create_peer_connection(&self.config)
            .await
            .map_err(|e| Error::transient(format!("peer connection failed: {e}")))?;
        let subscriber =
            Subscriber::new(peer_id.to_string(), stream_id.to_string(), pc).await?;
        stream.add_subscriber(Arc::clone(&subscriber))?;
        Ok(subscriber)
    }

    fn stream_snapshot(&self) -> Vec<Arc<SfuStream>> {
        self.streams.read().unwrap().values().cloned().collect()
    }
}

/// Periodically sample per-stream bandwidth until cancelled.
pub fn spawn_stats_monitor(
    sfu: Arc<Sfu>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("SFU stats monitor stopped");
                    break;
                }
                _ = ticker.tick() => {
                    for stream in sfu.stream_snapshot() {
                        stream.sample_bandwidth();
                    }
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::RtpOutbound;
    use bytes::Bytes;

    /// Records the sequence numbers written to it.
    struct CaptureSink {
        seqs: Mutex<Vec<u16>>,
    }

    impl CaptureSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seqs: Mutex::new(Vec::new()),
            })
        }

        fn seqs(&self) -> Vec<u16> {
            self.seqs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RtpOutbound for CaptureSink {
        async fn write_rtp(
            &self,
            pkt: &webrtc::rtp::packet::Packet,
        ) -> std::result::Result<(), webrtc::Error> {
            self.seqs.lock().unwrap().push(pkt.header.sequence_number);
            Ok(())
        }
    }

    /// Always fails; used to prove per-subscriber isolation.
    struct FailingSink;

    #[async_trait]
    impl RtpOutbound for FailingSink {
        async fn write_rtp(
            &self,
            _pkt: &webrtc::rtp::packet::Packet,
        ) -> std::result::Result<(), webrtc::Error> {
            Err(webrtc::Error::new("sink down".to_string()))
        }
    }

    fn rtp(seq: u16) -> webrtc::rtp::packet::Packet {
        webrtc::rtp::packet::Packet {
            header: webrtc::rtp::header::Header {
                sequence_number: seq,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0u8; 100]),
        }
    }

    fn sfu() -> Sfu {
        Sfu::new(SfuConfig::default())
    }

    #[test]
    fn create_and_duplicate_stream() {
        let sfu = sfu();
        sfu.create_stream("s1", "first").unwrap();
        let err = sfu.create_stream("s1", "again").unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn delete_unknown_stream() {
        let sfu = sfu();
        let err = sfu.delete_stream("nope").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn fanout_delivers_in_order_to_all_subscribers() {
        let stream = SfuStream::new("s".into(), "test".into(), 16);

        let sink_a = CaptureSink::new();
        let sink_b = CaptureSink::new();
        let sink_c = CaptureSink::new();
        let audio = CaptureSink::new();

        for (id, sink) in [("a", &sink_a), ("b", &sink_b), ("c", &sink_c)] {
            let sub = Subscriber::detached(
                id,
                "s",
                Arc::clone(sink) as Arc<dyn RtpOutbound>,
                Arc::clone(&audio) as Arc<dyn RtpOutbound>,
            );
            stream.add_subscriber(sub).unwrap();
        }

        for seq in 1..=50u16 {
            stream.forward_video(&rtp(seq)).await;
        }
        // b drops out mid-flow.
        assert!(stream.remove_subscriber("b").is_some());
        for seq in 51..=100u16 {
            stream.forward_video(&rtp(seq)).await;
        }

        let want_all: Vec<u16> = (1..=100).collect();
        let want_half: Vec<u16> = (1..=50).collect();
        assert_eq!(sink_a.seqs(), want_all);
        assert_eq!(sink_c.seqs(), want_all);
        assert_eq!(sink_b.seqs(), want_half);
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_affect_others() {
        let stream = SfuStream::new("s".into(), "test".into(), 16);

        let good = CaptureSink::new();
        let audio = CaptureSink::new();
        stream
            .add_subscriber(Subscriber::detached(
                "good",
                "s",
                Arc::clone(&good) as Arc<dyn RtpOutbound>,
                Arc::clone(&audio) as Arc<dyn RtpOutbound>,
            ))
            .unwrap();
        stream
            .add_subscriber(Subscriber::detached(
                "bad",
                "s",
                Arc::new(FailingSink) as Arc<dyn RtpOutbound>,
                Arc::new(FailingSink) as Arc<dyn RtpOutbound>,
            ))
            .unwrap();

        for seq in 1..=10u16 {
            stream.forward_video(&rtp(seq)).await;
        }
        assert_eq!(good.seqs().len(), 10);
    }

    #[test]
    fn subscriber_cap_is_enforced() {
        let stream = SfuStream::new("s".into(), "test".into(), 2);
        let audio = CaptureSink::new();

        for id in ["a", "b"] {
            let sink = CaptureSink::new();
            stream
                .add_subscriber(Subscriber::detached(
                    id,
                    "s",
                    sink as Arc<dyn RtpOutbound>,
                    Arc::clone(&audio) as Arc<dyn RtpOutbound>,
                ))
                .unwrap();
        }

        let sink = CaptureSink::new();
        let err = stream
            .add_subscriber(Subscriber::detached(
                "c",
                "s",
                sink as Arc<dyn RtpOutbound>,
                audio as Arc<dyn RtpOutbound>,
            ))
            .unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
        assert_eq!(stream.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn publisher_slot_is_exclusive() {
        let cfg = SfuConfig::default();
        let stream = SfuStream::new("s".into(), "test".into(), 16);

        let pc1 = peer::create_peer_connection(&cfg).await.unwrap();
        let first = Arc::new(Publisher::new("p1".into(), "s".into(), pc1));
        stream.add_publisher(first).unwrap();

        let pc2 = peer::create_peer_connection(&cfg).await.unwrap();
        let second = Arc::new(Publisher::new("p2".into(), "s".into(), pc2));
        let err = stream.add_publisher(second).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));

        // Removing the publisher frees the slot.
        assert!(stream.remove_publisher().is_some());
        assert!(stream.publisher().is_none());
    }

    #[tokio::test]
    async fn audio_fanout_uses_audio_sink() {
        let stream = SfuStream::new("s".into(), "test".into(), 16);
        let video = CaptureSink::new();
        let audio = CaptureSink::new();
        let sub = Subscriber::detached(
            "a",
            "s",
            Arc::clone(&video) as Arc<dyn RtpOutbound>,
            Arc::clone(&audio) as Arc<dyn RtpOutbound>,
        );
        stream.add_subscriber(Arc::clone(&sub)).unwrap();
        assert!(sub.is_subscribed());

        stream.forward_audio(&rtp(7)).await;
        assert!(video.seqs().is_empty());
        assert_eq!(audio.seqs(), vec![7]);

        // Forwarding counters track successful writes.
        assert_eq!(sub.stats.snapshot().packets_sent, 1);
    }
}
