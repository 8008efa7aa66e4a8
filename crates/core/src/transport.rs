//! Batch delivery: beacon first, HTTP POST second.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, TrackError},
    events::EventRecord,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectBatch {
    pub events: Vec<EventRecord>,
}

impl CollectBatch {
    /// Serialized once per delivery attempt.
    pub fn to_body(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Fire-and-forget sink that survives page unload (`navigator.sendBeacon`).
/// `false` means the browser refused to queue the request.
pub trait Beacon: Send + Sync {
    fn send_beacon(&self, url: &str, body: &[u8]) -> bool;
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one serialized batch of `events` records. Any error means the
    /// batch must be requeued.
    async fn deliver(&self, body: &[u8], events: usize) -> Result<()>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let url = url.into();
        reqwest::Url::parse(&url).map_err(|e| TrackError::InvalidUrl {
            url: url.clone(),
            reason: e.to_string(),
        })?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&self, body: &[u8], events: usize) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TrackError::Rejected {
                status: status.as_u16(),
                events,
            });
        }
        Ok(())
    }
}

/// Tries the beacon, falls through to `fallback` when the beacon is missing
/// or refuses the payload.
pub struct BeaconFirstTransport {
    beacon: Option<Arc<dyn Beacon>>,
    url: String,
    fallback: Arc<dyn Transport>,
}

impl BeaconFirstTransport {
    pub fn new(
        beacon: Option<Arc<dyn Beacon>>,
        url: impl Into<String>,
        fallback: Arc<dyn Transport>,
    ) -> Self {
        Self {
            beacon,
            url: url.into(),
            fallback,
        }
    }
}

#[async_trait]
impl Transport for BeaconFirstTransport {
    async fn deliver(&self, body: &[u8], events: usize) -> Result<()> {
        if let Some(beacon) = &self.beacon {
            if beacon.send_beacon(&self.url, body) {
                return Ok(());
            }
            tracing::debug!(events, "beacon refused batch, falling back to POST");
        }
        self.fallback.deliver(body, events).await
    }
}

/// In-memory transport that records batches. Fails the first `fail_times`
/// deliveries. Used by the CLI dry run and by tests.
#[derive(Default)]
pub struct RecordingTransport {
    batches: Mutex<Vec<CollectBatch>>,
    attempts: AtomicUsize,
    fail_remaining: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(fail_times: usize) -> Self {
        Self {
            fail_remaining: AtomicUsize::new(fail_times),
            ..Self::default()
        }
    }

    pub fn batches(&self) -> Vec<CollectBatch> {
        self.batches.lock().expect("RecordingTransport poisoned").clone()
    }

    pub fn delivered_events(&self) -> Vec<EventRecord> {
        self.batches()
            .into_iter()
            .flat_map(|batch| batch.events)
            .collect()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn deliver(&self, body: &[u8], events: usize) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TrackError::Rejected {
                status: 503,
                events,
            });
        }
        let batch: CollectBatch = serde_json::from_slice(body)?;
        self.batches
            .lock()
            .expect("RecordingTransport poisoned")
            .push(batch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventContext, EventKind};
    use serde_json::Map;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, header, method, path},
    };

    struct StubBeacon {
        accept: bool,
        calls: AtomicUsize,
    }

    impl Beacon for StubBeacon {
        fn send_beacon(&self, _url: &str, _body: &[u8]) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.accept
        }
    }

    fn batch() -> CollectBatch {
        CollectBatch {
            events: vec![EventRecord::new(
                EventKind::View,
                EventContext {
                    page_id: "home".into(),
                    ..Default::default()
                },
                Map::new(),
                "6f1c7c1e-0000-4000-8000-000000000001".into(),
                "2024-05-01T10:00:00.000Z".into(),
            )],
        }
    }

    #[tokio::test]
    async fn http_posts_json_batch() {
        let server = MockServer::start().await;
        let batch = batch();
        Mock::given(method("POST"))
            .and(path("/api/analytics/collect/"))
            .and(header("content-type", "application/json"))
            .and(body_json(&batch))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpTransport::new(
            format!("{}/api/analytics/collect/", server.uri()),
            Duration::from_secs(2),
        )
        .unwrap();
        transport.deliver(&batch.to_body().unwrap(), 1).await.unwrap();
    }

    #[tokio::test]
    async fn http_non_2xx_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let transport =
            HttpTransport::new(format!("{}/collect", server.uri()), Duration::from_secs(2))
                .unwrap();
        let err = transport
            .deliver(&batch().to_body().unwrap(), 1)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TrackError::Rejected {
                status: 500,
                events: 1
            }
        ));
    }

    #[test]
    fn rejects_relative_url() {
        assert!(matches!(
            HttpTransport::new("/api/analytics/collect/", Duration::from_secs(1)),
            Err(TrackError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn beacon_success_skips_fallback() {
        let beacon = Arc::new(StubBeacon {
            accept: true,
            calls: AtomicUsize::new(0),
        });
        let fallback = Arc::new(RecordingTransport::new());
        let transport = BeaconFirstTransport::new(
            Some(beacon.clone() as Arc<dyn Beacon>),
            "/collect",
            fallback.clone(),
        );
        transport.deliver(&batch().to_body().unwrap(), 1).await.unwrap();
        assert_eq!(beacon.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.attempts(), 0);
    }

    #[tokio::test]
    async fn refused_beacon_falls_through() {
        let beacon = Arc::new(StubBeacon {
            accept: false,
            calls: AtomicUsize::new(0),
        });
        let fallback = Arc::new(RecordingTransport::new());
        let transport =
            BeaconFirstTransport::new(Some(beacon as Arc<dyn Beacon>), "/collect", fallback.clone());
        transport.deliver(&batch().to_body().unwrap(), 1).await.unwrap();
        assert_eq!(fallback.batches(), vec![batch()]);
    }

    #[tokio::test]
    async fn recording_transport_fails_then_recovers() {
        let transport = RecordingTransport::failing(2);
        let body = batch().to_body().unwrap();
        assert!(transport.deliver(&body, 1).await.is_err());
        assert!(transport.deliver(&body, 1).await.is_err());
        assert!(transport.deliver(&body, 1).await.is_ok());
        assert_eq!(transport.attempts(), 3);
        assert_eq!(transport.batches().len(), 1);
    }
}
