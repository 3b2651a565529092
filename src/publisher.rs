// Location Publisher
//
// Foreground sampling loop: draws samples from a LocationSource, filters them
// through the sampling policy, caches the newest one for self-display and
// broadcasts it fire-and-forget. Started and stopped by group session
// transitions; stop is idempotent and safe on every teardown path.

use crate::config::SamplePolicy;
use crate::connection::ConnectionManager;
use crate::error::BeaconError;
use crate::protocol::{ClientMessage, LocationSample};
use async_trait::async_trait;
use futures_util::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Stream of device positions
pub type SampleStream = Pin<Box<dyn Stream<Item = LocationSample> + Send>>;

/// Seam for the device geolocation API.
///
/// Implementations deliver their callbacks on whatever thread the platform
/// uses; the publisher marshals them back through its own task before any
/// shared state is touched.
#[async_trait]
pub trait LocationSource: Send + Sync {
    /// Request foreground location permission from the user
    async fn request_permission(&self) -> Result<(), BeaconError>;

    /// Begin continuous sampling under the given policy
    fn watch(&self, policy: SamplePolicy) -> SampleStream;
}

/// Continuous sampling loop bound to the group session lifecycle
pub struct LocationPublisher {
    source: Arc<dyn LocationSource>,
    policy: SamplePolicy,
    connection: Arc<ConnectionManager>,
    /// Own last sample, cached for self-display. Never written into the
    /// presence map.
    last: Arc<RwLock<Option<LocationSample>>>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl LocationPublisher {
    pub(crate) fn new(
        source: Arc<dyn LocationSource>,
        policy: SamplePolicy,
        connection: Arc<ConnectionManager>,
    ) -> Self {
        Self {
            source,
            policy,
            connection,
            last: Arc::new(RwLock::new(None)),
            watch_task: Mutex::new(None),
        }
    }

    /// Request permission and start the watch. No-op when already running.
    ///
    /// On denial the watch is not started and `PermissionDenied` is returned;
    /// calling `start` again after the user grants access is the retry entry
    /// point.
    pub async fn start(&self) -> Result<(), BeaconError> {
        let mut task = self.watch_task.lock().await;
        if task.is_some() {
            return Ok(());
        }

        self.source.request_permission().await?;

        let mut stream = self.source.watch(self.policy.clone());
        let policy = self.policy.clone();
        let last = self.last.clone();
        let connection = self.connection.clone();
        tracing::debug!(
            "location watch started (min_interval={}ms, min_distance={}m)",
            policy.min_interval_ms,
            policy.min_distance_m
        );

        *task = Some(tokio::spawn(async move {
            let mut last_published: Option<LocationSample> = None;
            while let Some(sample) = stream.next().await {
                if let Some(prev) = &last_published {
                    if !admits(&policy, prev, &sample) {
                        continue;
                    }
                }
                *last.write().await = Some(sample.clone());
                last_published = Some(sample.clone());

                // At-most-once: a sample lost to a downed link is superseded
                // within seconds by the next one
                if let Err(e) = connection
                    .send(&ClientMessage::UpdateLocation(sample))
                    .await
                {
                    tracing::debug!("location sample dropped: {}", e);
                }
            }
            tracing::debug!("location watch stream ended");
        }));
        Ok(())
    }

    /// Cancel the watch if one is active. Idempotent: safe to call repeatedly
    /// or before `start`.
    pub async fn stop(&self) {
        if let Some(handle) = self.watch_task.lock().await.take() {
            handle.abort();
            tracing::debug!("location watch stopped");
        }
    }

    /// Whether a watch is currently active
    pub async fn is_active(&self) -> bool {
        self.watch_task.lock().await.is_some()
    }

    /// Own last published sample, for self-display
    pub async fn last_sample(&self) -> Option<LocationSample> {
        self.last.read().await.clone()
    }
}

/// Either threshold crossing admits a sample: enough time since the last
/// published one, or enough movement from it
fn admits(policy: &SamplePolicy, prev: &LocationSample, next: &LocationSample) -> bool {
    let elapsed_ms = next.timestamp.saturating_sub(prev.timestamp);
    if elapsed_ms >= policy.min_interval_ms as i64 {
        return true;
    }
    haversine_m(prev.lat, prev.lng, next.lat, next.lng) >= policy.min_distance_m
}

/// Great-circle distance in meters
fn haversine_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let dlat = (lat2 - lat1).to_radians();
    let dlng = (lng2 - lng1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

// ============================================================================
// Feed source
// ============================================================================

/// A `LocationSource` fed by the host application.
///
/// Platform geolocation callbacks (or a test harness) push samples in with
/// [`FeedSource::push`]; the publisher consumes them on its own task. Slow
/// consumers lose the oldest samples, which matches last-value-wins semantics.
pub struct FeedSource {
    tx: broadcast::Sender<LocationSample>,
    permission_granted: std::sync::atomic::AtomicBool,
}

impl FeedSource {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            tx,
            permission_granted: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// Simulate (or mirror) the user's permission decision
    pub fn set_permission(&self, granted: bool) {
        self.permission_granted
            .store(granted, std::sync::atomic::Ordering::SeqCst);
    }

    /// Push a device sample into every active watch
    pub fn push(&self, sample: LocationSample) {
        let _ = self.tx.send(sample);
    }
}

impl Default for FeedSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocationSource for FeedSource {
    async fn request_permission(&self) -> Result<(), BeaconError> {
        if self
            .permission_granted
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            Ok(())
        } else {
            Err(BeaconError::PermissionDenied)
        }
    }

    fn watch(&self, _policy: SamplePolicy) -> SampleStream {
        let rx = self.tx.subscribe();
        Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(sample) => return Some((sample, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("sample feed lagged, skipped {}", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }))
    }
}
