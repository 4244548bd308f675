//! The multi-camera loop: acquire a frame from every camera, recognise faces,
//! record attendance and publish the operator view.
//!
//! One tick reads all cameras concurrently, each bounded by the read timeout.
//! A camera that is closed, failing, slow or still busy with an earlier read
//! contributes a placeholder for that tick and never holds up the others.

use crate::config::{CameraConfig, Config};
use crate::engine::EngineHandle;
use crate::mosaic::{self, Overlay};
use chrono::Utc;
use image::GrayImage;
use rollcall_core::{
    AttendanceRecorder, AttendanceStore, Gesture, GridLayout, Observation, RecordReport, ViewController,
};
use rollcall_hw::{Frame, FrameSource, SourceError, SourceSpec};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

/// Opens the frame source for a camera. Called on a blocking thread.
pub type SourceOpener =
    Arc<dyn Fn(&CameraConfig) -> Result<Box<dyn FrameSource>, SourceError> + Send + Sync>;

type SharedSource = Arc<Mutex<Box<dyn FrameSource>>>;

/// Opener for real cameras: V4L2 devices and HTTP snapshot endpoints.
pub fn device_opener(read_timeout: Duration) -> SourceOpener {
    Arc::new(move |camera: &CameraConfig| {
        let spec = match camera.source.parse::<SourceSpec>() {
            Ok(spec) => spec,
            Err(never) => match never {},
        };
        spec.open(read_timeout)
    })
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub tick: Duration,
    pub read_timeout: Duration,
    /// Delay before a closed camera is opened again.
    pub reopen_after: Duration,
    pub frame_width: u32,
    pub frame_height: u32,
    pub gesture_debounce: Duration,
}

impl MonitorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tick: config.tick,
            read_timeout: config.read_timeout,
            reopen_after: config.reopen_after,
            frame_width: config.frame_width,
            frame_height: config.frame_height,
            gesture_debounce: config.gesture_debounce,
        }
    }
}

struct CameraSlot {
    config: CameraConfig,
    source: Option<SharedSource>,
    /// When a closed source should next be opened.
    retry_at: Instant,
    /// Start of the current run of failed reads.
    failing_since: Option<Instant>,
}

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Per camera: whether a real frame was acquired.
    pub live: Vec<bool>,
    /// One entry per recognised face, in camera order.
    pub reports: Vec<RecordReport>,
}

pub struct Monitor<S> {
    slots: Vec<CameraSlot>,
    settings: MonitorSettings,
    opener: SourceOpener,
    engine: EngineHandle,
    recorder: AttendanceRecorder<S>,
    view: ViewController,
    layout: GridLayout,
    gestures: mpsc::Receiver<Gesture>,
    view_tx: watch::Sender<Option<Arc<GrayImage>>>,
}

impl<S: AttendanceStore> Monitor<S> {
    /// No camera is opened here; every source is opened on the first tick.
    pub fn new(
        cameras: Vec<CameraConfig>,
        settings: MonitorSettings,
        opener: SourceOpener,
        engine: EngineHandle,
        recorder: AttendanceRecorder<S>,
        gestures: mpsc::Receiver<Gesture>,
        view_tx: watch::Sender<Option<Arc<GrayImage>>>,
    ) -> Self {
        let now = Instant::now();
        let layout = GridLayout::new(cameras.len(), settings.frame_width, settings.frame_height);
        let view = ViewController::new(cameras.len(), settings.gesture_debounce);
        let slots = cameras
            .into_iter()
            .map(|config| CameraSlot {
                config,
                source: None,
                retry_at: now,
                failing_since: None,
            })
            .collect();
        Self {
            slots,
            settings,
            opener,
            engine,
            recorder,
            view,
            layout,
            gestures,
            view_tx,
        }
    }

    pub fn layout(&self) -> GridLayout {
        self.layout
    }

    /// Tick every `settings.tick` until `shutdown` becomes true. The tick in
    /// progress is allowed to finish; sources are released afterwards.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(cameras = self.slots.len(), tick_ms = self.settings.tick.as_millis() as u64, "monitor started");
        let mut ticker = tokio::time::interval(self.settings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        self.release().await;
        tracing::info!("monitor stopped");
    }

    /// Recognised faces are recorded one at a time in camera order. Each store
    /// write is bounded by the recorder's write timeout.
    pub async fn tick(&mut self) -> TickReport {
        self.reopen_due().await;
        let frames = self.acquire().await;
        let live: Vec<bool> = frames.iter().map(Option::is_some).collect();

        let batch: Vec<(usize, Arc<GrayImage>)> = frames
            .iter()
            .enumerate()
            .filter_map(|(camera, frame)| frame.clone().map(|frame| (camera, frame)))
            .collect();
        let analyses = if batch.is_empty() {
            Vec::new()
        } else {
            match self.engine.recognize(batch).await {
                Ok(analyses) => analyses,
                Err(err) => {
                    tracing::error!(error = %err, "recognition unavailable for this tick");
                    Vec::new()
                }
            }
        };

        let observed_at = Utc::now();
        let mut overlays: Vec<Vec<Overlay>> = vec![Vec::new(); self.slots.len()];
        let mut reports = Vec::new();
        for analysis in analyses {
            let Some(slot) = self.slots.get(analysis.camera) else {
                continue;
            };
            let faces = match analysis.faces {
                Ok(faces) => faces,
                Err(err) => {
                    tracing::warn!(camera = %slot.config.name, error = %err, "recognition failed");
                    continue;
                }
            };
            for face in faces {
                if let Some(identity) = face.outcome.identity() {
                    let observation = Observation::new(identity.clone(), slot.config.location.clone(), observed_at);
                    reports.push(self.recorder.observe(&observation).await);
                }
                overlays[analysis.camera].push(Overlay {
                    recognized: face.outcome.identity().is_some(),
                    bbox: face.bbox,
                });
            }
        }

        self.drain_gestures();
        self.render(frames, &overlays);
        TickReport { live, reports }
    }

    /// Open every closed source whose retry time has come.
    async fn reopen_due(&mut self) {
        let now = Instant::now();
        for index in 0..self.slots.len() {
            let slot = &self.slots[index];
            if slot.source.is_some() || slot.retry_at > now {
                continue;
            }

            let opener = self.opener.clone();
            let config = slot.config.clone();
            let opened = tokio::task::spawn_blocking(move || opener(&config)).await;

            let reopen_after = self.settings.reopen_after;
            let slot = &mut self.slots[index];
            let err = match opened {
                Ok(Ok(source)) => {
                    tracing::info!(camera = %slot.config.name, source = %slot.config.source, "camera opened");
                    slot.source = Some(Arc::new(Mutex::new(source)));
                    slot.failing_since = None;
                    continue;
                }
                Ok(Err(err)) => err.to_string(),
                Err(join) => format!("open task failed: {join}"),
            };
            tracing::warn!(
                camera = %slot.config.name,
                source = %slot.config.source,
                error = %err,
                retry_in_secs = reopen_after.as_secs(),
                "camera unavailable"
            );
            slot.retry_at = Instant::now() + reopen_after;
        }
    }

    /// Read one normalised frame from every open camera.
    async fn acquire(&mut self) -> Vec<Option<Arc<GrayImage>>> {
        let mut reads = JoinSet::new();
        for (index, slot) in self.slots.iter().enumerate() {
            let Some(source) = slot.source.clone() else {
                continue;
            };
            let timeout = self.settings.read_timeout;
            let zoom = slot.config.zoom;
            let (width, height) = (self.settings.frame_width, self.settings.frame_height);
            reads.spawn(async move {
                let read = tokio::task::spawn_blocking(move || read_normalized(&source, zoom, width, height));
                let result = match tokio::time::timeout(timeout, read).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join)) => Err(SourceError::CaptureFailed(format!("reader task failed: {join}"))),
                    Err(_) => Err(SourceError::Timeout),
                };
                (index, result)
            });
        }

        let mut frames = vec![None; self.slots.len()];
        let mut failed = Vec::new();
        while let Some(joined) = reads.join_next().await {
            let Ok((index, result)) = joined else {
                continue;
            };
            match result {
                Ok(frame) => {
                    let slot = &mut self.slots[index];
                    if slot.failing_since.take().is_some() {
                        tracing::info!(camera = %slot.config.name, "camera recovered");
                    }
                    frames[index] = Some(Arc::new(frame));
                }
                Err(err) => failed.push((index, err)),
            }
        }

        for (index, err) in failed {
            self.note_failure(index, err).await;
        }
        frames
    }

    /// Track a failed read. A camera failing for longer than the reopen
    /// interval is closed so the next due tick opens it afresh.
    async fn note_failure(&mut self, index: usize, err: SourceError) {
        let now = Instant::now();
        let reopen_after = self.settings.reopen_after;
        let slot = &mut self.slots[index];

        let Some(since) = slot.failing_since else {
            tracing::warn!(camera = %slot.config.name, error = %err, "camera read failed; showing placeholder");
            slot.failing_since = Some(now);
            return;
        };
        tracing::debug!(camera = %slot.config.name, error = %err, "camera still failing");

        if matches!(err, SourceError::InFlight) || now.duration_since(since) < reopen_after {
            return;
        }
        if let Some(source) = slot.source.take() {
            tracing::warn!(camera = %slot.config.name, "closing failing camera for reopen");
            slot.retry_at = now;
            slot.failing_since = None;
            let _ = tokio::task::spawn_blocking(move || drop(source)).await;
        }
    }

    fn drain_gestures(&mut self) {
        while let Ok(gesture) = self.gestures.try_recv() {
            if let Some(state) = self.view.apply(gesture) {
                tracing::info!(?state, "view changed");
            }
        }
    }

    fn render(&self, frames: Vec<Option<Arc<GrayImage>>>, overlays: &[Vec<Overlay>]) {
        let placeholder = Arc::new(Frame::placeholder(self.settings.frame_width, self.settings.frame_height).image);
        let frames: Vec<Arc<GrayImage>> = frames
            .into_iter()
            .map(|frame| frame.unwrap_or_else(|| placeholder.clone()))
            .collect();
        let canvas = mosaic::compose(self.view.state(), &self.layout, &frames, overlays);
        self.view_tx.send_replace(Some(Arc::new(canvas)));
    }

    /// Close every source off the async runtime; device and client teardown
    /// may block.
    async fn release(&mut self) {
        let sources: Vec<SharedSource> = self.slots.iter_mut().filter_map(|slot| slot.source.take()).collect();
        let count = sources.len();
        if let Err(err) = tokio::task::spawn_blocking(move || drop(sources)).await {
            tracing::warn!(error = %err, "releasing cameras failed");
        }
        tracing::info!(count, "cameras released");
    }
}

fn read_normalized(
    source: &Mutex<Box<dyn FrameSource>>,
    zoom: f32,
    width: u32,
    height: u32,
) -> Result<GrayImage, SourceError> {
    let mut guard = match source.try_lock() {
        Ok(guard) => guard,
        Err(TryLockError::WouldBlock) => return Err(SourceError::InFlight),
        Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
    };
    let frame = guard.read()?;
    Ok(frame.normalized(zoom, width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing;
    use image::Luma;
    use rollcall_core::{AttendanceLedger, EventOutcome, StoreError};
    use rollcall_store::SqliteStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeSource {
        value: u8,
        delay: Duration,
    }

    impl FrameSource for FakeSource {
        fn read(&mut self) -> Result<Frame, SourceError> {
            std::thread::sleep(self.delay);
            Ok(Frame::new(GrayImage::from_pixel(64, 48, Luma([self.value])), 0))
        }
    }

    /// `"broken"` never opens, `"slow"` takes 300 ms per read, a number is a
    /// uniform frame of that brightness.
    fn fake_opener() -> SourceOpener {
        Arc::new(|camera: &CameraConfig| -> Result<Box<dyn FrameSource>, SourceError> {
            match camera.source.as_str() {
                "broken" => Err(SourceError::DeviceNotFound(camera.source.clone())),
                "slow" => Ok(Box::new(FakeSource { value: 90, delay: Duration::from_millis(300) })),
                value => Ok(Box::new(FakeSource {
                    value: value.parse().unwrap(),
                    delay: Duration::ZERO,
                })),
            }
        })
    }

    fn camera(source: &str, location: &str) -> CameraConfig {
        CameraConfig {
            name: format!("cam-{source}"),
            source: source.to_string(),
            location: location.to_string(),
            zoom: 1.0,
        }
    }

    fn settings() -> MonitorSettings {
        MonitorSettings {
            tick: Duration::from_millis(10),
            read_timeout: Duration::from_millis(100),
            reopen_after: Duration::from_secs(60),
            frame_width: 64,
            frame_height: 48,
            gesture_debounce: Duration::from_millis(500),
        }
    }

    struct Harness {
        monitor: Monitor<SqliteStore>,
        store: SqliteStore,
        gestures: mpsc::Sender<Gesture>,
        view: watch::Receiver<Option<Arc<GrayImage>>>,
    }

    async fn harness(cameras: Vec<CameraConfig>, settings: MonitorSettings, opener: SourceOpener) -> Harness {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let recorder = AttendanceRecorder::new(
            Arc::new(Mutex::new(AttendanceLedger::default())),
            Some(store.clone()),
        );
        let (gestures, gesture_rx) = mpsc::channel(8);
        let (view_tx, view) = watch::channel(None);
        let engine = testing::engine(&["id-200", "id-90"]);
        let monitor = Monitor::new(cameras, settings, opener, engine, recorder, gesture_rx, view_tx);
        Harness { monitor, store, gestures, view }
    }

    /// Attendance store with switches for failing and stalling writes.
    #[derive(Clone, Default)]
    struct ScriptedStore {
        events: Arc<Mutex<Vec<(String, String)>>>,
        fail: Arc<AtomicBool>,
        stall: Arc<AtomicBool>,
    }

    impl ScriptedStore {
        async fn write(&self) -> Result<(), StoreError> {
            if self.stall.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(1500)).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Closed);
            }
            Ok(())
        }

        fn events(&self) -> Vec<(String, String)> {
            self.events.lock().unwrap().clone()
        }
    }

    impl AttendanceStore for ScriptedStore {
        async fn append_event(&self, observation: &Observation) -> Result<(), StoreError> {
            self.write().await?;
            self.events
                .lock()
                .unwrap()
                .push((observation.identity.to_string(), observation.location.clone()));
            Ok(())
        }

        async fn upsert_presence(&self, _observation: &Observation) -> Result<(), StoreError> {
            self.write().await
        }
    }

    fn scripted_monitor(cameras: Vec<CameraConfig>, store: ScriptedStore) -> Monitor<ScriptedStore> {
        let recorder = AttendanceRecorder::new(Arc::new(Mutex::new(AttendanceLedger::default())), Some(store))
            .with_write_timeout(Duration::from_millis(100));
        let (_gestures, gesture_rx) = mpsc::channel(8);
        let (view_tx, _view) = watch::channel(None);
        let engine = testing::engine(&["id-200", "id-90"]);
        Monitor::new(cameras, settings(), fake_opener(), engine, recorder, gesture_rx, view_tx)
    }

    fn pixel(view: &watch::Receiver<Option<Arc<GrayImage>>>, x: u32, y: u32) -> u8 {
        view.borrow().as_ref().unwrap().get_pixel(x, y)[0]
    }

    #[tokio::test]
    async fn test_failed_camera_does_not_stop_others() {
        let mut h = harness(vec![camera("broken", "Lobby"), camera("200", "Gate")], settings(), fake_opener()).await;

        let report = h.monitor.tick().await;
        assert_eq!(report.live, vec![false, true]);
        assert_eq!(report.reports.len(), 1);
        assert_eq!(report.reports[0].event, EventOutcome::Appended);

        let events = h.store.list_events(None, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].national_code, "id-200");
        assert_eq!(events[0].location, "Gate");

        // Placeholder on the left, live camera on the right.
        assert_eq!(pixel(&h.view, 5, 5), 0);
        assert_eq!(pixel(&h.view, 48, 24), 200);

        let report = h.monitor.tick().await;
        assert_eq!(report.reports[0].event, EventOutcome::Suppressed);
        assert_eq!(h.store.list_events(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_slow_camera_times_out_without_blocking() {
        let mut h = harness(vec![camera("slow", "Lobby"), camera("200", "Gate")], settings(), fake_opener()).await;

        let started = std::time::Instant::now();
        let report = h.monitor.tick().await;
        assert_eq!(report.live, vec![false, true]);
        assert!(started.elapsed() < Duration::from_millis(300));

        // The first read still holds the source.
        let report = h.monitor.tick().await;
        assert_eq!(report.live, vec![false, true]);
    }

    #[tokio::test]
    async fn test_camera_reopened_after_failure() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let opener: SourceOpener = Arc::new(move |_: &CameraConfig| -> Result<Box<dyn FrameSource>, SourceError> {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(SourceError::DeviceBusy)
            } else {
                Ok(Box::new(FakeSource { value: 90, delay: Duration::ZERO }))
            }
        });
        let mut settings = settings();
        settings.reopen_after = Duration::ZERO;
        let mut h = harness(vec![camera("x", "Lobby")], settings, opener).await;

        assert_eq!(h.monitor.tick().await.live, vec![false]);
        let report = h.monitor.tick().await;
        assert_eq!(report.live, vec![true]);
        assert_eq!(report.reports.len(), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gesture_focuses_camera() {
        let mut h = harness(vec![camera("broken", "Lobby"), camera("200", "Gate")], settings(), fake_opener()).await;

        h.gestures
            .send(Gesture::Select { cell: Some(1), at: std::time::Instant::now() })
            .await
            .unwrap();
        h.monitor.tick().await;
        assert_eq!(pixel(&h.view, 5, 5), 200);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness(vec![camera("200", "Gate")], settings(), fake_opener()).await;
        let (tx, rx) = watch::channel(false);
        let mut view = h.view.clone();

        let task = tokio::spawn(h.monitor.run(rx));
        view.changed().await.unwrap();
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        assert_eq!(h.store.list_events(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_slow_store_does_not_stall_tick() {
        let store = ScriptedStore::default();
        store.stall.store(true, Ordering::SeqCst);
        let mut monitor = scripted_monitor(vec![camera("200", "Gate")], store.clone());

        let started = std::time::Instant::now();
        let report = monitor.tick().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(report.live, vec![true]);
        assert_eq!(report.reports, vec![RecordReport { event: EventOutcome::Failed, presence_stored: false }]);
        assert!(store.events().is_empty());

        // Nothing was cached, so the next sighting is admitted again.
        store.stall.store(false, Ordering::SeqCst);
        let report = monitor.tick().await;
        assert_eq!(report.reports[0].event, EventOutcome::Appended);
        assert_eq!(store.events(), vec![("id-200".to_string(), "Gate".to_string())]);
    }

    #[tokio::test]
    async fn test_same_person_at_several_cameras_in_one_tick() {
        let store = ScriptedStore::default();
        let cameras = vec![camera("200", "Lobby"), camera("200", "Gate"), camera("200", "Gate")];
        let mut monitor = scripted_monitor(cameras, store.clone());

        let report = monitor.tick().await;
        let events: Vec<EventOutcome> = report.reports.iter().map(|r| r.event).collect();
        assert_eq!(events, vec![EventOutcome::Appended, EventOutcome::Appended, EventOutcome::Suppressed]);
        assert_eq!(
            store.events(),
            vec![
                ("id-200".to_string(), "Lobby".to_string()),
                ("id-200".to_string(), "Gate".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_store_outage_keeps_loop_running() {
        let store = ScriptedStore::default();
        store.fail.store(true, Ordering::SeqCst);
        let mut monitor = scripted_monitor(vec![camera("broken", "Lobby"), camera("200", "Gate")], store.clone());

        for _ in 0..2 {
            let report = monitor.tick().await;
            assert_eq!(report.live, vec![false, true]);
            assert_eq!(report.reports[0].event, EventOutcome::Failed);
        }
        assert!(store.events().is_empty());

        store.fail.store(false, Ordering::SeqCst);
        let report = monitor.tick().await;
        assert_eq!(report.reports[0].event, EventOutcome::Appended);
        assert_eq!(store.events().len(), 1);
    }
}
