use image::imageops::{self, FilterType};
use image::GrayImage;
use rollcall_core::detector::DetectorError;
use rollcall_core::{BoundingBox, FaceDetector, FaceMatcher, Identity, MatchOutcome};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Side length of the face crop stored at enrollment.
pub const ENROLL_FACE_SIZE: u32 = 200;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("no face detected or face is incomplete")]
    NoUsableFace,
    #[error("could not start engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// One detected face and what the matcher made of it.
#[derive(Debug, Clone)]
pub struct RecognizedFace {
    pub bbox: BoundingBox,
    pub outcome: MatchOutcome,
}

/// Recognition result for one camera's frame. Detection failures stay
/// confined to the frame they happened on.
#[derive(Debug)]
pub struct FrameAnalysis {
    pub camera: usize,
    pub faces: Result<Vec<RecognizedFace>, EngineError>,
}

/// Messages sent from the monitor loop and HTTP handlers to the engine thread.
enum EngineRequest {
    Recognize {
        frames: Vec<(usize, Arc<GrayImage>)>,
        reply: oneshot::Sender<Vec<FrameAnalysis>>,
    },
    ExtractFace {
        image: GrayImage,
        reply: oneshot::Sender<Result<GrayImage, EngineError>>,
    },
    Train {
        identity: Identity,
        face: GrayImage,
        reply: oneshot::Sender<usize>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Detect and identify faces in each `(camera, frame)` pair.
    pub async fn recognize(&self, frames: Vec<(usize, Arc<GrayImage>)>) -> Result<Vec<FrameAnalysis>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Recognize { frames, reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Find the most confident face with both eyes visible and return it
    /// cropped to [`ENROLL_FACE_SIZE`] square.
    pub async fn extract_face(&self, image: GrayImage) -> Result<GrayImage, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::ExtractFace { image, reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Add a labelled face to the gallery. Returns the gallery size.
    pub async fn train(&self, identity: Identity, face: GrayImage) -> Result<usize, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Train { identity, face, reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    async fn send(&self, request: EngineRequest) -> Result<(), EngineError> {
        self.tx.send(request).await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the detector and the matcher; inference and training are
/// serialised through its request queue. It exits once every handle is dropped.
pub fn spawn_engine(
    mut detector: Box<dyn FaceDetector>,
    mut matcher: Box<dyn FaceMatcher>,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(8);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!(gallery = matcher.len(), "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Recognize { frames, reply } => {
                        let analyses = frames
                            .iter()
                            .map(|(camera, frame)| FrameAnalysis {
                                camera: *camera,
                                faces: run_recognize(detector.as_mut(), matcher.as_ref(), frame),
                            })
                            .collect();
                        let _ = reply.send(analyses);
                    }
                    EngineRequest::ExtractFace { image, reply } => {
                        let _ = reply.send(run_extract(detector.as_mut(), &image));
                    }
                    EngineRequest::Train { identity, face, reply } => {
                        tracing::debug!(%identity, "training face");
                        matcher.train(identity, &face);
                        let _ = reply.send(matcher.len());
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

fn run_recognize(
    detector: &mut dyn FaceDetector,
    matcher: &dyn FaceMatcher,
    frame: &GrayImage,
) -> Result<Vec<RecognizedFace>, EngineError> {
    let (width, height) = frame.dimensions();
    let faces = detector.detect(frame)?;

    let recognized = faces
        .into_iter()
        .filter_map(|bbox| {
            let (x, y, w, h) = bbox.crop_rect(width, height)?;
            let crop = imageops::crop_imm(frame, x, y, w, h).to_image();
            let outcome = matcher.predict(&crop);
            Some(RecognizedFace { bbox, outcome })
        })
        .collect();
    Ok(recognized)
}

/// Detections come sorted by confidence; the first usable one wins.
fn run_extract(detector: &mut dyn FaceDetector, image: &GrayImage) -> Result<GrayImage, EngineError> {
    let (width, height) = image.dimensions();
    let faces = detector.detect(image)?;
    tracing::debug!(count = faces.len(), "enroll: faces detected");

    let (x, y, w, h) = faces
        .iter()
        .filter(|face| face.has_both_eyes())
        .find_map(|face| face.crop_rect(width, height))
        .ok_or(EngineError::NoUsableFace)?;

    let crop = imageops::crop_imm(image, x, y, w, h).to_image();
    Ok(imageops::resize(&crop, ENROLL_FACE_SIZE, ENROLL_FACE_SIZE, FilterType::Triangle))
}

#[cfg(test)]
pub(crate) mod testing {
    //! Deterministic stand-ins for the ONNX detector and LBPH matcher.

    use super::*;

    /// Reports one face covering the central half of any frame whose centre
    /// pixel is non-zero. Eye landmarks are included unless `eyes` is false.
    pub struct CenterDetector {
        pub eyes: bool,
    }

    impl FaceDetector for CenterDetector {
        fn detect(&mut self, image: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError> {
            let (w, h) = image.dimensions();
            if w == 0 || h == 0 || image.get_pixel(w / 2, h / 2)[0] == 0 {
                return Ok(Vec::new());
            }
            let (x, y, bw, bh) = (w as f32 / 4.0, h as f32 / 4.0, w as f32 / 2.0, h as f32 / 2.0);
            let eye = |fx: f32| (x + bw * fx, y + bh * 0.35);
            Ok(vec![BoundingBox {
                x,
                y,
                width: bw,
                height: bh,
                confidence: 0.9,
                landmarks: self.eyes.then(|| {
                    [eye(0.3), eye(0.7), (x + bw * 0.5, y + bh * 0.5), eye(0.35), eye(0.65)]
                }),
            }])
        }
    }

    /// Identifies a face by its centre brightness: a crop whose centre pixel
    /// is `v` matches identity `"id-v"` if that identity was trained.
    #[derive(Default)]
    pub struct BrightnessMatcher {
        pub known: Vec<Identity>,
    }

    impl FaceMatcher for BrightnessMatcher {
        fn predict(&self, face: &GrayImage) -> MatchOutcome {
            let (w, h) = face.dimensions();
            let label = format!("id-{}", face.get_pixel(w / 2, h / 2)[0]);
            match self.known.iter().find(|id| id.as_str() == label) {
                Some(identity) => MatchOutcome::Matched {
                    identity: identity.clone(),
                    confidence: 10.0,
                },
                None => MatchOutcome::NoMatch { best_confidence: None },
            }
        }

        fn train(&mut self, identity: Identity, _face: &GrayImage) {
            self.known.push(identity);
        }

        fn len(&self) -> usize {
            self.known.len()
        }
    }

    pub fn engine(known: &[&str]) -> EngineHandle {
        let matcher = BrightnessMatcher {
            known: known.iter().map(|code| Identity::new(code).unwrap()).collect(),
        };
        spawn_engine(Box::new(CenterDetector { eyes: true }), Box::new(matcher)).unwrap()
    }
}
