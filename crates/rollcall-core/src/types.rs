use chrono::{DateTime, Utc};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable enrollment key for a person (a national or enrollment code).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("identity code must not be empty")]
pub struct EmptyIdentity;

impl Identity {
    /// Build an identity from a code, trimming surrounding whitespace.
    pub fn new(code: impl AsRef<str>) -> Result<Self, EmptyIdentity> {
        let code = code.as_ref().trim();
        if code.is_empty() {
            return Err(EmptyIdentity);
        }
        Ok(Self(code.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Identity {
    type Error = EmptyIdentity;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Identity> for String {
    fn from(value: Identity) -> Self {
        value.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One recognised face at one camera at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub identity: Identity,
    /// Location label of the camera that produced the sighting.
    pub location: String,
    pub observed_at: DateTime<Utc>,
}

impl Observation {
    pub fn new(identity: Identity, location: impl Into<String>, observed_at: DateTime<Utc>) -> Self {
        Self {
            identity,
            location: location.into(),
            observed_at,
        }
    }
}

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Integer crop rectangle `(x, y, w, h)` clamped to a `width` x `height` image.
    ///
    /// Returns `None` when the box lies entirely outside the image.
    pub fn crop_rect(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0.0).floor() as u32;
        let y0 = self.y.max(0.0).floor() as u32;
        let x1 = ((self.x + self.width).ceil().max(0.0) as u32).min(width);
        let y1 = ((self.y + self.height).ceil().max(0.0) as u32).min(height);
        if x0 >= x1 || y0 >= y1 {
            return None;
        }
        Some((x0, y0, x1 - x0, y1 - y0))
    }

    /// True when both eye landmarks are present and fall inside the box.
    pub fn has_both_eyes(&self) -> bool {
        let Some(landmarks) = &self.landmarks else {
            return false;
        };
        landmarks[..2].iter().all(|&(lx, ly)| {
            lx >= self.x && lx <= self.x + self.width && ly >= self.y && ly <= self.y + self.height
        })
    }
}

/// Result of matching one face crop against the enrolled gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// Best candidate scored below the threshold. Lower confidence is better.
    Matched { identity: Identity, confidence: f64 },
    /// Nothing enrolled, or the best candidate was not close enough.
    NoMatch { best_confidence: Option<f64> },
}

impl MatchOutcome {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            MatchOutcome::Matched { identity, .. } => Some(identity),
            MatchOutcome::NoMatch { .. } => None,
        }
    }
}

/// Maps a cropped grayscale face to an enrolled identity.
pub trait FaceMatcher: Send {
    fn predict(&self, face: &GrayImage) -> MatchOutcome;

    /// Add a labelled face sample to the gallery.
    fn train(&mut self, identity: Identity, face: &GrayImage);

    /// Number of enrolled samples.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face_at(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 0.9, landmarks: None }
    }

    #[test]
    fn test_identity_trims_and_rejects_empty() {
        assert_eq!(Identity::new(" 0012345678 ").unwrap().as_str(), "0012345678");
        assert_eq!(Identity::new("   "), Err(EmptyIdentity));
        assert_eq!(Identity::new(""), Err(EmptyIdentity));
    }

    #[test]
    fn test_identity_string_conversions() {
        let id = Identity::try_from("42".to_string()).unwrap();
        assert_eq!(id.to_string(), "42");
        assert_eq!(String::from(id), "42");
        assert!(Identity::try_from(String::new()).is_err());
    }

    #[test]
    fn test_crop_rect_clamps_to_image() {
        let face = face_at(-10.0, 5.0, 50.0, 200.0);
        assert_eq!(face.crop_rect(100, 100), Some((0, 5, 40, 95)));
    }

    #[test]
    fn test_crop_rect_outside_image() {
        let face = face_at(150.0, 150.0, 20.0, 20.0);
        assert_eq!(face.crop_rect(100, 100), None);
    }

    #[test]
    fn test_has_both_eyes() {
        let mut face = face_at(10.0, 10.0, 100.0, 100.0);
        assert!(!face.has_both_eyes());

        face.landmarks = Some([(40.0, 40.0), (80.0, 40.0), (60.0, 60.0), (45.0, 85.0), (75.0, 85.0)]);
        assert!(face.has_both_eyes());

        face.landmarks = Some([(40.0, 40.0), (130.0, 40.0), (60.0, 60.0), (45.0, 85.0), (75.0, 85.0)]);
        assert!(!face.has_both_eyes());
    }

    #[test]
    fn test_match_outcome_identity() {
        let id = Identity::new("7").unwrap();
        let m = MatchOutcome::Matched { identity: id.clone(), confidence: 12.0 };
        assert_eq!(m.identity(), Some(&id));
        assert_eq!(MatchOutcome::NoMatch { best_confidence: None }.identity(), None);
    }
}
