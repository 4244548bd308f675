//! LBPH face recognizer.
//!
//! Local binary pattern histograms (radius 1, 8 neighbours) over an 8x8 grid,
//! compared by chi-square distance against every enrolled sample. The distance
//! is the confidence: lower is better, zero is an identical histogram.

use crate::types::{FaceMatcher, Identity, MatchOutcome};
use image::imageops::{self, FilterType};
use image::GrayImage;

/// Side length faces are normalised to before encoding.
pub const LBPH_FACE_SIZE: u32 = 100;
/// Distance below which a prediction counts as a match.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 100.0;

const LBPH_GRID: usize = 8;
const LBPH_BINS: usize = 256;

/// Neighbour offsets, clockwise from the top-left.
const NEIGHBOURS: [(i32, i32); 8] = [(-1, -1), (0, -1), (1, -1), (1, 0), (1, 1), (0, 1), (-1, 1), (-1, 0)];

pub struct LbphRecognizer {
    threshold: f64,
    samples: Vec<(Identity, Vec<f32>)>,
}

impl LbphRecognizer {
    pub fn new(threshold: f64) -> Self {
        Self { threshold, samples: Vec::new() }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Nearest enrolled sample and its distance, regardless of threshold.
    pub fn nearest(&self, face: &GrayImage) -> Option<(&Identity, f64)> {
        let query = histogram(face);
        self.samples
            .iter()
            .map(|(identity, hist)| (identity, chi_square(&query, hist)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }
}

impl Default for LbphRecognizer {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

impl FaceMatcher for LbphRecognizer {
    fn predict(&self, face: &GrayImage) -> MatchOutcome {
        match self.nearest(face) {
            Some((identity, distance)) if distance < self.threshold => MatchOutcome::Matched {
                identity: identity.clone(),
                confidence: distance,
            },
            Some((_, distance)) => MatchOutcome::NoMatch { best_confidence: Some(distance) },
            None => MatchOutcome::NoMatch { best_confidence: None },
        }
    }

    fn train(&mut self, identity: Identity, face: &GrayImage) {
        self.samples.push((identity, histogram(face)));
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Spatial LBP histogram of a face, `LBPH_GRID^2 * LBPH_BINS` long.
///
/// Each cell histogram is normalised to sum to one.
fn histogram(face: &GrayImage) -> Vec<f32> {
    let face = if face.dimensions() == (LBPH_FACE_SIZE, LBPH_FACE_SIZE) {
        face.clone()
    } else {
        imageops::resize(face, LBPH_FACE_SIZE, LBPH_FACE_SIZE, FilterType::Triangle)
    };

    let codes = lbp_codes(&face);
    let (w, h) = ((LBPH_FACE_SIZE - 2) as usize, (LBPH_FACE_SIZE - 2) as usize);
    let (cell_w, cell_h) = (w / LBPH_GRID, h / LBPH_GRID);

    let mut hist = vec![0f32; LBPH_GRID * LBPH_GRID * LBPH_BINS];
    for row in 0..LBPH_GRID {
        for col in 0..LBPH_GRID {
            let cell = &mut hist[(row * LBPH_GRID + col) * LBPH_BINS..][..LBPH_BINS];
            for y in row * cell_h..(row + 1) * cell_h {
                for x in col * cell_w..(col + 1) * cell_w {
                    cell[codes[y * w + x] as usize] += 1.0;
                }
            }
            let total = (cell_w * cell_h) as f32;
            cell.iter_mut().for_each(|v| *v /= total);
        }
    }
    hist
}

/// LBP code of every interior pixel, row-major over `(w - 2) x (h - 2)`.
fn lbp_codes(face: &GrayImage) -> Vec<u8> {
    let (w, h) = face.dimensions();
    let mut codes = Vec::with_capacity((w.saturating_sub(2) * h.saturating_sub(2)) as usize);
    for y in 1..h.saturating_sub(1) {
        for x in 1..w.saturating_sub(1) {
            let centre = face.get_pixel(x, y).0[0];
            let code = NEIGHBOURS.iter().enumerate().fold(0u8, |acc, (bit, &(dx, dy))| {
                let n = face.get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32).0[0];
                acc | (u8::from(n >= centre) << (7 - bit))
            });
            codes.push(code);
        }
    }
    codes
}

/// Symmetric chi-square distance.
fn chi_square(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .filter(|(x, y)| **x + **y > 0.0)
        .map(|(&x, &y)| {
            let (x, y) = (x as f64, y as f64);
            2.0 * (x - y).powi(2) / (x + y)
        })
        .sum()
}
