//! Display state machine: a grid of all cameras, or one camera focused.
//!
//! Gestures arrive as discrete events; rendering only reads the state.

use std::time::{Duration, Instant};

pub const DEFAULT_GESTURE_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    Grid,
    Focused(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gesture {
    /// Select a grid cell, or a point outside every cell (`None`).
    /// The cell is ignored while a camera is focused.
    Select { cell: Option<usize>, at: Instant },
}

impl Gesture {
    fn at(&self) -> Instant {
        match self {
            Gesture::Select { at, .. } => *at,
        }
    }
}

pub struct ViewController {
    state: ViewState,
    cameras: usize,
    debounce: Duration,
    last_accepted: Option<Instant>,
}

impl ViewController {
    pub fn new(cameras: usize, debounce: Duration) -> Self {
        Self {
            state: ViewState::Grid,
            cameras,
            debounce,
            last_accepted: None,
        }
    }

    pub fn state(&self) -> ViewState {
        self.state
    }

    /// Apply a gesture. Returns the new state if it changed.
    ///
    /// A gesture arriving within the debounce window of the last accepted one
    /// is dropped, as is a selection of a cell with no camera behind it.
    pub fn apply(&mut self, gesture: Gesture) -> Option<ViewState> {
        let at = gesture.at();
        if let Some(last) = self.last_accepted {
            if at.saturating_duration_since(last) < self.debounce {
                tracing::debug!("gesture debounced");
                return None;
            }
        }

        let next = match (self.state, gesture) {
            (ViewState::Grid, Gesture::Select { cell: Some(cell), .. }) if cell < self.cameras => {
                ViewState::Focused(cell)
            }
            (ViewState::Grid, Gesture::Select { cell, .. }) => {
                tracing::debug!(?cell, cameras = self.cameras, "select on empty grid cell ignored");
                return None;
            }
            (ViewState::Focused(_), Gesture::Select { .. }) => ViewState::Grid,
        };

        self.last_accepted = Some(at);
        self.state = next;
        Some(next)
    }
}

/// Placement of `cameras` tiles in a `width` x `height` mosaic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridLayout {
    pub cameras: usize,
    pub cols: u32,
    pub rows: u32,
    pub width: u32,
    pub height: u32,
}

impl GridLayout {
    pub fn new(cameras: usize, width: u32, height: u32) -> Self {
        let n = cameras.max(1) as u32;
        let cols = (n as f64).sqrt().ceil() as u32;
        let rows = n.div_ceil(cols);
        Self { cameras, cols, rows, width, height }
    }

    /// Size of one tile.
    pub fn cell_size(&self) -> (u32, u32) {
        ((self.width / self.cols).max(1), (self.height / self.rows).max(1))
    }

    /// Top-left pixel of tile `index`.
    pub fn cell_origin(&self, index: usize) -> (u32, u32) {
        let (cw, ch) = self.cell_size();
        let index = index as u32;
        ((index % self.cols) * cw, (index / self.cols) * ch)
    }

    /// Tile under mosaic pixel `(x, y)`, if a camera occupies it.
    pub fn cell_at(&self, x: u32, y: u32) -> Option<usize> {
        let (cw, ch) = self.cell_size();
        let col = x / cw;
        let row = y / ch;
        if col >= self.cols || row >= self.rows {
            return None;
        }
        let index = (row * self.cols + col) as usize;
        (index < self.cameras).then_some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select(cell: usize, at: Instant) -> Gesture {
        Gesture::Select { cell: Some(cell), at }
    }

    #[test]
    fn test_select_toggles_between_grid_and_focus() {
        let t0 = Instant::now();
        let mut view = ViewController::new(4, DEFAULT_GESTURE_DEBOUNCE);
        assert_eq!(view.state(), ViewState::Grid);

        assert_eq!(view.apply(select(2, t0)), Some(ViewState::Focused(2)));
        assert_eq!(view.apply(select(0, t0 + Duration::from_secs(1))), Some(ViewState::Grid));
        assert_eq!(view.state(), ViewState::Grid);
    }

    #[test]
    fn test_gestures_inside_debounce_collapse() {
        let t0 = Instant::now();
        let mut view = ViewController::new(4, DEFAULT_GESTURE_DEBOUNCE);
        view.apply(select(1, t0));
        assert_eq!(view.apply(select(1, t0 + Duration::from_millis(499))), None);
        assert_eq!(view.state(), ViewState::Focused(1));
        assert_eq!(view.apply(select(1, t0 + Duration::from_millis(500))), Some(ViewState::Grid));
    }

    #[test]
    fn test_empty_cell_is_ignored_and_not_debounced() {
        let t0 = Instant::now();
        let mut view = ViewController::new(3, DEFAULT_GESTURE_DEBOUNCE);
        assert_eq!(view.apply(select(3, t0)), None);
        assert_eq!(view.apply(select(0, t0 + Duration::from_millis(10))), Some(ViewState::Focused(0)));
    }

    #[test]
    fn test_select_outside_cells_only_leaves_focus() {
        let t0 = Instant::now();
        let mut view = ViewController::new(2, DEFAULT_GESTURE_DEBOUNCE);
        let outside = |at| Gesture::Select { cell: None, at };
        assert_eq!(view.apply(outside(t0)), None);
        view.apply(select(1, t0 + Duration::from_secs(1)));
        assert_eq!(view.apply(outside(t0 + Duration::from_secs(2))), Some(ViewState::Grid));
    }

    #[test]
    fn test_grid_layout_shapes() {
        let one = GridLayout::new(1, 640, 480);
        assert_eq!((one.cols, one.rows), (1, 1));

        let three = GridLayout::new(3, 640, 480);
        assert_eq!((three.cols, three.rows), (2, 2));
        assert_eq!(three.cell_size(), (320, 240));
        assert_eq!(three.cell_origin(2), (0, 240));

        let five = GridLayout::new(5, 600, 400);
        assert_eq!((five.cols, five.rows), (3, 2));
    }

    #[test]
    fn test_cell_hit_testing() {
        let layout = GridLayout::new(3, 640, 480);
        assert_eq!(layout.cell_at(10, 10), Some(0));
        assert_eq!(layout.cell_at(400, 10), Some(1));
        assert_eq!(layout.cell_at(10, 300), Some(2));
        assert_eq!(layout.cell_at(400, 300), None);
        assert_eq!(layout.cell_at(9999, 10), None);
    }
}
