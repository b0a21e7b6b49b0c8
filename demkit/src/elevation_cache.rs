//! Sliding read window over one raster.

use crate::dataset::DatasetCache;

/// Default edge length, in pixels, of the cached window.
pub const DEFAULT_WINDOW_SIZE: usize = 64;

/// A rectangular block of samples last read from a [`DatasetCache`].
///
/// Neighbouring queries usually land in the same block, so a handler keeps one
/// window per raster and only goes back to the raster when a query's 2×2
/// neighbourhood falls outside it. A window of size 2 reads exactly the
/// neighbourhood every time.
#[derive(Debug, Clone)]
pub struct ElevationCache {
    size: usize,
    x0: usize,
    y0: usize,
    width: usize,
    height: usize,
    samples: Vec<f64>,
}

impl ElevationCache {
    /// Create an empty window of `size` × `size` pixels (at least 2).
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(2),
            x0: 0,
            y0: 0,
            width: 0,
            height: 0,
            samples: Vec::new(),
        }
    }

    /// Edge length of a full window.
    pub fn window_size(&self) -> usize {
        self.size
    }

    /// True when the 2×2 neighbourhood whose top-left pixel is `(x, y)` is
    /// inside the current window.
    pub fn holds(&self, x: usize, y: usize) -> bool {
        x >= self.x0 && y >= self.y0 && x + 1 < self.x0 + self.width && y + 1 < self.y0 + self.height
    }

    /// Read a new window with top-left pixel `(x, y)`, clamped to the raster.
    ///
    /// The caller guarantees `x + 1` and `y + 1` are inside the raster. On a
    /// read error the window is left empty and `false` is returned.
    pub fn fill(&mut self, dataset: &mut DatasetCache, x: usize, y: usize) -> bool {
        let (raster_width, raster_height) = dataset.size();
        let width = self.size.min(raster_width.saturating_sub(x));
        let height = self.size.min(raster_height.saturating_sub(y));

        match dataset.read_window(x, y, width, height) {
            Ok(samples) => {
                self.x0 = x;
                self.y0 = y;
                self.width = width;
                self.height = height;
                self.samples = samples;
                true
            }
            Err(e) => {
                tracing::debug!(path = %dataset.path().display(), x, y, error = %e, "Window read failed");
                self.invalidate();
                false
            }
        }
    }

    /// The 2×2 neighbourhood at `(x, y)` as `[v00, v10, v01, v11]`.
    ///
    /// Only meaningful when [`holds`](Self::holds) is true.
    pub fn sample4(&self, x: usize, y: usize) -> [f64; 4] {
        debug_assert!(self.holds(x, y));
        let i = (y - self.y0) * self.width + (x - self.x0);
        [
            self.samples[i],
            self.samples[i + 1],
            self.samples[i + self.width],
            self.samples[i + self.width + 1],
        ]
    }

    /// Forget the current window.
    pub fn invalidate(&mut self) {
        self.width = 0;
        self.height = 0;
        self.samples.clear();
    }
}

impl Default for ElevationCache {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}
