// THEORY:
// The `DiffEngine` turns two equal-sized frames into one recolored "diff frame".
// It is the algorithmic heart of the crate and knows nothing about files, endpoints
// or the fabric.
//
// Algorithm:
// 1.  **Scan**: Every pixel is visited in row-major order. For each pixel not yet
//     visited, the `SmartPixel` channel distance between the previous and current
//     frame decides whether the coordinate changed.
// 2.  **Background**: Unchanged pixels are written according to the run's
//     `BackgroundPolicy` (copied verbatim or dimmed).
// 3.  **Region Growing**: A changed pixel seeds a flood fill over the maximal
//     4-connected region of changed pixels. The fill uses an explicit stack so very
//     large regions cannot blow the call stack. Every pixel of the region is painted
//     with the region's color; the next region takes the next palette color.
// 4.  **Arena Reuse**: The visited grid and the fill stack live in the engine and are
//     reset, not reallocated, between frame pairs. An engine is therefore owned by
//     exactly one worker at a time.
// 5.  **Aggregation**: Like the blob detector it grew out of, each finished region
//     is summarized (color, size, bounding box) for logging and reports.
//
// Region shapes are fully deterministic. Region colors are cosmetic and come from a
// random palette unless a seed is configured.

use crate::config::{BackgroundPolicy, DiffConfig};
use crate::core_modules::frame::{DecodeError, Frame};
use crate::core_modules::pixel::pixel::{CHANNELS, Pixel};
use crate::core_modules::smart_pixel::smart_pixel::SmartPixel;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A simple struct to represent a pixel coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

/// One 4-connected region of changed pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    /// Position of the region in discovery order for its frame pair. Not persistent.
    pub id: usize,
    pub color: Pixel,
    pub pixel_count: usize,
    /// Top-left and bottom-right corners, inclusive.
    pub bounding_box: (Point, Point),
}

/// The output of one frame pair.
#[derive(Debug, Clone)]
pub struct DiffFrame {
    pub frame: Frame,
    pub regions: Vec<Region>,
    pub changed_pixels: usize,
}

/// A boolean grid, one cell per pixel, reused across frame pairs.
#[derive(Debug, Default)]
struct VisitedGrid {
    cells: Vec<bool>,
}

impl VisitedGrid {
    fn reset(&mut self, len: usize) {
        self.cells.clear();
        self.cells.resize(len, false);
    }

    #[inline]
    fn is_visited(&self, index: usize) -> bool {
        self.cells[index]
    }

    #[inline]
    fn visit(&mut self, index: usize) {
        self.cells[index] = true;
    }
}

/// Region colors for one frame pair, handed out in a cycle.
#[derive(Debug)]
struct RegionPalette {
    colors: Vec<Pixel>,
    cursor: usize,
}

impl RegionPalette {
    fn generate(size: usize, rng: &mut impl Rng) -> Self {
        let colors = (0..size.max(1))
            .map(|_| Pixel::opaque(rng.random(), rng.random(), rng.random()))
            .collect();
        Self { colors, cursor: 0 }
    }

    fn next_color(&mut self) -> Pixel {
        let color = self.colors[self.cursor];
        self.cursor = (self.cursor + 1) % self.colors.len();
        color
    }
}

pub struct DiffEngine {
    config: DiffConfig,
    visited: VisitedGrid,
    stack: Vec<usize>,
}

impl DiffEngine {
    pub fn new(config: DiffConfig) -> Self {
        Self {
            config,
            visited: VisitedGrid::default(),
            stack: Vec::new(),
        }
    }

    pub fn config(&self) -> &DiffConfig {
        &self.config
    }

    fn palette(&self) -> RegionPalette {
        match self.config.palette_seed {
            Some(seed) => RegionPalette::generate(self.config.palette_size, &mut StdRng::seed_from_u64(seed)),
            None => RegionPalette::generate(self.config.palette_size, &mut rand::rng()),
        }
    }

    /// Computes the diff frame of `previous -> current`.
    pub fn diff(&mut self, previous: &Frame, current: &Frame) -> Result<DiffFrame, DecodeError> {
        if (previous.width, previous.height) != (current.width, current.height) {
            return Err(DecodeError::SizeMismatch {
                previous: (previous.width, previous.height),
                current: (current.width, current.height),
            });
        }

        let width = current.width as usize;
        let pixel_count = current.pixel_count();
        let threshold = self.config.threshold_percent;
        let mut palette = self.palette();
        let mut output = vec![0u8; pixel_count * CHANNELS];
        let mut regions = Vec::new();
        let mut changed_pixels = 0;

        self.visited.reset(pixel_count);

        for index in 0..pixel_count {
            if self.visited.is_visited(index) {
                continue;
            }

            if SmartPixel::at(&previous.data, &current.data, index).changed(threshold) {
                let region = self.grow_region(
                    index,
                    width,
                    previous,
                    current,
                    palette.next_color(),
                    regions.len(),
                    &mut output,
                );
                changed_pixels += region.pixel_count;
                regions.push(region);
            } else {
                self.visited.visit(index);
                let pixel = Pixel::read(&current.data, index);
                let background = match self.config.background {
                    BackgroundPolicy::Copy => pixel,
                    BackgroundPolicy::Dim => pixel.dimmed(),
                };
                background.write(&mut output, index);
            }
        }

        Ok(DiffFrame {
            frame: Frame {
                width: current.width,
                height: current.height,
                data: output,
            },
            regions,
            changed_pixels,
        })
    }

    /// Flood-fills the 4-connected changed region containing `seed`.
    /// Pixels are marked visited when pushed, so none is pushed twice.
    #[allow(clippy::too_many_arguments)]
    fn grow_region(
        &mut self,
        seed: usize,
        width: usize,
        previous: &Frame,
        current: &Frame,
        color: Pixel,
        id: usize,
        output: &mut [u8],
    ) -> Region {
        let height = current.height as usize;
        let threshold = self.config.threshold_percent;
        let mut min = Point { x: u32::MAX, y: u32::MAX };
        let mut max = Point { x: 0, y: 0 };
        let mut pixel_count = 0;

        self.stack.clear();
        self.stack.push(seed);
        self.visited.visit(seed);

        while let Some(index) = self.stack.pop() {
            color.write(output, index);
            pixel_count += 1;

            let x = index % width;
            let y = index / width;
            min.x = min.x.min(x as u32);
            min.y = min.y.min(y as u32);
            max.x = max.x.max(x as u32);
            max.y = max.y.max(y as u32);

            // Right, left, down, up. No diagonals.
            let neighbors = [
                (x + 1 < width).then(|| index + 1),
                (x > 0).then(|| index - 1),
                (y + 1 < height).then(|| index + width),
                (y > 0).then(|| index - width),
            ];
            for neighbor in neighbors.into_iter().flatten() {
                if !self.visited.is_visited(neighbor)
                    && SmartPixel::at(&previous.data, &current.data, neighbor).changed(threshold)
                {
                    self.visited.visit(neighbor);
                    self.stack.push(neighbor);
                }
            }
        }

        Region {
            id,
            color,
            pixel_count,
            bounding_box: (min, max),
        }
    }
}

/// One-shot convenience over a fresh engine.
pub fn diff_frames(previous: &Frame, current: &Frame, config: &DiffConfig) -> Result<DiffFrame, DecodeError> {
    DiffEngine::new(config.clone()).diff(previous, current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const GRAY: [u8; 4] = [100, 100, 100, 255];
    const WHITE: [u8; 4] = [255, 255, 255, 255];

    fn seeded() -> DiffConfig {
        DiffConfig {
            palette_seed: Some(7),
            ..DiffConfig::default()
        }
    }

    fn paint(frame: &mut Frame, points: &[(u32, u32)], rgba: [u8; 4]) {
        for &(x, y) in points {
            Pixel::from(rgba).write(&mut frame.data, (y * frame.width + x) as usize);
        }
    }

    fn rect(x0: u32, y0: u32, x1: u32, y1: u32) -> Vec<(u32, u32)> {
        (y0..=y1).flat_map(|y| (x0..=x1).map(move |x| (x, y))).collect()
    }

    fn color_at(diff: &DiffFrame, x: u32, y: u32) -> Pixel {
        Pixel::read(&diff.frame.data, (y * diff.frame.width + x) as usize)
    }

    #[test]
    fn identical_frames_have_no_regions() {
        let mut frame = Frame::filled(16, 9, GRAY);
        paint(&mut frame, &rect(2, 2, 5, 5), WHITE);
        let diff = diff_frames(&frame, &frame, &seeded()).expect("diff");
        assert!(diff.regions.is_empty());
        assert_eq!(diff.changed_pixels, 0);
        assert_eq!(diff.frame, frame);
    }

    #[test]
    fn dim_policy_dims_every_unchanged_pixel() {
        let frame = Frame::filled(4, 4, [90, 60, 30, 255]);
        let config = DiffConfig {
            background: BackgroundPolicy::Dim,
            ..seeded()
        };
        let diff = diff_frames(&frame, &frame, &config).expect("diff");
        assert_eq!(diff.frame, Frame::filled(4, 4, [30, 20, 10, 255]));
    }

    #[test]
    fn separated_blocks_become_separate_regions() {
        let previous = Frame::filled(20, 10, GRAY);
        let mut current = previous.clone();
        let left = rect(1, 1, 4, 3);
        let right = rect(10, 5, 12, 8);
        paint(&mut current, &left, WHITE);
        paint(&mut current, &right, WHITE);

        let diff = diff_frames(&previous, &current, &seeded()).expect("diff");
        assert_eq!(diff.regions.len(), 2);
        assert_eq!(diff.changed_pixels, left.len() + right.len());

        let first = &diff.regions[0];
        assert_eq!(first.pixel_count, left.len());
        assert_eq!(first.bounding_box, (Point { x: 1, y: 1 }, Point { x: 4, y: 3 }));
        for &(x, y) in &left {
            assert_eq!(color_at(&diff, x, y), first.color);
        }
        let second = &diff.regions[1];
        assert_eq!(second.bounding_box, (Point { x: 10, y: 5 }, Point { x: 12, y: 8 }));
        for &(x, y) in &right {
            assert_eq!(color_at(&diff, x, y), second.color);
        }
        // Background is copied from the current frame.
        assert_eq!(color_at(&diff, 0, 0), Pixel::from(GRAY));
    }

    #[test]
    fn concave_shapes_are_one_region() {
        let previous = Frame::filled(10, 10, GRAY);
        let mut current = previous.clone();
        // A "U": two columns joined along the bottom row, scanned top-down it is
        // first seen as two separate columns.
        let mut shape = rect(1, 1, 1, 8);
        shape.extend(rect(8, 1, 8, 8));
        shape.extend(rect(2, 8, 7, 8));
        paint(&mut current, &shape, WHITE);

        let diff = diff_frames(&previous, &current, &seeded()).expect("diff");
        assert_eq!(diff.regions.len(), 1);
        assert_eq!(diff.regions[0].pixel_count, shape.len());
    }

    #[test]
    fn diagonal_contact_does_not_connect() {
        let previous = Frame::filled(4, 4, GRAY);
        let mut current = previous.clone();
        paint(&mut current, &[(0, 0), (1, 1), (2, 2)], WHITE);
        let diff = diff_frames(&previous, &current, &seeded()).expect("diff");
        assert_eq!(diff.regions.len(), 3);
        assert!(diff.regions.iter().all(|r| r.pixel_count == 1));
    }

    #[test]
    fn every_changed_pixel_belongs_to_exactly_one_region() {
        let previous = Frame::filled(32, 32, GRAY);
        let mut current = previous.clone();
        // A grid of changed 2x2 tiles separated by unchanged gutters.
        let mut changed = Vec::new();
        for ty in (0..32).step_by(4) {
            for tx in (0..32).step_by(4) {
                changed.extend(rect(tx, ty, tx + 1, ty + 1));
            }
        }
        paint(&mut current, &changed, WHITE);

        let diff = diff_frames(&previous, &current, &seeded()).expect("diff");
        assert_eq!(diff.regions.len(), 64);
        assert_eq!(diff.changed_pixels, changed.len());
        assert_eq!(diff.regions.iter().map(|r| r.pixel_count).sum::<usize>(), changed.len());
        let distinct: HashSet<_> = diff.regions.iter().map(|r| r.bounding_box).collect();
        assert_eq!(distinct.len(), 64);
    }

    #[test]
    fn full_frame_change_does_not_recurse() {
        let previous = Frame::filled(1024, 768, [0, 0, 0, 255]);
        let current = Frame::filled(1024, 768, WHITE);
        let diff = diff_frames(&previous, &current, &seeded()).expect("diff");
        assert_eq!(diff.regions.len(), 1);
        assert_eq!(diff.changed_pixels, 1024 * 768);
    }

    #[test]
    fn palette_cycles_after_it_is_exhausted() {
        let previous = Frame::filled(9, 1, GRAY);
        let mut current = previous.clone();
        paint(&mut current, &[(0, 0), (2, 0), (4, 0), (6, 0), (8, 0)], WHITE);
        let config = DiffConfig {
            palette_size: 2,
            ..seeded()
        };
        let diff = diff_frames(&previous, &current, &config).expect("diff");
        let colors: Vec<Pixel> = diff.regions.iter().map(|r| r.color).collect();
        assert_eq!(colors[0], colors[2]);
        assert_eq!(colors[1], colors[3]);
        assert_eq!(colors[0], colors[4]);
    }

    #[test]
    fn region_shapes_do_not_depend_on_colors() {
        let previous = Frame::filled(12, 12, GRAY);
        let mut current = previous.clone();
        paint(&mut current, &rect(0, 0, 3, 3), WHITE);
        paint(&mut current, &rect(6, 6, 11, 7), WHITE);

        let a = diff_frames(&previous, &current, &DiffConfig::default()).expect("diff");
        let b = diff_frames(&previous, &current, &seeded()).expect("diff");
        let shapes = |d: &DiffFrame| d.regions.iter().map(|r| (r.pixel_count, r.bounding_box)).collect::<Vec<_>>();
        assert_eq!(shapes(&a), shapes(&b));
    }

    #[test]
    fn engine_reuses_its_arena_between_pairs() {
        let mut engine = DiffEngine::new(seeded());
        let small = Frame::filled(4, 4, GRAY);
        let mut changed = small.clone();
        paint(&mut changed, &rect(0, 0, 3, 3), WHITE);
        assert_eq!(engine.diff(&small, &changed).expect("diff").regions.len(), 1);
        // A second, identical pair must not see stale visited cells.
        assert_eq!(engine.diff(&small, &changed).expect("diff").changed_pixels, 16);
        assert!(engine.diff(&small, &small).expect("diff").regions.is_empty());
    }

    #[test]
    fn mismatched_sizes_are_rejected() {
        let result = diff_frames(&Frame::filled(2, 2, GRAY), &Frame::filled(3, 2, GRAY), &seeded());
        assert!(matches!(result, Err(DecodeError::SizeMismatch { .. })));
    }
}
