// THEORY:
// The `SmartPixel` module provides the comparative half of the pixel layer. It wraps
// a pair of "dumb" `Pixel`s taken from the same coordinate of two consecutive frames
// and quantifies how much that coordinate changed.
//
// The engine uses a single lens: the channel distance, i.e. the sum of the absolute
// red, green and blue differences normalized to a percentage of the largest possible
// difference (3 * 255). Alpha never participates.

pub mod smart_pixel {
    use crate::core_modules::pixel::pixel::*;

    pub type DistancePercent = f64;

    /// The largest possible sum of absolute RGB channel differences.
    const MAX_CHANNEL_DISTANCE: f64 = 3.0 * 255.0;

    /// An analytical tool that compares the same coordinate across two frames.
    #[derive(Debug, Clone, Copy)]
    pub struct SmartPixel {
        pub previous: Pixel,
        pub current: Pixel,
    }

    impl SmartPixel {
        pub fn new(previous: Pixel, current: Pixel) -> Self {
            Self { previous, current }
        }

        /// Builds the pair for pixel `index` of two packed RGBA buffers.
        #[inline]
        pub fn at(previous: &[Byte], current: &[Byte], index: usize) -> Self {
            Self::new(Pixel::read(previous, index), Pixel::read(current, index))
        }

        /// Sum of absolute RGB differences, 0..=765.
        pub fn channel_distance(&self) -> u16 {
            let dr = (self.previous.red as i16 - self.current.red as i16).unsigned_abs();
            let dg = (self.previous.green as i16 - self.current.green as i16).unsigned_abs();
            let db = (self.previous.blue as i16 - self.current.blue as i16).unsigned_abs();
            dr + dg + db
        }

        /// Channel distance as a percentage of the maximum possible distance.
        pub fn distance_percent(&self) -> DistancePercent {
            self.channel_distance() as f64 / MAX_CHANNEL_DISTANCE * 100.0
        }

        /// A coordinate has changed when its distance is strictly above the threshold.
        #[inline]
        pub fn changed(&self, threshold_percent: DistancePercent) -> bool {
            self.distance_percent() > threshold_percent
        }
    }
}
