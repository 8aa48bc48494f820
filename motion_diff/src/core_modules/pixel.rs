// THEORY:
// The `Pixel` module is the most fundamental unit of the diff engine. It is a
// "dumb" data container for a single RGBA pixel. It knows how to read itself out
// of a packed frame buffer and how to write itself back, and it carries the two
// single-pixel transforms the diff frame needs: dimming (for receding background)
// and an opaque constructor for region colors.
//
// Anything that needs a second pixel (distance, change detection) belongs in
// `SmartPixel`, which wraps a pair of these.
//
// Key principles:
// 1) Single-pixel scope: nothing here reads neighbors or a previous frame.
// 2) Packed layout: frames are flat RGBA8 buffers, 4 bytes per pixel, row-major.

pub mod pixel {
    pub type Byte = u8;
    pub type Channel = Byte;

    /// Number of bytes per pixel in every frame buffer handled by the engine.
    pub const CHANNELS: usize = 4;

    /// Divisor applied to each color channel when background pixels are dimmed.
    pub const DIM_DIVISOR: Channel = 3;

    /// A "dumb" data container representing a single RGBA pixel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct Pixel {
        /// The red channel value (0-255).
        pub red: Channel,
        /// The green channel value (0-255).
        pub green: Channel,
        /// The blue channel value (0-255).
        pub blue: Channel,
        /// The alpha (transparency) channel value (0-255).
        pub alpha: Channel,
    }

    impl Pixel {
        pub fn new(red: Channel, green: Channel, blue: Channel, alpha: Channel) -> Self {
            Pixel { red, green, blue, alpha }
        }

        /// A fully opaque pixel. Region colors are always opaque.
        pub fn opaque(red: Channel, green: Channel, blue: Channel) -> Self {
            Pixel::new(red, green, blue, Channel::MAX)
        }

        /// Reads the pixel at `index` (in pixels, not bytes) out of a packed RGBA buffer.
        #[inline]
        pub fn read(buffer: &[Byte], index: usize) -> Self {
            let at = index * CHANNELS;
            Pixel::new(buffer[at], buffer[at + 1], buffer[at + 2], buffer[at + 3])
        }

        /// Writes this pixel at `index` (in pixels) into a packed RGBA buffer.
        #[inline]
        pub fn write(&self, buffer: &mut [Byte], index: usize) {
            let at = index * CHANNELS;
            buffer[at..at + CHANNELS].copy_from_slice(&self.to_bytes());
        }

        /// The same pixel with its color channels scaled down; alpha is untouched.
        pub fn dimmed(&self) -> Self {
            Pixel::new(
                self.red / DIM_DIVISOR,
                self.green / DIM_DIVISOR,
                self.blue / DIM_DIVISOR,
                self.alpha,
            )
        }

        pub fn to_bytes(&self) -> [Byte; CHANNELS] {
            [self.red, self.green, self.blue, self.alpha]
        }
    }

    impl From<[Byte; CHANNELS]> for Pixel {
        fn from(bytes: [Byte; CHANNELS]) -> Self {
            Pixel::new(bytes[0], bytes[1], bytes[2], bytes[3])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::pixel::*;

    #[test]
    fn read_and_write_use_packed_rgba_offsets() {
        let mut buffer = vec![0u8; 3 * CHANNELS];
        Pixel::new(1, 2, 3, 4).write(&mut buffer, 1);
        assert_eq!(&buffer[4..8], &[1, 2, 3, 4]);
        assert_eq!(Pixel::read(&buffer, 1), Pixel::new(1, 2, 3, 4));
        assert_eq!(Pixel::read(&buffer, 0), Pixel::default());
    }

    #[test]
    fn dimming_keeps_alpha() {
        let dimmed = Pixel::new(90, 30, 255, 200).dimmed();
        assert_eq!(dimmed, Pixel::new(30, 10, 85, 200));
    }
}
