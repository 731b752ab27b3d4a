use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use image::{DynamicImage, ImageReader};

use crate::buffer::PixelBuffer;
use crate::error::DecodeError;
use crate::metric;
use crate::pool::BufferPool;
use crate::spec::{PixelFormat, Spec};

/// Turns cached image files into pixel buffers, recycling pooled buffers where it can.
#[derive(Debug, Clone, Copy, Default)]
pub struct Decoder;

impl Decoder {
    /// Decodes the file at `path` for `spec`.
    ///
    /// An idle buffer of the spec's bucket is claimed first and overwritten in place if the
    /// image has exactly its dimensions. Otherwise the claimed buffer goes back to the pool
    /// and a fresh one is allocated. The returned buffer is bound to `uri`.
    pub fn decode(
        &self,
        pool: &BufferPool,
        uri: &Arc<str>,
        path: &Path,
        spec: &Spec,
    ) -> Result<Arc<PixelBuffer>, DecodeError> {
        let reusable = pool.get_unused(spec);

        let image = match read_image(path) {
            Ok(image) => image,
            Err(e) => {
                if let Some(buffer) = reusable {
                    pool.return_unused(buffer);
                }
                metric!(counter("decode.failure") += 1, "spec" => spec.key());
                return Err(e);
            }
        };
        let (width, height) = (image.width(), image.height());

        let buffer = match reusable {
            Some(buffer) if buffer.width() == width && buffer.height() == height => {
                buffer.write_pixels(|pixels| convert_into(&image, spec.pixel_format(), pixels));
                buffer.set_in_decode_use(false);
                tracing::trace!(buffer = buffer.id(), uri = %uri, "decoded into pooled buffer");
                buffer
            }
            reusable => {
                if let Some(buffer) = reusable {
                    pool.return_unused(buffer);
                }
                let mut pixels = vec![0; pixel_len(width, height, spec.pixel_format())];
                convert_into(&image, spec.pixel_format(), &mut pixels);
                PixelBuffer::new(spec.clone(), width, height, pixels)
            }
        };

        buffer.bind(uri.clone());
        Ok(buffer)
    }
}

fn read_image(path: &Path) -> Result<DynamicImage, DecodeError> {
    let bytes = fs::read(path)?;
    let image = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .decode()?;
    Ok(image)
}

fn pixel_len(width: u32, height: u32, format: PixelFormat) -> usize {
    width as usize * height as usize * format.bytes_per_pixel()
}

/// Writes `image` into `out` in the given pixel format.
fn convert_into(image: &DynamicImage, format: PixelFormat, out: &mut [u8]) {
    let rgba = image.to_rgba8();
    match format {
        PixelFormat::Argb8888 => out.copy_from_slice(rgba.as_raw()),
        PixelFormat::Alpha8 => {
            for (dst, px) in out.iter_mut().zip(rgba.pixels()) {
                *dst = px[3];
            }
        }
        PixelFormat::Rgb565 => {
            for (dst, px) in out.chunks_exact_mut(2).zip(rgba.pixels()) {
                let [r, g, b, _] = px.0;
                let packed = (u16::from(r >> 3) << 11) | (u16::from(g >> 2) << 5) | u16::from(b >> 3);
                dst.copy_from_slice(&packed.to_le_bytes());
            }
        }
    }
}
