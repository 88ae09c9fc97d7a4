//! Decoded-frame to tile-raster conversion.

use bytes::Bytes;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::frame;
use ffmpeg_next::software::scaling::{context::Context, flag::Flags};
use quadview_types::{PipelineError, RasterFrame};

use crate::ff_err;

/// Converts decoded frames of one fixed source geometry into the RGBA tile
/// raster. The conversion context is built from the first frame seen and
/// reused; a source that changes format or dimensions mid-session is an
/// error, never silently corrupt output.
pub struct FrameScaler {
    name: String,
    tile_width: u32,
    tile_height: u32,
    converter: Option<Converter>,
    rgba: frame::Video,
}

struct Converter {
    ctx: Context,
    src_format: Pixel,
    src_width: u32,
    src_height: u32,
}

impl Converter {
    fn build(
        name: &str,
        frame: &frame::Video,
        tile_width: u32,
        tile_height: u32,
    ) -> Result<Self, PipelineError> {
        let ctx = Context::get(
            frame.format(),
            frame.width(),
            frame.height(),
            Pixel::RGBA,
            tile_width,
            tile_height,
            Flags::BILINEAR,
        )
        .map_err(ff_err)?;

        log::info!(
            target: "rtsp",
            "\"{}\" converter ready: {} -> {}x{} rgba",
            name,
            geometry(frame.width(), frame.height(), frame.format()),
            tile_width,
            tile_height
        );

        Ok(Self {
            ctx,
            src_format: frame.format(),
            src_width: frame.width(),
            src_height: frame.height(),
        })
    }
}

impl FrameScaler {
    pub fn new(name: &str, tile_width: u32, tile_height: u32) -> Self {
        Self {
            name: name.to_string(),
            tile_width,
            tile_height,
            converter: None,
            rgba: frame::Video::empty(),
        }
    }

    /// Scales one decoded frame into the reused tile raster. The returned
    /// reference is valid until the next call; callers copy it out with
    /// [`pack_raster`] when the frame leaves the thread.
    pub fn scale(&mut self, frame: &frame::Video) -> Result<&frame::Video, PipelineError> {
        if let Some(converter) = self.converter.as_ref() {
            let have = (converter.src_width, converter.src_height, converter.src_format);
            let got = (frame.width(), frame.height(), frame.format());
            if have != got {
                return Err(PipelineError::SourceChanged {
                    have: geometry(have.0, have.1, have.2),
                    got: geometry(got.0, got.1, got.2),
                });
            }
        }

        if self.converter.is_none() {
            self.converter = Some(Converter::build(
                &self.name,
                frame,
                self.tile_width,
                self.tile_height,
            )?);
        }
        if let Some(converter) = self.converter.as_mut() {
            converter.ctx.run(frame, &mut self.rgba).map_err(ff_err)?;
        }

        Ok(&self.rgba)
    }

    /// Forgets the source geometry so the next frame rebuilds the
    /// conversion context. Used when the decode path changes underneath
    /// the session; the tile dimensions never change.
    pub fn reset(&mut self) {
        self.converter = None;
    }
}

/// Copies a scaled raster out of its reused frame, dropping any row
/// padding the scaler added.
pub fn pack_raster(frame: &frame::Video) -> RasterFrame {
    let width = frame.width();
    let height = frame.height();
    let row = width as usize * 4;
    let stride = frame.stride(0);
    let data = frame.data(0);

    let mut packed = Vec::with_capacity(row * height as usize);
    if stride == row {
        packed.extend_from_slice(&data[..row * height as usize]);
    } else {
        for y in 0..height as usize {
            let start = y * stride;
            packed.extend_from_slice(&data[start..start + row]);
        }
    }

    RasterFrame {
        width,
        height,
        data: Bytes::from(packed),
    }
}

fn geometry(width: u32, height: u32, format: Pixel) -> String {
    format!("{}x{} {:?}", width, height, format)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn black_frame(width: u32, height: u32, format: Pixel) -> frame::Video {
        crate::init().expect("ffmpeg init");
        let mut frame = frame::Video::new(format, width, height);
        for plane in 0..frame.planes() {
            frame.data_mut(plane).fill(0);
        }
        frame
    }

    #[test]
    fn output_matches_tile_dimensions() {
        let mut scaler = FrameScaler::new("cam", 960, 540);
        let input = black_frame(1280, 720, Pixel::YUV420P);

        let scaled = scaler.scale(&input).expect("scale");
        assert_eq!(scaled.width(), 960);
        assert_eq!(scaled.height(), 540);
        assert_eq!(scaled.format(), Pixel::RGBA);

        let raster = pack_raster(scaled);
        assert_eq!(raster.width, 960);
        assert_eq!(raster.height, 540);
        assert_eq!(raster.data.len(), 960 * 540 * 4);
    }

    #[test]
    fn converter_is_reused_across_frames() {
        let mut scaler = FrameScaler::new("cam", 320, 180);
        let input = black_frame(640, 360, Pixel::YUV420P);

        for _ in 0..3 {
            let scaled = scaler.scale(&input).expect("scale");
            assert_eq!((scaled.width(), scaled.height()), (320, 180));
        }
    }

    #[test]
    fn geometry_change_is_fatal() {
        let mut scaler = FrameScaler::new("cam", 320, 180);
        let first = black_frame(1280, 720, Pixel::YUV420P);
        scaler.scale(&first).expect("first frame");

        let shrunk = black_frame(640, 360, Pixel::YUV420P);
        let err = scaler.scale(&shrunk).err().expect("changed source");
        assert!(matches!(err, PipelineError::SourceChanged { .. }));

        let reformatted = black_frame(1280, 720, Pixel::NV12);
        let err = scaler.scale(&reformatted).err().expect("changed format");
        assert!(matches!(err, PipelineError::SourceChanged { .. }));
    }

    #[test]
    fn reset_accepts_a_new_geometry() {
        let mut scaler = FrameScaler::new("cam", 320, 180);
        let first = black_frame(1280, 720, Pixel::YUV420P);
        scaler.scale(&first).expect("first frame");

        scaler.reset();
        let second = black_frame(1280, 720, Pixel::NV12);
        let scaled = scaler.scale(&second).expect("rebuilt converter");
        assert_eq!((scaled.width(), scaled.height()), (320, 180));
    }
}
