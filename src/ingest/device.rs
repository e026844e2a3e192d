//! Camera device frame source.
//!
//! `DeviceSource` captures frames from a local V4L2 device node
//! (e.g. `/dev/video0`) when built with the `ingest-v4l2` feature. Device
//! paths of the form `stub://name` select an endless synthetic camera that
//! paints a red marker into every 30th frame.
//!
//! Captured frames stay in memory and are never forwarded raw.

use anyhow::{anyhow, Result};

use super::file::SyntheticClip;
use super::{FrameRead, FrameSource};
use crate::error::SourceError;

/// Configuration for a camera device.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// Device path (e.g., "/dev/video0")
    pub device: String,
    /// Requested frame rate.
    pub target_fps: u32,
    /// Preferred frame width.
    pub width: u32,
    /// Preferred frame height.
    pub height: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            target_fps: 30,
            width: 640,
            height: 480,
        }
    }
}

/// Camera frame source.
pub struct DeviceSource {
    backend: DeviceBackend,
}

enum DeviceBackend {
    Synthetic(SyntheticClip),
    #[cfg(feature = "ingest-v4l2")]
    V4l2(v4l2::V4l2Device),
}

impl DeviceSource {
    pub fn new(config: DeviceConfig) -> Result<Self> {
        if config.device.starts_with("stub://") {
            return Ok(Self {
                backend: DeviceBackend::Synthetic(SyntheticClip::from_uri(&config.device, false)?),
            });
        }
        if config.device.contains("://") {
            return Err(anyhow!(
                "device ingestion only supports local device nodes"
            ));
        }
        #[cfg(feature = "ingest-v4l2")]
        {
            Ok(Self {
                backend: DeviceBackend::V4l2(v4l2::V4l2Device::new(config)),
            })
        }
        #[cfg(not(feature = "ingest-v4l2"))]
        {
            Err(anyhow!(
                "camera ingestion requires the ingest-v4l2 feature ({})",
                config.device
            ))
        }
    }

    /// Open the device and start streaming.
    pub fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            DeviceBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "ingest-v4l2")]
            DeviceBackend::V4l2(source) => source.connect(),
        }
    }
}

impl FrameSource for DeviceSource {
    fn describe(&self) -> String {
        match &self.backend {
            DeviceBackend::Synthetic(source) => source.describe(),
            #[cfg(feature = "ingest-v4l2")]
            DeviceBackend::V4l2(source) => format!("camera {}", source.device()),
        }
    }

    fn is_open(&self) -> bool {
        match &self.backend {
            DeviceBackend::Synthetic(source) => source.is_open(),
            #[cfg(feature = "ingest-v4l2")]
            DeviceBackend::V4l2(source) => source.is_open(),
        }
    }

    fn is_finite(&self) -> bool {
        false
    }

    fn read_frame(&mut self) -> Result<FrameRead, SourceError> {
        match &mut self.backend {
            DeviceBackend::Synthetic(source) => source.read_frame(),
            #[cfg(feature = "ingest-v4l2")]
            DeviceBackend::V4l2(source) => source.read_frame(),
        }
    }

    fn rewind(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    fn close(&mut self) {
        match &mut self.backend {
            DeviceBackend::Synthetic(source) => source.close(),
            #[cfg(feature = "ingest-v4l2")]
            DeviceBackend::V4l2(source) => source.close(),
        }
    }
}

// ----------------------------------------------------------------------------
// Production V4L2 device using libv4l
// ----------------------------------------------------------------------------

#[cfg(feature = "ingest-v4l2")]
mod v4l2 {
    use anyhow::{Context, Result};
    use ouroboros::self_referencing;

    use super::DeviceConfig;
    use crate::error::SourceError;
    use crate::frame::Frame;
    use crate::ingest::FrameRead;

    pub(super) struct V4l2Device {
        config: DeviceConfig,
        state: Option<V4l2State>,
        fourcc: [u8; 4],
        active_width: u32,
        active_height: u32,
    }

    #[self_referencing]
    struct V4l2State {
        device: v4l::Device,
        #[borrows(mut device)]
        #[covariant]
        stream: v4l::prelude::MmapStream<'this, v4l::Device>,
    }

    impl V4l2Device {
        pub(super) fn new(config: DeviceConfig) -> Self {
            Self {
                active_width: config.width,
                active_height: config.height,
                config,
                state: None,
                fourcc: *b"RGB3",
            }
        }

        pub(super) fn device(&self) -> &str {
            &self.config.device
        }

        pub(super) fn is_open(&self) -> bool {
            self.state.is_some()
        }

        pub(super) fn connect(&mut self) -> Result<()> {
            use v4l::buffer::Type;
            use v4l::video::Capture;

            let mut device = v4l::Device::with_path(&self.config.device)
                .with_context(|| format!("open v4l2 device {}", self.config.device))?;
            let mut format = device.format().context("read v4l2 format")?;
            format.width = self.config.width;
            format.height = self.config.height;
            format.fourcc = v4l::FourCC::new(b"RGB3");

            let format = match device.set_format(&format) {
                Ok(format) => format,
                Err(err) => {
                    log::warn!(
                        "camera {}: failed to set RGB format: {}",
                        self.config.device,
                        err
                    );
                    device
                        .format()
                        .context("read v4l2 format after set failure")?
                }
            };

            if self.config.target_fps > 0 {
                let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
                if let Err(err) = device.set_params(&params) {
                    log::warn!("camera {}: failed to set fps: {}", self.config.device, err);
                }
            }

            self.active_width = format.width;
            self.active_height = format.height;
            self.fourcc = format.fourcc.repr;

            let state = V4l2StateBuilder {
                device,
                stream_builder: |device| {
                    v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                        .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
                },
            }
            .try_build()?;
            self.state = Some(state);

            log::info!(
                "camera connected: {} ({}x{} {})",
                self.config.device,
                self.active_width,
                self.active_height,
                String::from_utf8_lossy(&self.fourcc)
            );
            Ok(())
        }

        pub(super) fn read_frame(&mut self) -> Result<FrameRead, SourceError> {
            use v4l::io::traits::CaptureStream;

            let state = self.state.as_mut().ok_or(SourceError::Closed)?;
            let buf = state
                .with_mut(|fields| fields.stream.next().map(|(buf, _meta)| buf.to_vec()))
                .map_err(|err| SourceError::Read(format!("capture v4l2 frame: {err}")))?;
            if buf.is_empty() {
                return Ok(FrameRead::NotReady);
            }

            let (width, height) = (self.active_width, self.active_height);
            let frame = match &self.fourcc {
                b"RGB3" => Frame::from_rgb(width, height, buf),
                b"YUYV" => Frame::from_rgb(width, height, yuyv_to_rgb(&buf, width, height)),
                b"MJPG" => image::load_from_memory_with_format(&buf, image::ImageFormat::Jpeg)
                    .ok()
                    .map(|decoded| Frame::from_image(decoded.to_rgb8())),
                other => {
                    return Err(SourceError::Read(format!(
                        "unsupported pixel format {}",
                        String::from_utf8_lossy(other)
                    )))
                }
            };
            frame
                .map(FrameRead::Frame)
                .ok_or_else(|| SourceError::Read("captured buffer does not match format".into()))
        }

        pub(super) fn close(&mut self) {
            if self.state.take().is_some() {
                log::info!("camera closed: {}", self.config.device);
            }
        }
    }

    fn yuyv_to_rgb(buf: &[u8], width: u32, height: u32) -> Vec<u8> {
        let pixels = (width as usize) * (height as usize);
        let mut rgb = Vec::with_capacity(pixels * 3);
        for chunk in buf.chunks_exact(4).take(pixels / 2) {
            let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
            rgb.extend_from_slice(&yuv_pixel(y0, u, v));
            rgb.extend_from_slice(&yuv_pixel(y1, u, v));
        }
        rgb
    }

    fn yuv_pixel(y: u8, u: u8, v: u8) -> [u8; 3] {
        let c = y as f32 - 16.0;
        let d = u as f32 - 128.0;
        let e = v as f32 - 128.0;
        let r = 1.164 * c + 1.596 * e;
        let g = 1.164 * c - 0.392 * d - 0.813 * e;
        let b = 1.164 * c + 2.017 * d;
        [
            r.clamp(0.0, 255.0) as u8,
            g.clamp(0.0, 255.0) as u8,
            b.clamp(0.0, 255.0) as u8,
        ]
    }
}
