//! Simulated GigE Vision camera backend.
//!
//! Models a camera on a gigabit link whose achievable frame rate degrades
//! once the programmed inter-packet delay eats into the per-frame idle
//! time: `rate = min(max_rate, 1 / (wire_time + packets * delay))`. The
//! model is deterministic, so the delay search can be exercised end to end
//! without hardware.

use machine_vision_formats as formats;

use formats::PixFmt;
use gev_packet_delay::{
    feature, AcquisitionStream, CameraInfo, CameraModule, DelayCamera, Error, FrameBufferPool,
    Result, spread_delay_estimate,
};
use tracing::debug;

/// Gigabit Ethernet line rate.
const GIGE_LINK_BPS: u64 = 1_000_000_000;

/// IP + UDP + GVSP header bytes per stream packet.
const PACKET_OVERHEAD_BYTES: u32 = 36;

/// Tick frequency of the simulated camera clock, 125 MHz as on common
/// GigE Vision hardware.
pub const SIM_TICK_FREQUENCY: u64 = 125_000_000;

const SIM_CAMERA_NAME: &str = "gevsim-0";

// ---------------------------
// module

pub struct WrappedModule {}

pub fn new_module() -> Result<WrappedModule> {
    Ok(WrappedModule {})
}

impl CameraModule for WrappedModule {
    type CameraType = SimCamera;

    fn name(&self) -> &str {
        "sim"
    }

    fn camera_infos(&self) -> Result<Vec<Box<dyn CameraInfo>>> {
        let info: Box<dyn CameraInfo> = Box::new(SimCameraInfo::default());
        Ok(vec![info])
    }

    fn camera(&mut self, name: &str) -> Result<Self::CameraType> {
        if name != SIM_CAMERA_NAME {
            return Err(Error::from(format!("no such camera: {name}")));
        }
        Ok(SimCamera::new(name))
    }
}

// ---------------------------
// camera info

#[derive(Debug, Clone)]
pub struct SimCameraInfo {
    name: String,
    serial: String,
    model: String,
    vendor: String,
}

impl Default for SimCameraInfo {
    fn default() -> Self {
        Self {
            name: SIM_CAMERA_NAME.to_string(),
            serial: "46231".to_string(),
            model: "SimCam-1".to_string(),
            vendor: "GevSim".to_string(),
        }
    }
}

impl CameraInfo for SimCameraInfo {
    fn name(&self) -> &str {
        &self.name
    }
    fn serial(&self) -> &str {
        &self.serial
    }
    fn model(&self) -> &str {
        &self.model
    }
    fn vendor(&self) -> &str {
        &self.vendor
    }
}

// ---------------------------
// camera

pub struct SimCamera {
    info: SimCameraInfo,
    width: u32,
    height: u32,
    pixel_format: PixFmt,
    formats: Vec<PixFmt>,
    packet_size: u32,
    tick_frequency: u64,
    delay_ticks: u64,
    /// Sensor-limited frame rate, reached whenever the link leaves enough
    /// idle time.
    max_frame_rate: f64,
    /// Factor applied to the ideal spread estimate, modeling a
    /// conservative vendor estimate which overshoots the true boundary.
    estimate_overshoot: f64,
    streaming: bool,
    frame_count: u64,
}

impl SimCamera {
    pub fn new(name: &str) -> Self {
        let info = SimCameraInfo {
            name: name.to_string(),
            ..Default::default()
        };
        Self {
            info,
            width: 640,
            height: 480,
            pixel_format: PixFmt::Mono8,
            formats: vec![PixFmt::Mono8, PixFmt::BayerRG8, PixFmt::YUV422, PixFmt::RGB8],
            packet_size: 1500,
            tick_frequency: SIM_TICK_FREQUENCY,
            delay_ticks: 0,
            max_frame_rate: 30.0,
            estimate_overshoot: 1.25,
            streaming: false,
            frame_count: 0,
        }
    }

    pub fn with_max_frame_rate(mut self, fps: f64) -> Self {
        self.max_frame_rate = fps;
        self
    }

    pub fn with_packet_size(mut self, packet_size: u32) -> Self {
        self.packet_size = packet_size;
        self
    }

    pub fn with_estimate_overshoot(mut self, factor: f64) -> Self {
        self.estimate_overshoot = factor;
        self
    }

    /// Tick frequency of zero makes the camera advertise no inter-packet
    /// delay support.
    pub fn without_tick_frequency(mut self) -> Self {
        self.tick_frequency = 0;
        self
    }

    fn image_bytes(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.pixel_format.bits_per_pixel() as u64 / 8
    }

    fn packet_payload(&self) -> u64 {
        self.packet_size.saturating_sub(PACKET_OVERHEAD_BYTES) as u64
    }

    /// Frame rate the camera reaches at the currently programmed delay.
    fn achievable_frame_rate(&self) -> f64 {
        let bytes = self.image_bytes();
        let packets = bytes.div_ceil(self.packet_payload());
        let delay_seconds = if self.tick_frequency == 0 {
            0.0
        } else {
            self.delay_ticks as f64 / self.tick_frequency as f64
        };
        let frame_time =
            (bytes * 8) as f64 / GIGE_LINK_BPS as f64 + packets as f64 * delay_seconds;
        self.max_frame_rate.min(1.0 / frame_time)
    }
}

impl CameraInfo for SimCamera {
    fn name(&self) -> &str {
        self.info.name()
    }
    fn serial(&self) -> &str {
        self.info.serial()
    }
    fn model(&self) -> &str {
        self.info.model()
    }
    fn vendor(&self) -> &str {
        self.info.vendor()
    }
}

impl DelayCamera for SimCamera {
    fn feature_int(&self, name: &str) -> Result<i64> {
        match name {
            feature::TICK_FREQUENCY => Ok(self.tick_frequency as i64),
            feature::INTER_PACKET_DELAY => Ok(self.delay_ticks as i64),
            feature::PACKET_SIZE => Ok(self.packet_size as i64),
            feature::WIDTH => Ok(self.width as i64),
            feature::HEIGHT => Ok(self.height as i64),
            _ => Err(Error::FeatureNotPresent(name.to_string())),
        }
    }

    fn feature_int_set(&mut self, name: &str, value: i64) -> Result<()> {
        match name {
            feature::INTER_PACKET_DELAY => {
                if value < 0 {
                    return Err(Error::from(format!(
                        "negative inter-packet delay: {value}"
                    )));
                }
                self.delay_ticks = value as u64;
                debug!("programmed inter-packet delay {} ticks", self.delay_ticks);
                Ok(())
            }
            feature::PACKET_SIZE => {
                if self.streaming {
                    return Err(Error::from("packet size is locked while streaming"));
                }
                self.packet_size = u32::try_from(value)?;
                Ok(())
            }
            _ => Err(Error::FeatureNotPresent(name.to_string())),
        }
    }

    fn feature_float(&self, name: &str) -> Result<f64> {
        match name {
            "AcquisitionFrameRate" => Ok(self.max_frame_rate),
            _ => Err(Error::FeatureNotPresent(name.to_string())),
        }
    }

    fn feature_enum(&self, name: &str) -> Result<String> {
        match name {
            feature::PIXEL_FORMAT => Ok(format!("{}", self.pixel_format)),
            _ => Err(Error::FeatureNotPresent(name.to_string())),
        }
    }

    fn feature_enum_set(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            feature::PIXEL_FORMAT => {
                let pixel_format = self
                    .formats
                    .iter()
                    .copied()
                    .find(|pixfmt| format!("{pixfmt}") == value)
                    .ok_or_else(|| Error::from(format!("unknown pixel format: {value}")))?;
                self.set_pixel_format(pixel_format)
            }
            _ => Err(Error::FeatureNotPresent(name.to_string())),
        }
    }

    fn feature_writable(&self, name: &str) -> Result<bool> {
        match name {
            feature::PIXEL_FORMAT | feature::PACKET_SIZE => Ok(!self.streaming),
            feature::INTER_PACKET_DELAY => Ok(true),
            feature::TICK_FREQUENCY | feature::WIDTH | feature::HEIGHT => Ok(false),
            _ => Err(Error::FeatureNotPresent(name.to_string())),
        }
    }

    fn theoretical_delay(&self) -> Result<f64> {
        let ideal = spread_delay_estimate(
            self.image_bytes(),
            self.packet_payload(),
            self.max_frame_rate,
            GIGE_LINK_BPS,
        );
        Ok(ideal * self.estimate_overshoot)
    }

    fn pixel_format(&self) -> Result<PixFmt> {
        Ok(self.pixel_format)
    }

    fn possible_pixel_formats(&self) -> Result<Vec<PixFmt>> {
        Ok(self.formats.clone())
    }

    fn set_pixel_format(&mut self, pixel_format: PixFmt) -> Result<()> {
        if self.streaming {
            return Err(Error::from("PixelFormat is locked while streaming"));
        }
        if !self.formats.contains(&pixel_format) {
            return Err(Error::from(format!(
                "pixel format not supported: {pixel_format}"
            )));
        }
        self.pixel_format = pixel_format;
        Ok(())
    }
}

impl AcquisitionStream for SimCamera {
    fn stream_start(&mut self, buffers: &mut FrameBufferPool) -> Result<()> {
        if self.streaming {
            return Err(Error::from("stream already started"));
        }
        if buffers.is_empty() {
            return Err(Error::from("empty buffer pool"));
        }
        if buffers.pixel_format() != self.pixel_format
            || buffers.width() != self.width
            || buffers.height() != self.height
        {
            return Err(Error::from(
                "buffer pool does not match the camera's current format",
            ));
        }
        // Simulate grabbing one frame per buffer.
        for buffer in buffers.iter_mut() {
            let fill = (self.frame_count & 0xff) as u8;
            buffer.data_mut().fill(fill);
            self.frame_count += 1;
        }
        self.streaming = true;
        Ok(())
    }

    fn stream_stop(&mut self) -> Result<f64> {
        if !self.streaming {
            return Err(Error::from("stream is not started"));
        }
        self.streaming = false;
        Ok(self.achievable_frame_rate())
    }
}
