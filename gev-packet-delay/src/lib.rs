use std::time::{Duration, Instant};

use machine_vision_formats as formats;

pub mod search;
pub use search::{
    delay_to_ticks, rates_equal, PacketDelaySearch, RunResult, SearchOutcome, MAX_ITERATIONS,
    RATE_TOLERANCE,
};

// ---------------------------
// errors

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The camera reports a tick frequency of zero, so delay values cannot
    /// be expressed in device ticks at all.
    #[error("camera does not support inter-packet delay (zero tick frequency)")]
    UnsupportedDevice,
    #[error("timed out waiting for feature {0} to become writable")]
    FeatureTimeout(String),
    #[error("feature not present: {0}")]
    FeatureNotPresent(String),
    #[error("GevError({msg})")]
    GevError { msg: String },
    #[error("BackendError({0})")]
    BackendError(#[from] anyhow::Error),
    #[error("try from int error: {source}")]
    TryFromIntError {
        #[from]
        source: std::num::TryFromIntError,
    },
}

fn _test_error_is_send() {
    // Compile-time test to ensure Error implements Send trait.
    fn implements<T: Send>() {}
    implements::<Error>();
}

impl<'a> From<&'a str> for Error {
    fn from(orig: &'a str) -> Error {
        Error::GevError {
            msg: orig.to_string(),
        }
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Error {
        Error::GevError { msg }
    }
}

// ---------------------------
// GigE Vision feature names

/// Standard GigE Vision feature names used by the typed accessors on
/// [DelayCamera].
pub mod feature {
    /// Camera clock tick frequency, in Hz.
    pub const TICK_FREQUENCY: &str = "GevTimestampTickFrequency";
    /// Stream channel inter-packet delay, in ticks.
    pub const INTER_PACKET_DELAY: &str = "GevSCPD";
    /// Stream channel packet size, in bytes.
    pub const PACKET_SIZE: &str = "GevSCPSPacketSize";
    pub const WIDTH: &str = "Width";
    pub const HEIGHT: &str = "Height";
    pub const PIXEL_FORMAT: &str = "PixelFormat";
}

// ---------------------------
// CameraModule

/// A module for opening cameras (e.g. a vendor SDK wrapper or the
/// simulator).
pub trait CameraModule: Send {
    type CameraType: DelayCamera + AcquisitionStream;

    fn name(&self) -> &str;
    fn camera_infos(&self) -> Result<Vec<Box<dyn CameraInfo>>>;
    fn camera(&mut self, name: &str) -> Result<Self::CameraType>;
}

// ---------------------------
// CameraInfo

pub trait CameraInfo {
    fn name(&self) -> &str;
    fn serial(&self) -> &str;
    fn model(&self) -> &str;
    fn vendor(&self) -> &str;
}

// ---------------------------
// DelayCamera

/// Device-parameter access for a GigE Vision camera.
///
/// Backends implement the weakly typed feature accessors; the typed
/// accessors have default implementations in terms of the standard GigE
/// Vision feature names in [feature] and may be overridden where a vendor
/// SDK exposes a better path.
pub trait DelayCamera: CameraInfo + Send {
    // ----- start: weakly typed but easier to implement API -----

    fn feature_int(&self, name: &str) -> Result<i64>;
    fn feature_int_set(&mut self, name: &str, value: i64) -> Result<()>;
    fn feature_float(&self, name: &str) -> Result<f64>;
    fn feature_enum(&self, name: &str) -> Result<String>;
    fn feature_enum_set(&mut self, name: &str, value: &str) -> Result<()>;
    fn feature_writable(&self, name: &str) -> Result<bool>;

    // ----- end: weakly typed but easier to implement API -----

    /// Camera clock tick frequency in Hz.
    ///
    /// A value of zero means the camera cannot express inter-packet delays
    /// and [PacketDelaySearch::new](crate::PacketDelaySearch::new) will
    /// refuse to run against it.
    fn tick_frequency(&self) -> Result<u64> {
        Ok(self.feature_int(feature::TICK_FREQUENCY)?.try_into()?)
    }

    /// Program the inter-packet delay register, in ticks.
    fn set_inter_packet_delay(&mut self, ticks: u64) -> Result<()> {
        self.feature_int_set(feature::INTER_PACKET_DELAY, ticks.try_into()?)
    }

    /// Currently programmed inter-packet delay, in ticks.
    fn inter_packet_delay(&self) -> Result<u64> {
        Ok(self.feature_int(feature::INTER_PACKET_DELAY)?.try_into()?)
    }

    /// Stream channel packet size in bytes.
    fn packet_size(&self) -> Result<u32> {
        Ok(self.feature_int(feature::PACKET_SIZE)?.try_into()?)
    }

    /// Return the sensor width in pixels
    fn width(&self) -> Result<u32> {
        Ok(self.feature_int(feature::WIDTH)?.try_into()?)
    }
    /// Return the sensor height in pixels
    fn height(&self) -> Result<u32> {
        Ok(self.feature_int(feature::HEIGHT)?.try_into()?)
    }

    /// Model-estimated inter-packet delay in seconds, used to seed the
    /// search.
    ///
    /// The estimate depends on the image size, packet size and pixel
    /// format, so it is only valid after the desired pixel format has been
    /// applied. See [spread_delay_estimate] for a backend-usable model.
    fn theoretical_delay(&self) -> Result<f64>;

    // Settings: PixFmt ----------------------------
    fn pixel_format(&self) -> Result<formats::PixFmt>;
    fn possible_pixel_formats(&self) -> Result<Vec<formats::PixFmt>>;
    fn set_pixel_format(&mut self, pixel_format: formats::PixFmt) -> Result<()>;
}

// ---------------------------
// AcquisitionStream

/// Streaming acquisition which reports an aggregate frame rate.
///
/// Implementations must acquire enough frames between
/// [AcquisitionStream::stream_start] and [AcquisitionStream::stream_stop]
/// to measure a stable rate, and must support being started and stopped
/// repeatedly without leaking resources across iterations within one
/// tuning run and across runs for different pixel formats.
pub trait AcquisitionStream {
    fn stream_start(&mut self, buffers: &mut FrameBufferPool) -> Result<()>;
    /// Stop streaming and return the measured frame rate in frames per
    /// second.
    fn stream_stop(&mut self) -> Result<f64>;
}

// ---------------------------
// FrameBufferPool

/// Number of images in the grab queue. Generally, increasing this number
/// gives a better real-time rate measurement.
pub const DEFAULT_NUM_BUFFERS: usize = 20;

/// A single pre-allocated grab buffer.
pub struct FrameBuffer {
    data: Vec<u8>,
}

impl FrameBuffer {
    pub fn data(&self) -> &[u8] {
        &self.data
    }
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// An owned, caller-scoped collection of grab buffers passed to the
/// acquisition stream. One pool is allocated per pixel-format run and
/// dropped when the run ends.
pub struct FrameBufferPool {
    width: u32,
    height: u32,
    pixel_format: formats::PixFmt,
    buffers: Vec<FrameBuffer>,
}

impl FrameBufferPool {
    pub fn new(width: u32, height: u32, pixel_format: formats::PixFmt, count: usize) -> Self {
        let stride = width as usize * pixel_format.bits_per_pixel() as usize / 8;
        let buffers = (0..count)
            .map(|_| FrameBuffer {
                // Buffers start cleared to 0xff so stale data is obvious.
                data: vec![0xff; stride * height as usize],
            })
            .collect();
        Self {
            width,
            height,
            pixel_format,
            buffers,
        }
    }

    /// Allocate buffers matching the camera's currently applied pixel
    /// format and image size.
    pub fn for_camera<C: DelayCamera + ?Sized>(cam: &C, count: usize) -> Result<Self> {
        Ok(Self::new(
            cam.width()?,
            cam.height()?,
            cam.pixel_format()?,
            count,
        ))
    }

    pub fn width(&self) -> u32 {
        self.width
    }
    pub fn height(&self) -> u32 {
        self.height
    }
    pub fn pixel_format(&self) -> formats::PixFmt {
        self.pixel_format
    }
    pub fn len(&self) -> usize {
        self.buffers.len()
    }
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, FrameBuffer> {
        self.buffers.iter_mut()
    }
}

// ---------------------------
// feature write readiness

const WRITABLE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Wait until `name` becomes writable, polling at a fixed interval.
///
/// Cameras keep some features (notably `PixelFormat`) locked while a
/// stream is open or a previous write is still being applied. The wait is
/// bounded: once `timeout` elapses [Error::FeatureTimeout] is returned
/// rather than blocking indefinitely.
pub fn wait_feature_writable<C: DelayCamera + ?Sized>(
    cam: &C,
    name: &str,
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if cam.feature_writable(name)? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::FeatureTimeout(name.to_string()));
        }
        std::thread::sleep(WRITABLE_POLL_INTERVAL);
    }
}

// ---------------------------
// theoretical delay model

/// Estimate an inter-packet delay, in seconds, which spreads packet
/// transmission over the length of a frame.
///
/// The per-frame idle time on the link (`1/frame_rate` minus the wire
/// time of the image payload) is divided evenly among the frame's
/// packets. Returns 0.0 when the inputs leave no idle time or are
/// degenerate.
pub fn spread_delay_estimate(
    image_bytes: u64,
    packet_payload: u64,
    frame_rate: f64,
    link_bps: u64,
) -> f64 {
    if image_bytes == 0 || packet_payload == 0 || link_bps == 0 || frame_rate <= 0.0 {
        return 0.0;
    }
    let packets = image_bytes.div_ceil(packet_payload);
    let wire_time = (image_bytes * 8) as f64 / link_bps as f64;
    let slack = (1.0 / frame_rate - wire_time).max(0.0);
    slack / packets as f64
}
