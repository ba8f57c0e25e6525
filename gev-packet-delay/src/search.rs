//! Iterative search for the largest inter-packet delay which keeps the
//! camera at its reference frame rate.
//!
//! The inter-packet delay is first set to zero and a reference frame rate
//! is sampled. The camera's theoretical delay estimate is then used as a
//! starting point, and the delay is shrunk while re-measuring the frame
//! rate until three consecutive measurements match the reference. The
//! accepted delay is the converged value reduced by a safety margin. If
//! the reference frame rate initially sampled is off, the search will not
//! converge to a solution.

use std::time::Duration;

use machine_vision_formats::PixFmt;
use tracing::{debug, info};

use crate::{AcquisitionStream, DelayCamera, Error, FrameBufferPool, Result};

/// Absolute frame-rate tolerance, in frames per second, within which two
/// measurements count as equal.
pub const RATE_TOLERANCE: f64 = 0.1;

/// Consecutive matching measurements required before a delay value is
/// trusted. A single match could be measurement noise.
const CONVERGENCE_STREAK: u32 = 3;

/// Fraction removed from the converged delay before programming the final
/// value.
const SAFETY_MARGIN: f64 = 0.15;

/// Delay shrink divisor while re-confirming a matching rate (2%).
const MATCH_SHRINK_DIVISOR: f64 = 50.0;

/// Delay shrink divisor after a rate mismatch (10%).
const MISMATCH_SHRINK_DIVISOR: f64 = 10.0;

/// Settling time between iterations. The newly programmed delay and the
/// restarted stream need this long to take effect; measuring sooner gives
/// spurious mismatches from transient state.
const SETTLE_INTERVAL: Duration = Duration::from_millis(500);

/// Upper bound on search iterations. The shrink steps terminate for any
/// realistic starting delay well before this; hitting the cap means the
/// frame rate never stabilized within tolerance.
pub const MAX_ITERATIONS: u32 = 1000;

/// Approximate equality of two frame rates.
pub fn rates_equal(a: f64, b: f64) -> bool {
    (a - b).abs() <= RATE_TOLERANCE
}

/// Convert a delay in seconds to device clock ticks, truncating.
pub fn delay_to_ticks(delay_seconds: f64, tick_frequency: u64) -> u64 {
    (delay_seconds * tick_frequency as f64) as u64
}

#[derive(Debug, Clone, Default)]
struct SearchState {
    base_frame_rate: f64,
    measured_frame_rate: f64,
    delay_seconds: f64,
    delay_ticks: u64,
    tick_frequency: u64,
    equality_streak: u32,
}

/// The accepted solution for one pixel-format run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub pixel_format: PixFmt,
    /// Final programmed delay, in device clock ticks.
    pub delay_ticks: u64,
    /// Final delay in seconds.
    pub delay_seconds: f64,
    /// Reference frame rate measured with zero delay.
    pub base_frame_rate: f64,
    /// Frame rate measured at the last probed delay.
    pub measured_frame_rate: f64,
}

/// How a per-format search run ended.
///
/// Only [SearchOutcome::Converged] carries a usable solution.
/// [SearchOutcome::StoppedAtNonPositiveDelay] is a distinct stop kept
/// separate from both success and failure: the running delay reached zero
/// seconds while its tick conversion was still nonzero, which no category
/// of the search models cleanly. Callers should surface it as its own
/// case rather than fold it into either.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    Converged(RunResult),
    /// The streak-based convergence landed exactly on zero delay; no
    /// useful delay exists for this format.
    ConvergedAtZero,
    /// Mismatch-driven shrinkage reached zero ticks before any
    /// convergence; the delay would have to be zero to preserve the frame
    /// rate.
    DrivenToZero,
    StoppedAtNonPositiveDelay(RunResult),
    /// The iteration cap was reached without any stop condition firing.
    DidNotConverge { iterations: u32 },
}

impl SearchOutcome {
    /// True for the outcomes which contribute no solution.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            SearchOutcome::ConvergedAtZero
                | SearchOutcome::DrivenToZero
                | SearchOutcome::DidNotConverge { .. }
        )
    }

    pub fn result(&self) -> Option<&RunResult> {
        match self {
            SearchOutcome::Converged(result) => Some(result),
            SearchOutcome::StoppedAtNonPositiveDelay(result) => Some(result),
            _ => None,
        }
    }
}

/// Feedback-control search for one pixel format.
///
/// Owns the search state exclusively for the duration of the run. The
/// camera and buffer pool are borrowed for the whole run; runs for
/// different pixel formats are strictly sequential.
pub struct PacketDelaySearch<'a, C>
where
    C: DelayCamera + AcquisitionStream,
{
    cam: &'a mut C,
    buffers: &'a mut FrameBufferPool,
    settle: Duration,
    max_iterations: u32,
    state: SearchState,
}

impl<'a, C> PacketDelaySearch<'a, C>
where
    C: DelayCamera + AcquisitionStream,
{
    /// Create a search over `cam` using `buffers` for acquisition.
    ///
    /// Fails with [Error::UnsupportedDevice] when the camera reports a
    /// zero tick frequency, before any streaming happens.
    pub fn new(cam: &'a mut C, buffers: &'a mut FrameBufferPool) -> Result<Self> {
        let tick_frequency = cam.tick_frequency()?;
        if tick_frequency == 0 {
            return Err(Error::UnsupportedDevice);
        }
        Ok(Self {
            cam,
            buffers,
            settle: SETTLE_INTERVAL,
            max_iterations: MAX_ITERATIONS,
            state: SearchState {
                tick_frequency,
                ..Default::default()
            },
        })
    }

    /// Override the settling interval between iterations.
    pub fn with_settle_interval(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Override the iteration cap.
    pub fn with_iteration_cap(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Reference frame rate sampled by [PacketDelaySearch::measure_baseline].
    pub fn base_frame_rate(&self) -> f64 {
        self.state.base_frame_rate
    }

    fn measure_rate(&mut self) -> Result<f64> {
        self.cam.stream_start(self.buffers)?;
        self.cam.stream_stop()
    }

    /// Sample the reference frame rate at zero delay and seed the search
    /// from the camera's theoretical delay estimate.
    pub fn measure_baseline(&mut self) -> Result<()> {
        self.cam.set_inter_packet_delay(0)?;
        self.state.base_frame_rate = self.measure_rate()?;
        self.state.delay_seconds = self.cam.theoretical_delay()?;
        self.state.delay_ticks =
            delay_to_ticks(self.state.delay_seconds, self.state.tick_frequency);
        info!(
            "reference frame rate {:.2} fps, theoretical delay {:.3} usec ({} ticks)",
            self.state.base_frame_rate,
            self.state.delay_seconds * 1e6,
            self.state.delay_ticks,
        );
        Ok(())
    }

    fn shrink_delay(&mut self, divisor: f64) {
        self.state.delay_seconds -= self.state.delay_seconds / divisor;
        self.state.delay_ticks =
            delay_to_ticks(self.state.delay_seconds, self.state.tick_frequency);
    }

    fn current_result(&self) -> Result<RunResult> {
        Ok(RunResult {
            pixel_format: self.cam.pixel_format()?,
            delay_ticks: self.state.delay_ticks,
            delay_seconds: self.state.delay_seconds,
            base_frame_rate: self.state.base_frame_rate,
            measured_frame_rate: self.state.measured_frame_rate,
        })
    }

    /// Run the iterative search. Call after
    /// [PacketDelaySearch::measure_baseline].
    pub fn search(&mut self) -> Result<SearchOutcome> {
        for iteration in 1..=self.max_iterations {
            self.cam.set_inter_packet_delay(self.state.delay_ticks)?;
            self.state.measured_frame_rate = self.measure_rate()?;
            debug!(
                "iteration {}: programmed {} ticks, measured {:.2} fps",
                iteration, self.state.delay_ticks, self.state.measured_frame_rate,
            );

            if rates_equal(self.state.base_frame_rate, self.state.measured_frame_rate) {
                self.state.equality_streak += 1;

                if self.state.delay_ticks == 0 {
                    // Converged trivially at zero delay: no useful delay
                    // exists for this format.
                    self.state.delay_seconds = 0.0;
                    return Ok(SearchOutcome::ConvergedAtZero);
                } else if self.state.equality_streak == CONVERGENCE_STREAK {
                    // Boundary confirmed; remove the safety margin and
                    // program the final value.
                    self.state.delay_seconds -= self.state.delay_seconds * SAFETY_MARGIN;
                    if self.state.delay_seconds <= 0.0 {
                        self.state.delay_seconds = 0.0;
                    }
                    self.state.delay_ticks =
                        delay_to_ticks(self.state.delay_seconds, self.state.tick_frequency);
                    self.cam.set_inter_packet_delay(self.state.delay_ticks)?;
                    info!(
                        "converged: {} ticks ({:.3} usec) at {:.2} fps",
                        self.state.delay_ticks,
                        self.state.delay_seconds * 1e6,
                        self.state.measured_frame_rate,
                    );
                    return Ok(SearchOutcome::Converged(self.current_result()?));
                } else {
                    // Reduce slightly and re-confirm stability near the
                    // boundary.
                    self.shrink_delay(MATCH_SHRINK_DIVISOR);
                }
            } else {
                // Still far from the reference frame rate.
                self.state.equality_streak = 0;
                self.shrink_delay(MISMATCH_SHRINK_DIVISOR);
                if self.state.delay_ticks == 0 {
                    self.state.delay_seconds = 0.0;
                    return Ok(SearchOutcome::DrivenToZero);
                } else if self.state.delay_seconds <= 0.0 {
                    self.state.delay_seconds = 0.0;
                    return Ok(SearchOutcome::StoppedAtNonPositiveDelay(
                        self.current_result()?,
                    ));
                }
            }

            std::thread::sleep(self.settle);
        }

        Ok(SearchOutcome::DidNotConverge {
            iterations: self.max_iterations,
        })
    }

    /// Measure the baseline, then search.
    pub fn run(mut self) -> Result<SearchOutcome> {
        self.measure_baseline()?;
        self.search()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::{feature, CameraInfo};

    /// A camera whose stream measurements are scripted.
    struct MockCamera {
        rates: VecDeque<f64>,
        tick_frequency: u64,
        theoretical: f64,
        programmed: Vec<u64>,
        streaming: bool,
        writable: bool,
    }

    impl MockCamera {
        fn new(tick_frequency: u64, theoretical: f64, rates: &[f64]) -> Self {
            Self {
                rates: rates.iter().copied().collect(),
                tick_frequency,
                theoretical,
                programmed: Vec::new(),
                streaming: false,
                writable: true,
            }
        }

        fn pool(&self) -> FrameBufferPool {
            FrameBufferPool::new(640, 480, PixFmt::Mono8, 4)
        }
    }

    impl CameraInfo for MockCamera {
        fn name(&self) -> &str {
            "mock-0"
        }
        fn serial(&self) -> &str {
            "0000"
        }
        fn model(&self) -> &str {
            "Mock"
        }
        fn vendor(&self) -> &str {
            "MockVendor"
        }
    }

    impl DelayCamera for MockCamera {
        fn feature_int(&self, name: &str) -> Result<i64> {
            match name {
                feature::TICK_FREQUENCY => Ok(self.tick_frequency as i64),
                feature::INTER_PACKET_DELAY => {
                    Ok(self.programmed.last().copied().unwrap_or(0) as i64)
                }
                feature::PACKET_SIZE => Ok(1500),
                feature::WIDTH => Ok(640),
                feature::HEIGHT => Ok(480),
                _ => Err(Error::FeatureNotPresent(name.to_string())),
            }
        }
        fn feature_int_set(&mut self, name: &str, value: i64) -> Result<()> {
            match name {
                feature::INTER_PACKET_DELAY => {
                    self.programmed.push(value as u64);
                    Ok(())
                }
                _ => Err(Error::FeatureNotPresent(name.to_string())),
            }
        }
        fn feature_float(&self, name: &str) -> Result<f64> {
            Err(Error::FeatureNotPresent(name.to_string()))
        }
        fn feature_enum(&self, name: &str) -> Result<String> {
            match name {
                feature::PIXEL_FORMAT => Ok(format!("{}", PixFmt::Mono8)),
                _ => Err(Error::FeatureNotPresent(name.to_string())),
            }
        }
        fn feature_enum_set(&mut self, name: &str, _value: &str) -> Result<()> {
            Err(Error::FeatureNotPresent(name.to_string()))
        }
        fn feature_writable(&self, _name: &str) -> Result<bool> {
            Ok(self.writable)
        }
        fn theoretical_delay(&self) -> Result<f64> {
            Ok(self.theoretical)
        }
        fn pixel_format(&self) -> Result<PixFmt> {
            Ok(PixFmt::Mono8)
        }
        fn possible_pixel_formats(&self) -> Result<Vec<PixFmt>> {
            Ok(vec![PixFmt::Mono8])
        }
        fn set_pixel_format(&mut self, _pixel_format: PixFmt) -> Result<()> {
            Ok(())
        }
    }

    impl AcquisitionStream for MockCamera {
        fn stream_start(&mut self, buffers: &mut FrameBufferPool) -> Result<()> {
            assert!(!self.streaming, "stream started twice");
            assert!(!buffers.is_empty());
            self.streaming = true;
            Ok(())
        }
        fn stream_stop(&mut self) -> Result<f64> {
            assert!(self.streaming, "stream stopped while not started");
            self.streaming = false;
            self.rates
                .pop_front()
                .ok_or_else(|| Error::from("rate script exhausted"))
        }
    }

    fn run_search(cam: &mut MockCamera) -> SearchOutcome {
        let mut pool = cam.pool();
        let search = PacketDelaySearch::new(cam, &mut pool)
            .unwrap()
            .with_settle_interval(Duration::ZERO);
        search.run().unwrap()
    }

    #[test]
    fn rate_equality_is_absolute_and_symmetric() {
        assert!(rates_equal(30.0, 30.1));
        assert!(rates_equal(30.1, 30.0));
        assert!(rates_equal(30.0, 29.9));
        assert!(rates_equal(29.9, 30.0));
        assert!(!rates_equal(30.0, 30.11));
        assert!(!rates_equal(30.11, 30.0));
        // absolute, not relative: the same margin applies at high rates
        assert!(!rates_equal(3000.0, 3000.2));
    }

    #[test]
    fn tick_conversion_truncates() {
        assert_eq!(delay_to_ticks(0.0005, 1_000_000), 500);
        assert_eq!(delay_to_ticks(0.00040817, 1_000_000), 408);
        // 1.9999 ticks floors to 1, never rounds up
        assert_eq!(delay_to_ticks(0.0019999, 1_000), 1);
        assert_eq!(delay_to_ticks(0.0, 1_000_000), 0);
    }

    #[test]
    fn zero_tick_frequency_is_unsupported() {
        let mut cam = MockCamera::new(0, 0.0005, &[30.0]);
        let mut pool = cam.pool();
        match PacketDelaySearch::new(&mut cam, &mut pool) {
            Err(Error::UnsupportedDevice) => {}
            other => panic!("expected UnsupportedDevice, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn baseline_programs_zero_delay_first() {
        let mut cam = MockCamera::new(1_000_000, 0.0005, &[30.0]);
        let mut pool = cam.pool();
        let mut search = PacketDelaySearch::new(&mut cam, &mut pool)
            .unwrap()
            .with_settle_interval(Duration::ZERO);
        search.measure_baseline().unwrap();
        assert_eq!(search.base_frame_rate(), 30.0);
        assert_eq!(cam.programmed, vec![0]);
    }

    #[test]
    fn three_matches_converge_with_safety_margin() {
        // Worked scenario: base 30.0 at zero delay, then three matching
        // measurements from a 500-tick start.
        let mut cam = MockCamera::new(1_000_000, 0.0005, &[30.0, 30.05, 29.96, 30.0]);
        let outcome = run_search(&mut cam);
        let result = match outcome {
            SearchOutcome::Converged(result) => result,
            other => panic!("expected convergence, got {other:?}"),
        };
        // 0.0005 * 0.98 * 0.98 * 0.85 = 0.00040817 s -> 408 ticks
        assert_eq!(result.delay_ticks, 408);
        approx::assert_relative_eq!(result.delay_seconds, 0.00040817, epsilon = 1e-9);
        assert_eq!(result.base_frame_rate, 30.0);
        assert_eq!(result.measured_frame_rate, 30.0);
        // programmed sequence: baseline zero, 500, 490, 480, final 408
        assert_eq!(cam.programmed, vec![0, 500, 490, 480, 408]);
        assert!(!SearchOutcome::Converged(result).is_failure());
    }

    #[test]
    fn mismatch_resets_streak() {
        // match, match, mismatch, match, match, match: must converge on
        // the sixth measurement, not the third.
        let rates = [30.0, 30.05, 29.96, 25.0, 30.0, 30.0, 30.0];
        let mut cam = MockCamera::new(1_000_000, 0.0005, &rates);
        let outcome = run_search(&mut cam);
        assert!(matches!(outcome, SearchOutcome::Converged(_)));
        // every scripted rate was consumed: six search iterations ran
        assert!(cam.rates.is_empty());
    }

    #[test]
    fn match_at_zero_ticks_is_failure() {
        // Theoretical delay of zero: the first iteration matches at zero
        // ticks, which means no useful delay exists.
        let mut cam = MockCamera::new(1_000_000, 0.0, &[30.0, 30.0]);
        let outcome = run_search(&mut cam);
        assert_eq!(outcome, SearchOutcome::ConvergedAtZero);
        assert!(outcome.is_failure());
        assert!(outcome.result().is_none());
    }

    #[test]
    fn mismatch_shrinkage_to_zero_ticks_is_failure() {
        // The measured rate never approaches the baseline, so the delay is
        // shrunk by 10% per iteration until the tick conversion hits zero.
        let mut rates = vec![30.0];
        rates.extend(std::iter::repeat(25.0).take(80));
        let mut cam = MockCamera::new(1_000_000, 0.0005, &rates);
        let outcome = run_search(&mut cam);
        assert_eq!(outcome, SearchOutcome::DrivenToZero);
        assert!(outcome.is_failure());
        // the zero value is never programmed on the failure path
        assert!(cam.programmed.iter().skip(1).all(|&t| t > 0));
    }

    #[test]
    fn iteration_cap_reports_did_not_converge() {
        // A rate pattern which never produces three consecutive matches
        // and never drives the delay to zero.
        let mut rates = vec![30.0];
        for _ in 0..4 {
            rates.extend_from_slice(&[30.0, 30.0, 25.0]);
        }
        let mut cam = MockCamera::new(1_000_000, 0.0005, &rates);
        let mut pool = cam.pool();
        let mut search = PacketDelaySearch::new(&mut cam, &mut pool)
            .unwrap()
            .with_settle_interval(Duration::ZERO)
            .with_iteration_cap(9);
        search.measure_baseline().unwrap();
        let outcome = search.search().unwrap();
        assert_eq!(outcome, SearchOutcome::DidNotConverge { iterations: 9 });
        assert!(outcome.is_failure());
    }

    #[test]
    fn wait_feature_writable_times_out() {
        let mut cam = MockCamera::new(1_000_000, 0.0005, &[]);
        cam.writable = false;
        match crate::wait_feature_writable(&cam, feature::PIXEL_FORMAT, Duration::ZERO) {
            Err(Error::FeatureTimeout(name)) => assert_eq!(name, feature::PIXEL_FORMAT),
            other => panic!("expected FeatureTimeout, got {:?}", other),
        }
        cam.writable = true;
        crate::wait_feature_writable(&cam, feature::PIXEL_FORMAT, Duration::ZERO).unwrap();
    }
}
