//! Logic-frame pacing and the per-tick clock for Arclink.
//!
//! The logic thread runs a plain loop: wait for the next frame, drain the
//! hand-off queues, run session timers, repeat. [`FramePacer`] owns the
//! "wait for the next frame" part with budget monitoring and overrun
//! handling; [`TickClock`] is the time value every deadline check in that
//! frame compares against.
//!
//! # Why a cached clock
//!
//! Session code never calls `Instant::now()`. Each tick samples the clock
//! once and passes the [`TickClock`] down, so every timer in a frame sees
//! the same "now" and tests can drive time by hand with [`TickClock::at`]
//! and [`TickClock::advance`].
//!
//! # Integration
//!
//! ```ignore
//! let mut pacer = FramePacer::new(TickConfig::with_rate(30));
//! loop {
//!     let info = pacer.wait_for_tick();
//!     node.tick_at(info.clock);
//!     pacer.record_tick_end();
//! }
//! ```

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tracing::{debug, trace, warn};

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// A point in time sampled once per tick.
///
/// Carries both a monotonic [`Instant`] (for deadlines) and wall-clock
/// seconds since the Unix epoch (for token timestamps, which must make
/// sense across processes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickClock {
    instant: Instant,
    since_epoch: Duration,
}

impl TickClock {
    /// Samples the system clocks.
    pub fn now() -> Self {
        Self {
            instant: Instant::now(),
            // A clock set before 1970 reads as the epoch itself.
            since_epoch: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default(),
        }
    }

    /// A clock at an explicit point, for deterministic tests.
    pub fn at(instant: Instant, unix_secs: u64) -> Self {
        Self {
            instant,
            since_epoch: Duration::from_secs(unix_secs),
        }
    }

    /// The same clock moved forward by `by`.
    pub fn advance(&self, by: Duration) -> Self {
        Self {
            instant: self.instant + by,
            since_epoch: self.since_epoch + by,
        }
    }

    /// Monotonic time, for deadlines.
    pub fn instant(&self) -> Instant {
        self.instant
    }

    /// Whole seconds since the Unix epoch, for token timestamps.
    pub fn unix_secs(&self) -> u64 {
        self.since_epoch.as_secs()
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What to do when a frame starts late.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TickPolicy {
    /// Forget the missed frames and schedule from now.
    #[default]
    Skip,
    /// Run up to `max_catchup` frames back to back to recover the cadence.
    CatchUp {
        /// Beyond this many frames behind, fall back to `Skip`.
        max_catchup: u32,
    },
}

/// Configuration for the frame pacer.
#[derive(Debug, Clone)]
pub struct TickConfig {
    /// Logic frames per second.
    pub tick_rate_hz: u32,
    /// Overrun handling policy.
    pub policy: TickPolicy,
    /// Fraction of the frame budget (0.0–1.0) above which a warning is logged.
    pub budget_warn_threshold: f64,
    /// Fraction of the frame budget above which the warning is critical.
    pub budget_critical_threshold: f64,
    /// Track average and maximum frame time.
    pub metrics_enabled: bool,
    /// Random delay (0–max µs) before the first frame, so processes started
    /// together don't tick in lockstep.
    pub initial_jitter_us: u64,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 30,
            policy: TickPolicy::default(),
            budget_warn_threshold: 0.80,
            budget_critical_threshold: 1.0,
            metrics_enabled: true,
            initial_jitter_us: 2_000,
        }
    }
}

impl TickConfig {
    /// Highest supported frame rate.
    pub const MAX_TICK_RATE_HZ: u32 = 1_000;

    /// A config for a specific frame rate with the other defaults.
    pub fn with_rate(tick_rate_hz: u32) -> Self {
        Self {
            tick_rate_hz,
            ..Default::default()
        }
    }

    /// Clamps out-of-range values. Called by [`FramePacer::new`].
    ///
    /// - `tick_rate_hz` is forced into `1..=MAX_TICK_RATE_HZ`.
    /// - Thresholds are clamped to `0.0..=1.0`, warn ≤ critical.
    pub fn validated(mut self) -> Self {
        let clamped = self.tick_rate_hz.clamp(1, Self::MAX_TICK_RATE_HZ);
        if clamped != self.tick_rate_hz {
            warn!(
                rate = self.tick_rate_hz,
                clamped, "tick_rate_hz out of range, clamping"
            );
            self.tick_rate_hz = clamped;
        }
        self.budget_warn_threshold = self.budget_warn_threshold.clamp(0.0, 1.0);
        self.budget_critical_threshold = self.budget_critical_threshold.clamp(0.0, 1.0);
        if self.budget_warn_threshold > self.budget_critical_threshold {
            self.budget_warn_threshold = self.budget_critical_threshold;
        }
        self
    }

    /// Duration of one frame.
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate_hz.max(1) as f64)
    }
}

// ---------------------------------------------------------------------------
// Tick info and metrics
// ---------------------------------------------------------------------------

/// Returned by [`FramePacer::wait_for_tick`].
#[derive(Debug, Clone)]
pub struct TickInfo {
    /// Frame number, starting at 1.
    pub tick: u64,
    /// Nominal frame length.
    pub dt: Duration,
    /// The frame started more than 10% of a frame late.
    pub overrun: bool,
    /// Frames dropped to recover the cadence.
    pub ticks_skipped: u64,
    /// The clock for this frame.
    pub clock: TickClock,
}

/// Runtime metrics. Timing values cover the logic work reported through
/// [`FramePacer::record_tick_end`], not the sleep.
#[derive(Debug, Clone, Default)]
pub struct TickMetrics {
    pub total_ticks: u64,
    pub total_overruns: u64,
    pub total_skipped: u64,
    /// Exponential moving average, α = 0.1.
    pub avg_tick_time: Duration,
    pub max_tick_time: Duration,
    /// Last frame's work time over the frame budget. Above 1.0 is an overrun.
    pub budget_utilization: f64,
}

// ---------------------------------------------------------------------------
// Pacer
// ---------------------------------------------------------------------------

/// Blocking fixed-rate frame pacer for the logic thread.
pub struct FramePacer {
    config: TickConfig,
    tick_duration: Duration,
    tick_count: u64,
    next_tick: Instant,
    tick_start: Option<Instant>,
    metrics: TickMetrics,
}

impl FramePacer {
    /// Creates a pacer. The first frame is due one frame from now plus
    /// the configured jitter.
    pub fn new(config: TickConfig) -> Self {
        let config = config.validated();
        let tick_duration = config.tick_duration();

        let jitter = if config.initial_jitter_us > 0 {
            Duration::from_micros(rand::rng().random_range(0..config.initial_jitter_us))
        } else {
            Duration::ZERO
        };

        debug!(
            rate_hz = config.tick_rate_hz,
            budget_ms = tick_duration.as_secs_f64() * 1000.0,
            policy = ?config.policy,
            "frame pacer created"
        );

        Self {
            next_tick: Instant::now() + tick_duration + jitter,
            config,
            tick_duration,
            tick_count: 0,
            tick_start: None,
            metrics: TickMetrics::default(),
        }
    }

    /// A pacer for a specific frame rate with default settings.
    pub fn with_rate(tick_rate_hz: u32) -> Self {
        Self::new(TickConfig::with_rate(tick_rate_hz))
    }

    /// Sleeps the calling thread until the next frame is due.
    pub fn wait_for_tick(&mut self) -> TickInfo {
        let due = self.next_tick;
        let now = Instant::now();
        if due > now {
            std::thread::sleep(due - now);
        }

        let clock = TickClock::now();
        let now = clock.instant();
        self.tick_count += 1;
        self.tick_start = Some(now);

        let dur = self.tick_duration;
        let late_by = now.saturating_duration_since(due);
        let overrun = late_by > dur / 10;
        let behind = (late_by.as_nanos() / dur.as_nanos().max(1)) as u64;
        let mut ticks_skipped = 0;

        self.next_tick = match self.config.policy {
            TickPolicy::Skip => {
                if overrun && behind > 0 {
                    ticks_skipped = behind;
                    warn!(
                        tick = self.tick_count,
                        skipped = behind,
                        late_ms = late_by.as_secs_f64() * 1000.0,
                        "frame overrun, skipping ahead"
                    );
                }
                now + dur
            }
            TickPolicy::CatchUp { max_catchup } => {
                let max_catchup = u64::from(max_catchup);
                if overrun && behind > max_catchup {
                    ticks_skipped = behind - max_catchup;
                    warn!(
                        tick = self.tick_count,
                        behind,
                        skipped = ticks_skipped,
                        "frame overrun beyond catch-up cap, skipping ahead"
                    );
                    now + dur
                } else {
                    due + dur
                }
            }
        };

        if overrun {
            self.metrics.total_overruns += 1;
        }
        self.metrics.total_skipped += ticks_skipped;
        self.metrics.total_ticks += 1;

        trace!(tick = self.tick_count, overrun, "frame started");

        TickInfo {
            tick: self.tick_count,
            dt: dur,
            overrun,
            ticks_skipped,
            clock,
        }
    }

    /// Records that the current frame's logic has finished.
    ///
    /// Without this call no budget warnings are produced.
    pub fn record_tick_end(&mut self) {
        let Some(start) = self.tick_start.take() else {
            return;
        };
        let elapsed = start.elapsed();
        let budget = self.tick_duration;
        let utilization = elapsed.as_secs_f64() / budget.as_secs_f64();
        self.metrics.budget_utilization = utilization;

        if utilization >= self.config.budget_critical_threshold {
            warn!(
                tick = self.tick_count,
                elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                budget_ms = budget.as_secs_f64() * 1000.0,
                "CRITICAL: frame exceeded budget"
            );
        } else if utilization >= self.config.budget_warn_threshold {
            warn!(
                tick = self.tick_count,
                elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                budget_ms = budget.as_secs_f64() * 1000.0,
                "frame approaching budget limit"
            );
        }

        if self.config.metrics_enabled {
            if elapsed > self.metrics.max_tick_time {
                self.metrics.max_tick_time = elapsed;
            }
            let alpha = 0.1;
            let prev = self.metrics.avg_tick_time.as_secs_f64();
            self.metrics.avg_tick_time =
                Duration::from_secs_f64(prev * (1.0 - alpha) + elapsed.as_secs_f64() * alpha);
        }
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn metrics(&self) -> &TickMetrics {
        &self.metrics
    }

    pub fn tick_rate_hz(&self) -> u32 {
        self.config.tick_rate_hz
    }

    pub fn tick_duration(&self) -> Duration {
        self.tick_duration
    }
}
