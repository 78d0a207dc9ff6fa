//! Snapshot buffering, clock recovery and interpolation for remote players.
//!
//! Snapshots are stamped with the server's monotonic clock. The receiver
//! keeps a render clock in that same domain, advances it by local frame time
//! and renders `render_clock - delay` by interpolating between the two
//! buffered snapshots that bracket it. The delay adapts to the measured
//! snapshot spacing and jitter. The render clock is corrected every frame
//! by [`correct_render_clock`], a pure function so it can be tested without
//! a frame loop.

use crate::diagnostics::SpacingStats;
use log::{debug, info, warn};
use shared::{MonoOffset, PlayerFrame, Snapshot};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub max_buffer: usize,
    pub min_delay_ms: f64,
    pub max_delay_ms: f64,
    pub initial_delay_ms: f64,
    pub ema_alpha: f64,
    /// Fraction of the gap to the target delay closed per snapshot.
    pub delay_smoothing: f64,
    pub nominal_spacing_ms: f64,
    /// Longest frame the render clock will advance by at once.
    pub max_frame_ms: f64,
    pub edge_margin_ms: f64,
    pub phase_gain: f64,
    pub catch_up_threshold_ms: f64,
    pub catch_up_gain: f64,
    pub catch_up_cap_ms: f64,
    pub slow_down_threshold_ms: f64,
    pub slow_down_gain: f64,
    pub slow_down_cap_ms: f64,
    /// Furthest the render target may trail the newest snapshot beyond the delay.
    pub backlog_limit_ms: f64,
    pub severe_lag_ms: f64,
    pub severe_lag_keep: usize,
    pub stale_margin_ms: f64,
    /// Spacing samples at or above this are treated as gaps, not jitter.
    pub max_spacing_sample_ms: f64,
    pub report_interval_ms: f64,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            max_buffer: 120,
            min_delay_ms: 120.0,
            max_delay_ms: 300.0,
            initial_delay_ms: 150.0,
            ema_alpha: 0.12,
            delay_smoothing: 0.1,
            nominal_spacing_ms: shared::SNAPSHOT_INTERVAL_MS,
            max_frame_ms: 250.0,
            edge_margin_ms: 5.0,
            phase_gain: 0.02,
            catch_up_threshold_ms: 120.0,
            catch_up_gain: 0.12,
            catch_up_cap_ms: 10.0,
            slow_down_threshold_ms: 60.0,
            slow_down_gain: 0.08,
            slow_down_cap_ms: 8.0,
            backlog_limit_ms: 500.0,
            severe_lag_ms: 1000.0,
            severe_lag_keep: 10,
            stale_margin_ms: 50.0,
            max_spacing_sample_ms: 500.0,
            report_interval_ms: 5000.0,
        }
    }
}

/// Smoothed spacing and jitter of arriving snapshots, and the interpolation
/// delay derived from them.
#[derive(Debug, Clone)]
pub struct DelayEstimator {
    spacing_ema: Option<f64>,
    jitter_ema: Option<f64>,
    delay_ms: f64,
}

impl DelayEstimator {
    pub fn new(config: &ReceiverConfig) -> Self {
        Self {
            spacing_ema: None,
            jitter_ema: None,
            delay_ms: config.initial_delay_ms,
        }
    }

    pub fn spacing_ema(&self) -> Option<f64> {
        self.spacing_ema
    }

    pub fn jitter_ema(&self) -> Option<f64> {
        self.jitter_ema
    }

    pub fn delay_ms(&self) -> f64 {
        self.delay_ms
    }

    /// Folds one inter-snapshot spacing into the estimates. Samples outside
    /// `[0, max_spacing_sample_ms)` are ignored; returns whether it was used.
    pub fn observe(&mut self, spacing: f64, config: &ReceiverConfig) -> bool {
        if !(spacing >= 0.0 && spacing < config.max_spacing_sample_ms) {
            return false;
        }
        let alpha = config.ema_alpha;

        let spacing_ema = match self.spacing_ema {
            None => spacing,
            Some(ema) => ema + (spacing - ema) * alpha,
        };
        let deviation = (spacing - spacing_ema).abs();
        let jitter_ema = match self.jitter_ema {
            None => deviation,
            Some(ema) => ema + (deviation - ema) * alpha,
        };
        self.spacing_ema = Some(spacing_ema);
        self.jitter_ema = Some(jitter_ema);

        let target = target_delay(spacing_ema, jitter_ema, config);
        self.delay_ms += (target - self.delay_ms) * config.delay_smoothing;
        true
    }
}

/// Instantaneous delay target: three spacings plus two jitters, banded.
pub fn target_delay(spacing_ema: f64, jitter_ema: f64, config: &ReceiverConfig) -> f64 {
    (spacing_ema * 3.0 + jitter_ema * 2.0).clamp(config.min_delay_ms, config.max_delay_ms)
}

/// Inputs of one render clock correction.
#[derive(Debug, Clone, Copy)]
pub struct ClockInput {
    pub render_clock: f64,
    /// Local time elapsed since the previous frame.
    pub frame_dt: f64,
    pub delay_ms: f64,
    pub spacing_ema: Option<f64>,
    /// Server times of the oldest and newest buffered snapshots.
    pub oldest: f64,
    pub newest: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockEvent {
    None,
    /// The target trailed the newest snapshot by more than the backlog limit.
    BacklogClamped,
    /// The target trailed by more than the severe lag threshold and was reset.
    SevereLagReset,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockStep {
    pub render_clock: f64,
    /// Server time to render this frame.
    pub target: f64,
    pub event: ClockEvent,
}

/// Advances the render clock by one frame and applies the correctors in
/// order: buffer edge clamp, phase correction toward the nominal spacing,
/// lag recovery, then catch-up or slow-down. Returns the corrected clock
/// and the render target for this frame.
pub fn correct_render_clock(input: ClockInput, config: &ReceiverConfig) -> ClockStep {
    let delay = input.delay_ms;
    let mut render_clock = input.render_clock + input.frame_dt.clamp(0.0, config.max_frame_ms);
    let mut target = render_clock - delay;

    // Never ahead of the newest snapshot, never behind the oldest.
    let ceiling = input.newest - config.edge_margin_ms;
    if target > ceiling {
        target = ceiling;
        render_clock = target + delay;
    }
    let floor = input.oldest + config.edge_margin_ms;
    if target < floor {
        target = floor;
        render_clock = target + delay;
    }

    // Takes effect from the next frame.
    if let Some(spacing) = input.spacing_ema {
        render_clock += (spacing - config.nominal_spacing_ms) * config.phase_gain;
    }

    let desired = input.newest - delay;
    let mut event = ClockEvent::None;
    let lag = desired - target;
    if lag > config.severe_lag_ms {
        target = desired;
        render_clock = target + delay;
        event = ClockEvent::SevereLagReset;
    } else if lag > config.backlog_limit_ms {
        target = desired - config.backlog_limit_ms;
        render_clock = target + delay;
        event = ClockEvent::BacklogClamped;
    }

    let lag = desired - target;
    if lag > config.catch_up_threshold_ms {
        target += (lag * config.catch_up_gain).min(config.catch_up_cap_ms);
        render_clock = target + delay;
    } else if lag < -config.slow_down_threshold_ms {
        target -= (-lag * config.slow_down_gain).min(config.slow_down_cap_ms);
        render_clock = target + delay;
    }

    ClockStep {
        render_clock,
        target,
        event,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferedSnapshot {
    pub tick_id: u64,
    pub t_mono: f64,
    pub players: HashMap<String, PlayerFrame>,
}

/// Interpolated state of one remote player for the current frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPlayer {
    pub x: f32,
    pub y: f32,
    pub flip: bool,
    pub animation: Option<String>,
    pub health: u32,
    pub is_alive: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderFrame {
    pub target: f64,
    pub players: HashMap<String, RenderedPlayer>,
}

/// Blends two snapshots at `alpha`. Positions are interpolated; discrete
/// state comes from the newer entry when the player is in both.
pub fn blend(a: &BufferedSnapshot, b: &BufferedSnapshot, alpha: f64) -> HashMap<String, RenderedPlayer> {
    let alpha = alpha.clamp(0.0, 1.0) as f32;
    let mut players = HashMap::with_capacity(b.players.len());

    for name in a.players.keys().chain(b.players.keys()) {
        if players.contains_key(name) {
            continue;
        }
        let rendered = match (a.players.get(name), b.players.get(name)) {
            (Some(from), Some(to)) => RenderedPlayer {
                x: from.x + alpha * (to.x - from.x),
                y: from.y + alpha * (to.y - from.y),
                ..rendered_from(to)
            },
            (None, Some(only)) | (Some(only), None) => rendered_from(only),
            (None, None) => continue,
        };
        players.insert(name.clone(), rendered);
    }

    players
}

fn rendered_from(frame: &PlayerFrame) -> RenderedPlayer {
    RenderedPlayer {
        x: frame.x,
        y: frame.y,
        flip: frame.flip,
        animation: frame.animation.clone(),
        health: frame.health,
        is_alive: frame.is_alive,
    }
}

/// Renders `target` from an ordered buffer. Uses the bracketing pair when
/// one exists, otherwise the newest pair or the single buffered snapshot.
pub fn interpolate_at(
    buffer: &VecDeque<BufferedSnapshot>,
    target: f64,
) -> Option<HashMap<String, RenderedPlayer>> {
    let bracket = buffer
        .iter()
        .zip(buffer.iter().skip(1))
        .find(|(a, b)| a.t_mono <= target && target <= b.t_mono);

    if let Some((a, b)) = bracket {
        let span = b.t_mono - a.t_mono;
        let alpha = if span > 0.0 {
            (target - a.t_mono) / span
        } else {
            1.0
        };
        return Some(blend(a, b, alpha));
    }

    match buffer.len() {
        0 => None,
        1 => buffer.back().map(|only| blend(only, only, 1.0)),
        n => Some(blend(&buffer[n - 2], &buffer[n - 1], 1.0)),
    }
}

/// Client-side jitter buffer and render clock for one match.
pub struct SnapshotReceiver {
    config: ReceiverConfig,
    buffer: VecDeque<BufferedSnapshot>,
    offset: MonoOffset,
    estimator: DelayEstimator,
    render_clock: Option<f64>,
    last_frame_at: Option<f64>,
    last_report_at: f64,
    spacing: SpacingStats,
    dropped: u64,
    resets: u64,
}

impl SnapshotReceiver {
    pub fn new(config: ReceiverConfig) -> Self {
        let estimator = DelayEstimator::new(&config);
        Self {
            config,
            buffer: VecDeque::new(),
            offset: MonoOffset::new(),
            estimator,
            render_clock: None,
            last_frame_at: None,
            last_report_at: 0.0,
            spacing: SpacingStats::new(),
            dropped: 0,
            resets: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn buffer(&self) -> &VecDeque<BufferedSnapshot> {
        &self.buffer
    }

    pub fn delay_ms(&self) -> f64 {
        self.estimator.delay_ms()
    }

    pub fn estimator(&self) -> &DelayEstimator {
        &self.estimator
    }

    pub fn render_clock(&self) -> Option<f64> {
        self.render_clock
    }

    pub fn offset(&self) -> &MonoOffset {
        &self.offset
    }

    /// Local time since the newest buffered snapshot was taken.
    pub fn newest_age_ms(&self, local_now: f64) -> Option<f64> {
        let newest = self.buffer.back()?;
        Some(local_now - self.offset.to_local(newest.t_mono)?)
    }

    /// How far the render clock trails the calibrated server clock.
    pub fn render_lag_ms(&self, local_now: f64) -> Option<f64> {
        Some(self.offset.to_server(local_now)? - self.render_clock?)
    }

    pub fn spacing_stats(&mut self) -> &mut SpacingStats {
        &mut self.spacing
    }

    /// Snapshots discarded for arriving out of order.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn severe_resets(&self) -> u64 {
        self.resets
    }

    /// Buffers a snapshot received at local monotonic time `local_now`.
    /// Returns false when it was discarded as stale or duplicate.
    pub fn ingest(&mut self, snapshot: Snapshot, local_now: f64) -> bool {
        if self.offset.calibrate(snapshot.t_mono, local_now) {
            info!(
                "Monotonic offset calibrated: {:.2}ms",
                self.offset.offset().unwrap_or_default()
            );
        }

        if let Some(newest) = self.buffer.back() {
            if snapshot.tick_id <= newest.tick_id {
                self.dropped += 1;
                debug!(
                    "Dropping snapshot {} (newest is {})",
                    snapshot.tick_id, newest.tick_id
                );
                return false;
            }
            let spacing = snapshot.t_mono - newest.t_mono;
            if self.estimator.observe(spacing, &self.config) {
                self.spacing.record(spacing);
            }
        }

        if self.render_clock.is_none() {
            self.render_clock = Some(snapshot.t_mono);
            self.last_frame_at = Some(local_now);
        }

        self.buffer.push_back(BufferedSnapshot {
            tick_id: snapshot.tick_id,
            t_mono: snapshot.t_mono,
            players: snapshot.players,
        });
        while self.buffer.len() > self.config.max_buffer {
            self.buffer.pop_front();
        }

        true
    }

    /// Advances the render clock to local time `local_now` and returns the
    /// interpolated state of every player, or None before any snapshot.
    pub fn render(&mut self, local_now: f64) -> Option<RenderFrame> {
        let newest = self.buffer.back()?.t_mono;
        let oldest = self.buffer.front()?.t_mono;

        let render_clock = self.render_clock.unwrap_or(newest);
        let frame_dt = local_now - self.last_frame_at.unwrap_or(local_now);
        self.last_frame_at = Some(local_now);

        let step = correct_render_clock(
            ClockInput {
                render_clock,
                frame_dt,
                delay_ms: self.estimator.delay_ms(),
                spacing_ema: self.estimator.spacing_ema(),
                oldest,
                newest,
            },
            &self.config,
        );
        self.render_clock = Some(step.render_clock);

        match step.event {
            ClockEvent::SevereLagReset => {
                self.resets += 1;
                warn!(
                    "Severe render lag, resetting clock (buffer={})",
                    self.buffer.len()
                );
                let excess = self.buffer.len().saturating_sub(self.config.severe_lag_keep);
                self.buffer.drain(..excess);
            }
            ClockEvent::BacklogClamped => {
                warn!(
                    "Clamping render backlog (buffer={})",
                    self.buffer.len()
                );
            }
            ClockEvent::None => {}
        }
        self.trim_stale(step.target);

        if local_now - self.last_report_at >= self.config.report_interval_ms {
            self.last_report_at = local_now;
            if let (Some(spacing), Some(jitter)) =
                (self.estimator.spacing_ema(), self.estimator.jitter_ema())
            {
                debug!(
                    "[adaptive] delay={:.1}ms spacingEma={:.2} jitterEma={:.2} buffer={} newestAge={:.1}ms renderLag={:.1}ms",
                    self.estimator.delay_ms(),
                    spacing,
                    jitter,
                    self.buffer.len(),
                    self.newest_age_ms(local_now).unwrap_or_default(),
                    self.render_lag_ms(local_now).unwrap_or_default()
                );
            }
        }

        let players = interpolate_at(&self.buffer, step.target)?;
        Some(RenderFrame {
            target: step.target,
            players,
        })
    }

    /// Drops snapshots the render target has moved well past, always
    /// keeping a pair to interpolate between.
    fn trim_stale(&mut self, target: f64) {
        let horizon = target - self.config.stale_margin_ms;
        while self.buffer.len() > 2 && self.buffer[1].t_mono <= horizon {
            self.buffer.pop_front();
        }
    }
}
