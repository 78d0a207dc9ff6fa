//! # Session Client Library
//!
//! Client-side half of match synchronization. The server is authoritative
//! for combat and sends position snapshots at about 20 Hz; this library
//! turns that irregular stream into smooth per-frame positions for every
//! remote player.
//!
//! ## Architecture Overview
//!
//! ### Single Clock Anchor
//! The first snapshot fixes the offset between the local monotonic clock and
//! the server's. There is no continuous re-synchronization; drift and
//! jitter are absorbed by the render clock correctors instead.
//!
//! ### Adaptive Jitter Buffer
//! Snapshots are buffered in arrival order. The interpolation delay follows
//! an exponential moving average of snapshot spacing and its deviation,
//! kept inside a fixed band and smoothed so it never jumps.
//!
//! ### Corrected Render Clock
//! A local render timeline advances by real frame time and is corrected
//! every frame: clamped to the buffered range, phase-adjusted toward the
//! nominal spacing, pulled forward when it falls behind, eased back when it
//! runs ahead, and reset outright after a severe stall. The correction is a
//! pure function of the clock, the buffer bounds and the frame time, so it
//! is unit-tested without a frame loop.
//!
//! ## Module Organization
//!
//! ### Receiver Module (`receiver`)
//! - Clock calibration and snapshot buffering
//! - Delay estimation and render clock correction
//! - Bracketing and linear interpolation
//!
//! ### Diagnostics Module (`diagnostics`)
//! Rolling spacing statistics, reported periodically at debug level.
//!
//! ### Network Module (`network`)
//! Headless UDP client: connects, joins a match, acknowledges readiness,
//! streams scripted movement and drives the receiver at frame rate.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::receiver::{ReceiverConfig, SnapshotReceiver};
//! use shared::SessionClock;
//!
//! let clock = SessionClock::start();
//! let mut receiver = SnapshotReceiver::new(ReceiverConfig::default());
//!
//! // On every snapshot packet:
//! // receiver.ingest(snapshot, clock.now_ms());
//!
//! // Once per frame:
//! if let Some(frame) = receiver.render(clock.now_ms()) {
//!     for (name, player) in &frame.players {
//!         println!("{} at ({}, {})", name, player.x, player.y);
//!     }
//! }
//! ```

pub mod diagnostics;
pub mod network;
pub mod receiver;
