//! Adaptive per-chip clock control and work pipeline for Bitfury ASIC
//! arrays.
//!
//! The [`driver::BitfuryDriver`] polls a [`bus::ChipBus`], keeps three jobs
//! in flight per chip, forwards de-duplicated results to a
//! [`work::WorkQueue`] and tunes each chip's oscillator setting from its
//! measured throughput.

pub mod autoclock;
pub mod bus;
pub mod chip;
pub mod config;
pub mod daemon;
pub mod driver;
pub mod error;
pub mod persist;
pub mod prefetch;
pub mod ring;
pub mod scan;
pub mod sim;
pub mod stats;
pub mod tracing;
pub mod types;
pub mod work;
pub mod worker;
