// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Overwatch - Real-time Motion Monitoring Kernel
//!
//! A supervised detection worker watches a camera, decides when sustained
//! motion is worth an alarm and hands the decision to the coordinator, which
//! runs the alarm state machine, the command pipeline and the notifier
//! fan-out.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────── worker process ─────────────────────────┐
//! │  CaptureSource → imaging → MotionDetector → heartbeat / frame   │
//! └───────────────────────────────┬─────────────────────────────────┘
//!                                 │ stdin / stdout (bincode frames)
//! ┌───────────────────────────────┴─────────── coordinator ─────────┐
//! │  Supervisor (watchdog)                                          │
//! │       ↓                                                         │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │                        Event Bus                         │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! │       ↓              ↓               ↓               ↓          │
//! │  ┌─────────┐  ┌────────────┐  ┌─────────────┐  ┌──────────┐     │
//! │  │  Alarm  │  │  Command   │  │ Alert       │  │ Metrics  │     │
//! │  │  State  │  │  Pipeline  │  │ Fan-out     │  │          │     │
//! │  └─────────┘  └────────────┘  └─────────────┘  └──────────┘     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod alerts;
pub mod capture;
pub mod config;
pub mod core;
pub mod detection;
pub mod metrics;
pub mod system;

// Re-exports for convenience
pub use config::Config;
pub use core::{Engine, EventBus};
pub use system::{State, SystemStatus};

/// Overwatch version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Overwatch name
pub const NAME: &str = "Overwatch";
