#![forbid(unsafe_code)]

//! Unified event bus for the rung ABR engine.

mod abr;
mod bus;
mod event;
mod telemetry;

pub use abr::{AbrEvent, SwitchReason};
pub use bus::EventBus;
pub use event::Event;
pub use telemetry::TelemetryEvent;
