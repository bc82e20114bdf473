// Licensed under the MIT license.

//! `espat`: a host-side AT-command protocol engine for Espressif Wi-Fi
//! coprocessors. Drives the device over a serial line,
//! translating typed requests into the device's line-oriented AT dialect and
//! raising parsed responses back to the host as [`message::Event`]s.
//!
//! The top-level entry point is [`engine::Engine`]; [`config::Config`]
//! configures it and [`transport::Transport`] is the serial-line contract the
//! host integrator supplies.

pub mod config;
pub mod conn;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod format;
pub mod message;
pub mod os;
pub mod parser;
pub mod pbuf;
pub mod ringbuf;
pub mod state;
pub mod transport;

pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
