#![allow(clippy::new_without_default, clippy::too_many_arguments)]

pub mod app;
pub mod common;
pub mod config;
pub mod logging;
pub mod tun;

pub use app::{ServiceControl, TunnelService};
pub use common::{Result, TunnelError};
