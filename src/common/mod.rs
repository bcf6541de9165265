pub mod error;

pub use error::{Result, TunnelError, TunnelErrorKind};
