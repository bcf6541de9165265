pub mod hev;
pub mod interface;
pub mod routes;

pub use hev::{emit, ConfigBlob, EmitOptions};
pub use interface::{build, AddressPair, AppFilter, AppIdentity, InterfaceConfigurator, InterfaceSpec};
