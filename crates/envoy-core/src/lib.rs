pub mod auth;
pub mod config;
pub mod descriptors;
pub mod endpoint;
pub mod error;
pub mod gateway;
pub mod http;
pub mod info;
pub mod reader;
pub mod snapshot;

pub use auth::{GatewayAuth, LegacyAuth, TokenAuth};
pub use config::ReaderConfig;
pub use error::GatewayError;
pub use gateway::{Gateway, GatewayModel, AVAILABLE_PROPERTIES};
pub use http::{HttpTransport, ReqwestTransport};
pub use info::{FirmwareVersion, GatewayInfo};
pub use reader::GatewayReader;
pub use snapshot::{Snapshot, SnapshotDevice};

#[cfg(test)]
mod reader_tests;
