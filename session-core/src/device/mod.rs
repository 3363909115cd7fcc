//! Local device identity and bundle publication
//!
//! - **store**: typed access to the device items in the key store
//! - **bundle**: public bundle generation and the publisher collaborator
//! - **bootstrap**: first-run setup and exactly-once publication

pub mod bootstrap;
pub mod bundle;
pub mod store;

pub use bootstrap::{random_device_id, Bootstrap};
pub use bundle::{Bundle, BundleManager, BundlePublisher};
pub use store::{DeviceIdentity, DeviceStore, MAX_DEVICE_ID};
