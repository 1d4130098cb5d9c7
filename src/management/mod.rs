//! # Device Management
//!
//! ```text
//! management/
//! ├── client.rs       - ManagedClient session and manage/unmanage handshake
//! ├── action.rs       - Reboot and factory reset requests
//! ├── attribute.rs    - Location and metadata updates pushed by the platform
//! ├── firmware.rs     - Firmware verify, download and update lifecycle
//! ├── device_data.rs  - Device info, location, logs and firmware documents
//! └── response.rs     - Response codes and reply documents
//! ```

pub mod action;
pub mod attribute;
pub mod client;
pub mod device_data;
pub mod firmware;
pub mod response;

pub use action::{DeviceActionHandler, DeviceActions};
pub use attribute::{AttributeActions, AttributeHandler};
pub use client::{ManagedClient, ManagementHooks};
pub use device_data::{
    DeviceInfo, DeviceLocation, DeviceLog, FirmwareInfo, FirmwareState, LogSeverity, Supports,
    UpdateStatus,
};
pub use firmware::{FirmwareActions, FirmwareHandler, ProgressKind};
pub use response::ActionResponse;
