// src/communication/mod.rs - transports that implement DeviceChannel
pub mod serial;

pub use serial::SerialChannel;
