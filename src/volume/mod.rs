pub mod client;
pub mod lifecycle;

pub use client::VolumeClient;
pub use lifecycle::VolumeLifecycle;
