pub mod directory;
pub mod runtime;
pub mod transport;

pub use directory::{BackendWorkerDirectory, WorkerDirectory};
pub use runtime::{ContainerSpec, HttpRuntimeClient, RuntimeClient, VolumeMount, VolumeSpec};
pub use transport::{CachingTransport, WorkerTransport};
