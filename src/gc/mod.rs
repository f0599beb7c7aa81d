pub mod collector;
pub mod kinds;

pub use collector::Collector;
pub use kinds::{CollectorKind, ExpiredContainers, OrphanedResourceCaches, OrphanedVolumes, StalledWorkers};
