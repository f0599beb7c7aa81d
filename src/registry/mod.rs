pub mod base_resource_type;
pub mod resource_cache;
pub mod worker_resource_type;

pub use base_resource_type::BaseResourceTypeRegistry;
pub use resource_cache::ResourceCacheRegistry;
pub use worker_resource_type::WorkerResourceTypeRegistry;
