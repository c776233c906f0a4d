pub use super::error::ContainerErrors;
pub use super::lru_index::LruIndex;
