pub mod error;
pub mod lru_index;
pub mod prelude;
