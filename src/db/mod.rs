pub mod models;
pub mod pool;
pub mod repository;

#[cfg(test)]
pub mod test_support;

pub use models::*;
pub use pool::build_pool;
pub use repository::{Repository, RepositoryPort};
