pub mod pool;
pub mod schema;
pub mod store;

pub use pool::DbPool;
pub use store::{ThreadStore, UnitOfWork};
