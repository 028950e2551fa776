//! External service clients/adapters.

pub mod object_storage;
pub mod square;

pub use object_storage::{InMemoryObjectStorage, ObjectStorageClient};
pub use square::{SquareBillingProvider, SquareConfig};
