pub mod migration;

pub use migration::{MigrationError, Result};
