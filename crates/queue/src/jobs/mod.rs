//! Job definitions.

mod cleanup;
mod publish;

pub use cleanup::StorageCleanupJob;
pub use publish::PublishDeviationJob;
