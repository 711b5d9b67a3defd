//! Repository layer for database operations.

mod automation;
mod deviation;
mod sale_queue;
mod user;

pub use automation::AutomationRepository;
pub use deviation::{
    CommitSummary, DeviationRepository, PublishCommit, PublishedItem, SaleListingRequest,
};
pub use sale_queue::SaleQueueRepository;
pub use user::UserRepository;
