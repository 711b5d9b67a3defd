//! Database entities.

#![allow(missing_docs)]

pub mod automation;
pub mod deviation;
pub mod deviation_file;
pub mod sale_queue;
pub mod user;

pub use automation::Entity as Automation;
pub use deviation::Entity as Deviation;
pub use deviation_file::Entity as DeviationFile;
pub use sale_queue::Entity as SaleQueue;
pub use user::Entity as User;
