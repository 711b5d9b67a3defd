//! Job workers.

mod publish;

pub use publish::{PublishContext, PublishJobResult, publish_worker};
