//! Deviation publish job.

use serde::{Deserialize, Serialize};

use crate::publisher::PublishMode;

/// Job to publish one deviation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishDeviationJob {
    /// Deviation to publish.
    pub deviation_id: String,

    /// Owner of the deviation, used as the rate limiting subject.
    pub user_id: String,

    /// 1-based attempt number of this run.
    #[serde(default = "first_attempt")]
    pub attempt: u32,

    /// Overrides the deviation's stored upload mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<PublishMode>,
}

const fn first_attempt() -> u32 {
    1
}

impl PublishDeviationJob {
    /// Create a job for the first attempt.
    #[must_use]
    pub const fn new(deviation_id: String, user_id: String) -> Self {
        Self {
            deviation_id,
            user_id,
            attempt: 1,
            mode: None,
        }
    }

    /// Publish in `mode` regardless of the stored upload mode.
    #[must_use]
    pub fn with_mode(mut self, mode: PublishMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// The same job for the following attempt.
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}
