//! ID generation utilities.

use ulid::Ulid;
use uuid::Uuid;

/// ID generator for entities and execution leases.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    _private: (),
}

impl IdGenerator {
    /// Create a new ID generator.
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }

    /// Generate a new ULID-based ID for a database row.
    #[must_use]
    pub fn generate(&self) -> String {
        Ulid::new().to_string().to_lowercase()
    }

    /// Generate a lease token for one publish attempt.
    ///
    /// UUID v7 keeps leases time-ordered, which makes stale ones easy to spot
    /// in the `execution_lock_id` column.
    #[must_use]
    pub fn generate_lease_id(&self) -> String {
        Uuid::now_v7().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_ulid() {
        let id_gen = IdGenerator::new();
        let id1 = id_gen.generate();
        let id2 = id_gen.generate();

        assert_eq!(id1.len(), 26);
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_lease_ids_are_unique_per_attempt() {
        let id_gen = IdGenerator::new();
        let a = id_gen.generate_lease_id();
        let b = id_gen.generate_lease_id();

        assert_eq!(a.len(), 36);
        assert_ne!(a, b);
    }
}
