//! Entity kinds and identifier generation
//!
//! Identifiers are `<PREFIX>-<uuid v4>`, e.g. `CHUNK-9F3C…`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kinds of records managed by ChunkFleet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Drive,
    Chunk,
    Replica,
    Policy,
    RedistributionLog,
    Metric,
}

impl EntityKind {
    /// Identifier prefix for this kind
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Drive => "DRIVE",
            Self::Chunk => "CHUNK",
            Self::Replica => "REPLICA",
            Self::Policy => "POLICY",
            Self::RedistributionLog => "LOG",
            Self::Metric => "METRIC",
        }
    }

    /// Generate a fresh, collision-free identifier
    pub fn new_id(&self) -> String {
        format!(
            "{}-{}",
            self.prefix(),
            Uuid::new_v4().simple().to_string().to_uppercase()
        )
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Drive => write!(f, "Drive"),
            Self::Chunk => write!(f, "Data chunk"),
            Self::Replica => write!(f, "Replica"),
            Self::Policy => write!(f, "Policy"),
            Self::RedistributionLog => write!(f, "Redistribution log"),
            Self::Metric => write!(f, "Drive metric"),
        }
    }
}
