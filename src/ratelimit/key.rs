//! Bucket key generation.

use std::fmt;

use super::bucket::Dimension;
use super::rules::BucketScope;

/// Uniquely identifies one live bucket.
///
/// The identifier is empty for the `global` dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub dimension: Dimension,
    pub identifier: String,
    pub scope: BucketScope,
}

impl BucketKey {
    /// Key for a dimension that carries an identifier.
    pub fn new(dimension: Dimension, identifier: impl Into<String>, scope: BucketScope) -> Self {
        let identifier = match dimension {
            Dimension::Global => String::new(),
            _ => identifier.into(),
        };
        Self {
            dimension,
            identifier,
            scope,
        }
    }

    /// Key of the shared global bucket in a scope.
    pub fn global(scope: BucketScope) -> Self {
        Self::new(Dimension::Global, String::new(), scope)
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dimension {
            Dimension::Global => write!(f, "{}:{}", self.scope, self.dimension),
            _ => write!(f, "{}:{}={}", self.scope, self.dimension, self.identifier),
        }
    }
}
