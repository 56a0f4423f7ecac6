//! Execution paths: integer addresses into a step graph
//!
//! Index 0 selects a top-level entry. For `parallel`, `conditional` and
//! `foreach` entries a second index selects the branch (or iteration slot).
//! When the addressed node is itself a nested workflow, the remaining
//! indices are resolved inside it.

use serde::{Deserialize, Serialize};

/// Address of one node in a step graph
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionPath(Vec<usize>);

impl ExecutionPath {
    pub fn new(indices: impl Into<Vec<usize>>) -> Self {
        Self(indices.into())
    }

    /// The path of the first top-level entry
    pub fn root() -> Self {
        Self(vec![0])
    }

    /// A path addressing the top-level entry `index`
    pub fn top_level(index: usize) -> Self {
        Self(vec![index])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    /// Index of the top-level entry
    pub fn top(&self) -> Option<usize> {
        self.0.first().copied()
    }

    /// Branch or slot index below the top-level entry
    pub fn branch(&self) -> Option<usize> {
        self.0.get(1).copied()
    }

    /// Path with `index` appended
    pub fn child(&self, index: usize) -> Self {
        let mut indices = self.0.clone();
        indices.push(index);
        Self(indices)
    }

    /// Path with the last index removed
    pub fn parent(&self) -> Option<Self> {
        if self.0.len() < 2 {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    /// Path of the next sibling at the same depth
    pub fn next_sibling(&self) -> Option<Self> {
        let mut indices = self.0.clone();
        let last = indices.last_mut()?;
        *last += 1;
        Some(Self(indices))
    }

    /// Indices remaining after the first `depth` have been consumed
    pub fn tail(&self, depth: usize) -> Self {
        Self(self.0.iter().skip(depth).copied().collect())
    }
}

impl From<Vec<usize>> for ExecutionPath {
    fn from(indices: Vec<usize>) -> Self {
        Self(indices)
    }
}

impl std::fmt::Display for ExecutionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, index) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", index)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_root_and_top_level() {
        assert_eq!(ExecutionPath::root(), ExecutionPath::new(vec![0]));
        assert_eq!(ExecutionPath::top_level(3).top(), Some(3));
        assert_eq!(ExecutionPath::top_level(3).branch(), None);
    }

    #[test]
    fn test_parent_of_top_level_is_none() {
        assert!(ExecutionPath::top_level(2).parent().is_none());
        assert_eq!(
            ExecutionPath::new(vec![2, 1]).parent(),
            Some(ExecutionPath::top_level(2))
        );
    }

    #[test]
    fn test_next_sibling_of_empty_path() {
        assert!(ExecutionPath::default().next_sibling().is_none());
    }

    #[test]
    fn test_display() {
        assert_eq!(ExecutionPath::new(vec![1, 0, 4]).to_string(), "[1, 0, 4]");
        assert_eq!(ExecutionPath::default().to_string(), "[]");
    }

    #[test]
    fn test_serializes_as_plain_array() {
        let json = serde_json::to_string(&ExecutionPath::new(vec![2, 5])).unwrap();
        assert_eq!(json, "[2,5]");
    }

    proptest! {
        #[test]
        fn child_then_parent_is_identity(
            indices in proptest::collection::vec(0usize..50, 1..6),
            extra in 0usize..50,
        ) {
            let path = ExecutionPath::new(indices);
            prop_assert_eq!(path.child(extra).parent(), Some(path.clone()));
        }

        #[test]
        fn next_sibling_keeps_depth_and_prefix(
            indices in proptest::collection::vec(0usize..50, 1..6),
        ) {
            let path = ExecutionPath::new(indices.clone());
            let next = path.next_sibling().unwrap();
            prop_assert_eq!(next.len(), path.len());
            prop_assert_eq!(&next.as_slice()[..indices.len() - 1], &indices[..indices.len() - 1]);
            prop_assert_eq!(next.as_slice()[indices.len() - 1], indices[indices.len() - 1] + 1);
        }
    }
}
