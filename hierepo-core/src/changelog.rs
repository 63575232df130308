//! Ordered operations destined for one atomic submission

use crate::id::ItemId;
use crate::operation::Operation;

/// An ordered list of pending mutations sharing one commit target
///
/// Operations are replayed in the order they were recorded; later operations
/// may address items created by earlier ones.
#[derive(Debug, Clone)]
pub struct ChangeLog {
    target: ItemId,
    operations: Vec<Operation>,
}

impl ChangeLog {
    pub fn new(target: impl Into<ItemId>) -> Self {
        Self {
            target: target.into(),
            operations: Vec::new(),
        }
    }

    pub fn with_operations(target: impl Into<ItemId>, operations: Vec<Operation>) -> Self {
        Self {
            target: target.into(),
            operations,
        }
    }

    /// The item whose batch carries the operations
    pub fn target(&self) -> &ItemId {
        &self.target
    }

    /// Record an operation after the existing ones
    pub fn push(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::NodeId;
    use crate::name::Name;

    #[test]
    fn test_preserves_recording_order() {
        let root = NodeId::from_unique_id("root");
        let mut log = ChangeLog::new(root.clone());
        assert!(log.is_empty());

        for n in ["a", "b", "c"] {
            log.push(Operation::add_node(
                root.clone(),
                Name::new(n).unwrap(),
                Name::new("nt:unstructured").unwrap(),
            ));
        }
        log.push(Operation::remove(root.clone()));

        let kinds: Vec<String> = log.operations().iter().map(|op| op.to_string()).collect();
        assert_eq!(log.len(), 4);
        assert!(kinds[0].contains("/ a :"));
        assert!(kinds[2].contains("/ c :"));
        assert_eq!(kinds[3], "Remove([root])");
        assert_eq!(log.target(), &ItemId::Node(root));
    }
}
