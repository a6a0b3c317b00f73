//! Hierarchical test tree derived from ledger (test id, suite path) pairs.

use serde::{Deserialize, Serialize};

/// A node in the derived test tree. Never stored; rebuilt on every read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TestTreeNode {
    Suite {
        name: String,
        children: Vec<TestTreeNode>,
    },
    Test {
        name: String,
        #[serde(rename = "testId")]
        test_id: String,
    },
}

impl TestTreeNode {
    pub fn name(&self) -> &str {
        match self {
            TestTreeNode::Suite { name, .. } | TestTreeNode::Test { name, .. } => name,
        }
    }
}

/// Build the tree from `(test_id, suite_path)` pairs in first-seen order.
///
/// An empty suite path yields a root-level leaf; otherwise each segment
/// becomes (or reuses) a suite node and the leaf lands at the end of the
/// chain. Sibling order follows insertion, not name.
pub fn build_test_tree<'a, I>(pairs: I) -> Vec<TestTreeNode>
where
    I: IntoIterator<Item = (&'a str, &'a [String])>,
{
    let mut roots = Vec::new();
    for (test_id, suite_path) in pairs {
        insert(&mut roots, suite_path, test_id);
    }
    roots
}

fn insert(nodes: &mut Vec<TestTreeNode>, path: &[String], test_id: &str) {
    match path.split_first() {
        None => {
            let exists = nodes.iter().any(
                |node| matches!(node, TestTreeNode::Test { test_id: id, .. } if id == test_id),
            );
            if !exists {
                nodes.push(TestTreeNode::Test {
                    name: test_id.to_string(),
                    test_id: test_id.to_string(),
                });
            }
        }
        Some((head, rest)) => {
            let index = match nodes
                .iter()
                .position(|node| matches!(node, TestTreeNode::Suite { name, .. } if name == head))
            {
                Some(index) => index,
                None => {
                    nodes.push(TestTreeNode::Suite {
                        name: head.clone(),
                        children: Vec::new(),
                    });
                    nodes.len() - 1
                }
            };
            if let TestTreeNode::Suite { children, .. } = &mut nodes[index] {
                insert(children, rest, test_id);
            }
        }
    }
}
