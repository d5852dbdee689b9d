//! Depth-first trie traversal driven by visitor callbacks.

use crate::{ForestResult, Node, NodeId, NodeManager, NodePath, NodeReference};

/// A visitor's verdict after seeing one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitResponse {
    /// Descend into the node's children.
    Continue,
    /// Skip the node's subtree, continue with its siblings.
    Prune,
    /// Unwind the whole traversal immediately.
    Abort,
}

/// The position handed to a visitor alongside each node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    /// The visited node's id.
    pub id: NodeId,
    /// The node's depth below the visited root, in nodes.
    pub depth: usize,
    /// The branch-slot path from the root; invalid once the position is
    /// deeper than the navigator can express.
    pub path: NodePath,
}

/// A depth-first trie observer.
///
/// Branch children are visited in slot order; an account's storage trie is
/// visited below the account leaf.
pub trait NodeVisitor {
    /// Called for every reachable node, before its children.
    fn visit(&mut self, node: &Node, info: &NodeInfo) -> VisitResponse;
}

/// Adapts a closure into a [NodeVisitor].
#[derive(Debug)]
pub struct VisitWith<F>(pub F);

impl<F: FnMut(&Node, &NodeInfo) -> VisitResponse> NodeVisitor for VisitWith<F> {
    fn visit(&mut self, node: &Node, info: &NodeInfo) -> VisitResponse {
        (self.0)(node, info)
    }
}

/// Walks the subtree under `root` depth-first. Returns `false` when the
/// visitor aborted the traversal.
pub(crate) fn visit_subtree(
    manager: &NodeManager,
    root: &NodeReference,
    visitor: &mut dyn NodeVisitor,
) -> ForestResult<bool> {
    visit_node(manager, root, 0, NodePath::ROOT, visitor)
}

fn visit_node(
    manager: &NodeManager,
    reference: &NodeReference,
    depth: usize,
    path: NodePath,
    visitor: &mut dyn NodeVisitor,
) -> ForestResult<bool> {
    if reference.is_empty() {
        return Ok(true);
    }
    let handle = manager.get_read(reference)?;
    let info = NodeInfo { id: handle.id(), depth, path };
    match visitor.visit(&handle, &info) {
        VisitResponse::Abort => return Ok(false),
        VisitResponse::Prune => return Ok(true),
        VisitResponse::Continue => {}
    }

    enum Descent {
        Branch(Vec<(u8, NodeReference)>),
        Single(NodeReference),
        None,
    }
    let descent = match &*handle {
        Node::Branch(branch) => Descent::Branch(
            (0..16u8)
                .filter(|slot| !branch.children[*slot as usize].is_empty())
                .map(|slot| (slot, branch.children[slot as usize].clone()))
                .collect(),
        ),
        Node::Extension(extension) => Descent::Single(extension.next.clone()),
        Node::Account(account) => Descent::Single(account.storage.clone()),
        Node::Value(_) | Node::Empty => Descent::None,
    };
    drop(handle);

    match descent {
        Descent::Branch(children) => {
            for (slot, child) in children {
                if !visit_node(manager, &child, depth + 1, path.child(slot), visitor)? {
                    return Ok(false);
                }
            }
        }
        Descent::Single(child) => {
            if !visit_node(manager, &child, depth + 1, path, visitor)? {
                return Ok(false);
            }
        }
        Descent::None => {}
    }
    Ok(true)
}

/// Renders the subtree under `root` as an indented textual tree.
pub(crate) fn dump_subtree(manager: &NodeManager, root: &NodeReference) -> ForestResult<String> {
    use std::fmt::Write;

    let mut out = String::new();
    let mut write_line = VisitWith(|node: &Node, info: &NodeInfo| {
        let indent = "  ".repeat(info.depth);
        let line = match node {
            Node::Empty => "empty".to_string(),
            Node::Branch(branch) => {
                format!("branch[{}] children={}", info.id, branch.child_count())
            }
            Node::Extension(extension) => {
                format!("extension[{}] path_len={}", info.id, extension.path.len())
            }
            Node::Account(account) => {
                format!("account[{}] address={}", info.id, account.address)
            }
            Node::Value(value) => format!("value[{}] key={}", info.id, value.key),
        };
        let _ = writeln!(out, "{indent}{line}");
        VisitResponse::Continue
    });
    visit_subtree(manager, root, &mut write_line)?;
    Ok(out)
}
