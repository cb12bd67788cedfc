use crate::taxon::{SeqId, TaxonError};
use petgraph::{
    graph::{DiGraph, NodeIndex},
    Direction,
};
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("No Newick string found")]
    NoNewick,

    #[error("Empty tree")]
    Empty,

    #[error("Unbalanced parentheses at position {0}")]
    Unbalanced(usize),

    #[error("Unnamed leaf at position {0}")]
    UnnamedLeaf(usize),

    #[error(r#"Bad branch length "{0}""#)]
    BranchLength(String),

    #[error(r#"Unexpected "{1}" at position {0}"#)]
    Unexpected(usize, char),

    #[error(transparent)]
    Taxon(#[from] TaxonError),

    #[error("Cannot reroot: {0}")]
    CannotReroot(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TreeNode {
    Internal,
    Leaf(SeqId),
}

// --------------------------------------------------
/// A rooted gene tree stored as an arena of nodes with parent → child edges
#[derive(Debug, Clone)]
pub struct PhyloTree {
    graph: DiGraph<TreeNode, ()>,
    root: NodeIndex,
}

impl PhyloTree {
    /// Parse a Newick string. Leaf labels are validated as sequence ids.
    /// Internal labels (support values) and branch lengths are discarded.
    pub fn from_newick(newick: &str) -> Result<Self, TreeError> {
        let chars: Vec<char> = newick.chars().collect();
        let mut graph = DiGraph::new();
        let mut stack: Vec<NodeIndex> = vec![];
        let mut root: Option<NodeIndex> = None;
        // After "(" or "," a node must follow
        let mut expect_node = true;
        let mut pos = 0;

        while pos < chars.len() {
            let c = chars[pos];
            match c {
                '(' => {
                    if !expect_node {
                        return Err(TreeError::Unexpected(pos, c));
                    }
                    let node = graph.add_node(TreeNode::Internal);
                    attach(&mut graph, &stack, &mut root, node, pos)?;
                    stack.push(node);
                    pos += 1;
                }
                ',' | ')' => {
                    if expect_node {
                        return Err(TreeError::UnnamedLeaf(pos));
                    }
                    if stack.is_empty() {
                        return Err(TreeError::Unbalanced(pos));
                    }
                    pos += 1;
                    if c == ',' {
                        expect_node = true;
                    } else {
                        stack.pop();
                        // Internal node label, e.g. a support value
                        let (_, next) = read_label(&chars, pos);
                        pos = next;
                    }
                }
                ':' => {
                    pos = read_length(&chars, pos + 1)?;
                }
                '[' => {
                    pos = skip_comment(&chars, pos)?;
                }
                ';' => {
                    pos += 1;
                    break;
                }
                c if c.is_whitespace() => pos += 1,
                _ => {
                    if !expect_node {
                        return Err(TreeError::Unexpected(pos, c));
                    }
                    let (label, next) = read_label(&chars, pos);
                    let leaf = graph.add_node(TreeNode::Leaf(SeqId::parse(&label)?));
                    attach(&mut graph, &stack, &mut root, leaf, pos)?;
                    expect_node = false;
                    pos = next;
                }
            }
        }

        if !stack.is_empty() {
            return Err(TreeError::Unbalanced(chars.len()));
        }

        if let Some((i, c)) = chars
            .iter()
            .enumerate()
            .skip(pos)
            .find(|(_, c)| !c.is_whitespace())
        {
            return Err(TreeError::Unexpected(i, *c));
        }

        match root {
            Some(root) => Ok(PhyloTree { graph, root }),
            _ => Err(TreeError::Empty),
        }
    }

    pub fn root(&self) -> NodeIndex {
        self.root
    }

    /// The sequence id of a leaf, `None` for internal nodes
    pub fn seq_id(&self, node: NodeIndex) -> Option<&SeqId> {
        match &self.graph[node] {
            TreeNode::Leaf(id) => Some(id),
            TreeNode::Internal => None,
        }
    }

    pub fn is_leaf(&self, node: NodeIndex) -> bool {
        matches!(self.graph[node], TreeNode::Leaf(_))
    }

    pub fn parent(&self, node: NodeIndex) -> Option<NodeIndex> {
        self.graph
            .neighbors_directed(node, Direction::Incoming)
            .next()
    }

    /// Children in Newick order
    pub fn children(&self, node: NodeIndex) -> Vec<NodeIndex> {
        // petgraph walks edges newest first
        let mut children: Vec<_> = self
            .graph
            .neighbors_directed(node, Direction::Outgoing)
            .collect();
        children.reverse();
        children
    }

    /// Breadth-first order starting at the root
    pub fn level_order(&self) -> Vec<NodeIndex> {
        let mut order = Vec::with_capacity(self.graph.node_count());
        let mut queue = VecDeque::from([self.root]);
        while let Some(node) = queue.pop_front() {
            order.push(node);
            queue.extend(self.children(node));
        }
        order
    }

    /// Leaves under `node` (itself if a leaf) in preorder
    pub fn leaves(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut leaves = vec![];
        let mut stack = vec![node];
        while let Some(node) = stack.pop() {
            if self.is_leaf(node) {
                leaves.push(node);
            } else {
                stack.extend(self.children(node).into_iter().rev());
            }
        }
        leaves
    }

    pub fn leaf_count(&self, node: NodeIndex) -> usize {
        self.leaves(node).len()
    }

    /// All leaf ids of the tree in preorder
    pub fn leaf_ids(&self) -> Vec<&SeqId> {
        self.leaves(self.root)
            .into_iter()
            .filter_map(|leaf| self.seq_id(leaf))
            .collect()
    }

    /// A copy of the tree rooted on the branch above `outgroup`.
    /// The new root has the outgroup as its first child and the rest of the
    /// tree as its second; internal nodes left with one child are removed.
    pub fn rerooted_on(&self, outgroup: NodeIndex) -> Result<Self, TreeError> {
        if outgroup == self.root {
            return Err(TreeError::CannotReroot("outgroup is already the root"));
        }
        let parent = self
            .parent(outgroup)
            .ok_or(TreeError::CannotReroot("outgroup has no parent"))?;
        if parent == self.root && self.children(parent).len() < 2 {
            return Err(TreeError::CannotReroot("tree has a single lineage"));
        }

        let mut graph = DiGraph::new();
        let root = graph.add_node(TreeNode::Internal);

        // (old node, node we arrived from, new parent), popped in preorder
        let mut stack = vec![(parent, outgroup, root), (outgroup, parent, root)];
        while let Some((old, from, new_parent)) = stack.pop() {
            let next: Vec<_> = self
                .neighbors(old)
                .into_iter()
                .filter(|&n| n != from)
                .collect();

            let attach_to = if !self.is_leaf(old) && next.len() < 2 {
                // Unary after reorientation: splice it out
                new_parent
            } else {
                let node = graph.add_node(self.graph[old].clone());
                graph.add_edge(new_parent, node, ());
                node
            };

            stack.extend(next.into_iter().rev().map(|n| (n, old, attach_to)));
        }

        Ok(PhyloTree { graph, root })
    }

    /// Children first, then the parent
    fn neighbors(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut neighbors = self.children(node);
        neighbors.extend(self.parent(node));
        neighbors
    }

    /// Render as Newick (leaf ids only)
    pub fn to_newick(&self) -> String {
        let mut out = self.subtree_newick(self.root);
        out.push(';');
        out
    }

    fn subtree_newick(&self, node: NodeIndex) -> String {
        match &self.graph[node] {
            TreeNode::Leaf(id) => id.to_string(),
            TreeNode::Internal => format!(
                "({})",
                self.children(node)
                    .into_iter()
                    .map(|child| self.subtree_newick(child))
                    .collect::<Vec<_>>()
                    .join(",")
            ),
        }
    }
}

// --------------------------------------------------
fn attach(
    graph: &mut DiGraph<TreeNode, ()>,
    stack: &[NodeIndex],
    root: &mut Option<NodeIndex>,
    node: NodeIndex,
    pos: usize,
) -> Result<(), TreeError> {
    match stack.last() {
        Some(&parent) => {
            graph.add_edge(parent, node, ());
        }
        _ if root.is_none() => *root = Some(node),
        _ => return Err(TreeError::Unbalanced(pos)),
    }
    Ok(())
}

// --------------------------------------------------
fn read_label(chars: &[char], start: usize) -> (String, usize) {
    let mut pos = start;
    while pos < chars.len() && !"(),:;[".contains(chars[pos]) {
        pos += 1;
    }
    let label: String = chars[start..pos].iter().collect();
    (label.trim().to_string(), pos)
}

// --------------------------------------------------
fn read_length(chars: &[char], start: usize) -> Result<usize, TreeError> {
    let (value, pos) = read_label(chars, start);
    value
        .parse::<f64>()
        .map_err(|_| TreeError::BranchLength(value.clone()))?;
    Ok(pos)
}

// --------------------------------------------------
fn skip_comment(chars: &[char], start: usize) -> Result<usize, TreeError> {
    chars[start..]
        .iter()
        .position(|&c| c == ']')
        .map(|offset| start + offset + 1)
        .ok_or(TreeError::Unexpected(start, '['))
}

// --------------------------------------------------
/// Pull the Newick string out of a plain or NEXUS tree file: the first line
/// that carries a "tree1=" marker or whose text (or last space-separated
/// token) starts with "(". Quotes and backslashes are removed.
pub fn extract_newick(text: &str) -> Result<String, TreeError> {
    text.lines()
        .map(str::trim)
        .find_map(|line| {
            if let Some((_, tree)) = line.rsplit_once("tree1=") {
                Some(tree)
            } else if line.starts_with('(') {
                Some(line)
            } else {
                line.rsplit(' ').next().filter(|token| token.starts_with('('))
            }
        })
        .map(|newick| newick.trim().replace(['\'', '\\'], ""))
        .ok_or(TreeError::NoNewick)
}

// --------------------------------------------------
#[cfg(test)]
mod tests {
    use super::{extract_newick, PhyloTree, TreeError};
    use anyhow::Result;
    use pretty_assertions::assert_eq;

    fn names(tree: &PhyloTree, nodes: &[petgraph::graph::NodeIndex]) -> Vec<String> {
        nodes
            .iter()
            .filter_map(|&n| tree.seq_id(n).map(|id| id.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_newick() -> Result<()> {
        let tree = PhyloTree::from_newick(
            "((Sr_ci_Scer_1:0.1,Sr_ci_Sbay_1:0.2)0.95:0.3,[note]Op_me_Hsap_1:1e-3);",
        )?;
        assert_eq!(
            tree.to_newick(),
            "((Sr_ci_Scer_1,Sr_ci_Sbay_1),Op_me_Hsap_1);"
        );
        assert_eq!(tree.leaf_count(tree.root()), 3);
        assert_eq!(tree.children(tree.root()).len(), 2);
        Ok(())
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            PhyloTree::from_newick("((Sr_ci_Scer_1,Sr_ci_Sbay_1);"),
            Err(TreeError::Unbalanced(_))
        ));
        assert!(matches!(
            PhyloTree::from_newick("(Sr_ci_Scer_1,,Sr_ci_Sbay_1);"),
            Err(TreeError::UnnamedLeaf(_))
        ));
        assert!(matches!(
            PhyloTree::from_newick("(Sr_ci_Scer_1:abc,Sr_ci_Sbay_1);"),
            Err(TreeError::BranchLength(_))
        ));
        assert!(matches!(
            PhyloTree::from_newick("(Sr_ci_Scer_1,seq2);"),
            Err(TreeError::Taxon(_))
        ));
        assert!(matches!(
            PhyloTree::from_newick("(Sr_ci_Scer_1,Sr_ci_Sbay_1);x"),
            Err(TreeError::Unexpected(_, 'x'))
        ));
        assert!(matches!(PhyloTree::from_newick(" ;"), Err(TreeError::Empty)));
    }

    #[test]
    fn test_level_order() -> Result<()> {
        let tree = PhyloTree::from_newick(
            "((Am_tu_Aaaa_1,(Am_tu_Bbbb_1,Am_tu_Cccc_1)),Op_me_Hsap_1);",
        )?;
        let order = tree.level_order();
        assert_eq!(order.len(), 7);
        assert_eq!(order[0], tree.root());
        assert_eq!(
            names(&tree, &order),
            vec!["Op_me_Hsap_1", "Am_tu_Aaaa_1", "Am_tu_Bbbb_1", "Am_tu_Cccc_1"]
        );
        assert_eq!(
            names(&tree, &tree.leaves(tree.root())),
            vec!["Am_tu_Aaaa_1", "Am_tu_Bbbb_1", "Am_tu_Cccc_1", "Op_me_Hsap_1"]
        );
        Ok(())
    }

    #[test]
    fn test_reroot() -> Result<()> {
        let tree = PhyloTree::from_newick(
            "((Am_tu_Aaaa_1,Am_tu_Bbbb_1),((Op_me_Hsap_1,Op_me_Mmus_1),Pl_gr_Atha_1));",
        )?;
        // The (Hsap, Mmus) clade
        let clade = tree
            .level_order()
            .into_iter()
            .find(|&n| tree.leaf_count(n) == 2 && !tree.leaves(n).iter().any(|&l| {
                tree.seq_id(l).map_or(false, |id| id.code().major() != "Op")
            }))
            .unwrap();

        let rerooted = tree.rerooted_on(clade)?;
        assert_eq!(
            rerooted.to_newick(),
            "((Op_me_Hsap_1,Op_me_Mmus_1),(Pl_gr_Atha_1,(Am_tu_Aaaa_1,Am_tu_Bbbb_1)));"
        );
        assert_eq!(rerooted.leaf_count(rerooted.root()), 5);

        assert!(matches!(
            tree.rerooted_on(tree.root()),
            Err(TreeError::CannotReroot(_))
        ));
        Ok(())
    }

    #[test]
    fn test_reroot_on_leaf_with_multifurcating_root() -> Result<()> {
        let tree = PhyloTree::from_newick(
            "(Am_tu_Aaaa_1,Op_me_Hsap_1,(Pl_gr_Atha_1,Pl_gr_Osat_1));",
        )?;
        let leaf = tree.children(tree.root())[1];
        let rerooted = tree.rerooted_on(leaf)?;
        assert_eq!(
            rerooted.to_newick(),
            "(Op_me_Hsap_1,(Am_tu_Aaaa_1,(Pl_gr_Atha_1,Pl_gr_Osat_1)));"
        );
        Ok(())
    }

    #[test]
    fn test_extract_newick() -> Result<()> {
        assert_eq!(
            extract_newick("(Sr_ci_Scer_1,Op_me_Hsap_1);\n")?,
            "(Sr_ci_Scer_1,Op_me_Hsap_1);"
        );

        let nexus = "#NEXUS\nbegin trees;\n\ttree tree1=('Sr_ci_Scer_1',Op_me_Hsap_1);\nend;\n";
        assert_eq!(extract_newick(nexus)?, "(Sr_ci_Scer_1,Op_me_Hsap_1);");

        let nexus = "#NEXUS\nbegin trees;\n  tree tree_1 = [&U] (Sr_ci_Scer_1,Op_me_Hsap_1);\n  tree tree_2 = [&U] (Op_me_Hsap_1,Sr_ci_Scer_1);\nend;\n";
        assert_eq!(extract_newick(nexus)?, "(Sr_ci_Scer_1,Op_me_Hsap_1);");

        assert!(matches!(
            extract_newick("#NEXUS\nend;"),
            Err(TreeError::NoNewick)
        ));
        Ok(())
    }
}
