use crate::{
    taxon::{TaxonCode, TaxonGroup},
    tree::PhyloTree,
};
use itertools::Itertools;
use petgraph::graph::NodeIndex;
use std::collections::{HashMap, HashSet};

/// A strictly monophyletic node accepted for one taxonomic group
#[derive(Debug, Clone, PartialEq)]
pub struct Clade {
    pub node: NodeIndex,
    pub leaves: HashSet<NodeIndex>,
    /// Distinct taxon-sample codes among the leaves
    pub taxa: usize,
}

impl Clade {
    pub fn contains(&self, leaf: NodeIndex) -> bool {
        self.leaves.contains(&leaf)
    }
}

/// Accepted clades keyed by group code. Every requested group has an entry,
/// possibly empty.
#[derive(Debug, Default, PartialEq)]
pub struct CladeMap {
    clades: HashMap<String, Vec<Clade>>,
}

impl CladeMap {
    pub fn get(&self, code: &str) -> Option<&[Clade]> {
        self.clades.get(code).map(Vec::as_slice)
    }

    /// Minor-clade clades when that group was searched, else major-clade
    pub fn for_taxon(&self, taxon: &TaxonCode) -> Option<&[Clade]> {
        self.get(taxon.minor()).or_else(|| self.get(taxon.major()))
    }

    pub fn len(&self) -> usize {
        self.clades.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// --------------------------------------------------
/// Find the maximal nodes whose leaves all belong to `group`, skipping any
/// node that shares a leaf with `claimed`. Accepted leaves are added to
/// `claimed`.
pub fn monophyletic_clades(
    tree: &PhyloTree,
    group: &TaxonGroup,
    claimed: &mut HashSet<NodeIndex>,
) -> Vec<Clade> {
    let mut clades = vec![];

    for node in tree.level_order() {
        let leaves = tree.leaves(node);
        if leaves.iter().any(|leaf| claimed.contains(leaf)) {
            continue;
        }

        let ids: Vec<_> =
            leaves.iter().filter_map(|&leaf| tree.seq_id(leaf)).collect();
        if ids.iter().all(|id| group.contains(id.code())) {
            claimed.extend(leaves.iter().copied());
            clades.push(Clade {
                node,
                taxa: ids.iter().map(|id| id.code()).unique().count(),
                leaves: leaves.into_iter().collect(),
            });
        }
    }

    clades
}

// --------------------------------------------------
/// Run clade detection for each group in order. Leaves claimed for an
/// earlier group are unavailable to later ones.
pub fn find_clades(tree: &PhyloTree, groups: &[TaxonGroup]) -> CladeMap {
    let mut claimed = HashSet::new();
    let mut clades = HashMap::new();

    for group in groups {
        let found = monophyletic_clades(tree, group, &mut claimed);
        clades
            .entry(group.code().to_string())
            .or_insert_with(Vec::new)
            .extend(found);
    }

    CladeMap { clades }
}
