use crate::tree::{PhyloTree, TreeError};
use itertools::Itertools;
use log::debug;
use petgraph::graph::NodeIndex;
use std::collections::HashSet;

/// Smallest node considered as an outgroup
const MIN_OUTGROUP_LEAVES: usize = 3;

/// Foreign leaves tolerated inside an outgroup clade
const MAX_FOREIGN_LEAVES: usize = 2;

/// In-group leaves an outgroup needs before the tree is rerooted on it
const MIN_ROOTING_LEAVES: usize = 3;

/// Prokaryotes first, then the eukaryotic major clades
pub fn default_outgroups() -> Vec<Vec<String>> {
    [&["Ba", "Za"][..], &["Op"], &["Pl"], &["Am"], &["Ex"], &["Sr"]]
        .iter()
        .map(|group| group.iter().map(|code| code.to_string()).collect())
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum RerootOutcome {
    /// Rooted on the clade found for this group of major-clade codes
    Rerooted { group: Vec<String>, leaves: usize },
    /// No group produced a usable outgroup
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub node: NodeIndex,
    /// Unique in-group taxon codes
    pub taxa: usize,
    /// In-group leaves
    pub leaves: usize,
}

// --------------------------------------------------
/// The largest near-monophyletic clade for one group of major-clade codes.
/// Accepted candidates add their leaves to `claimed`, which the caller
/// carries across groups.
pub fn best_outgroup(
    tree: &PhyloTree,
    group: &[String],
    claimed: &mut HashSet<NodeIndex>,
) -> Option<Candidate> {
    let mut best: Option<Candidate> = None;

    for node in tree.level_order() {
        let leaves = tree.leaves(node);
        if leaves.len() < MIN_OUTGROUP_LEAVES
            || leaves.iter().any(|leaf| claimed.contains(leaf))
        {
            continue;
        }

        let (ingroup, foreign): (Vec<_>, Vec<_>) = leaves
            .iter()
            .filter_map(|&leaf| tree.seq_id(leaf))
            .partition(|id| group.iter().any(|code| code == id.code().major()));

        let taxa = ingroup.iter().map(|id| id.code()).unique().count();
        let best_taxa = best.as_ref().map_or(0, |b| b.taxa);

        if foreign.len() <= MAX_FOREIGN_LEAVES && taxa > best_taxa {
            claimed.extend(leaves.iter().copied());
            best = Some(Candidate {
                node,
                taxa,
                leaves: ingroup.len(),
            });
        }
    }

    best
}

// --------------------------------------------------
/// Reroot on the first outgroup group with a large enough clade.
/// Returns the tree unchanged when no group qualifies.
pub fn reroot(
    tree: &PhyloTree,
    outgroups: &[Vec<String>],
) -> Result<(PhyloTree, RerootOutcome), TreeError> {
    let mut claimed = HashSet::new();

    for group in outgroups {
        if let Some(candidate) = best_outgroup(tree, group, &mut claimed) {
            debug!(
                "Outgroup candidate for {}: {} taxa, {} leaves",
                group.join("/"),
                candidate.taxa,
                candidate.leaves
            );

            if candidate.leaves > MIN_ROOTING_LEAVES {
                let rerooted = tree.rerooted_on(candidate.node)?;
                return Ok((
                    rerooted,
                    RerootOutcome::Rerooted {
                        group: group.clone(),
                        leaves: candidate.leaves,
                    },
                ));
            }
        }
    }

    Ok((tree.clone(), RerootOutcome::Unchanged))
}
