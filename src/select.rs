use crate::{
    clades::CladeMap,
    fasta::{Alignment, FastaRecord},
    taxon::{CoverageStrategy, SeqId, TaxonCode, Targets},
    tree::PhyloTree,
};
use anyhow::{anyhow, Result};
use itertools::Itertools;
use log::debug;
use petgraph::graph::NodeIndex;
use serde::Serialize;
use std::fmt;

/// Why a sequence was chosen for its taxon
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Reason {
    /// The taxon had one sequence in the OG
    Single,
    /// The only sequence in the taxon's largest accepted clade
    Clade { taxa: usize },
    /// Highest score among tied or unplaced candidates
    Score { clade_taxa: usize, score: f64 },
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::Single => write!(f, "single"),
            Reason::Clade { .. } => write!(f, "clade"),
            Reason::Score { .. } => write!(f, "score"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub taxon: TaxonCode,
    pub id: SeqId,
    /// Ungapped sequence
    pub seq: String,
    pub reason: Reason,
}

impl Selection {
    pub fn to_record(&self) -> FastaRecord {
        FastaRecord::new(self.id.as_str(), self.seq.as_str())
    }
}

/// One representative per taxon, in first-seen tree order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectionResult {
    pub selections: Vec<Selection>,
}

impl SelectionResult {
    pub fn get(&self, taxon: &TaxonCode) -> Option<&Selection> {
        self.selections.iter().find(|sel| &sel.taxon == taxon)
    }

    pub fn len(&self) -> usize {
        self.selections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selections.is_empty()
    }
}

struct Candidate<'a> {
    leaf: NodeIndex,
    id: &'a SeqId,
    record: &'a FastaRecord,
}

// --------------------------------------------------
/// Choose one sequence per target taxon from the OG's tree and alignment
pub fn select_sequences(
    tree: &PhyloTree,
    alignment: &Alignment,
    targets: &Targets,
    clades: &CladeMap,
    coverage: &dyn CoverageStrategy,
) -> Result<SelectionResult> {
    // Only targeted leaves need a record
    let mut leaves = vec![];
    for leaf in tree.leaves(tree.root()) {
        if let Some(id) = tree.seq_id(leaf).filter(|id| targets.includes(id)) {
            let record = alignment.get(id.as_str()).ok_or_else(|| {
                anyhow!(r#"Tree leaf "{id}" is missing from the alignment"#)
            })?;
            leaves.push(Candidate { leaf, id, record });
        }
    }

    let taxa: Vec<&TaxonCode> =
        leaves.iter().map(|cand| cand.id.code()).unique().collect();

    let mut selections = vec![];
    for taxon in taxa {
        let candidates: Vec<&Candidate> =
            leaves.iter().filter(|cand| cand.id.code() == taxon).collect();

        let (chosen, reason) =
            choose(taxon, candidates, clades, coverage).ok_or_else(|| {
                anyhow!("No candidate sequences for taxon {taxon}")
            })?;

        debug!("{taxon}: {} ({reason})", chosen.id);
        selections.push(Selection {
            taxon: taxon.clone(),
            id: chosen.id.clone(),
            seq: chosen.record.ungapped(),
            reason,
        });
    }

    Ok(SelectionResult { selections })
}

// --------------------------------------------------
fn choose<'a>(
    taxon: &TaxonCode,
    candidates: Vec<&'a Candidate<'a>>,
    clades: &CladeMap,
    coverage: &dyn CoverageStrategy,
) -> Option<(&'a Candidate<'a>, Reason)> {
    if candidates.len() == 1 {
        return candidates.first().map(|&cand| (cand, Reason::Single));
    }

    // Size of the accepted clade holding each candidate, 0 if none
    let sizes: Vec<usize> = match clades.for_taxon(taxon) {
        Some(found) => candidates
            .iter()
            .map(|cand| {
                found
                    .iter()
                    .find(|clade| clade.contains(cand.leaf))
                    .map_or(0, |clade| clade.taxa)
            })
            .collect(),
        _ => vec![0; candidates.len()],
    };

    let best_size = sizes.iter().copied().max().unwrap_or(0);
    let pool: Vec<&Candidate> = if best_size > 0 {
        candidates
            .into_iter()
            .zip(&sizes)
            .filter_map(|(cand, &size)| (size == best_size).then_some(cand))
            .collect()
    } else {
        candidates
    };

    if best_size > 0 && pool.len() == 1 {
        return pool.first().map(|&cand| (cand, Reason::Clade { taxa: best_size }));
    }

    best_scoring(&pool, coverage).map(|(cand, score)| {
        (
            cand,
            Reason::Score {
                clade_taxa: best_size,
                score,
            },
        )
    })
}

// --------------------------------------------------
/// Ungapped length, weighted by coverage when every candidate has one.
/// The first of equal scores wins.
fn best_scoring<'a>(
    pool: &[&'a Candidate<'a>],
    coverage: &dyn CoverageStrategy,
) -> Option<(&'a Candidate<'a>, f64)> {
    let weights: Option<Vec<f64>> =
        pool.iter().map(|cand| coverage.weight(cand.id)).collect();

    let mut best: Option<(&Candidate, f64)> = None;
    for (i, &cand) in pool.iter().enumerate() {
        let len = cand.record.ungapped_len() as f64;
        let score = match &weights {
            Some(weights) => len * weights[i],
            _ => len,
        };
        if best.map_or(true, |(_, top)| score > top) {
            best = Some((cand, score));
        }
    }

    best
}
