use crate::{
    fasta::{open, open_for_write, read_fasta, write_fasta, FastaRecord, GAP},
    select::SelectionResult,
    taxon::{SeqId, TaxonCode},
};
use anyhow::{anyhow, bail, Result};
use itertools::Itertools;
use log::{debug, info};
use std::{
    collections::HashMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    process::Command,
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConcatError {
    #[error("OG {0} has no aligned sequences, cannot derive its width")]
    EmptyAlignment(String),

    #[error("OG {og}: {found} aligned records for {expected} selected sequences")]
    RecordCount {
        og: String,
        expected: usize,
        found: usize,
    },

    #[error("OG {og}: aligned sequences differ in length ({widths})")]
    Ragged { og: String, widths: String },

    #[error("OG {og}: taxon {taxon} appears more than once")]
    DuplicateTaxon { og: String, taxon: String },

    #[error("OG {og}: selected taxon {taxon} is missing from the aligner output")]
    MissingTaxon { og: String, taxon: String },

    #[error(
        "Taxon {taxon} has {found} aligned positions, expected {expected}"
    )]
    Width {
        taxon: String,
        expected: usize,
        found: usize,
    },
}

// --------------------------------------------------
/// Produces an aligned FASTA from an unaligned one
pub trait Aligner: Send + Sync {
    fn align(&self, unaligned: &Path, aligned: &Path) -> Result<()>;
}

/// An external program that writes the alignment to STDOUT, as MAFFT does
#[derive(Debug, Clone)]
pub struct ExternalAligner {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ExternalAligner {
    /// Locate `program` on the PATH (or as given) before any work starts
    pub fn new(program: &str, args: &[String]) -> Result<Self> {
        let program = which::which(program)
            .map_err(|e| anyhow!(r#"Cannot find aligner "{program}": {e}"#))?;
        Ok(ExternalAligner {
            program,
            args: args.to_vec(),
        })
    }
}

impl Aligner for ExternalAligner {
    fn align(&self, unaligned: &Path, aligned: &Path) -> Result<()> {
        let mut args = self.args.clone();
        args.push(unaligned.to_string_lossy().to_string());
        info!(r#"Running "{} {}""#, self.program.display(), args.join(" "));

        let res = Command::new(&self.program).args(&args).output()?;
        if !res.status.success() {
            bail!(
                "{} failed on {}: {}",
                self.program.display(),
                unaligned.display(),
                String::from_utf8_lossy(&res.stderr)
            );
        }

        fs::write(aligned, &res.stdout)
            .map_err(|e| anyhow!("Cannot write {}: {e}", aligned.display()))?;
        Ok(())
    }
}

// --------------------------------------------------
/// One OG after realignment, keyed by taxon code
#[derive(Debug, Clone, PartialEq)]
pub struct RealignedOg {
    pub name: String,
    pub width: usize,
    pub rows: HashMap<TaxonCode, String>,
    /// Taxa in selection order
    pub taxa: Vec<TaxonCode>,
}

impl RealignedOg {
    /// Check the aligner output against the selection and key it by taxon
    pub fn from_records(
        name: &str,
        selection: &SelectionResult,
        records: Vec<FastaRecord>,
    ) -> Result<Self> {
        if records.is_empty() {
            bail!(ConcatError::EmptyAlignment(name.to_string()));
        }
        if records.len() != selection.len() {
            bail!(ConcatError::RecordCount {
                og: name.to_string(),
                expected: selection.len(),
                found: records.len(),
            });
        }

        let widths: Vec<usize> =
            records.iter().map(|rec| rec.seq.chars().count()).unique().collect();
        if widths.len() != 1 {
            bail!(ConcatError::Ragged {
                og: name.to_string(),
                widths: widths.iter().join(", "),
            });
        }

        let mut rows = HashMap::new();
        for rec in records {
            let id = SeqId::parse(&rec.id)?;
            let taxon = id.code().clone();
            if rows.insert(taxon.clone(), rec.seq).is_some() {
                bail!(ConcatError::DuplicateTaxon {
                    og: name.to_string(),
                    taxon: taxon.to_string(),
                });
            }
        }

        let taxa: Vec<TaxonCode> = selection
            .selections
            .iter()
            .map(|sel| sel.taxon.clone())
            .collect();
        if let Some(missing) = taxa.iter().find(|taxon| !rows.contains_key(*taxon)) {
            bail!(ConcatError::MissingTaxon {
                og: name.to_string(),
                taxon: missing.to_string(),
            });
        }

        Ok(RealignedOg {
            name: name.to_string(),
            width: widths[0],
            rows,
            taxa,
        })
    }
}

// --------------------------------------------------
/// Write the OG's selected, ungapped sequences, align them and read the
/// result back
pub fn realign(
    name: &str,
    selection: &SelectionResult,
    unaligned_dir: &Path,
    aligned_dir: &Path,
    aligner: &dyn Aligner,
) -> Result<RealignedOg> {
    if selection.is_empty() {
        bail!(ConcatError::EmptyAlignment(name.to_string()));
    }

    let unaligned = write_selection(name, selection, unaligned_dir)?;
    let aligned = aligned_dir.join(format!("{name}.fasta"));
    aligner.align(&unaligned, &aligned)?;

    let records = read_fasta(open(&aligned)?)?;
    debug!("{name}: {} aligned records", records.len());
    RealignedOg::from_records(name, selection, records)
}

// --------------------------------------------------
pub fn write_selection(
    name: &str,
    selection: &SelectionResult,
    outdir: &Path,
) -> Result<PathBuf> {
    let path = outdir.join(format!("{name}.fasta"));
    let records: Vec<_> =
        selection.selections.iter().map(|sel| sel.to_record()).collect();
    let mut output = open_for_write(&path)?;
    write_fasta(&mut output, &records)?;
    Ok(path)
}

// --------------------------------------------------
/// Per-taxon concatenation of all OGs, gap-filled where a taxon is absent
#[derive(Debug, Clone, PartialEq)]
pub struct Supermatrix {
    pub taxa: Vec<TaxonCode>,
    pub rows: HashMap<TaxonCode, String>,
    pub width: usize,
    /// (OG name, start, end) of each partition, 1-based inclusive
    pub partitions: Vec<(String, usize, usize)>,
}

impl Supermatrix {
    /// OGs are joined in the order given; taxa appear in first-seen order
    pub fn build(ogs: &[RealignedOg]) -> Result<Self> {
        let taxa: Vec<TaxonCode> = ogs
            .iter()
            .flat_map(|og| og.taxa.iter().cloned())
            .unique()
            .collect();

        let width: usize = ogs.iter().map(|og| og.width).sum();
        let mut rows: HashMap<TaxonCode, String> = taxa
            .iter()
            .map(|taxon| (taxon.clone(), String::with_capacity(width)))
            .collect();

        let mut partitions = vec![];
        let mut start = 1;
        for og in ogs {
            let gaps = GAP.to_string().repeat(og.width);
            for taxon in &taxa {
                if let Some(row) = rows.get_mut(taxon) {
                    row.push_str(og.rows.get(taxon).unwrap_or(&gaps));
                }
            }
            partitions.push((og.name.clone(), start, start + og.width - 1));
            start += og.width;
        }

        for taxon in &taxa {
            let found = rows.get(taxon).map_or(0, |row| row.chars().count());
            if found != width {
                bail!(ConcatError::Width {
                    taxon: taxon.to_string(),
                    expected: width,
                    found,
                });
            }
        }

        Ok(Supermatrix {
            taxa,
            rows,
            width,
            partitions,
        })
    }

    pub fn records(&self) -> Vec<FastaRecord> {
        self.taxa
            .iter()
            .map(|taxon| {
                FastaRecord::new(
                    taxon.as_str(),
                    self.rows.get(taxon).cloned().unwrap_or_default(),
                )
            })
            .collect()
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut output = open_for_write(path)?;
        write_fasta(&mut output, &self.records())?;
        info!(
            r#"Wrote {} taxa x {} positions to "{}""#,
            self.taxa.len(),
            self.width,
            path.display()
        );
        Ok(())
    }

    /// RAxML-style partition file for the per-OG blocks
    pub fn write_partitions(&self, path: &Path, model: &str) -> Result<()> {
        let mut output = open_for_write(path)?;
        for (name, start, end) in &self.partitions {
            writeln!(output, "{model}, {name} = {start}-{end}")?;
        }
        Ok(())
    }
}
