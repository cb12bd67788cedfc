use anyhow::{anyhow, bail, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fs,
    path::Path,
    sync::OnceLock,
};
use thiserror::Error;

/// Length of the taxon-sample code that prefixes every sequence id
pub const TAXON_CODE_LEN: usize = 10;

const MAJOR_LEN: usize = 2;
const MINOR_LEN: usize = 5;

#[derive(Debug, Error, PartialEq)]
pub enum TaxonError {
    #[error(
        r#"Sequence ID "{0}" is shorter than the {TAXON_CODE_LEN}-character taxon code"#
    )]
    TooShort(String),

    #[error(r#"Sequence ID "{0}" has a non-ASCII taxon code"#)]
    NotAscii(String),

    #[error(
        r#"Sequence ID "{0}" does not look like "Mj_mi_Samp" (expected "_" at positions 3 and 6)"#
    )]
    BadSeparators(String),
}

// --------------------------------------------------
/// The 10-character taxon-sample code, e.g. `Sr_ci_Scer`.
/// The first 2 characters name the major clade, the first 5 the minor clade.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaxonCode(String);

impl TaxonCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn major(&self) -> &str {
        &self.0[..MAJOR_LEN]
    }

    pub fn minor(&self) -> &str {
        &self.0[..MINOR_LEN]
    }
}

impl fmt::Display for TaxonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// --------------------------------------------------
/// A full sequence id together with its validated taxon code
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeqId {
    id: String,
    code: TaxonCode,
}

impl SeqId {
    pub fn parse(id: &str) -> Result<Self, TaxonError> {
        let id = id.trim();
        let prefix = id
            .get(..TAXON_CODE_LEN)
            .ok_or_else(|| {
                if id.chars().count() < TAXON_CODE_LEN {
                    TaxonError::TooShort(id.to_string())
                } else {
                    TaxonError::NotAscii(id.to_string())
                }
            })?;

        if !prefix.is_ascii() {
            return Err(TaxonError::NotAscii(id.to_string()));
        }

        let bytes = prefix.as_bytes();
        if bytes[MAJOR_LEN] != b'_' || bytes[MINOR_LEN] != b'_' {
            return Err(TaxonError::BadSeparators(id.to_string()));
        }

        Ok(SeqId {
            id: id.to_string(),
            code: TaxonCode(prefix.to_string()),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }

    pub fn code(&self) -> &TaxonCode {
        &self.code
    }

    /// Per-sequence text after the taxon code, e.g. `_NODE_1_Cov12.5_len900`
    pub fn suffix(&self) -> &str {
        &self.id[TAXON_CODE_LEN..]
    }
}

impl fmt::Display for SeqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

// --------------------------------------------------
/// A taxonomic group used for clade detection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaxonGroup {
    Major(String),
    Minor(String),
}

impl TaxonGroup {
    /// Codes shorter than the minor-clade prefix select the major clade
    pub fn from_target(code: &str) -> Self {
        if code.len() < MINOR_LEN {
            TaxonGroup::Major(code[..MAJOR_LEN].to_string())
        } else {
            TaxonGroup::Minor(code[..MINOR_LEN].to_string())
        }
    }

    pub fn code(&self) -> &str {
        match self {
            TaxonGroup::Major(code) | TaxonGroup::Minor(code) => code,
        }
    }

    pub fn contains(&self, taxon: &TaxonCode) -> bool {
        match self {
            TaxonGroup::Major(code) => taxon.major() == code,
            TaxonGroup::Minor(code) => taxon.minor() == code,
        }
    }
}

// --------------------------------------------------
/// Which taxa take part in selection
#[derive(Debug, Clone, PartialEq)]
pub enum Targets {
    /// Every taxon-sample code present in the tree
    All,
    /// Complete or partial taxon codes, matched as id prefixes
    Codes(Vec<String>),
}

impl Targets {
    /// Resolve the `--targets` argument: a file of codes, inline
    /// comma-separated codes, or nothing.
    pub fn resolve(arg: Option<&str>) -> Result<Self> {
        let Some(arg) = arg.map(str::trim) else {
            return Ok(Targets::All);
        };

        let path = Path::new(arg);
        let codes: Vec<String> = if path.is_file() {
            fs::read_to_string(path)
                .map_err(|e| anyhow!("Cannot read {}: {e}", path.display()))?
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from)
                .collect()
        } else if arg.ends_with(".txt") {
            bail!(r#"Target taxa file "{arg}" does not exist"#);
        } else {
            arg.split(',')
                .map(str::trim)
                .filter(|code| !code.is_empty())
                .map(String::from)
                .collect()
        };

        if codes.is_empty() {
            bail!(r#"No target taxa found in "{arg}""#);
        }

        let bad: Vec<_> = codes
            .iter()
            .filter(|code| !is_valid_code(code))
            .map(String::as_str)
            .collect();
        if !bad.is_empty() {
            bail!(
                "Invalid target taxa: {}. Give complete or partial taxon \
                codes (e.g. Sr_ci_S or Am_tu) inline separated by commas, \
                or a .txt file with one code per line.",
                bad.join(", ")
            );
        }

        Ok(Targets::Codes(codes))
    }

    pub fn includes(&self, id: &SeqId) -> bool {
        match self {
            Targets::All => true,
            Targets::Codes(codes) => {
                codes.iter().any(|code| id.as_str().starts_with(code.as_str()))
            }
        }
    }

    /// Groups for clade detection, unique and in first-seen order
    pub fn groups<'a>(
        &self,
        leaves: impl IntoIterator<Item = &'a SeqId>,
    ) -> Vec<TaxonGroup> {
        let mut groups: Vec<TaxonGroup> = vec![];
        let mut push = |group: TaxonGroup| {
            if !groups.contains(&group) {
                groups.push(group);
            }
        };

        match self {
            Targets::All => {
                for leaf in leaves {
                    push(TaxonGroup::from_target(leaf.code().as_str()));
                }
            }
            Targets::Codes(codes) => {
                for code in codes {
                    push(TaxonGroup::from_target(code));
                }
            }
        }

        groups
    }
}

fn is_valid_code(code: &str) -> bool {
    code.len() >= MAJOR_LEN
        && code.len() <= TAXON_CODE_LEN
        && code.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// --------------------------------------------------
/// Supplies an optional weight for a candidate sequence.
/// A candidate set is weighted only when every member has a weight.
pub trait CoverageStrategy: Send + Sync {
    fn weight(&self, id: &SeqId) -> Option<f64>;
}

/// Reads k-mer coverage written by rnaSPAdes, e.g. `..._Cov12.5_len900`
#[derive(Debug, Default)]
pub struct SpadesCoverage;

impl CoverageStrategy for SpadesCoverage {
    fn weight(&self, id: &SeqId) -> Option<f64> {
        static COV: OnceLock<Regex> = OnceLock::new();
        let re = COV.get_or_init(|| {
            Regex::new(r"Cov(\d+(?:\.\d+)?(?:[eE][-+]?\d+)?)_").unwrap()
        });

        re.captures_iter(id.suffix())
            .last()
            .and_then(|caps| caps[1].parse().ok())
    }
}

/// Scores by ungapped length alone
#[derive(Debug, Default)]
pub struct LengthOnly;

impl CoverageStrategy for LengthOnly {
    fn weight(&self, _id: &SeqId) -> Option<f64> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scoring {
    #[default]
    Coverage,
    Length,
}

impl Scoring {
    pub fn strategy(&self) -> Box<dyn CoverageStrategy> {
        match self {
            Scoring::Coverage => Box::new(SpadesCoverage),
            Scoring::Length => Box::new(LengthOnly),
        }
    }
}

// --------------------------------------------------
#[cfg(test)]
mod tests {
    use super::{
        CoverageStrategy, LengthOnly, SeqId, SpadesCoverage, TaxonError,
        TaxonGroup, Targets,
    };
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use std::{fs, io::Write};
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_parse_seq_id() -> Result<()> {
        let id = SeqId::parse("Sr_ci_Scer_NODE_1_Cov4.5_len300")?;
        assert_eq!(id.code().as_str(), "Sr_ci_Scer");
        assert_eq!(id.code().major(), "Sr");
        assert_eq!(id.code().minor(), "Sr_ci");
        assert_eq!(id.suffix(), "_NODE_1_Cov4.5_len300");

        // A bare taxon code is a valid id
        let id = SeqId::parse("Am_tu_K1ab")?;
        assert_eq!(id.suffix(), "");
        Ok(())
    }

    #[test]
    fn test_parse_seq_id_errors() {
        assert_eq!(
            SeqId::parse("Sr_ci"),
            Err(TaxonError::TooShort("Sr_ci".to_string()))
        );
        assert_eq!(
            SeqId::parse("Srxci_Scer_1"),
            Err(TaxonError::BadSeparators("Srxci_Scer_1".to_string()))
        );
        assert_eq!(
            SeqId::parse("Sr_ci_Scé_1"),
            Err(TaxonError::NotAscii("Sr_ci_Scé_1".to_string()))
        );
    }

    #[test]
    fn test_taxon_group() -> Result<()> {
        let id = SeqId::parse("Sr_ci_Scer_1")?;
        assert_eq!(TaxonGroup::from_target("Sr"), TaxonGroup::Major("Sr".into()));
        assert_eq!(
            TaxonGroup::from_target("Sr_c"),
            TaxonGroup::Major("Sr".into())
        );
        assert_eq!(
            TaxonGroup::from_target("Sr_ci_S"),
            TaxonGroup::Minor("Sr_ci".into())
        );
        assert!(TaxonGroup::from_target("Sr").contains(id.code()));
        assert!(TaxonGroup::from_target("Sr_ci").contains(id.code()));
        assert!(!TaxonGroup::from_target("Sr_rh").contains(id.code()));
        Ok(())
    }

    #[test]
    fn test_targets_inline() -> Result<()> {
        assert_eq!(Targets::resolve(None)?, Targets::All);
        assert_eq!(
            Targets::resolve(Some("Sr_ci_S, Am_tu"))?,
            Targets::Codes(vec!["Sr_ci_S".into(), "Am_tu".into()])
        );

        let targets = Targets::resolve(Some("Am_tu"))?;
        assert!(targets.includes(&SeqId::parse("Am_tu_K1ab_1")?));
        assert!(!targets.includes(&SeqId::parse("Am_tb_K1ab_1")?));
        Ok(())
    }

    #[test]
    fn test_targets_file() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "Sr_ci_Scer\n\nOp_me\n")?;
        let path = file.path().to_string_lossy().to_string();
        assert_eq!(
            Targets::resolve(Some(&path))?,
            Targets::Codes(vec!["Sr_ci_Scer".into(), "Op_me".into()])
        );
        Ok(())
    }

    #[test]
    fn test_targets_errors() -> Result<()> {
        let res = Targets::resolve(Some("missing.txt"));
        assert!(res.is_err());
        assert_eq!(
            res.unwrap_err().to_string(),
            r#"Target taxa file "missing.txt" does not exist"#
        );

        let res = Targets::resolve(Some("S,Am/tu"));
        assert!(res.is_err());
        assert!(res
            .unwrap_err()
            .to_string()
            .starts_with("Invalid target taxa: S, Am/tu."));

        let dir = tempdir()?;
        let empty = dir.path().join("empty.txt");
        fs::write(&empty, "\n\n")?;
        assert!(Targets::resolve(Some(&empty.to_string_lossy())).is_err());
        Ok(())
    }

    #[test]
    fn test_groups() -> Result<()> {
        let leaves = vec![
            SeqId::parse("Sr_ci_Scer_1")?,
            SeqId::parse("Sr_ci_Sbay_1")?,
            SeqId::parse("Op_me_Hsap_1")?,
        ];
        assert_eq!(
            Targets::All.groups(&leaves),
            vec![
                TaxonGroup::Minor("Sr_ci".into()),
                TaxonGroup::Minor("Op_me".into())
            ]
        );

        let targets = Targets::Codes(vec!["Op".into(), "Sr_ci_S".into()]);
        assert_eq!(
            targets.groups(&leaves),
            vec![
                TaxonGroup::Major("Op".into()),
                TaxonGroup::Minor("Sr_ci".into())
            ]
        );
        Ok(())
    }

    #[test]
    fn test_coverage() -> Result<()> {
        let cov = SpadesCoverage;
        let id = SeqId::parse("Sr_ci_Scer_NODE_1_length_300_Cov0.8_x")?;
        assert_eq!(cov.weight(&id), Some(0.8));

        // The last annotation wins
        let id = SeqId::parse("Sr_ci_Scer_Cov2_Cov12.5_len900")?;
        assert_eq!(cov.weight(&id), Some(12.5));

        let id = SeqId::parse("Sr_ci_Scer_NODE_1")?;
        assert_eq!(cov.weight(&id), None);

        // No trailing field after the value
        let id = SeqId::parse("Sr_ci_Scer_Cov3")?;
        assert_eq!(cov.weight(&id), None);

        assert_eq!(LengthOnly.weight(&SeqId::parse("Sr_ci_Scer_Cov3_x")?), None);
        Ok(())
    }
}
