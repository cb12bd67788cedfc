use crate::{reroot::default_outgroups, taxon::Scoring};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Settings read from an optional TOML file. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Priority-ordered groups of major-clade codes tried as outgroups
    pub outgroups: Vec<Vec<String>>,

    /// How candidates outside a deciding clade are scored
    pub scoring: Scoring,

    /// Parallel OG workers for tree work and selection
    pub jobs: usize,

    pub aligner: AlignerConfig,

    /// Substitution model written to the partition file
    pub partition_model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlignerConfig {
    pub program: String,
    pub args: Vec<String>,

    /// Aligner processes allowed to run at once
    pub jobs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            outgroups: default_outgroups(),
            scoring: Scoring::default(),
            jobs: num_cpus::get(),
            aligner: AlignerConfig::default(),
            partition_model: "LG".to_string(),
        }
    }
}

impl Default for AlignerConfig {
    fn default() -> Self {
        AlignerConfig {
            program: "mafft".to_string(),
            args: vec!["--auto".to_string(), "--quiet".to_string()],
            jobs: (num_cpus::get() / 4).max(1),
        }
    }
}

impl Config {
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| anyhow!("Cannot read {}: {e}", path.display()))?;
        toml::from_str(&text)
            .map_err(|e| anyhow!("Bad config {}: {e}", path.display()))
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_path(path),
            _ => Ok(Self::default()),
        }
    }
}

// --------------------------------------------------
#[cfg(test)]
mod tests {
    use super::Config;
    use crate::taxon::Scoring;
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.outgroups[0], vec!["Ba", "Za"]);
        assert_eq!(config.outgroups.len(), 6);
        assert_eq!(config.scoring, Scoring::Coverage);
        assert_eq!(config.aligner.program, "mafft");
        assert!(config.jobs > 0);
        assert!(config.aligner.jobs > 0);
    }

    #[test]
    fn test_from_path() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("ogconcat.toml");
        fs::write(
            &path,
            r#"
scoring = "length"
outgroups = [["Op"], ["Am"]]

[aligner]
program = "cat"
args = []
jobs = 2
"#,
        )?;
        let config = Config::load(Some(&path))?;
        assert_eq!(config.scoring, Scoring::Length);
        assert_eq!(config.outgroups, vec![vec!["Op"], vec!["Am"]]);
        assert_eq!(config.aligner.program, "cat");
        assert!(config.aligner.args.is_empty());
        assert_eq!(config.aligner.jobs, 2);
        assert_eq!(config.partition_model, "LG");

        fs::write(&path, "threads = 4\n")?;
        assert!(Config::load(Some(&path)).is_err());
        Ok(())
    }
}
