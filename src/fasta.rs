use anyhow::{anyhow, Result};
use kseq::parse_reader;
use std::{
    collections::HashMap,
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::Path,
};

pub const GAP: char = '-';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastaRecord {
    pub id: String,
    pub seq: String,
}

impl FastaRecord {
    pub fn new(id: impl Into<String>, seq: impl Into<String>) -> Self {
        FastaRecord {
            id: id.into(),
            seq: seq.into(),
        }
    }

    pub fn ungapped(&self) -> String {
        self.seq.chars().filter(|&c| c != GAP).collect()
    }

    pub fn ungapped_len(&self) -> usize {
        self.seq.chars().filter(|&c| c != GAP).count()
    }
}

// --------------------------------------------------
/// One OG's input alignment, read-only after loading
#[derive(Debug, Default)]
pub struct Alignment {
    records: Vec<FastaRecord>,
    index: HashMap<String, usize>,
}

impl Alignment {
    pub fn from_records(records: Vec<FastaRecord>) -> Self {
        let index = records
            .iter()
            .enumerate()
            .map(|(i, rec)| (rec.id.clone(), i))
            .collect();
        Alignment { records, index }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        Ok(Self::from_records(read_fasta(open(path)?)?))
    }

    pub fn get(&self, id: &str) -> Option<&FastaRecord> {
        self.index.get(id).map(|&i| &self.records[i])
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// --------------------------------------------------
pub fn read_fasta(input: Box<dyn BufRead>) -> Result<Vec<FastaRecord>> {
    let mut reader = parse_reader(input)?;
    let mut records = vec![];
    while let Some(rec) = reader.iter_record()? {
        records.push(FastaRecord::new(rec.head(), rec.seq()));
    }
    Ok(records)
}

// --------------------------------------------------
pub fn write_fasta<'a>(
    output: &mut impl Write,
    records: impl IntoIterator<Item = &'a FastaRecord>,
) -> Result<()> {
    for rec in records {
        writeln!(output, ">{}\n{}", rec.id, rec.seq)?;
    }
    Ok(())
}

// --------------------------------------------------
pub fn open(filename: &Path) -> Result<Box<dyn BufRead>> {
    Ok(Box::new(BufReader::new(File::open(filename).map_err(
        |e| anyhow!("Cannot read {}: {e}", filename.display()),
    )?)))
}

// --------------------------------------------------
pub fn open_for_write(filename: &Path) -> Result<Box<dyn Write>> {
    Ok(Box::new(BufWriter::new(File::create(filename).map_err(
        |e| anyhow!("Cannot write {}: {e}", filename.display()),
    )?)))
}

// --------------------------------------------------
#[cfg(test)]
mod tests {
    use super::{open, open_for_write, read_fasta, write_fasta, Alignment, FastaRecord};
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use std::{fs, io::Cursor};
    use tempfile::tempdir;

    #[test]
    fn test_read_multiline() -> Result<()> {
        let text = ">Sr_ci_Scer_1 some description\nMK--L\nAV\n>Op_me_Hsap_1\n-MKLAV-\n";
        let records = read_fasta(Box::new(Cursor::new(text.as_bytes().to_vec())))?;
        assert_eq!(
            records,
            vec![
                FastaRecord::new("Sr_ci_Scer_1", "MK--LAV"),
                FastaRecord::new("Op_me_Hsap_1", "-MKLAV-"),
            ]
        );
        assert_eq!(records[0].ungapped(), "MKLAV");
        assert_eq!(records[1].ungapped_len(), 5);
        Ok(())
    }

    #[test]
    fn test_write_then_read() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("out.fasta");
        let records = vec![
            FastaRecord::new("Am_tu_K1ab_Cov2.5_x", "--MKV-L"),
            FastaRecord::new("Sr_ci_Scer_1", "AMKVQL-"),
        ];
        {
            let mut output = open_for_write(&path)?;
            write_fasta(&mut output, &records)?;
        }
        assert_eq!(
            fs::read_to_string(&path)?,
            ">Am_tu_K1ab_Cov2.5_x\n--MKV-L\n>Sr_ci_Scer_1\nAMKVQL-\n"
        );
        assert_eq!(read_fasta(open(&path)?)?, records);
        Ok(())
    }

    #[test]
    fn test_alignment_lookup() -> Result<()> {
        let aln = Alignment::from_records(vec![
            FastaRecord::new("a", "AC-"),
            FastaRecord::new("b", "A-G"),
        ]);
        assert_eq!(aln.len(), 2);
        assert_eq!(aln.get("b").map(|r| r.seq.as_str()), Some("A-G"));
        assert_eq!(aln.get("c"), None);
        Ok(())
    }
}
