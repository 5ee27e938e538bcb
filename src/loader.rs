//! Hit loaders: one interface over hits read from a local file and hits
//! fetched from a readdb server.

use crate::chroms::ChromosomeMap;
use crate::client::{Client, ClientConfig};
use crate::error::{ReadDbError, Result};
use crate::hits::{HitLine, SingleHit, Strand};
use crate::import::open_text;
use crate::protocol::RegionQuery;
use log::{debug, info};
use rustc_hash::FxHashMap;
use std::io::BufRead;
use std::path::PathBuf;

pub trait HitLoader {
    /// Hits with their 5' end in `[start, end]`, ordered by position.
    fn load_hits(
        &mut self,
        chrom: i32,
        start: i32,
        end: i32,
        strand: Option<Strand>,
    ) -> Result<Vec<SingleHit>>;

    fn count_hits(&mut self, chrom: i32, start: i32, end: i32, strand: Option<Strand>) -> Result<u64> {
        Ok(self.load_hits(chrom, start, end, strand)?.len() as u64)
    }

    fn sum_weights(&mut self, chrom: i32, start: i32, end: i32, strand: Option<Strand>) -> Result<f64> {
        Ok(self
            .load_hits(chrom, start, end, strand)?
            .iter()
            .map(|h| h.weight as f64)
            .sum())
    }

    /// Most common read length among the hits seen so far.
    fn read_len(&self) -> Option<i32>;
}

fn most_common(lengths: &FxHashMap<i32, u64>) -> Option<i32> {
    lengths
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        .map(|(&len, _)| len)
}

/// All single hits of a canonical hit file, held in memory per chromosome.
#[derive(Debug, Default)]
pub struct FileHitLoader {
    by_chrom: FxHashMap<i32, Vec<SingleHit>>,
    lengths: FxHashMap<i32, u64>,
}

impl FileHitLoader {
    pub fn from_hits<I: IntoIterator<Item = SingleHit>>(hits: I) -> Self {
        let mut loader = FileHitLoader::default();
        for hit in hits {
            *loader.lengths.entry(hit.length).or_insert(0) += 1;
            loader.by_chrom.entry(hit.chrom).or_default().push(hit);
        }
        for hits in loader.by_chrom.values_mut() {
            hits.sort_by(|a, b| a.cmp_position(b));
        }
        loader
    }

    /// Read the single lines of a hit file. Paired lines are ignored.
    pub fn from_file(path: &str, chroms: &ChromosomeMap) -> Result<Self> {
        let reader = open_text(path)?;
        let mut hits = Vec::new();
        let mut paired = 0usize;
        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim_end_matches('\r');
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match HitLine::parse(line, chroms) {
                Ok(HitLine::Single(hit)) => hits.push(hit),
                Ok(HitLine::Paired(_)) => paired += 1,
                Err(e) => {
                    return Err(ReadDbError::Parse(format!(
                        "{} line {}: {}",
                        path,
                        line_num + 1,
                        e
                    )))
                }
            }
        }
        if paired > 0 {
            debug!("Ignored {} paired lines in {}", paired, path);
        }
        info!("Loaded {} hits from {}", hits.len(), path);
        Ok(Self::from_hits(hits))
    }

    pub fn len(&self) -> usize {
        self.by_chrom.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HitLoader for FileHitLoader {
    fn load_hits(
        &mut self,
        chrom: i32,
        start: i32,
        end: i32,
        strand: Option<Strand>,
    ) -> Result<Vec<SingleHit>> {
        let Some(hits) = self.by_chrom.get(&chrom) else {
            return Ok(Vec::new());
        };
        let lo = hits.partition_point(|h| h.pos < start);
        let hi = hits.partition_point(|h| h.pos <= end);
        Ok(hits[lo..hi.max(lo)]
            .iter()
            .filter(|h| h.strand.matches(strand))
            .copied()
            .collect())
    }

    fn read_len(&self) -> Option<i32> {
        most_common(&self.lengths)
    }
}

/// Hits of one or more alignments on a readdb server.
pub struct ReadDbHitLoader {
    client: Client,
    alignments: Vec<String>,
    lengths: FxHashMap<i32, u64>,
}

impl ReadDbHitLoader {
    pub fn new(client: Client, alignments: Vec<String>) -> Result<Self> {
        if alignments.is_empty() {
            return Err(ReadDbError::InvalidArgument(
                "at least one alignment is required".to_string(),
            ));
        }
        Ok(ReadDbHitLoader {
            client,
            alignments,
            lengths: FxHashMap::default(),
        })
    }

    /// Check the alignment list, then connect.
    pub fn connect(config: &ClientConfig, alignments: &[String]) -> Result<Self> {
        if alignments.is_empty() {
            return Err(ReadDbError::InvalidArgument(
                "at least one alignment is required".to_string(),
            ));
        }
        Self::new(Client::connect(config.clone())?, alignments.to_vec())
    }

    pub fn client(&mut self) -> &mut Client {
        &mut self.client
    }

    fn region(&self, chrom: i32, start: i32, end: i32, strand: Option<Strand>) -> RegionQuery {
        RegionQuery::new(self.alignments.clone(), chrom, start, end).with_strand(strand)
    }
}

impl HitLoader for ReadDbHitLoader {
    fn load_hits(
        &mut self,
        chrom: i32,
        start: i32,
        end: i32,
        strand: Option<Strand>,
    ) -> Result<Vec<SingleHit>> {
        let region = self.region(chrom, start, end, strand);
        let hits = self.client.single_hits(&region)?;
        for hit in &hits {
            *self.lengths.entry(hit.length).or_insert(0) += 1;
        }
        Ok(hits)
    }

    fn count_hits(&mut self, chrom: i32, start: i32, end: i32, strand: Option<Strand>) -> Result<u64> {
        let region = self.region(chrom, start, end, strand);
        self.client.count(&region, false)
    }

    fn sum_weights(&mut self, chrom: i32, start: i32, end: i32, strand: Option<Strand>) -> Result<f64> {
        let region = self.region(chrom, start, end, strand);
        self.client.weight(&region, false)
    }

    fn read_len(&self) -> Option<i32> {
        most_common(&self.lengths)
    }
}

/// Where hits come from.
#[derive(Debug, Clone)]
pub enum LoaderConfig {
    File { path: PathBuf },
    ReadDb { client: ClientConfig, alignments: Vec<String> },
}

pub enum HitSource {
    File(FileHitLoader),
    ReadDb(ReadDbHitLoader),
}

impl HitSource {
    pub fn open(config: &LoaderConfig, chroms: &ChromosomeMap) -> Result<Self> {
        match config {
            LoaderConfig::File { path } => Ok(HitSource::File(FileHitLoader::from_file(
                &path.to_string_lossy(),
                chroms,
            )?)),
            LoaderConfig::ReadDb { client, alignments } => Ok(HitSource::ReadDb(
                ReadDbHitLoader::connect(client, alignments)?,
            )),
        }
    }

    fn loader(&mut self) -> &mut dyn HitLoader {
        match self {
            HitSource::File(loader) => loader,
            HitSource::ReadDb(loader) => loader,
        }
    }
}

impl HitLoader for HitSource {
    fn load_hits(
        &mut self,
        chrom: i32,
        start: i32,
        end: i32,
        strand: Option<Strand>,
    ) -> Result<Vec<SingleHit>> {
        self.loader().load_hits(chrom, start, end, strand)
    }

    fn count_hits(&mut self, chrom: i32, start: i32, end: i32, strand: Option<Strand>) -> Result<u64> {
        self.loader().count_hits(chrom, start, end, strand)
    }

    fn sum_weights(&mut self, chrom: i32, start: i32, end: i32, strand: Option<Strand>) -> Result<f64> {
        self.loader().sum_weights(chrom, start, end, strand)
    }

    fn read_len(&self) -> Option<i32> {
        match self {
            HitSource::File(loader) => loader.read_len(),
            HitSource::ReadDb(loader) => loader.read_len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_file_loader_range_and_strand() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# hits").unwrap();
        writeln!(file, "chr1\t200\t+\t36\t1").unwrap();
        writeln!(file, "chr1\t100\t-\t36\t0.5").unwrap();
        writeln!(file, "chr1\t150\t+\t30\t1").unwrap();
        writeln!(file, "chr2\t100\t+\t36\t1").unwrap();
        writeln!(file, "chr1\t100\t+\t36\tchr1\t300\t-\t36\t1\t1").unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let mut loader = FileHitLoader::from_file(&path, &ChromosomeMap::new()).unwrap();
        assert_eq!(loader.len(), 4);
        let hits = loader.load_hits(1, 100, 199, None).unwrap();
        assert_eq!(hits.iter().map(|h| h.pos).collect::<Vec<_>>(), vec![100, 150]);
        assert_eq!(loader.count_hits(1, 1, 1000, Some(Strand::Plus)).unwrap(), 2);
        assert!((loader.sum_weights(1, 1, 1000, None).unwrap() - 2.5).abs() < 1e-9);
        assert!(loader.load_hits(7, 1, 1000, None).unwrap().is_empty());
        assert_eq!(loader.read_len(), Some(36));
    }

    #[test]
    fn test_file_loader_reports_bad_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "chr1\t200\t?\t36\t1").unwrap();
        let path = file.path().to_string_lossy().into_owned();
        assert!(matches!(
            FileHitLoader::from_file(&path, &ChromosomeMap::new()),
            Err(ReadDbError::Parse(_))
        ));
    }

    #[test]
    fn test_hit_source_dispatch() {
        let loader = FileHitLoader::from_hits(vec![SingleHit::new(1, 10, Strand::Plus, 25, 1.0)]);
        let mut source = HitSource::File(loader);
        assert_eq!(source.count_hits(1, 1, 20, None).unwrap(), 1);
        assert_eq!(source.read_len(), Some(25));

        let config = LoaderConfig::ReadDb {
            client: ClientConfig::default(),
            alignments: vec![],
        };
        assert!(matches!(
            HitSource::open(&config, &ChromosomeMap::new()),
            Err(ReadDbError::InvalidArgument(_))
        ));
    }
}
