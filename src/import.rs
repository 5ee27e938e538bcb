//! Conversion of aligner output into canonical hit lines.
//!
//! Every input format is reduced to [`AlignedRead`]s, which a [`Converter`]
//! turns into single, paired and junction lines depending on the selected
//! [`ImportModes`]. Records that cannot be used are counted, never fatal.

use crate::chroms::ChromosomeMap;
use crate::error::{ReadDbError, Result};
use crate::hits::{ParseErr, PairedHit, SingleHit, Strand, CODE_JUNCTION, CODE_MATE_PAIR};
use log::{debug, error, info, warn};
use noodles::bgzf;
use rust_htslib::bam::{self, record::Aux, Read as BamRead};
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Sam,
    Bam,
    Eland,
    Bowtie,
}

impl std::str::FromStr for InputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sam" => Ok(InputFormat::Sam),
            "bam" => Ok(InputFormat::Bam),
            "eland" => Ok(InputFormat::Eland),
            "bowtie" => Ok(InputFormat::Bowtie),
            _ => Err(format!(
                "unknown input format '{}' (sam, bam, eland, bowtie)",
                s
            )),
        }
    }
}

/// Which kinds of lines to emit. Any combination is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportModes {
    pub single: bool,
    pub paired: bool,
    pub junctions: bool,
}

impl Default for ImportModes {
    fn default() -> Self {
        ImportModes {
            single: true,
            paired: false,
            junctions: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub format: InputFormat,
    pub modes: ImportModes,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub records: u64,
    pub emitted: u64,
    pub skipped_unmapped: u64,
    pub skipped_malformed: u64,
    /// Paired reads whose mate never showed up.
    pub unmatched_mates: u64,
}

impl ImportSummary {
    pub fn skipped(&self) -> u64 {
        self.skipped_unmapped + self.skipped_malformed
    }

    pub fn log(&self, source: &str) {
        if self.skipped() > 0 || self.unmatched_mates > 0 {
            error!(
                "{}: {} records, {} lines emitted, skipped {} unmapped and {} malformed, {} unmatched mates",
                source,
                self.records,
                self.emitted,
                self.skipped_unmapped,
                self.skipped_malformed,
                self.unmatched_mates
            );
        } else {
            info!(
                "{}: {} records, {} lines emitted",
                source, self.records, self.emitted
            );
        }
    }
}

/// Where a read's mate aligned, as reported on the read itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MateInfo {
    pub chrom: String,
    /// 1-based leftmost position.
    pub start: i32,
}

/// One alignment, independent of the input format.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedRead {
    pub name: String,
    pub chrom: String,
    /// 1-based leftmost reference position.
    pub start: i32,
    pub strand: Strand,
    /// Reference blocks (1-based, inclusive), split at `N` operations.
    pub blocks: Vec<(i32, i32)>,
    pub read_len: i32,
    /// Number of places the read aligned to.
    pub multiplicity: u32,
    pub mate: Option<MateInfo>,
}

impl AlignedRead {
    fn weight(&self) -> f32 {
        1.0 / self.multiplicity.max(1) as f32
    }

    // 5' end of a block on the read's strand.
    fn five_prime(&self, (first, last): (i32, i32)) -> i32 {
        match self.strand {
            Strand::Plus => first,
            Strand::Minus => last,
        }
    }

    fn span(&self) -> (i32, i32) {
        let first = self.blocks.first().map_or(self.start, |b| b.0);
        let last = self.blocks.last().map_or(self.start, |b| b.1);
        (first, last)
    }
}

/// Parse a CIGAR string into `(operation, length)` pairs.
pub fn parse_cigar(cigar: &str) -> std::result::Result<Vec<(char, u32)>, ParseErr> {
    let mut ops = Vec::new();
    let mut len = 0u32;
    let mut have_len = false;
    for c in cigar.chars() {
        if let Some(d) = c.to_digit(10) {
            len = len
                .checked_mul(10)
                .and_then(|l| l.checked_add(d))
                .ok_or_else(|| ParseErr::InvalidFormat(format!("CIGAR length overflow in {}", cigar)))?;
            have_len = true;
        } else {
            if !have_len || !"MIDNSHP=X".contains(c) {
                return Err(ParseErr::InvalidFormat(format!("invalid CIGAR '{}'", cigar)));
            }
            ops.push((c, len));
            len = 0;
            have_len = false;
        }
    }
    if have_len || ops.is_empty() {
        return Err(ParseErr::InvalidFormat(format!("invalid CIGAR '{}'", cigar)));
    }
    Ok(ops)
}

/// Reference blocks covered by an alignment starting at `start`. `M`, `=`,
/// `X` and `D` extend the current block, `N` closes it.
pub fn cigar_blocks(start: i32, ops: &[(char, u32)]) -> Vec<(i32, i32)> {
    let mut blocks = Vec::new();
    let mut pos = start;
    let mut block_start = start;
    for &(op, len) in ops {
        let len = len as i32;
        match op {
            'M' | '=' | 'X' | 'D' => pos += len,
            'N' => {
                if pos > block_start {
                    blocks.push((block_start, pos - 1));
                }
                pos += len;
                block_start = pos;
            }
            _ => {}
        }
    }
    if pos > block_start {
        blocks.push((block_start, pos - 1));
    }
    blocks
}

/// Bases of the read itself: `M`, `I`, `S`, `=` and `X`.
pub fn cigar_read_len(ops: &[(char, u32)]) -> i32 {
    ops.iter()
        .filter(|(op, _)| matches!(op, 'M' | 'I' | 'S' | '=' | 'X'))
        .map(|&(_, len)| len as i32)
        .sum()
}

/// Merge consecutive blocks separated by less than `read_len` bases.
pub fn merge_nearby(blocks: &[(i32, i32)], read_len: i32) -> Vec<(i32, i32)> {
    let mut merged: Vec<(i32, i32)> = Vec::with_capacity(blocks.len());
    for &(first, last) in blocks {
        match merged.last_mut() {
            Some(prev) if first - prev.1 - 1 < read_len => prev.1 = prev.1.max(last),
            _ => merged.push((first, last)),
        }
    }
    merged
}

fn sam_tag_int(fields: &[&str], tag: &str) -> Option<u32> {
    fields.iter().find_map(|field| {
        let rest = field.strip_prefix(tag)?.strip_prefix(':')?;
        let (kind, value) = rest.split_once(':')?;
        match kind {
            "i" => value.parse::<u32>().ok(),
            _ => None,
        }
    })
}

/// Outcome of reducing one input record.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Aligned(AlignedRead),
    Unmapped,
}

const FLAG_PAIRED: u32 = 0x1;
const FLAG_UNMAPPED: u32 = 0x4;
const FLAG_MATE_UNMAPPED: u32 = 0x8;
const FLAG_REVERSE: u32 = 0x10;

/// Parse a SAM alignment line. Header lines are the caller's business.
pub fn parse_sam_line(line: &str) -> std::result::Result<Record, ParseErr> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < 11 {
        return Err(ParseErr::NotEnoughFields(11));
    }
    let flag: u32 = fields[1].parse().map_err(ParseErr::InvalidInt)?;
    if flag & FLAG_UNMAPPED != 0 || fields[2] == "*" || fields[5] == "*" {
        return Ok(Record::Unmapped);
    }
    let start: i32 = fields[3].parse().map_err(ParseErr::InvalidInt)?;
    if start < 1 {
        return Ok(Record::Unmapped);
    }
    let ops = parse_cigar(fields[5])?;
    let blocks = cigar_blocks(start, &ops);
    if blocks.is_empty() {
        return Err(ParseErr::InvalidFormat(format!(
            "CIGAR '{}' covers no reference bases",
            fields[5]
        )));
    }

    let mate = if flag & FLAG_PAIRED != 0 && flag & FLAG_MATE_UNMAPPED == 0 && fields[6] != "*" {
        let chrom = if fields[6] == "=" { fields[2] } else { fields[6] };
        let start: i32 = fields[7].parse().map_err(ParseErr::InvalidInt)?;
        Some(MateInfo {
            chrom: chrom.to_string(),
            start,
        })
    } else {
        None
    };

    Ok(Record::Aligned(AlignedRead {
        name: fields[0].to_string(),
        chrom: fields[2].to_string(),
        start,
        strand: if flag & FLAG_REVERSE != 0 {
            Strand::Minus
        } else {
            Strand::Plus
        },
        blocks,
        read_len: cigar_read_len(&ops),
        multiplicity: sam_tag_int(&fields[11..], "NH").unwrap_or(1).max(1),
        mate,
    }))
}

fn contiguous_read(name: &str, chrom: &str, start: i32, strand: Strand, read_len: i32, multiplicity: u32) -> AlignedRead {
    AlignedRead {
        name: name.to_string(),
        chrom: chrom.to_string(),
        start,
        strand,
        blocks: vec![(start, start + read_len - 1)],
        read_len,
        multiplicity,
        mate: None,
    }
}

/// Parse an ELAND result line: name, sequence, match code, three mismatch
/// counts, chromosome, position, strand. Only unique (`U*`) matches are used.
pub fn parse_eland_line(line: &str) -> std::result::Result<Record, ParseErr> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < 3 {
        return Err(ParseErr::NotEnoughFields(3));
    }
    if !fields[2].starts_with('U') {
        return Ok(Record::Unmapped);
    }
    if fields.len() < 9 {
        return Err(ParseErr::NotEnoughFields(9));
    }
    let chrom = fields[6]
        .trim_end_matches(".fa")
        .trim_end_matches(".fasta");
    let start: i32 = fields[7].parse().map_err(ParseErr::InvalidInt)?;
    let strand = Strand::parse(fields[8])?;
    let read_len = fields[1].len() as i32;
    if read_len == 0 {
        return Err(ParseErr::InvalidFormat("empty read sequence".to_string()));
    }
    Ok(Record::Aligned(contiguous_read(
        fields[0], chrom, start, strand, read_len, 1,
    )))
}

/// Parse a default Bowtie output line: name, strand, reference, 0-based
/// offset, sequence, qualities, number of other alignments.
pub fn parse_bowtie_line(line: &str) -> std::result::Result<Record, ParseErr> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < 7 {
        return Err(ParseErr::NotEnoughFields(7));
    }
    let strand = Strand::parse(fields[1])?;
    let offset: i32 = fields[3].parse().map_err(ParseErr::InvalidInt)?;
    let others: u32 = fields[6].parse().map_err(ParseErr::InvalidInt)?;
    let read_len = fields[4].len() as i32;
    if read_len == 0 {
        return Err(ParseErr::InvalidFormat("empty read sequence".to_string()));
    }
    // reference names often carry a description after the first space
    let chrom = fields[2].split_whitespace().next().unwrap_or(fields[2]);
    Ok(Record::Aligned(contiguous_read(
        fields[0],
        chrom,
        offset + 1,
        strand,
        read_len,
        others.saturating_add(1),
    )))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MateKey {
    name: String,
    chrom: String,
    start: i32,
    mate_chrom: String,
    mate_start: i32,
}

#[derive(Debug, Clone, Copy)]
struct PendingMate {
    chrom: i32,
    pos: i32,
    strand: Strand,
    len: i32,
    weight: f32,
}

/// Turns aligned reads into hit lines on `out`, assigning chromosome ids on the way.
pub struct Converter<W: Write> {
    modes: ImportModes,
    chroms: ChromosomeMap,
    out: W,
    pending: FxHashMap<MateKey, PendingMate>,
    summary: ImportSummary,
}

impl<W: Write> Converter<W> {
    pub fn new(modes: ImportModes, chroms: ChromosomeMap, out: W) -> Self {
        Converter {
            modes,
            chroms,
            out,
            pending: FxHashMap::default(),
            summary: ImportSummary::default(),
        }
    }

    pub fn summary(&self) -> ImportSummary {
        self.summary
    }

    pub fn chroms(&self) -> &ChromosomeMap {
        &self.chroms
    }

    /// Account for one input record, or the parse error it produced.
    pub fn push(&mut self, record: std::result::Result<Record, ParseErr>) -> Result<()> {
        self.summary.records += 1;
        match record {
            Ok(Record::Aligned(read)) => self.push_read(&read),
            Ok(Record::Unmapped) => {
                self.summary.skipped_unmapped += 1;
                Ok(())
            }
            Err(e) => {
                debug!("Skipping malformed record {}: {}", self.summary.records, e);
                self.summary.skipped_malformed += 1;
                Ok(())
            }
        }
    }

    fn push_read(&mut self, read: &AlignedRead) -> Result<()> {
        let chrom = self.chroms.get_or_insert_id(&read.chrom);
        let weight = read.weight();

        if self.modes.single {
            for block in merge_nearby(&read.blocks, read.read_len) {
                let hit = SingleHit::new(
                    chrom,
                    read.five_prime(block),
                    read.strand,
                    block.1 - block.0 + 1,
                    weight,
                );
                writeln!(self.out, "{}", hit.to_line(&self.chroms))?;
                self.summary.emitted += 1;
            }
        }

        if self.modes.junctions {
            for pair in read.blocks.windows(2) {
                let hit = PairedHit {
                    left_chrom: chrom,
                    left_pos: read.five_prime(pair[0]),
                    left_strand: read.strand,
                    left_len: pair[0].1 - pair[0].0 + 1,
                    right_chrom: chrom,
                    right_pos: read.five_prime(pair[1]),
                    right_strand: read.strand,
                    right_len: pair[1].1 - pair[1].0 + 1,
                    weight,
                    code: CODE_JUNCTION,
                };
                self.write_paired(hit)?;
            }
        }

        if self.modes.paired {
            if let Some(mate) = &read.mate {
                self.pair_mate(read, mate, chrom, weight)?;
            }
        }
        Ok(())
    }

    fn pair_mate(&mut self, read: &AlignedRead, mate: &MateInfo, chrom: i32, weight: f32) -> Result<()> {
        let span = read.span();
        let this = PendingMate {
            chrom,
            pos: read.five_prime(span),
            strand: read.strand,
            len: span.1 - span.0 + 1,
            weight,
        };
        let mate_key = MateKey {
            name: read.name.clone(),
            chrom: mate.chrom.clone(),
            start: mate.start,
            mate_chrom: read.chrom.clone(),
            mate_start: read.start,
        };
        match self.pending.remove(&mate_key) {
            Some(other) => {
                let hit = PairedHit {
                    left_chrom: other.chrom,
                    left_pos: other.pos,
                    left_strand: other.strand,
                    left_len: other.len,
                    right_chrom: this.chrom,
                    right_pos: this.pos,
                    right_strand: this.strand,
                    right_len: this.len,
                    weight: other.weight.min(this.weight),
                    code: CODE_MATE_PAIR,
                };
                self.write_paired(hit)
            }
            None => {
                let key = MateKey {
                    name: read.name.clone(),
                    chrom: read.chrom.clone(),
                    start: read.start,
                    mate_chrom: mate.chrom.clone(),
                    mate_start: mate.start,
                };
                self.pending.insert(key, this);
                Ok(())
            }
        }
    }

    fn write_paired(&mut self, hit: PairedHit) -> Result<()> {
        writeln!(self.out, "{}", hit.normalized().to_line(&self.chroms))?;
        self.summary.emitted += 1;
        Ok(())
    }

    /// Flush the output and return the summary and the chromosome map.
    pub fn finish(mut self) -> Result<(ImportSummary, ChromosomeMap)> {
        self.summary.unmatched_mates = self.pending.len() as u64;
        self.out.flush()?;
        Ok((self.summary, self.chroms))
    }
}

const BGZF_HEADER_SIZE: usize = 18;

fn is_bgzf<R: Read + Seek>(reader: &mut R) -> io::Result<bool> {
    let mut header = [0u8; BGZF_HEADER_SIZE];
    let result = match reader.read_exact(&mut header) {
        Ok(()) => Ok(header[0..2] == [0x1f, 0x8b]
            && header[3] & 0x04 != 0
            && header[12..14] == [b'B', b'C']),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    };
    reader.seek(SeekFrom::Start(0))?;
    result
}

/// Open a text input: `-` is stdin, `.gz`/`.bgz` files must be BGZF.
pub fn open_text(path: &str) -> io::Result<Box<dyn BufRead>> {
    if path == "-" {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    let mut file = File::open(path)
        .map_err(|e| io::Error::new(e.kind(), format!("Failed to open '{}': {}", path, e)))?;
    if [".gz", ".bgz"].iter().any(|e| path.ends_with(e)) {
        if !is_bgzf(&mut file)? {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "'{}' is regular gzip, not BGZF. Convert with: zcat '{}' | bgzip > out.gz",
                    path, path
                ),
            ));
        }
        Ok(Box::new(BufReader::new(bgzf::io::Reader::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Convert a text input (SAM, ELAND or Bowtie) line by line.
pub fn convert_text<R: BufRead, W: Write>(
    reader: R,
    format: InputFormat,
    converter: &mut Converter<W>,
) -> Result<()> {
    let parse: fn(&str) -> std::result::Result<Record, ParseErr> = match format {
        InputFormat::Sam => parse_sam_line,
        InputFormat::Eland => parse_eland_line,
        InputFormat::Bowtie => parse_bowtie_line,
        InputFormat::Bam => {
            return Err(ReadDbError::InvalidArgument(
                "BAM input must be read from a file".to_string(),
            ))
        }
    };
    for line in reader.lines() {
        let line = line?;
        let line = line.trim_end_matches('\r');
        if line.is_empty() || (format == InputFormat::Sam && line.starts_with('@')) {
            continue;
        }
        converter.push(parse(line))?;
    }
    Ok(())
}

fn bam_multiplicity(record: &bam::Record) -> u32 {
    let value = match record.aux(b"NH") {
        Ok(Aux::U8(v)) => v as i64,
        Ok(Aux::I8(v)) => v as i64,
        Ok(Aux::U16(v)) => v as i64,
        Ok(Aux::I16(v)) => v as i64,
        Ok(Aux::U32(v)) => v as i64,
        Ok(Aux::I32(v)) => v as i64,
        _ => 1,
    };
    value.clamp(1, u32::MAX as i64) as u32
}

fn tid_name(header: &bam::HeaderView, tid: i32) -> String {
    String::from_utf8_lossy(header.tid2name(tid as u32)).into_owned()
}

/// Convert a BAM file through htslib.
pub fn convert_bam<W: Write>(path: &str, converter: &mut Converter<W>) -> Result<()> {
    let mut reader = bam::Reader::from_path(path)
        .map_err(|e| ReadDbError::Parse(format!("Failed to open BAM '{}': {}", path, e)))?;
    let header = reader.header().clone();
    for result in reader.records() {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                converter.push(Err(ParseErr::InvalidFormat(e.to_string())))?;
                continue;
            }
        };
        if record.is_unmapped() || record.tid() < 0 {
            converter.push(Ok(Record::Unmapped))?;
            continue;
        }
        let ops: Vec<(char, u32)> = record
            .cigar()
            .iter()
            .map(|op| (op.char(), op.len()))
            .collect();
        let start = record.pos() as i32 + 1;
        let blocks = cigar_blocks(start, &ops);
        if blocks.is_empty() {
            converter.push(Err(ParseErr::InvalidFormat(
                "alignment covers no reference bases".to_string(),
            )))?;
            continue;
        }
        let mate = if record.is_paired() && !record.is_mate_unmapped() && record.mtid() >= 0 {
            Some(MateInfo {
                chrom: tid_name(&header, record.mtid()),
                start: record.mpos() as i32 + 1,
            })
        } else {
            None
        };
        converter.push(Ok(Record::Aligned(AlignedRead {
            name: String::from_utf8_lossy(record.qname()).into_owned(),
            chrom: tid_name(&header, record.tid()),
            start,
            strand: if record.is_reverse() {
                Strand::Minus
            } else {
                Strand::Plus
            },
            blocks,
            read_len: cigar_read_len(&ops),
            multiplicity: bam_multiplicity(&record),
            mate,
        })))?;
    }
    Ok(())
}

/// Convert `input` according to `config`, writing hit lines to `out`.
pub fn import<W: Write>(
    input: &str,
    config: &ImportConfig,
    chroms: ChromosomeMap,
    out: W,
) -> Result<(ImportSummary, ChromosomeMap)> {
    if matches!(config.format, InputFormat::Eland | InputFormat::Bowtie)
        && (config.modes.paired || config.modes.junctions)
    {
        warn!("{:?} input has no pairing or splicing; only single hits are emitted", config.format);
    }
    let mut converter = Converter::new(config.modes, chroms, out);
    match config.format {
        InputFormat::Bam => convert_bam(input, &mut converter)?,
        format => convert_text(open_text(input)?, format, &mut converter)?,
    }
    let (summary, chroms) = converter.finish()?;
    summary.log(input);
    Ok((summary, chroms))
}
