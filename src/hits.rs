//! Alignment hit records
//!
//! Single-end hits and paired-end/junction hits in the canonical form stored
//! by the server, plus the tab-separated text form produced by the importers
//! and consumed by the loader.
//!
//! ## Coordinates
//! - positions are 1-based
//! - a single hit's `pos` is the read's 5' end: on `+` the read covers
//!   `[pos, pos + length - 1]`, on `-` it covers `[pos - length + 1, pos]`

use crate::chroms::ChromosomeMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::num::{ParseFloatError, ParseIntError};

#[derive(Debug)]
pub enum ParseErr {
    NotEnoughFields(usize),
    InvalidInt(ParseIntError),
    InvalidFloat(ParseFloatError),
    InvalidStrand(String),
    UnknownChromosome(String),
    InvalidFormat(String),
}

impl std::fmt::Display for ParseErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseErr::NotEnoughFields(n) => write!(f, "Expected {} tab-separated fields", n),
            ParseErr::InvalidInt(e) => write!(f, "Invalid integer field: {}", e),
            ParseErr::InvalidFloat(e) => write!(f, "Invalid weight field: {}", e),
            ParseErr::InvalidStrand(s) => write!(f, "Invalid strand '{}'", s),
            ParseErr::UnknownChromosome(name) => write!(f, "Unknown chromosome '{}'", name),
            ParseErr::InvalidFormat(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ParseErr {}

impl From<ParseErr> for crate::error::ReadDbError {
    fn from(e: ParseErr) -> Self {
        crate::error::ReadDbError::Parse(e.to_string())
    }
}

/// Strand orientation. Travels on the wire as a single byte.
#[derive(Default, PartialEq, Eq, Hash, Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(from = "bool", into = "bool")]
pub enum Strand {
    #[default]
    Plus,
    Minus,
}

impl From<bool> for Strand {
    fn from(plus: bool) -> Self {
        if plus {
            Strand::Plus
        } else {
            Strand::Minus
        }
    }
}

impl From<Strand> for bool {
    fn from(strand: Strand) -> Self {
        strand == Strand::Plus
    }
}

impl Strand {
    pub fn is_plus(self) -> bool {
        self == Strand::Plus
    }

    pub fn as_char(self) -> char {
        match self {
            Strand::Plus => '+',
            Strand::Minus => '-',
        }
    }

    pub fn parse(s: &str) -> Result<Self, ParseErr> {
        match s {
            "+" | "F" => Ok(Strand::Plus),
            "-" | "R" => Ok(Strand::Minus),
            _ => Err(ParseErr::InvalidStrand(s.to_string())),
        }
    }

    /// `None` accepts both strands.
    pub fn matches(self, filter: Option<Strand>) -> bool {
        filter.map_or(true, |s| s == self)
    }
}

/// Read extent `(first, last)` of a read whose 5' end is `pos`.
pub fn read_extent(pos: i32, strand: Strand, length: i32) -> (i32, i32) {
    let span = length.max(1) - 1;
    match strand {
        Strand::Plus => (pos, pos.saturating_add(span)),
        Strand::Minus => (pos.saturating_sub(span), pos),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SingleHit {
    pub chrom: i32,
    pub pos: i32,
    pub strand: Strand,
    pub length: i32,
    pub weight: f32,
}

/// Identity of a hit's location, used to collapse duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Single(i32, i32, Strand),
    Paired(i32, i32, Strand, i32, i32, Strand),
}

impl SingleHit {
    pub fn new(chrom: i32, pos: i32, strand: Strand, length: i32, weight: f32) -> Self {
        SingleHit {
            chrom,
            pos,
            strand,
            length,
            weight,
        }
    }

    pub fn extent(&self) -> (i32, i32) {
        read_extent(self.pos, self.strand, self.length)
    }

    /// Extent of the read after extending `extension` bases downstream of the 5' end.
    pub fn extended(&self, extension: i32) -> (i32, i32) {
        match self.strand {
            Strand::Plus => (self.pos, self.pos.saturating_add(extension)),
            Strand::Minus => (self.pos.saturating_sub(extension), self.pos),
        }
    }

    pub fn location(&self) -> Location {
        Location::Single(self.chrom, self.pos, self.strand)
    }

    /// Store order: chromosome, position, strand, length.
    pub fn cmp_position(&self, other: &Self) -> Ordering {
        self.chrom
            .cmp(&other.chrom)
            .then(self.pos.cmp(&other.pos))
            .then(other.strand.is_plus().cmp(&self.strand.is_plus()))
            .then(self.length.cmp(&other.length))
    }

    pub fn parse_line(line: &str, chroms: &ChromosomeMap) -> Result<Self, ParseErr> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 5 {
            return Err(ParseErr::NotEnoughFields(5));
        }
        let chrom = chroms
            .resolve(fields[0])
            .ok_or_else(|| ParseErr::UnknownChromosome(fields[0].to_string()))?;
        Ok(SingleHit {
            chrom,
            pos: fields[1].parse().map_err(ParseErr::InvalidInt)?,
            strand: Strand::parse(fields[2])?,
            length: fields[3].parse().map_err(ParseErr::InvalidInt)?,
            weight: parse_weight(fields[4])?,
        })
    }

    pub fn to_line(&self, chroms: &ChromosomeMap) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}",
            chroms.display_name(self.chrom),
            self.pos,
            self.strand.as_char(),
            self.length,
            self.weight
        )
    }
}

/// Pairing code of a mate pair.
pub const CODE_MATE_PAIR: u8 = 1;
/// Pairing code of the two blocks of a split (spliced) read.
pub const CODE_JUNCTION: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PairedHit {
    pub left_chrom: i32,
    pub left_pos: i32,
    pub left_strand: Strand,
    pub left_len: i32,
    pub right_chrom: i32,
    pub right_pos: i32,
    pub right_strand: Strand,
    pub right_len: i32,
    pub weight: f32,
    pub code: u8,
}

impl PairedHit {
    /// Swap every left field with its right counterpart.
    pub fn flip_sides(&mut self) {
        std::mem::swap(&mut self.left_chrom, &mut self.right_chrom);
        std::mem::swap(&mut self.left_pos, &mut self.right_pos);
        std::mem::swap(&mut self.left_strand, &mut self.right_strand);
        std::mem::swap(&mut self.left_len, &mut self.right_len);
    }

    /// Make left the lower-coordinate end.
    pub fn normalize(&mut self) {
        if self.left_chrom > self.right_chrom
            || (self.left_chrom == self.right_chrom && self.left_pos > self.right_pos)
        {
            self.flip_sides();
        }
    }

    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }

    pub fn side(&self, left: bool) -> (i32, i32, Strand, i32) {
        if left {
            (self.left_chrom, self.left_pos, self.left_strand, self.left_len)
        } else {
            (self.right_chrom, self.right_pos, self.right_strand, self.right_len)
        }
    }

    pub fn location(&self) -> Location {
        let n = self.normalized();
        Location::Paired(
            n.left_chrom,
            n.left_pos,
            n.left_strand,
            n.right_chrom,
            n.right_pos,
            n.right_strand,
        )
    }

    /// Left-anchored order: chromosome, position, length on the left side,
    /// then the same on the right side.
    pub fn cmp_left(&self, other: &Self) -> Ordering {
        self.left_chrom
            .cmp(&other.left_chrom)
            .then(self.left_pos.cmp(&other.left_pos))
            .then(self.left_len.cmp(&other.left_len))
            .then(self.right_chrom.cmp(&other.right_chrom))
            .then(self.right_pos.cmp(&other.right_pos))
            .then(self.right_len.cmp(&other.right_len))
    }

    /// Right-anchored order. The right length is compared before the left length.
    pub fn cmp_right(&self, other: &Self) -> Ordering {
        self.right_chrom
            .cmp(&other.right_chrom)
            .then(self.right_pos.cmp(&other.right_pos))
            .then(self.right_len.cmp(&other.right_len))
            .then(self.left_len.cmp(&other.left_len))
            .then(self.left_chrom.cmp(&other.left_chrom))
            .then(self.left_pos.cmp(&other.left_pos))
    }

    pub fn cmp_side(&self, other: &Self, left: bool) -> Ordering {
        if left {
            self.cmp_left(other)
        } else {
            self.cmp_right(other)
        }
    }

    pub fn parse_line(line: &str, chroms: &ChromosomeMap) -> Result<Self, ParseErr> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 10 {
            return Err(ParseErr::NotEnoughFields(10));
        }
        let resolve = |name: &str| {
            chroms
                .resolve(name)
                .ok_or_else(|| ParseErr::UnknownChromosome(name.to_string()))
        };
        Ok(PairedHit {
            left_chrom: resolve(fields[0])?,
            left_pos: fields[1].parse().map_err(ParseErr::InvalidInt)?,
            left_strand: Strand::parse(fields[2])?,
            left_len: fields[3].parse().map_err(ParseErr::InvalidInt)?,
            right_chrom: resolve(fields[4])?,
            right_pos: fields[5].parse().map_err(ParseErr::InvalidInt)?,
            right_strand: Strand::parse(fields[6])?,
            right_len: fields[7].parse().map_err(ParseErr::InvalidInt)?,
            weight: parse_weight(fields[8])?,
            code: fields[9].parse().map_err(ParseErr::InvalidInt)?,
        })
    }

    pub fn to_line(&self, chroms: &ChromosomeMap) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            chroms.display_name(self.left_chrom),
            self.left_pos,
            self.left_strand.as_char(),
            self.left_len,
            chroms.display_name(self.right_chrom),
            self.right_pos,
            self.right_strand.as_char(),
            self.right_len,
            self.weight,
            self.code
        )
    }
}

fn parse_weight(field: &str) -> Result<f32, ParseErr> {
    let weight: f32 = field.parse().map_err(ParseErr::InvalidFloat)?;
    if !(weight > 0.0 && weight <= 1.0) {
        return Err(ParseErr::InvalidFormat(format!(
            "Weight {} outside (0, 1]",
            weight
        )));
    }
    Ok(weight)
}

/// Either kind of text line, for loaders that accept mixed input.
#[derive(Debug, Clone, PartialEq)]
pub enum HitLine {
    Single(SingleHit),
    Paired(PairedHit),
}

impl HitLine {
    /// Ten or more fields is a paired line, otherwise a single line.
    pub fn parse(line: &str, chroms: &ChromosomeMap) -> Result<Self, ParseErr> {
        if line.split('\t').count() >= 10 {
            PairedHit::parse_line(line, chroms).map(HitLine::Paired)
        } else {
            SingleHit::parse_line(line, chroms).map(HitLine::Single)
        }
    }
}
