//! Summaries over hit lists: duplicate capping, binned histograms, coverage
//! and the text output formats of the query tool.

use crate::chroms::ChromosomeMap;
use crate::error::Result;
use crate::hits::{read_extent, Location, PairedHit, SingleHit};
use crate::overlap::{OverlapSum, WeightedOverlapSum};
use rustc_hash::FxHashMap;

/// Keep at most `limit` hits per location, in first-seen order. `limit == 0` keeps everything.
pub fn dedup_by_location<T, F>(hits: Vec<T>, limit: u32, location: F) -> Vec<T>
where
    F: Fn(&T) -> Location,
{
    if limit == 0 {
        return hits;
    }
    let mut seen: FxHashMap<Location, u32> = FxHashMap::default();
    hits.into_iter()
        .filter(|hit| {
            let count = seen.entry(location(hit)).or_insert(0);
            *count += 1;
            *count <= limit
        })
        .collect()
}

pub fn dedup_single(hits: Vec<SingleHit>, limit: u32) -> Vec<SingleHit> {
    dedup_by_location(hits, limit, SingleHit::location)
}

pub fn dedup_paired(hits: Vec<PairedHit>, limit: u32) -> Vec<PairedHit> {
    dedup_by_location(hits, limit, PairedHit::location)
}

/// Binning of a query region: bin `k` covers `[start + k*size, start + (k+1)*size)`.
#[derive(Debug, Clone, Copy)]
pub struct Bins {
    pub start: i32,
    pub end: i32,
    pub size: i32,
}

impl Bins {
    pub fn new(start: i32, end: i32, size: i32) -> Self {
        Bins {
            start,
            end,
            size: size.max(1),
        }
    }

    fn index(&self, pos: i32) -> i32 {
        (pos - self.start) / self.size
    }

    pub fn key(&self, index: i32) -> i32 {
        self.start + index * self.size
    }

    // Clip to the region and convert to an inclusive range of bin indexes.
    fn index_range(&self, (first, last): (i32, i32)) -> Option<(i32, i32)> {
        if last < self.start || first > self.end {
            return None;
        }
        Some((
            self.index(first.max(self.start)),
            self.index(last.min(self.end)),
        ))
    }
}

/// Interval a single hit contributes to a histogram: its 5' end, or the
/// extended read when `extension > 0`.
pub fn single_interval(hit: &SingleHit, extension: i32) -> (i32, i32) {
    hit.extended(extension.max(0))
}

/// Interval a paired hit contributes: its left end, or the left read
/// extended `extension` bases downstream when `extension > 0`. Either way
/// it stays within `extension` of the left end.
pub fn paired_interval(hit: &PairedHit, extension: i32) -> (i32, i32) {
    let (chrom, pos, strand, length) = hit.side(true);
    single_interval(&SingleHit::new(chrom, pos, strand, length, hit.weight), extension)
}

/// Outer extent of both reads of a pair on the same chromosome.
pub fn fragment_extent(hit: &PairedHit) -> Option<(i32, i32)> {
    if hit.left_chrom != hit.right_chrom {
        return None;
    }
    let (l0, l1) = read_extent(hit.left_pos, hit.left_strand, hit.left_len);
    let (r0, r1) = read_extent(hit.right_pos, hit.right_strand, hit.right_len);
    Some((l0.min(r0), l1.max(r1)))
}

/// Count histogram. Each interval adds one to every bin it overlaps; only
/// non-empty bins are returned, in ascending order.
pub fn histogram<I>(intervals: I, bins: Bins) -> Result<Vec<(i32, u32)>>
where
    I: IntoIterator<Item = (i32, i32)>,
{
    let mut sum = OverlapSum::new();
    for interval in intervals {
        if let Some((a, b)) = bins.index_range(interval) {
            sum.add_interval(a, b);
        }
    }
    let last_index = bins.index(bins.end);
    let mut out = Vec::new();
    let steps = sum.steps()?;
    for window in steps.windows(2) {
        let (from, depth) = window[0];
        let (to, _) = window[1];
        if depth > 0 {
            for index in from..to.min(last_index + 1) {
                out.push((bins.key(index), depth as u32));
            }
        }
    }
    Ok(out)
}

/// Weight histogram: like [`histogram`] but each interval adds its weight.
pub fn weight_histogram<I>(intervals: I, bins: Bins) -> Result<Vec<(i32, f32)>>
where
    I: IntoIterator<Item = ((i32, i32), f32)>,
{
    let mut sum = WeightedOverlapSum::new();
    for (interval, weight) in intervals {
        if let Some((a, b)) = bins.index_range(interval) {
            sum.add_interval(a, b, weight as f64);
        }
    }
    let last_index = bins.index(bins.end);
    let mut out = Vec::new();
    let steps = sum.steps()?;
    for window in steps.windows(2) {
        let (from, weight) = window[0];
        let (to, _) = window[1];
        if weight > 1e-9 {
            for index in from..to.min(last_index + 1) {
                out.push((bins.key(index), weight as f32));
            }
        }
    }
    Ok(out)
}

pub fn single_histogram(
    hits: &[SingleHit],
    extension: i32,
    bins: Bins,
) -> Result<Vec<(i32, u32)>> {
    histogram(hits.iter().map(|h| single_interval(h, extension)), bins)
}

pub fn single_weight_histogram(
    hits: &[SingleHit],
    extension: i32,
    bins: Bins,
) -> Result<Vec<(i32, f32)>> {
    weight_histogram(
        hits.iter().map(|h| (single_interval(h, extension), h.weight)),
        bins,
    )
}

pub fn paired_histogram(
    hits: &[PairedHit],
    extension: i32,
    bins: Bins,
) -> Result<Vec<(i32, u32)>> {
    histogram(hits.iter().map(|h| paired_interval(h, extension)), bins)
}

pub fn paired_weight_histogram(
    hits: &[PairedHit],
    extension: i32,
    bins: Bins,
) -> Result<Vec<(i32, f32)>> {
    weight_histogram(
        hits.iter().map(|h| (paired_interval(h, extension), h.weight)),
        bins,
    )
}

/// Read coverage over the reads' own extents (or extended extents).
pub fn coverage(hits: &[SingleHit], extension: i32) -> OverlapSum {
    OverlapSum::from_intervals(hits.iter().map(|h| {
        if extension > 0 {
            h.extended(extension)
        } else {
            h.extent()
        }
    }))
}

/// Regions covered by at least `threshold` reads, e.g. candidate peak regions.
pub fn enriched_regions(hits: &[SingleHit], extension: i32, threshold: i32) -> Result<Vec<(i32, i32)>> {
    coverage(hits, extension).collect(threshold)
}

/// Text output of the query tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Raw,
    Bed,
    Wiggle,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "raw" => Ok(OutputFormat::Raw),
            "bed" => Ok(OutputFormat::Bed),
            "wiggle" | "wig" => Ok(OutputFormat::Wiggle),
            _ => Err(format!("unknown output format '{}' (raw, bed, wiggle)", s)),
        }
    }
}

/// BED line for a read: 0-based start, exclusive end, weight as score.
pub fn single_bed_line(hit: &SingleHit, chroms: &ChromosomeMap) -> String {
    let (first, last) = hit.extent();
    format!(
        "{}\t{}\t{}\t.\t{}\t{}",
        chroms.display_name(hit.chrom),
        first - 1,
        last,
        hit.weight,
        hit.strand.as_char()
    )
}

/// BED line for a pair: the whole fragment when both ends share a
/// chromosome, otherwise the left read.
pub fn paired_bed_line(hit: &PairedHit, chroms: &ChromosomeMap) -> String {
    let (first, last) = fragment_extent(hit)
        .unwrap_or_else(|| read_extent(hit.left_pos, hit.left_strand, hit.left_len));
    format!(
        "{}\t{}\t{}\t.\t{}\t{}",
        chroms.display_name(hit.left_chrom),
        first - 1,
        last,
        hit.weight,
        hit.left_strand.as_char()
    )
}

pub fn wiggle_header(chrom: &str, span: i32) -> String {
    format!("variableStep chrom={} span={}", chrom, span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hits::Strand;

    fn at(pos: i32) -> SingleHit {
        SingleHit::new(1, pos, Strand::Plus, 36, 1.0)
    }

    #[test]
    fn test_histogram_bins_by_start() {
        let hits = vec![at(5), at(5), at(15)];
        let bins = Bins::new(1, 30, 10);
        assert_eq!(
            single_histogram(&hits, 0, bins).unwrap(),
            vec![(1, 2), (11, 1)]
        );
    }

    #[test]
    fn test_histogram_ignores_hits_outside_region() {
        let hits = vec![at(0), at(31), at(30)];
        let bins = Bins::new(1, 30, 10);
        assert_eq!(single_histogram(&hits, 0, bins).unwrap(), vec![(21, 1)]);
    }

    #[test]
    fn test_histogram_with_extension_spans_bins() {
        // plus read at 5 extended by 20 covers 5..=25, minus read at 28 covers 8..=28
        let hits = vec![at(5), SingleHit::new(1, 28, Strand::Minus, 36, 1.0)];
        let bins = Bins::new(1, 30, 10);
        assert_eq!(
            single_histogram(&hits, 20, bins).unwrap(),
            vec![(1, 2), (11, 2), (21, 2)]
        );
        let bins = Bins::new(1, 100, 10);
        assert_eq!(
            single_histogram(&[at(95)], 20, bins).unwrap(),
            vec![(91, 1)]
        );
    }

    #[test]
    fn test_weight_histogram() {
        let hits = vec![
            SingleHit::new(1, 5, Strand::Plus, 36, 0.5),
            SingleHit::new(1, 6, Strand::Plus, 36, 0.25),
            SingleHit::new(1, 25, Strand::Plus, 36, 1.0),
        ];
        let bins = Bins::new(1, 30, 10);
        let histogram = single_weight_histogram(&hits, 0, bins).unwrap();
        assert_eq!(histogram.len(), 2);
        assert_eq!(histogram[0].0, 1);
        assert!((histogram[0].1 - 0.75).abs() < 1e-6);
        assert_eq!(histogram[1].0, 21);
        assert!((histogram[1].1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_dedup_keeps_first_seen() {
        let mut hits: Vec<SingleHit> = (0..5)
            .map(|i| SingleHit::new(1, 150, Strand::Plus, 30 + i, 1.0))
            .collect();
        hits.push(at(160));
        let kept = dedup_single(hits.clone(), 2);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].length, 30);
        assert_eq!(kept[1].length, 31);
        assert_eq!(kept[2].pos, 160);
        assert_eq!(dedup_single(hits, 0).len(), 6);
    }

    #[test]
    fn test_dedup_strands_are_distinct_locations() {
        let hits = vec![
            SingleHit::new(1, 150, Strand::Plus, 36, 1.0),
            SingleHit::new(1, 150, Strand::Minus, 36, 1.0),
            SingleHit::new(1, 150, Strand::Minus, 36, 1.0),
        ];
        assert_eq!(dedup_single(hits, 1).len(), 2);
    }

    #[test]
    fn test_enriched_regions() {
        let hits = vec![at(100), at(110), at(200)];
        // reads are 36bp: 100..=135 and 110..=145 overlap on 110..=135
        assert_eq!(enriched_regions(&hits, 0, 2).unwrap(), vec![(110, 135)]);
        assert_eq!(
            enriched_regions(&hits, 0, 1).unwrap(),
            vec![(100, 145), (200, 235)]
        );
    }

    #[test]
    fn test_bed_lines() {
        let mut chroms = ChromosomeMap::new();
        chroms.insert("chr1", 1);
        assert_eq!(single_bed_line(&at(100), &chroms), "chr1\t99\t135\t.\t1\t+");
        let pair = PairedHit {
            left_chrom: 1,
            left_pos: 100,
            left_strand: Strand::Plus,
            left_len: 36,
            right_chrom: 1,
            right_pos: 300,
            right_strand: Strand::Minus,
            right_len: 36,
            weight: 1.0,
            code: 1,
        };
        assert_eq!(paired_bed_line(&pair, &chroms), "chr1\t99\t300\t.\t1\t+");
        assert_eq!(paired_interval(&pair, 0), (100, 100));
        assert_eq!(paired_interval(&pair, 10), (100, 110));
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!("bed".parse::<OutputFormat>().unwrap(), OutputFormat::Bed);
        assert_eq!("wig".parse::<OutputFormat>().unwrap(), OutputFormat::Wiggle);
        assert!("xml".parse::<OutputFormat>().is_err());
    }
}
