use clap::Parser;
use log::{error, info, warn};
use rayon::ThreadPoolBuilder;
use readdb::aggregate::{
    enriched_regions, paired_bed_line, single_bed_line, wiggle_header, OutputFormat,
};
use readdb::chroms::ChromosomeMap;
use readdb::client::{Client, ClientConfig};
use readdb::error::ReadDbError;
use readdb::hits::{PairedHit, ParseErr, SingleHit, Strand};
use readdb::import::{import, open_text, ImportConfig, ImportModes, InputFormat};
use readdb::loader::{HitLoader, HitSource, LoaderConfig};
use readdb::locks::LockConfig;
use readdb::protocol::{HistogramQuery, RegionQuery};
use readdb::server::{Server, ServerConfig};
use readdb::store::CacheConfig;
use regex::Regex;
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{self, BufRead, BufWriter, Write};
use std::num::NonZeroUsize;
use std::path::PathBuf;

/// Common options shared between all commands
#[derive(Parser, Debug)]
struct CommonOpts {
    /// Number of threads for parallel processing.
    #[clap(short = 't', long, value_parser, default_value_t = NonZeroUsize::new(4).unwrap())]
    num_threads: NonZeroUsize,

    /// Verbosity level (0 = error, 1 = info, 2 = debug)
    #[clap(short, long, default_value = "0")]
    verbose: u8,
}

/// How to reach and log into a readdb server
#[derive(Parser, Debug)]
struct ConnectionOpts {
    /// Server host name or address
    #[clap(long, value_parser, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[clap(short = 'p', long, value_parser, default_value_t = 52000)]
    port: u16,

    /// User name
    #[clap(short = 'u', long, value_parser, default_value = "readdb")]
    user: String,

    /// Password
    #[clap(long, value_parser, default_value = "")]
    password: String,
}

impl ConnectionOpts {
    fn config(&self) -> ClientConfig {
        ClientConfig {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
        }
    }
}

/// Storage and query service for sequencing read alignments.
#[derive(Parser, Debug)]
#[command(author, version, about, disable_help_subcommand = true)]
enum Args {
    /// Run the server
    Serve {
        #[clap(flatten)]
        common: CommonOpts,

        /// Directory holding the stored hits
        #[clap(short = 'd', long, value_parser)]
        data_dir: PathBuf,

        /// Port to listen on (0 picks a free one)
        #[clap(short = 'p', long, value_parser, default_value_t = 52000)]
        port: u16,

        /// Address to bind
        #[clap(long, value_parser, default_value = "127.0.0.1")]
        bind: String,

        /// File of user<TAB>password lines; without it any credentials are accepted
        #[clap(long, value_parser)]
        users: Option<PathBuf>,

        /// Consider a lock table cleanup every this many lock acquisitions
        #[clap(long, value_parser, default_value_t = 1000)]
        gc_interval: usize,

        /// Only clean up once the lock table has more entries than this
        #[clap(long, value_parser, default_value_t = 10000)]
        gc_threshold: usize,

        /// Maximum number of simultaneous connections
        #[clap(long, value_parser)]
        max_connections: Option<usize>,

        /// Decoded hits kept in memory per hit type
        #[clap(long, value_parser, default_value_t = 20_000_000)]
        cache_hits: usize,
    },
    /// Query regions read from stdin, one `chrom:start-end[:strand]` per line
    Query {
        #[clap(flatten)]
        common: CommonOpts,

        #[clap(flatten)]
        conn: ConnectionOpts,

        /// Alignment ids to query (comma-separated or repeated)
        #[clap(short = 'a', long = "align", value_parser, value_delimiter = ',', required = true)]
        alignments: Vec<String>,

        /// Query paired hits
        #[clap(long, action)]
        paired: bool,

        /// Select paired hits by their right end instead of their left end
        #[clap(long, action)]
        right: bool,

        /// Report binned counts instead of hits
        #[clap(long, action)]
        histogram: bool,

        /// Report the number of hits (and their weight with --weights) per region
        #[clap(long, action)]
        count: bool,

        /// Bin size for histograms
        #[clap(short = 'b', long, value_parser, default_value_t = 10)]
        bin_size: i32,

        /// Extend reads this many bases downstream of their 5' end when binning
        #[clap(short = 'x', long, value_parser, default_value_t = 0)]
        extension: i32,

        /// Sum hit weights instead of counting hits
        #[clap(long, action)]
        weights: bool,

        /// Keep at most this many hits per location (0 keeps all)
        #[clap(long, value_parser, default_value_t = 0)]
        dedup: u32,

        /// Output format: raw, bed or wiggle
        #[clap(short = 'f', long, value_parser, default_value = "raw")]
        format: OutputFormat,

        /// Only report hits on this strand (+ or -)
        #[clap(short = 's', long, value_parser)]
        strand: Option<String>,

        /// Chromosome name<TAB>id file
        #[clap(short = 'c', long, value_parser)]
        chroms: Option<String>,

        /// Do not echo each region line before its results
        #[clap(long, action)]
        no_header: bool,
    },
    /// Convert aligner output to hit lines
    Import {
        #[clap(flatten)]
        common: CommonOpts,

        /// Input file (`-` for stdin; BAM needs a file)
        #[clap(short = 'i', long, value_parser)]
        input: String,

        /// Input format: sam, bam, eland or bowtie
        #[clap(short = 'f', long, value_parser)]
        format: InputFormat,

        /// Emit single hits (default when no mode is given)
        #[clap(long, action)]
        single: bool,

        /// Emit mate pairs
        #[clap(long, action)]
        paired: bool,

        /// Emit split-read junctions
        #[clap(long, action)]
        junctions: bool,

        /// Output file (stdout when omitted)
        #[clap(short = 'o', long, value_parser)]
        output: Option<String>,

        /// Chromosome name<TAB>id file to start from
        #[clap(short = 'c', long, value_parser)]
        chroms: Option<String>,

        /// Write the chromosome map, including new names, to this file
        #[clap(long, value_parser)]
        chroms_out: Option<String>,
    },
    /// Load hit lines into an alignment on the server
    Load {
        #[clap(flatten)]
        common: CommonOpts,

        #[clap(flatten)]
        conn: ConnectionOpts,

        /// Alignment id to load into
        #[clap(short = 'a', long = "align", value_parser)]
        alignment: String,

        /// Hit file (`-` for stdin)
        #[clap(short = 'i', long, value_parser)]
        input: String,

        /// The file holds paired hit lines
        #[clap(long, action)]
        paired: bool,

        /// Chromosome name<TAB>id file
        #[clap(short = 'c', long, value_parser)]
        chroms: Option<String>,

        /// Hits per request
        #[clap(long, value_parser, default_value_t = 100000)]
        batch: usize,
    },
    /// Report regions covered by at least --threshold reads, for regions read from stdin
    Regions {
        #[clap(flatten)]
        common: CommonOpts,

        #[clap(flatten)]
        conn: ConnectionOpts,

        /// Read hits from this file instead of the server
        #[clap(long, value_parser)]
        hits: Option<PathBuf>,

        /// Alignment ids to query on the server
        #[clap(short = 'a', long = "align", value_parser, value_delimiter = ',')]
        alignments: Vec<String>,

        /// Minimum read depth
        #[clap(long, value_parser, default_value_t = 2)]
        threshold: i32,

        /// Extend reads this many bases from their 5' end (0 uses each read's own length)
        #[clap(short = 'x', long, value_parser, default_value_t = 0)]
        extension: i32,

        /// Chromosome name<TAB>id file
        #[clap(short = 'c', long, value_parser)]
        chroms: Option<String>,
    },
    /// List the chromosomes of an alignment
    Chroms {
        #[clap(flatten)]
        common: CommonOpts,

        #[clap(flatten)]
        conn: ConnectionOpts,

        #[clap(short = 'a', long = "align", value_parser)]
        alignment: String,

        /// List chromosomes with paired hits
        #[clap(long, action)]
        paired: bool,

        /// Chromosome name<TAB>id file
        #[clap(short = 'c', long, value_parser)]
        chroms: Option<String>,
    },
    /// Print hit counts and weights per chromosome
    Stats {
        #[clap(flatten)]
        common: CommonOpts,

        #[clap(flatten)]
        conn: ConnectionOpts,

        #[clap(short = 'a', long = "align", value_parser, value_delimiter = ',', required = true)]
        alignments: Vec<String>,

        /// Chromosome name<TAB>id file
        #[clap(short = 'c', long, value_parser)]
        chroms: Option<String>,
    },
    /// Delete alignments from the server
    Delete {
        #[clap(flatten)]
        common: CommonOpts,

        #[clap(flatten)]
        conn: ConnectionOpts,

        #[clap(short = 'a', long = "align", value_parser, value_delimiter = ',', required = true)]
        alignments: Vec<String>,
    },
}

/// Options of one `query` run.
struct QueryOpts {
    alignments: Vec<String>,
    paired: bool,
    right: bool,
    histogram: bool,
    count: bool,
    bin_size: i32,
    extension: i32,
    weights: bool,
    dedup: u32,
    format: OutputFormat,
    strand: Option<Strand>,
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    match args {
        Args::Serve {
            common,
            data_dir,
            port,
            bind,
            users,
            gc_interval,
            gc_threshold,
            max_connections,
            cache_hits,
        } => {
            initialize(&common)?;
            let mut config = ServerConfig {
                bind,
                port,
                data_dir,
                users_file: users,
                lock: LockConfig {
                    gc_interval,
                    gc_threshold,
                },
                cache: CacheConfig {
                    max_hits: cache_hits,
                },
                ..ServerConfig::default()
            };
            if let Some(max_connections) = max_connections {
                config.max_connections = max_connections;
            }
            let server = Server::bind(config)?;
            // the bound address goes to stdout so scripts using port 0 can find it
            println!("{}", server.local_addr());
            server.serve()?;
        }
        Args::Query {
            common,
            conn,
            alignments,
            paired,
            right,
            histogram,
            count,
            bin_size,
            extension,
            weights,
            dedup,
            format,
            strand,
            chroms,
            no_header,
        } => {
            initialize(&common)?;
            let strand = strand.as_deref().map(parse_strand).transpose()?;
            let chroms = load_chroms(chroms.as_deref())?;
            let opts = QueryOpts {
                alignments,
                paired,
                right,
                histogram,
                count,
                bin_size,
                extension,
                weights,
                dedup,
                format,
                strand,
            };
            let mut client = Client::connect(conn.config())?;
            run_queries(&mut client, &opts, &chroms, no_header)?;
            client.close();
        }
        Args::Import {
            common,
            input,
            format,
            single,
            paired,
            junctions,
            output,
            chroms,
            chroms_out,
        } => {
            initialize(&common)?;
            let modes = ImportModes {
                single: single || !(paired || junctions),
                paired,
                junctions,
            };
            let config = ImportConfig { format, modes };
            let chroms = load_chroms(chroms.as_deref())?;
            let out: Box<dyn Write> = match &output {
                Some(path) => Box::new(BufWriter::new(File::create(path)?)),
                None => Box::new(BufWriter::new(io::stdout().lock())),
            };
            let (_, chroms) = import(&input, &config, chroms, out)?;
            if let Some(path) = chroms_out {
                chroms.write_to(BufWriter::new(File::create(&path)?))?;
                info!("Wrote {} chromosome names to {}", chroms.len(), path);
            }
        }
        Args::Load {
            common,
            conn,
            alignment,
            input,
            paired,
            chroms,
            batch,
        } => {
            initialize(&common)?;
            let chroms = load_chroms(chroms.as_deref())?;
            let mut client = Client::connect(conn.config())?;
            load_hits(&mut client, &alignment, &input, paired, &chroms, batch.max(1))?;
            client.close();
        }
        Args::Regions {
            common,
            conn,
            hits,
            alignments,
            threshold,
            extension,
            chroms,
        } => {
            initialize(&common)?;
            let chroms = load_chroms(chroms.as_deref())?;
            let config = match hits {
                Some(path) => LoaderConfig::File { path },
                None => LoaderConfig::ReadDb {
                    client: conn.config(),
                    alignments,
                },
            };
            let mut source = HitSource::open(&config, &chroms)?;
            run_regions(&mut source, &chroms, threshold, extension)?;
        }
        Args::Chroms {
            common,
            conn,
            alignment,
            paired,
            chroms,
        } => {
            initialize(&common)?;
            let chroms = load_chroms(chroms.as_deref())?;
            let mut client = Client::connect(conn.config())?;
            let ids = client.chroms(&alignment, paired)?;
            let mut names: Vec<String> = ids.into_iter().map(|id| chroms.display_name(id)).collect();
            names.sort_by(|a, b| natord::compare(a, b));
            for name in names {
                println!("{}", name);
            }
            client.close();
        }
        Args::Stats {
            common,
            conn,
            alignments,
            chroms,
        } => {
            initialize(&common)?;
            let chroms = load_chroms(chroms.as_deref())?;
            let mut client = Client::connect(conn.config())?;
            print_stats(&mut client, &alignments, &chroms)?;
            client.close();
        }
        Args::Delete {
            common,
            conn,
            alignments,
        } => {
            initialize(&common)?;
            let mut client = Client::connect(conn.config())?;
            for alignment in &alignments {
                client.delete_alignment(alignment)?;
                info!("Deleted {}", alignment);
            }
            client.close();
        }
    }

    Ok(())
}

/// Initialize logging and the thread pool from the common options
fn initialize(common: &CommonOpts) -> io::Result<()> {
    env_logger::Builder::new()
        .filter_level(match common.verbose {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .init();

    ThreadPoolBuilder::new()
        .num_threads(common.num_threads.into())
        .build_global()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
}

fn load_chroms(path: Option<&str>) -> io::Result<ChromosomeMap> {
    match path {
        Some(path) => {
            let chroms = ChromosomeMap::from_file(path)?;
            info!("Loaded {} chromosome names from {}", chroms.len(), path);
            Ok(chroms)
        }
        None => Ok(ChromosomeMap::new()),
    }
}

fn parse_strand(s: &str) -> io::Result<Strand> {
    Strand::parse(s).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))
}

/// A `chrom:start-end[:strand]` region line.
struct Region {
    chrom: i32,
    start: i32,
    end: i32,
    strand: Option<Strand>,
}

fn region_regex() -> Regex {
    Regex::new(r"^([^\s:]+):(\d+)-(\d+)(?::([+-]))?$").expect("region pattern is valid")
}

fn parse_region(re: &Regex, line: &str, chroms: &ChromosomeMap) -> Result<Region, ReadDbError> {
    let caps = re.captures(line).ok_or_else(|| {
        ReadDbError::Client(format!("expected chrom:start-end[:strand], got '{}'", line))
    })?;
    let chrom = chroms
        .resolve(&caps[1])
        .ok_or_else(|| ReadDbError::Client(format!("unknown chromosome '{}'", &caps[1])))?;
    let number = |s: &str| {
        s.parse::<i32>()
            .map_err(|e| ReadDbError::Client(format!("invalid coordinate '{}': {}", s, e)))
    };
    let start = number(&caps[2])?;
    let end = number(&caps[3])?;
    let strand = match caps.get(4) {
        Some(m) => Some(Strand::parse(m.as_str())?),
        None => None,
    };
    Ok(Region {
        chrom,
        start,
        end,
        strand,
    })
}

/// Answer every region on stdin. Per-region failures are logged and
/// skipped; a lost connection stops the run.
fn run_queries(
    client: &mut Client,
    opts: &QueryOpts,
    chroms: &ChromosomeMap,
    no_header: bool,
) -> io::Result<()> {
    let re = region_regex();
    let stdin = io::stdin();
    let mut out = BufWriter::new(io::stdout().lock());
    let mut regions = 0usize;
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        regions += 1;
        if !no_header {
            writeln!(out, "{}", line)?;
        }
        match query_region(client, opts, chroms, &re, line, &mut out) {
            Ok(()) => {}
            Err(e) if e.is_connection() => {
                out.flush()?;
                error!("Lost connection while querying '{}': {}", line, e);
                return Err(e.into());
            }
            Err(e) => error!("{}: {}", line, e),
        }
    }
    out.flush()?;
    info!("Answered {} regions", regions);
    Ok(())
}

fn query_region<W: Write>(
    client: &mut Client,
    opts: &QueryOpts,
    chroms: &ChromosomeMap,
    re: &Regex,
    line: &str,
    out: &mut W,
) -> Result<(), ReadDbError> {
    let region = parse_region(re, line, chroms)?;
    let chrom_name = chroms.display_name(region.chrom);
    let query = RegionQuery::new(opts.alignments.clone(), region.chrom, region.start, region.end)
        .with_strand(region.strand.or(opts.strand));

    if opts.count {
        let count = client.count(&query, opts.paired)?;
        if opts.weights {
            let weight = client.weight(&query, opts.paired)?;
            writeln!(out, "{}\t{}", count, weight)?;
        } else {
            writeln!(out, "{}", count)?;
        }
        return Ok(());
    }

    if opts.histogram || opts.format == OutputFormat::Wiggle {
        let histogram = HistogramQuery {
            region: query,
            paired: opts.paired,
            extension: opts.extension,
            bin_size: opts.bin_size,
            dedup: opts.dedup,
        };
        let bins: Vec<(i32, String)> = if opts.weights {
            client
                .weight_histogram(&histogram)?
                .into_iter()
                .map(|(bin, w)| (bin, w.to_string()))
                .collect()
        } else {
            client
                .histogram(&histogram)?
                .into_iter()
                .map(|(bin, c)| (bin, c.to_string()))
                .collect()
        };
        if opts.format == OutputFormat::Wiggle {
            writeln!(out, "{}", wiggle_header(&chrom_name, opts.bin_size))?;
        }
        for (bin, value) in bins {
            match opts.format {
                OutputFormat::Bed => writeln!(
                    out,
                    "{}\t{}\t{}\t.\t{}",
                    chrom_name,
                    bin - 1,
                    (bin + opts.bin_size - 1).min(region.end),
                    value
                )?,
                _ => writeln!(out, "{}\t{}", bin, value)?,
            }
        }
        return Ok(());
    }

    if opts.paired {
        let hits: Vec<PairedHit> = client.paired_hits_dedup(&query, !opts.right, opts.dedup)?;
        for hit in &hits {
            match opts.format {
                OutputFormat::Bed => writeln!(out, "{}", paired_bed_line(hit, chroms))?,
                _ => writeln!(out, "{}", hit.to_line(chroms))?,
            }
        }
    } else {
        let hits: Vec<SingleHit> = client.single_hits_dedup(&query, opts.dedup)?;
        for hit in &hits {
            match opts.format {
                OutputFormat::Bed => writeln!(out, "{}", single_bed_line(hit, chroms))?,
                _ => writeln!(out, "{}", hit.to_line(chroms))?,
            }
        }
    }
    Ok(())
}

/// Send the hit lines of `input` to the server in batches. Unparseable lines
/// are skipped and summarized; lines on chromosomes that cannot be resolved
/// fail the command once everything else is loaded.
fn load_hits(
    client: &mut Client,
    alignment: &str,
    input: &str,
    paired: bool,
    chroms: &ChromosomeMap,
    batch: usize,
) -> io::Result<()> {
    let reader = open_text(input)?;
    let mut singles: Vec<SingleHit> = Vec::new();
    let mut pairs: Vec<PairedHit> = Vec::new();
    let mut loaded = 0u64;
    let mut rejected = 0u64;
    let mut unknown: FxHashMap<String, u64> = FxHashMap::default();

    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parsed = if paired {
            PairedHit::parse_line(line, chroms).map(|hit| pairs.push(hit))
        } else {
            SingleHit::parse_line(line, chroms).map(|hit| singles.push(hit))
        };
        match parsed {
            Ok(()) => {}
            Err(ParseErr::UnknownChromosome(name)) => {
                rejected += 1;
                *unknown.entry(name).or_insert(0) += 1;
            }
            Err(e) => {
                warn!("{} line {}: {}", input, line_num + 1, e);
                rejected += 1;
            }
        }
        if singles.len() >= batch {
            loaded += client.add_single_hits(alignment, std::mem::take(&mut singles))?;
        }
        if pairs.len() >= batch {
            loaded += client.add_paired_hits(alignment, std::mem::take(&mut pairs))?;
        }
    }
    if !singles.is_empty() {
        loaded += client.add_single_hits(alignment, singles)?;
    }
    if !pairs.is_empty() {
        loaded += client.add_paired_hits(alignment, pairs)?;
    }
    if rejected == 0 {
        info!("Loaded {} hits into {}", loaded, alignment);
        return Ok(());
    }

    error!(
        "{}: loaded {} hits into {}, rejected {} lines",
        input, loaded, alignment, rejected
    );
    if unknown.is_empty() {
        return Ok(());
    }
    let mut names: Vec<(String, u64)> = unknown.into_iter().collect();
    names.sort_by(|a, b| natord::compare(&a.0, &b.0));
    for (name, lines) in &names {
        error!("{}: {} lines on unknown chromosome '{}'", input, lines, name);
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!(
            "{} chromosome names could not be resolved; pass --chroms with a name<TAB>id file",
            names.len()
        ),
    ))
}

fn run_regions(
    source: &mut HitSource,
    chroms: &ChromosomeMap,
    threshold: i32,
    extension: i32,
) -> io::Result<()> {
    let re = region_regex();
    let stdin = io::stdin();
    let mut out = BufWriter::new(io::stdout().lock());
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let result = parse_region(&re, line, chroms).and_then(|region| {
            // reads reaching into the region may start outside it
            let reach = extension.max(source.read_len().unwrap_or(0));
            let hits = source.load_hits(
                region.chrom,
                region.start.saturating_sub(reach),
                region.end.saturating_add(reach),
                region.strand,
            )?;
            let found = enriched_regions(&hits, extension, threshold)?;
            Ok((region, found))
        });
        match result {
            Ok((region, found)) => {
                let name = chroms.display_name(region.chrom);
                for (start, end) in found {
                    let (start, end) = (start.max(region.start), end.min(region.end));
                    if start <= end {
                        writeln!(out, "{}\t{}\t{}", name, start - 1, end)?;
                    }
                }
            }
            Err(e) if e.is_connection() => {
                out.flush()?;
                error!("Lost connection while processing '{}': {}", line, e);
                return Err(e.into());
            }
            Err(e) => error!("{}: {}", line, e),
        }
    }
    out.flush()
}

fn print_stats(client: &mut Client, alignments: &[String], chroms: &ChromosomeMap) -> io::Result<()> {
    println!("alignment\tchrom\tsingle\tsingle_weight\tpaired");
    for alignment in alignments {
        if !client.exists(alignment)? {
            warn!("Alignment {} does not exist", alignment);
            continue;
        }
        let single = client.chroms(alignment, false)?;
        let paired = client.chroms(alignment, true)?;
        let mut all: Vec<i32> = single.iter().chain(paired.iter()).copied().collect();
        all.sort_unstable();
        all.dedup();
        for chrom in all {
            let region = RegionQuery::new(vec![alignment.clone()], chrom, 0, i32::MAX);
            let (count, weight) = if single.contains(&chrom) {
                (client.count(&region, false)?, client.weight(&region, false)?)
            } else {
                (0, 0.0)
            };
            let pairs = if paired.contains(&chrom) {
                client.count(&region, true)?
            } else {
                0
            };
            println!(
                "{}\t{}\t{}\t{:.2}\t{}",
                alignment,
                chroms.display_name(chrom),
                count,
                weight,
                pairs
            );
        }
    }
    Ok(())
}
