//! Wire protocol
//!
//! Every message is a frame: a big-endian `u32` payload length followed by
//! the payload, a bincode-encoded [`Request`] or [`Response`]. Integers use
//! fixed-width encoding so hit records travel as fixed-size fields.
//!
//! A session is `Hello` → `Ready`, `Authenticate` → `Ok`, then any number of
//! strictly sequential request/response round trips, then `Bye` or EOF.

use crate::error::{ReadDbError, Result};
use crate::hits::{PairedHit, SingleHit, Strand};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind as IoErrorKind, Read, Write};

pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single frame's payload.
pub const MAX_FRAME_LEN: usize = 256 << 20;

fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Region part shared by every hit query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionQuery {
    pub alignments: Vec<String>,
    pub chrom: i32,
    pub start: i32,
    pub end: i32,
    /// `None` selects both strands.
    pub strand: Option<Strand>,
}

impl RegionQuery {
    pub fn new(alignments: Vec<String>, chrom: i32, start: i32, end: i32) -> Self {
        RegionQuery {
            alignments,
            chrom,
            start,
            end,
            strand: None,
        }
    }

    pub fn with_strand(mut self, strand: Option<Strand>) -> Self {
        self.strand = strand;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.alignments.is_empty() {
            return Err(ReadDbError::Client("no alignment ids given".to_string()));
        }
        if self.start > self.end {
            return Err(ReadDbError::Client(format!(
                "start {} is after end {}",
                self.start, self.end
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramQuery {
    pub region: RegionQuery,
    pub paired: bool,
    /// Bases to extend each read downstream of its 5' end (0 counts the 5' end only).
    pub extension: i32,
    pub bin_size: i32,
    /// Keep at most this many hits per location (0 keeps all).
    pub dedup: u32,
}

impl HistogramQuery {
    pub fn validate(&self) -> Result<()> {
        self.region.validate()?;
        if self.bin_size < 1 {
            return Err(ReadDbError::Client(format!(
                "bin size must be at least 1, got {}",
                self.bin_size
            )));
        }
        if self.extension < 0 {
            return Err(ReadDbError::Client(format!(
                "extension must not be negative, got {}",
                self.extension
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Hello { version: u32 },
    Authenticate { user: String, password: String },
    SingleHits(RegionQuery),
    PairedHits { region: RegionQuery, left_side: bool },
    Histogram(HistogramQuery),
    WeightHistogram(HistogramQuery),
    Count { region: RegionQuery, paired: bool },
    Weight { region: RegionQuery, paired: bool },
    Chroms { alignment: String, paired: bool },
    Exists { alignment: String },
    AddSingleHits { alignment: String, hits: Vec<SingleHit> },
    AddPairedHits { alignment: String, hits: Vec<PairedHit> },
    DeleteAlignment { alignment: String },
    Ping,
    Bye,
}

impl Request {
    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Hello { .. } => "hello",
            Request::Authenticate { .. } => "authenticate",
            Request::SingleHits(_) => "single-hits",
            Request::PairedHits { .. } => "paired-hits",
            Request::Histogram(_) => "histogram",
            Request::WeightHistogram(_) => "weight-histogram",
            Request::Count { .. } => "count",
            Request::Weight { .. } => "weight",
            Request::Chroms { .. } => "chroms",
            Request::Exists { .. } => "exists",
            Request::AddSingleHits { .. } => "add-single-hits",
            Request::AddPairedHits { .. } => "add-paired-hits",
            Request::DeleteAlignment { .. } => "delete-alignment",
            Request::Ping => "ping",
            Request::Bye => "bye",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Bad request semantics; the connection stays usable.
    Client,
    Auth,
    /// The server failed to answer a valid request.
    Server,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Ready { version: u32 },
    Ok,
    SingleHits(Vec<SingleHit>),
    PairedHits(Vec<PairedHit>),
    /// `(bin start, count)` in ascending bin order.
    Histogram(Vec<(i32, u32)>),
    WeightHistogram(Vec<(i32, f32)>),
    Count(u64),
    Weight(f64),
    Chroms(Vec<i32>),
    Exists(bool),
    Error { kind: ErrorKind, message: String },
}

impl Response {
    pub fn from_error(error: &ReadDbError) -> Self {
        let (kind, message) = match error {
            ReadDbError::Client(msg) | ReadDbError::InvalidArgument(msg) | ReadDbError::Parse(msg) => {
                (ErrorKind::Client, msg.clone())
            }
            ReadDbError::Auth(msg) => (ErrorKind::Auth, msg.clone()),
            other => (ErrorKind::Server, other.to_string()),
        };
        Response::Error { kind, message }
    }

    /// Turn an `Error` response back into the matching error.
    pub fn into_result(self) -> Result<Response> {
        match self {
            Response::Error { kind, message } => Err(match kind {
                ErrorKind::Client => ReadDbError::Client(message),
                ErrorKind::Auth => ReadDbError::Auth(message),
                ErrorKind::Server => ReadDbError::Client(format!("server error: {}", message)),
            }),
            other => Ok(other),
        }
    }
}

fn connection_error(context: &str, e: std::io::Error) -> ReadDbError {
    ReadDbError::Connection(format!("{}: {}", context, e))
}

/// Encode `message` as one frame and flush it.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    write_frame_limited(writer, message, MAX_FRAME_LEN)
}

/// Like [`write_frame`] with a caller-chosen size limit. An oversized
/// message is a `Client` error and nothing is written, so the stream stays
/// usable.
pub fn write_frame_limited<W: Write, T: Serialize>(
    writer: &mut W,
    message: &T,
    limit: usize,
) -> Result<()> {
    let payload = bincode::serde::encode_to_vec(message, wire_config())
        .map_err(|e| ReadDbError::Connection(format!("Failed to encode message: {e:?}")))?;
    if payload.len() > limit.min(MAX_FRAME_LEN) {
        return Err(ReadDbError::Client(format!(
            "message of {} bytes exceeds the {} byte frame limit",
            payload.len(),
            limit.min(MAX_FRAME_LEN)
        )));
    }
    writer
        .write_all(&(payload.len() as u32).to_be_bytes())
        .map_err(|e| connection_error("Failed to write frame header", e))?;
    writer
        .write_all(&payload)
        .map_err(|e| connection_error("Failed to write frame payload", e))?;
    writer
        .flush()
        .map_err(|e| connection_error("Failed to flush frame", e))
}

/// Read one frame. `Ok(None)` means the peer closed the connection between frames.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == IoErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(connection_error("Failed to read frame header", e)),
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ReadDbError::Connection(format!(
            "frame of {} bytes exceeds the {} byte limit",
            len, MAX_FRAME_LEN
        )));
    }
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .map_err(|e| connection_error("Truncated frame", e))?;
    let (message, consumed): (T, usize) =
        bincode::serde::decode_from_slice(&payload, wire_config())
            .map_err(|e| ReadDbError::Connection(format!("Malformed frame: {e:?}")))?;
    if consumed != len {
        return Err(ReadDbError::Connection(format!(
            "Malformed frame: {} trailing bytes",
            len - consumed
        )));
    }
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frame_roundtrip() {
        let request = Request::Histogram(HistogramQuery {
            region: RegionQuery::new(vec!["a".to_string(), "b".to_string()], 1, 1, 30)
                .with_strand(Some(Strand::Minus)),
            paired: false,
            extension: 0,
            bin_size: 10,
            dedup: 2,
        });
        let mut buf = Vec::new();
        write_frame(&mut buf, &request).unwrap();
        write_frame(&mut buf, &Request::Ping).unwrap();

        let mut cursor = Cursor::new(buf);
        let first: Option<Request> = read_frame(&mut cursor).unwrap();
        assert_eq!(first, Some(request));
        let second: Option<Request> = read_frame(&mut cursor).unwrap();
        assert_eq!(second, Some(Request::Ping));
        let end: Option<Request> = read_frame(&mut cursor).unwrap();
        assert_eq!(end, None);
    }

    #[test]
    fn test_hits_are_fixed_width() {
        let one = Response::SingleHits(vec![SingleHit::new(1, 100, Strand::Plus, 36, 1.0)]);
        let two = Response::SingleHits(vec![
            SingleHit::new(1, 100, Strand::Plus, 36, 1.0),
            SingleHit::new(22, 1_000_000, Strand::Minus, 36, 0.5),
        ]);
        let a = bincode::serde::encode_to_vec(&one, wire_config()).unwrap();
        let b = bincode::serde::encode_to_vec(&two, wire_config()).unwrap();
        // chrom + pos + strand byte + length + weight
        assert_eq!(b.len() - a.len(), 4 + 4 + 1 + 4 + 4);
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let mut buf = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 16]);
        let result: Result<Option<Request>> = read_frame(&mut Cursor::new(buf));
        assert!(matches!(result, Err(ReadDbError::Connection(_))));
    }

    #[test]
    fn test_truncated_frame_is_connection_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Request::Exists { alignment: "x".to_string() }).unwrap();
        buf.truncate(buf.len() - 1);
        let result: Result<Option<Request>> = read_frame(&mut Cursor::new(buf));
        assert!(matches!(result, Err(ReadDbError::Connection(_))));
    }

    #[test]
    fn test_error_response_mapping() {
        let response = Response::from_error(&ReadDbError::Client("no such alignment".into()));
        assert!(matches!(
            response.clone().into_result(),
            Err(ReadDbError::Client(msg)) if msg == "no such alignment"
        ));
        assert!(Response::Ok.into_result().is_ok());
        let server = Response::from_error(&ReadDbError::Invariant("depth".into()));
        assert!(matches!(server, Response::Error { kind: ErrorKind::Server, .. }));
    }

    #[test]
    fn test_validation() {
        assert!(RegionQuery::new(vec![], 1, 1, 10).validate().is_err());
        assert!(RegionQuery::new(vec!["a".into()], 1, 10, 1).validate().is_err());
        assert!(RegionQuery::new(vec!["a".into()], 1, 5, 5).validate().is_ok());
        let query = HistogramQuery {
            region: RegionQuery::new(vec!["a".into()], 1, 1, 10),
            paired: false,
            extension: 0,
            bin_size: 0,
            dedup: 0,
        };
        assert!(matches!(query.validate(), Err(ReadDbError::Client(_))));
    }
}
