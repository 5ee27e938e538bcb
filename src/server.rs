//! TCP server: one thread per connection, strictly sequential requests
//! within a connection, shared store and lock registry across connections.

use crate::aggregate::{
    dedup_paired, dedup_single, paired_histogram, paired_weight_histogram, single_histogram,
    single_weight_histogram, Bins,
};
use crate::error::{ReadDbError, Result};
use crate::locks::{LockConfig, LockRegistry, LockSet};
use crate::protocol::{
    read_frame, write_frame, write_frame_limited, ErrorKind, HistogramQuery, RegionQuery,
    Request, Response, MAX_FRAME_LEN, PROTOCOL_VERSION,
};
use crate::store::{CacheConfig, HitStore};
use log::{debug, error, info, warn};
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// 0 picks a free port; see [`Server::local_addr`].
    pub port: u16,
    pub data_dir: PathBuf,
    /// `user<TAB>password` lines. Without a users file any credentials are accepted.
    pub users_file: Option<PathBuf>,
    pub lock: LockConfig,
    pub cache: CacheConfig,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "127.0.0.1".to_string(),
            port: 52000,
            data_dir: PathBuf::from("readdb-data"),
            users_file: None,
            lock: LockConfig::default(),
            cache: CacheConfig::default(),
            max_connections: num_cpus::get() * 64,
        }
    }
}

/// Parse a users table: `user<TAB>password` per line, `#` comments and blank lines skipped.
pub fn parse_users<R: BufRead>(reader: R) -> Result<FxHashMap<String, String>> {
    let mut users = FxHashMap::default();
    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((user, password)) = line.split_once('\t') else {
            return Err(ReadDbError::Parse(format!(
                "users file line {}: expected user<TAB>password",
                line_num + 1
            )));
        };
        users.insert(user.to_string(), password.to_string());
    }
    Ok(users)
}

struct Shared {
    store: HitStore,
    registry: Arc<LockRegistry>,
    users: Option<FxHashMap<String, String>>,
    active: AtomicUsize,
    max_connections: usize,
    max_frame_len: usize,
}

/// Counts one open connection until dropped, including by a panicking
/// connection thread.
struct ConnectionSlot {
    shared: Arc<Shared>,
}

impl ConnectionSlot {
    fn take(shared: &Arc<Shared>) -> Self {
        shared.active.fetch_add(1, Ordering::SeqCst);
        ConnectionSlot {
            shared: Arc::clone(shared),
        }
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.shared.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    stopped: Arc<AtomicBool>,
}

/// Stops a running [`Server::serve`] loop from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    stopped: Arc<AtomicBool>,
    addr: SocketAddr,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        // wake the blocking accept
        let mut addr = self.addr;
        if addr.ip().is_unspecified() {
            addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        let _ = TcpStream::connect(addr);
    }
}

impl Server {
    pub fn bind(config: ServerConfig) -> Result<Self> {
        let users = match &config.users_file {
            Some(path) => {
                let users = parse_users(BufReader::new(File::open(path)?))?;
                info!("Loaded {} users from {}", users.len(), path.display());
                Some(users)
            }
            None => {
                warn!("No users file given, accepting any credentials");
                None
            }
        };
        let store = HitStore::open_with(&config.data_dir, config.cache)?;
        let listener = TcpListener::bind((config.bind.as_str(), config.port))?;
        let local_addr = listener.local_addr()?;
        info!("Listening on {}", local_addr);

        Ok(Server {
            listener,
            local_addr,
            shared: Arc::new(Shared {
                store,
                registry: LockRegistry::new(config.lock),
                users,
                active: AtomicUsize::new(0),
                max_connections: config.max_connections.max(1),
                max_frame_len: MAX_FRAME_LEN,
            }),
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stopped: Arc::clone(&self.stopped),
            addr: self.local_addr,
        }
    }

    /// Accept connections until shut down.
    pub fn serve(self) -> Result<()> {
        for stream in self.listener.incoming() {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            let peer = stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown peer".to_string());

            if self.shared.active.load(Ordering::SeqCst) >= self.shared.max_connections {
                warn!("Rejecting {}: {} connections open", peer, self.shared.max_connections);
                let mut writer = BufWriter::new(stream);
                let _ = write_frame(
                    &mut writer,
                    &Response::Error {
                        kind: ErrorKind::Server,
                        message: "too many connections".to_string(),
                    },
                );
                continue;
            }

            // a failed spawn drops the closure and with it the slot
            let slot = ConnectionSlot::take(&self.shared);
            let spawned = thread::Builder::new()
                .name(format!("readdb-{}", peer))
                .spawn(move || {
                    let shared = &slot.shared;
                    debug!("Connection from {}", peer);
                    match handle_connection(shared, stream) {
                        Ok(()) => debug!("{} disconnected", peer),
                        Err(e) if e.is_connection() => debug!("{} disconnected: {}", peer, e),
                        Err(e) => error!("Connection to {} failed: {}", peer, e),
                    }
                });
            if let Err(e) = spawned {
                error!("Failed to spawn connection thread: {}", e);
            }
        }
        info!("Server on {} stopped", self.local_addr);
        Ok(())
    }
}

fn handle_connection(shared: &Shared, stream: TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);
    let mut locks = shared.registry.lock_set();
    let result = serve_requests(shared, &mut reader, &mut writer, &mut locks);
    locks.release_all();
    result
}

fn serve_requests<R: Read, W: Write>(
    shared: &Shared,
    reader: &mut R,
    writer: &mut W,
    locks: &mut LockSet,
) -> Result<()> {
    let mut session = Session::default();
    while let Some(request) = read_frame::<_, Request>(reader)? {
        if request == Request::Bye {
            break;
        }
        let name = request.name();
        let response = session.respond(shared, locks, request);
        locks.release_all();
        match write_frame_limited(writer, &response, shared.max_frame_len) {
            Ok(()) => {}
            // nothing was written; answer with the error instead
            Err(e) if e.is_client_side() => {
                warn!("{} response dropped: {}", name, e);
                write_frame(writer, &Response::from_error(&e))?;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Session {
    greeted: bool,
    user: Option<String>,
}

impl Session {
    fn respond(&mut self, shared: &Shared, locks: &mut LockSet, request: Request) -> Response {
        let name = request.name();
        match self.dispatch(shared, locks, request) {
            Ok(response) => response,
            Err(e) => {
                if e.is_client_side() || matches!(e, ReadDbError::Auth(_)) {
                    debug!("{} request rejected: {}", name, e);
                } else {
                    error!("{} request failed: {}", name, e);
                }
                Response::from_error(&e)
            }
        }
    }

    fn dispatch(&mut self, shared: &Shared, locks: &mut LockSet, request: Request) -> Result<Response> {
        let store = &shared.store;
        match request {
            Request::Hello { version } => {
                if version != PROTOCOL_VERSION {
                    return Err(ReadDbError::Client(format!(
                        "unsupported protocol version {} (server speaks {})",
                        version, PROTOCOL_VERSION
                    )));
                }
                self.greeted = true;
                return Ok(Response::Ready {
                    version: PROTOCOL_VERSION,
                });
            }
            Request::Authenticate { user, password } => {
                if !self.greeted {
                    return Err(ReadDbError::Client("expected hello first".to_string()));
                }
                let accepted = match &shared.users {
                    Some(users) => users.get(&user) == Some(&password),
                    None => true,
                };
                if !accepted {
                    return Err(ReadDbError::Auth(format!("bad credentials for '{}'", user)));
                }
                debug!("Authenticated {}", user);
                self.user = Some(user);
                return Ok(Response::Ok);
            }
            Request::Ping => return Ok(Response::Ok),
            _ => {}
        }

        if self.user.is_none() {
            return Err(ReadDbError::Client("not authenticated".to_string()));
        }

        match request {
            Request::SingleHits(query) => Ok(Response::SingleHits(store.single_hits(locks, &query)?)),
            Request::PairedHits { region, left_side } => Ok(Response::PairedHits(
                store.paired_hits(locks, &region, left_side)?,
            )),
            Request::Histogram(query) => histogram(store, locks, &query),
            Request::WeightHistogram(query) => weight_histogram(store, locks, &query),
            Request::Count { region, paired } => Ok(Response::Count(store.count(locks, &region, paired)?)),
            Request::Weight { region, paired } => {
                Ok(Response::Weight(store.weight(locks, &region, paired)?))
            }
            Request::Chroms { alignment, paired } => {
                Ok(Response::Chroms(store.chroms(locks, &alignment, paired)?))
            }
            Request::Exists { alignment } => Ok(Response::Exists(store.exists(locks, &alignment)?)),
            Request::AddSingleHits { alignment, hits } => {
                let added = store.add_single_hits(locks, &alignment, &hits)?;
                Ok(Response::Count(added as u64))
            }
            Request::AddPairedHits { alignment, hits } => {
                let added = store.add_paired_hits(locks, &alignment, &hits)?;
                Ok(Response::Count(added as u64))
            }
            Request::DeleteAlignment { alignment } => {
                store.delete_alignment(locks, &alignment)?;
                Ok(Response::Ok)
            }
            Request::Hello { .. } | Request::Authenticate { .. } | Request::Ping | Request::Bye => {
                Err(ReadDbError::Client("unexpected request".to_string()))
            }
        }
    }
}

// Extended reads can reach into the region from hits outside it.
fn fetch_region(query: &HistogramQuery) -> RegionQuery {
    let mut region = query.region.clone();
    region.start = region.start.saturating_sub(query.extension);
    region.end = region.end.saturating_add(query.extension);
    region
}

fn histogram(store: &HitStore, locks: &mut LockSet, query: &HistogramQuery) -> Result<Response> {
    query.validate()?;
    let bins = Bins::new(query.region.start, query.region.end, query.bin_size);
    let region = fetch_region(query);
    let counts = if query.paired {
        let hits = dedup_paired(store.paired_hits(locks, &region, true)?, query.dedup);
        paired_histogram(&hits, query.extension, bins)?
    } else {
        let hits = dedup_single(store.single_hits(locks, &region)?, query.dedup);
        single_histogram(&hits, query.extension, bins)?
    };
    Ok(Response::Histogram(counts))
}

fn weight_histogram(
    store: &HitStore,
    locks: &mut LockSet,
    query: &HistogramQuery,
) -> Result<Response> {
    query.validate()?;
    let bins = Bins::new(query.region.start, query.region.end, query.bin_size);
    let region = fetch_region(query);
    let weights = if query.paired {
        let hits = dedup_paired(store.paired_hits(locks, &region, true)?, query.dedup);
        paired_weight_histogram(&hits, query.extension, bins)?
    } else {
        let hits = dedup_single(store.single_hits(locks, &region)?, query.dedup);
        single_weight_histogram(&hits, query.extension, bins)?
    };
    Ok(Response::WeightHistogram(weights))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hits::{SingleHit, Strand};

    fn shared(users: Option<FxHashMap<String, String>>) -> (tempfile::TempDir, Shared) {
        let dir = tempfile::tempdir().unwrap();
        let shared = Shared {
            store: HitStore::open(dir.path()).unwrap(),
            registry: LockRegistry::new(LockConfig::default()),
            users,
            active: AtomicUsize::new(0),
            max_connections: 4,
            max_frame_len: MAX_FRAME_LEN,
        };
        (dir, shared)
    }

    fn frames(requests: &[Request]) -> Vec<u8> {
        let mut buf = Vec::new();
        for request in requests {
            write_frame(&mut buf, request).unwrap();
        }
        buf
    }

    #[test]
    fn test_parse_users() {
        let text = "# comment\nalice\tsecret\n\nbob\tpa ss\n";
        let users = parse_users(text.as_bytes()).unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users["bob"], "pa ss");
        assert!(parse_users("nopassword\n".as_bytes()).is_err());
    }

    #[test]
    fn test_requests_need_authentication() {
        let mut users = FxHashMap::default();
        users.insert("alice".to_string(), "secret".to_string());
        let (_dir, shared) = shared(Some(users));
        let mut locks = shared.registry.lock_set();
        let mut session = Session::default();

        let exists = Request::Exists {
            alignment: "a".to_string(),
        };
        assert!(matches!(
            session.respond(&shared, &mut locks, exists.clone()),
            Response::Error { kind: ErrorKind::Client, .. }
        ));
        assert_eq!(
            session.respond(&shared, &mut locks, Request::Hello { version: PROTOCOL_VERSION }),
            Response::Ready { version: PROTOCOL_VERSION }
        );
        let wrong = Request::Authenticate {
            user: "alice".to_string(),
            password: "nope".to_string(),
        };
        assert!(matches!(
            session.respond(&shared, &mut locks, wrong),
            Response::Error { kind: ErrorKind::Auth, .. }
        ));
        let right = Request::Authenticate {
            user: "alice".to_string(),
            password: "secret".to_string(),
        };
        assert_eq!(session.respond(&shared, &mut locks, right), Response::Ok);
        assert_eq!(
            session.respond(&shared, &mut locks, exists),
            Response::Exists(false)
        );
    }

    #[test]
    fn test_histogram_with_dedup() {
        let (_dir, shared) = shared(None);
        let mut locks = shared.registry.lock_set();
        let hits = vec![
            SingleHit::new(1, 5, Strand::Plus, 36, 1.0),
            SingleHit::new(1, 5, Strand::Plus, 36, 1.0),
            SingleHit::new(1, 5, Strand::Plus, 36, 1.0),
            SingleHit::new(1, 15, Strand::Plus, 36, 1.0),
        ];
        shared.store.add_single_hits(&mut locks, "a", &hits).unwrap();
        locks.release_all();

        let mut query = HistogramQuery {
            region: RegionQuery::new(vec!["a".to_string()], 1, 1, 30),
            paired: false,
            extension: 0,
            bin_size: 10,
            dedup: 0,
        };
        assert_eq!(
            histogram(&shared.store, &mut locks, &query).unwrap(),
            Response::Histogram(vec![(1, 3), (11, 1)])
        );
        query.dedup = 2;
        assert_eq!(
            histogram(&shared.store, &mut locks, &query).unwrap(),
            Response::Histogram(vec![(1, 2), (11, 1)])
        );
    }

    #[test]
    fn test_extension_reaches_from_outside_region() {
        let (_dir, shared) = shared(None);
        let mut locks = shared.registry.lock_set();
        let hits = vec![SingleHit::new(1, 45, Strand::Minus, 36, 0.5)];
        shared.store.add_single_hits(&mut locks, "a", &hits).unwrap();
        let query = HistogramQuery {
            region: RegionQuery::new(vec!["a".to_string()], 1, 1, 30),
            paired: false,
            extension: 20,
            bin_size: 10,
            dedup: 0,
        };
        assert_eq!(
            histogram(&shared.store, &mut locks, &query).unwrap(),
            Response::Histogram(vec![(21, 1)])
        );
        assert_eq!(
            weight_histogram(&shared.store, &mut locks, &query).unwrap(),
            Response::WeightHistogram(vec![(21, 0.5)])
        );
    }

    #[test]
    fn test_oversized_response_keeps_session_open() {
        let (_dir, mut shared) = shared(None);
        shared.max_frame_len = 512;
        let hits: Vec<SingleHit> = (0..100)
            .map(|i| SingleHit::new(1, i + 1, Strand::Plus, 36, 1.0))
            .collect();
        let region = RegionQuery::new(vec!["a".to_string()], 1, 1, 1000);
        let input = frames(&[
            Request::Hello {
                version: PROTOCOL_VERSION,
            },
            Request::Authenticate {
                user: "tester".to_string(),
                password: String::new(),
            },
            Request::AddSingleHits {
                alignment: "a".to_string(),
                hits,
            },
            Request::SingleHits(region.clone()),
            Request::Count {
                region,
                paired: false,
            },
            Request::Bye,
        ]);

        let mut reader = input.as_slice();
        let mut output = Vec::new();
        let mut locks = shared.registry.lock_set();
        serve_requests(&shared, &mut reader, &mut output, &mut locks).unwrap();

        let mut replies = output.as_slice();
        let mut next = || read_frame::<_, Response>(&mut replies).unwrap();
        assert_eq!(
            next(),
            Some(Response::Ready {
                version: PROTOCOL_VERSION
            })
        );
        assert_eq!(next(), Some(Response::Ok));
        assert_eq!(next(), Some(Response::Count(100)));
        assert!(matches!(
            next(),
            Some(Response::Error {
                kind: ErrorKind::Client,
                ..
            })
        ));
        assert_eq!(next(), Some(Response::Count(100)));
        assert_eq!(next(), None);
    }

    #[test]
    fn test_connection_slot_released_when_thread_panics() {
        let (_dir, shared) = shared(None);
        let shared = Arc::new(shared);
        let slot = ConnectionSlot::take(&shared);
        assert_eq!(shared.active.load(Ordering::SeqCst), 1);
        let handle = thread::spawn(move || {
            let _slot = slot;
            panic!("connection handler failed");
        });
        assert!(handle.join().is_err());
        assert_eq!(shared.active.load(Ordering::SeqCst), 0);
    }
}
