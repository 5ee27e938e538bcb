//! Blocking client for a readdb server.
//!
//! A [`Client`] owns one connection and is used from one thread at a time.
//! Any connection-level failure closes it; call [`Client::reconnect`] to
//! start over. Request-level failures ([`ReadDbError::Client`]) leave the
//! connection usable.

use crate::aggregate::{dedup_paired, dedup_single};
use crate::error::{ReadDbError, Result};
use crate::hits::{PairedHit, SingleHit};
use crate::protocol::{
    read_frame, write_frame, HistogramQuery, RegionQuery, Request, Response, PROTOCOL_VERSION,
};
use log::{debug, info};
use std::collections::BTreeMap;
use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, TcpStream};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: 52000,
            user: "readdb".to_string(),
            password: String::new(),
        }
    }
}

struct Connection {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Connection {
    fn open(config: &ClientConfig) -> Result<Self> {
        let stream = TcpStream::connect((config.host.as_str(), config.port)).map_err(|e| {
            ReadDbError::Connection(format!(
                "cannot connect to {}:{}: {}",
                config.host, config.port, e
            ))
        })?;
        stream
            .set_nodelay(true)
            .map_err(|e| ReadDbError::Connection(e.to_string()))?;
        let reader = stream
            .try_clone()
            .map_err(|e| ReadDbError::Connection(e.to_string()))?;
        let mut connection = Connection {
            reader: BufReader::new(reader),
            writer: BufWriter::new(stream),
        };

        match connection.exchange(&Request::Hello {
            version: PROTOCOL_VERSION,
        })? {
            Response::Ready { version } => debug!("Server speaks protocol {}", version),
            other => return Err(unexpected("hello", &other)),
        }
        match connection.exchange(&Request::Authenticate {
            user: config.user.clone(),
            password: config.password.clone(),
        })? {
            Response::Ok => {}
            other => return Err(unexpected("authenticate", &other)),
        }
        Ok(connection)
    }

    fn exchange(&mut self, request: &Request) -> Result<Response> {
        write_frame(&mut self.writer, request)?;
        match read_frame::<_, Response>(&mut self.reader)? {
            Some(response) => response.into_result(),
            None => Err(ReadDbError::Connection(
                "server closed the connection".to_string(),
            )),
        }
    }

    fn shutdown(mut self) {
        let _ = write_frame(&mut self.writer, &Request::Bye);
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
    }
}

fn unexpected(request: &str, response: &Response) -> ReadDbError {
    ReadDbError::Connection(format!(
        "unexpected response to {}: {:?}",
        request, response
    ))
}

enum State {
    Unconnected,
    Connected(Connection),
    Closed,
}

pub struct Client {
    config: ClientConfig,
    state: State,
}

impl Client {
    /// A client that has not connected yet.
    pub fn new(config: ClientConfig) -> Self {
        Client {
            config,
            state: State::Unconnected,
        }
    }

    /// Connect and authenticate.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        let mut client = Client::new(config);
        client.reconnect()?;
        Ok(client)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, State::Connected(_))
    }

    /// Drop any current connection and connect again.
    pub fn reconnect(&mut self) -> Result<()> {
        if let State::Connected(connection) = std::mem::replace(&mut self.state, State::Unconnected) {
            connection.shutdown();
        }
        let connection = Connection::open(&self.config)?;
        info!(
            "Connected to {}:{} as {}",
            self.config.host, self.config.port, self.config.user
        );
        self.state = State::Connected(connection);
        Ok(())
    }

    /// Say goodbye and drop the connection. Calling it again does nothing.
    pub fn close(&mut self) {
        if let State::Connected(connection) = std::mem::replace(&mut self.state, State::Closed) {
            connection.shutdown();
            debug!("Closed connection to {}:{}", self.config.host, self.config.port);
        }
    }

    fn call(&mut self, request: Request) -> Result<Response> {
        let name = request.name();
        let State::Connected(connection) = &mut self.state else {
            return Err(ReadDbError::Connection(format!(
                "{} on a client that is not connected",
                name
            )));
        };
        let result = connection.exchange(&request);
        if let Err(e) = &result {
            if e.is_connection() {
                self.state = State::Closed;
            }
        }
        result
    }

    pub fn ping(&mut self) -> Result<()> {
        match self.call(Request::Ping)? {
            Response::Ok => Ok(()),
            other => Err(unexpected("ping", &other)),
        }
    }

    /// Single hits with their 5' end in the region, ordered by position.
    pub fn single_hits(&mut self, region: &RegionQuery) -> Result<Vec<SingleHit>> {
        match self.call(Request::SingleHits(region.clone()))? {
            Response::SingleHits(hits) => Ok(hits),
            other => Err(unexpected("single hits", &other)),
        }
    }

    /// Paired hits whose left (or right) end lies in the region.
    pub fn paired_hits(&mut self, region: &RegionQuery, left_side: bool) -> Result<Vec<PairedHit>> {
        match self.call(Request::PairedHits {
            region: region.clone(),
            left_side,
        })? {
            Response::PairedHits(hits) => Ok(hits),
            other => Err(unexpected("paired hits", &other)),
        }
    }

    /// [`Client::single_hits`] keeping at most `dedup` hits per location.
    pub fn single_hits_dedup(&mut self, region: &RegionQuery, dedup: u32) -> Result<Vec<SingleHit>> {
        Ok(dedup_single(self.single_hits(region)?, dedup))
    }

    pub fn paired_hits_dedup(
        &mut self,
        region: &RegionQuery,
        left_side: bool,
        dedup: u32,
    ) -> Result<Vec<PairedHit>> {
        Ok(dedup_paired(self.paired_hits(region, left_side)?, dedup))
    }

    /// Hit counts keyed by bin start.
    pub fn histogram(&mut self, query: &HistogramQuery) -> Result<BTreeMap<i32, u32>> {
        query.validate()?;
        match self.call(Request::Histogram(query.clone()))? {
            Response::Histogram(bins) => Ok(bins.into_iter().collect()),
            other => Err(unexpected("histogram", &other)),
        }
    }

    /// Weight sums keyed by bin start.
    pub fn weight_histogram(&mut self, query: &HistogramQuery) -> Result<BTreeMap<i32, f32>> {
        query.validate()?;
        match self.call(Request::WeightHistogram(query.clone()))? {
            Response::WeightHistogram(bins) => Ok(bins.into_iter().collect()),
            other => Err(unexpected("weight histogram", &other)),
        }
    }

    pub fn count(&mut self, region: &RegionQuery, paired: bool) -> Result<u64> {
        match self.call(Request::Count {
            region: region.clone(),
            paired,
        })? {
            Response::Count(count) => Ok(count),
            other => Err(unexpected("count", &other)),
        }
    }

    pub fn weight(&mut self, region: &RegionQuery, paired: bool) -> Result<f64> {
        match self.call(Request::Weight {
            region: region.clone(),
            paired,
        })? {
            Response::Weight(weight) => Ok(weight),
            other => Err(unexpected("weight", &other)),
        }
    }

    /// Chromosome ids with hits in `alignment`.
    pub fn chroms(&mut self, alignment: &str, paired: bool) -> Result<Vec<i32>> {
        match self.call(Request::Chroms {
            alignment: alignment.to_string(),
            paired,
        })? {
            Response::Chroms(chroms) => Ok(chroms),
            other => Err(unexpected("chroms", &other)),
        }
    }

    pub fn exists(&mut self, alignment: &str) -> Result<bool> {
        match self.call(Request::Exists {
            alignment: alignment.to_string(),
        })? {
            Response::Exists(exists) => Ok(exists),
            other => Err(unexpected("exists", &other)),
        }
    }

    /// Store hits under `alignment`, creating it on first use.
    pub fn add_single_hits(&mut self, alignment: &str, hits: Vec<SingleHit>) -> Result<u64> {
        match self.call(Request::AddSingleHits {
            alignment: alignment.to_string(),
            hits,
        })? {
            Response::Count(added) => Ok(added),
            other => Err(unexpected("add single hits", &other)),
        }
    }

    pub fn add_paired_hits(&mut self, alignment: &str, hits: Vec<PairedHit>) -> Result<u64> {
        match self.call(Request::AddPairedHits {
            alignment: alignment.to_string(),
            hits,
        })? {
            Response::Count(added) => Ok(added),
            other => Err(unexpected("add paired hits", &other)),
        }
    }

    pub fn delete_alignment(&mut self, alignment: &str) -> Result<()> {
        match self.call(Request::DeleteAlignment {
            alignment: alignment.to_string(),
        })? {
            Response::Ok => Ok(()),
            other => Err(unexpected("delete alignment", &other)),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}
