//! Fixtures shared by the engine tests: a loopback HTTP stub and a data
//! store that rejects blank keys the way a uuid column does.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use charstudio_contracts::{Character, CharacterUpdate, NewCharacter, NewPose, Pose};
use reqwest::blocking::Client as HttpClient;
use serde_json::Value;

use crate::local::LocalBackend;
use crate::ports::DataStore;

const STUB_WAIT: Duration = Duration::from_secs(10);

/// Client that never routes loopback traffic through an environment proxy.
pub(crate) fn loopback_client() -> Result<HttpClient> {
    HttpClient::builder()
        .no_proxy()
        .build()
        .context("failed to build loopback http client")
}

#[derive(Debug, Clone)]
pub(crate) struct CapturedRequest {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CapturedRequest {
    /// Header value by lower-case name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn json(&self) -> Result<Value> {
        serde_json::from_slice(&self.body).context("request body is not json")
    }

    /// Decoded query pairs of the request target.
    pub fn query(&self) -> Result<Vec<(String, String)>> {
        let url = reqwest::Url::parse(&format!("http://stub{}", self.target))?;
        Ok(url
            .query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect())
    }

    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct StubReply {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl StubReply {
    pub fn new(status: u16, content_type: &'static str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type,
            body: body.into(),
        }
    }

    pub fn json(status: u16, body: &Value) -> Self {
        Self::new(status, "application/json", body.to_string())
    }
}

/// Serves one scripted reply per connection on 127.0.0.1, then stops.
pub(crate) struct StubServer {
    base: String,
    handle: JoinHandle<Result<Vec<CapturedRequest>>>,
}

impl StubServer {
    pub fn start(replies: Vec<StubReply>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let base = format!("http://{}", listener.local_addr()?);
        let handle = thread::spawn(move || {
            let mut captured = Vec::with_capacity(replies.len());
            for reply in &replies {
                let stream = accept(&listener)?;
                captured.push(serve(stream, reply)?);
            }
            Ok(captured)
        });
        Ok(Self { base, handle })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Waits for every scripted reply to be served and returns the requests.
    pub fn finish(self) -> Result<Vec<CapturedRequest>> {
        self.handle
            .join()
            .map_err(|_| anyhow!("stub server thread panicked"))?
    }
}

fn accept(listener: &TcpListener) -> Result<TcpStream> {
    let deadline = Instant::now() + STUB_WAIT;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                stream.set_read_timeout(Some(STUB_WAIT))?;
                return Ok(stream);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    bail!("no request reached the stub server");
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn serve(stream: TcpStream, reply: &StubReply) -> Result<CapturedRequest> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    loop {
        line.clear();
        reader.read_line(&mut line)?;
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }
    let length = headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body)?;

    let mut writer = stream;
    write!(
        writer,
        "HTTP/1.1 {} Stub\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        reply.status,
        reply.content_type,
        reply.body.len()
    )?;
    writer.write_all(&reply.body)?;
    writer.flush()?;

    Ok(CapturedRequest {
        method,
        target,
        headers,
        body,
    })
}

/// Local store whose keyed calls fail on a blank id, like PostgREST
/// filtering a uuid primary key with `eq.`.
pub(crate) struct UuidKeyedStore {
    inner: Arc<LocalBackend>,
    keyed_calls: AtomicUsize,
}

impl UuidKeyedStore {
    pub fn new(inner: Arc<LocalBackend>) -> Self {
        Self {
            inner,
            keyed_calls: AtomicUsize::new(0),
        }
    }

    /// Number of calls that reached the store with an id.
    pub fn keyed_calls(&self) -> usize {
        self.keyed_calls.load(Ordering::SeqCst)
    }

    fn key(&self, id: &str) -> Result<()> {
        self.keyed_calls.fetch_add(1, Ordering::SeqCst);
        if id.trim().is_empty() {
            bail!("Supabase request failed (400): invalid input syntax for type uuid: \"{id}\"");
        }
        Ok(())
    }
}

impl DataStore for UuidKeyedStore {
    fn insert_character(&self, row: &NewCharacter) -> Result<Character> {
        self.inner.insert_character(row)
    }

    fn get_character(&self, id: &str) -> Result<Option<Character>> {
        self.key(id)?;
        self.inner.get_character(id)
    }

    fn list_characters(&self) -> Result<Vec<Character>> {
        self.inner.list_characters()
    }

    fn update_character(&self, id: &str, update: &CharacterUpdate) -> Result<Character> {
        self.key(id)?;
        self.inner.update_character(id, update)
    }

    fn delete_character(&self, id: &str) -> Result<()> {
        self.key(id)?;
        self.inner.delete_character(id)
    }

    fn insert_pose(&self, row: &NewPose) -> Result<Pose> {
        self.key(&row.character_id)?;
        self.inner.insert_pose(row)
    }

    fn list_poses(&self) -> Result<Vec<Pose>> {
        self.inner.list_poses()
    }

    fn delete_pose(&self, id: &str) -> Result<()> {
        self.key(id)?;
        self.inner.delete_pose(id)
    }

    fn delete_poses_for_character(&self, character_id: &str) -> Result<()> {
        self.key(character_id)?;
        self.inner.delete_poses_for_character(character_id)
    }
}
