//! Client for the remote embedding service.
//!
//! The service speaks a strict request/reply protocol: the client sends one
//! protobuf-encoded [`NodeEmbeddingRequest`], then reads exactly one
//! [`NodeEmbeddingResponse`]. Bodies travel in 4-byte little-endian length
//! frames over a persistent TCP connection to `127.0.0.1:<port>`. Each worker
//! thread owns its connection (the client lives inside a scratch slot), so no
//! cross-thread socket sharing ever happens.
//!
//! Any send/receive/parse failure closes the connection; the next call
//! reconnects lazily. Both directions carry a 300 second timeout.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use prost::Message;
use tracing::{debug, warn};

use crate::distance::{norm, Metric};
use crate::error::{Result, SearchError};

/// Send and receive timeout on the embedding connection.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(300);

/// Batch of node ids whose embeddings the engine wants.
#[derive(Clone, PartialEq, Message)]
pub struct NodeEmbeddingRequest {
    #[prost(uint32, repeated, tag = "1")]
    pub node_ids: Vec<u32>,
}

/// Dense vectors for a request batch.
///
/// `dimensions` holds exactly `[batch, dim]`; `embeddings_data` is
/// `batch * dim` little-endian `f32`s packed contiguously. `missing_ids` is
/// reserved for server-side misses.
#[derive(Clone, PartialEq, Message)]
pub struct NodeEmbeddingResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub embeddings_data: Vec<u8>,
    #[prost(int32, repeated, tag = "2")]
    pub dimensions: Vec<i32>,
    #[prost(uint32, repeated, tag = "3")]
    pub missing_ids: Vec<u32>,
}

/// Write one length-framed message body.
pub fn write_frame(stream: &mut TcpStream, body: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(body.len() as u32).to_le_bytes())?;
    stream.write_all(body)?;
    stream.flush()
}

/// Read one length-framed message body.
pub fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok(body)
}

/// Per-worker handle to the embedding service.
///
/// Owned by one scratch slot; the connection persists across queries and is
/// dropped (closing the socket) when the slot is torn down.
pub struct EmbeddingClient {
    port: u16,
    conn: Option<TcpStream>,
}

impl EmbeddingClient {
    pub fn new(port: u16) -> Self {
        Self { port, conn: None }
    }

    fn ensure_connected(&mut self) -> std::io::Result<&mut TcpStream> {
        if self.conn.is_none() {
            let stream = TcpStream::connect(("127.0.0.1", self.port))?;
            stream.set_read_timeout(Some(FETCH_TIMEOUT))?;
            stream.set_write_timeout(Some(FETCH_TIMEOUT))?;
            stream.set_nodelay(true)?;
            debug!(port = self.port, "connected to embedding service");
            self.conn = Some(stream);
        }
        Ok(self.conn.as_mut().unwrap())
    }

    /// Fetch one `f32` vector per id, in request order.
    ///
    /// Fails with [`SearchError::Fetch`] on transport failure, parse failure,
    /// a malformed `dimensions` field, batch-size mismatch, or payload size
    /// mismatch. The connection is closed on every failure path so the next
    /// call starts fresh.
    pub fn fetch(&mut self, node_ids: &[u32]) -> Result<Vec<Vec<f32>>> {
        let req = NodeEmbeddingRequest {
            node_ids: node_ids.to_vec(),
        };
        let body = req.encode_to_vec();

        let outcome = (|| -> std::result::Result<Vec<u8>, String> {
            let stream = self
                .ensure_connected()
                .map_err(|e| format!("connect: {e}"))?;
            write_frame(stream, &body).map_err(|e| format!("send: {e}"))?;
            read_frame(stream).map_err(|e| format!("recv: {e}"))
        })();

        let raw = match outcome {
            Ok(raw) => raw,
            Err(msg) => {
                warn!(port = self.port, error = %msg, "embedding transport failure");
                self.conn = None;
                return Err(SearchError::Fetch(msg));
            }
        };

        let resp = NodeEmbeddingResponse::decode(raw.as_slice()).map_err(|e| {
            self.conn = None;
            SearchError::Fetch(format!("decode: {e}"))
        })?;

        if resp.dimensions.len() != 2 {
            self.conn = None;
            return Err(SearchError::Fetch(format!(
                "response has {} dimension entries, expected 2",
                resp.dimensions.len()
            )));
        }
        let batch = resp.dimensions[0];
        let dim = resp.dimensions[1];
        if batch < 0 || dim < 0 || batch as usize != node_ids.len() {
            self.conn = None;
            return Err(SearchError::Fetch(format!(
                "response batch {} does not match request of {}",
                batch,
                node_ids.len()
            )));
        }
        let (batch, dim) = (batch as usize, dim as usize);
        let expected = batch * dim * 4;
        if resp.embeddings_data.len() != expected {
            self.conn = None;
            return Err(SearchError::Fetch(format!(
                "embedding payload is {} bytes, expected {}",
                resp.embeddings_data.len(),
                expected
            )));
        }

        let mut out = Vec::with_capacity(batch);
        for i in 0..batch {
            let bytes = &resp.embeddings_data[i * dim * 4..(i + 1) * dim * 4];
            out.push(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            );
        }
        Ok(out)
    }
}

/// Apply the same transform the index builder applied to the base set, so
/// that distances against fetched embeddings land in the search regime.
///
/// L2: none. Cosine: per-vector normalize. Inner product: scale the first
/// `data_dim - 1` dims by `1 / max_base_norm` and append the MIPS-to-L2
/// coordinate `sqrt(max(0, 1 - ||v||^2 / max_base_norm^2))`.
pub fn preprocess_fetched(
    embeddings: &mut [Vec<f32>],
    metric: Metric,
    max_base_norm: f32,
    data_dim: usize,
) {
    for emb in embeddings.iter_mut() {
        if emb.len() < data_dim.saturating_sub(1) {
            emb.resize(data_dim.saturating_sub(1), 0.0);
        }
        match metric {
            Metric::InnerProduct => {
                let inherent = data_dim - 1;
                let norm_sq: f32 = emb[..inherent].iter().map(|v| v * v).sum();
                for v in emb[..inherent].iter_mut() {
                    *v /= max_base_norm;
                }
                let res = 1.0 - norm_sq / (max_base_norm * max_base_norm);
                let tail = if res <= 0.0 { 0.0 } else { res.sqrt() };
                emb.resize(data_dim, tail);
            }
            Metric::Cosine => {
                let n = norm(emb);
                if n > 0.0 {
                    for v in emb.iter_mut() {
                        *v /= n;
                    }
                }
            }
            Metric::L2 => {}
        }
    }
}
