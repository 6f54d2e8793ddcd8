//! Ingress Sources
//!
//! Packet producers polled by the ingress core. A source hands out owned
//! packets in bursts and reports when it has nothing more to give.

use crate::buffer::{Packet, MAX_PACKET_SIZE};
use crate::config::{InputConfig, InputMode};
use crate::error::{PipelineError, Result};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::path::Path;

/// Burst-oriented packet source
pub trait IngressSource: Send {
    /// Source name for logs and the report
    fn name(&self) -> &str;

    /// Append up to `max` packets to `out`, returning how many were added
    fn rx_burst(&mut self, out: &mut Vec<Packet>, max: usize) -> Result<usize>;

    /// True once no further packets will ever be produced
    fn is_exhausted(&self) -> bool;
}

/// Build the source described by `config`
pub fn from_config(config: &InputConfig) -> Result<Box<dyn IngressSource>> {
    match config.mode {
        InputMode::Synthetic => Ok(Box::new(SyntheticSource::new(
            config.payload.as_bytes(),
            config.packet_size,
            config.packets,
        )?)),
        InputMode::TextFile => {
            let path = config
                .file
                .as_ref()
                .ok_or_else(|| PipelineError::Ingress("text_file input requires a file".into()))?;
            Ok(Box::new(TextFileSource::open(
                path,
                config.buf_len,
                config.overlap,
                config.iterations,
            )?))
        }
    }
}

/// Fixed-payload generator
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    payload: Bytes,
    /// Packets left to generate; `None` is unbounded
    remaining: Option<u64>,
    generated: u64,
}

impl SyntheticSource {
    /// Generate `count` packets (0 = unbounded) whose payload is `pattern`
    /// repeated or truncated to `packet_size` bytes
    pub fn new(pattern: &[u8], packet_size: usize, count: u64) -> Result<Self> {
        if packet_size == 0 || packet_size > MAX_PACKET_SIZE {
            return Err(PipelineError::Ingress(format!(
                "packet size {} must be between 1 and {}",
                packet_size, MAX_PACKET_SIZE
            )));
        }

        let mut payload = BytesMut::with_capacity(packet_size);
        if pattern.is_empty() {
            payload.resize(packet_size, 0);
        } else {
            while payload.len() < packet_size {
                let take = (packet_size - payload.len()).min(pattern.len());
                payload.extend_from_slice(&pattern[..take]);
            }
        }

        Ok(Self {
            payload: payload.freeze(),
            remaining: (count > 0).then_some(count),
            generated: 0,
        })
    }

    /// Packets produced so far
    pub fn generated(&self) -> u64 {
        self.generated
    }
}

impl IngressSource for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn rx_burst(&mut self, out: &mut Vec<Packet>, max: usize) -> Result<usize> {
        let n = match self.remaining {
            Some(left) => (left.min(max as u64)) as usize,
            None => max,
        };
        for _ in 0..n {
            out.push(Packet::new(&self.payload));
        }
        if let Some(left) = self.remaining.as_mut() {
            *left -= n as u64;
        }
        self.generated += n as u64;
        Ok(n)
    }

    fn is_exhausted(&self) -> bool {
        self.remaining == Some(0)
    }
}

/// Text file cut into fixed-length buffers
///
/// Consecutive buffers share `overlap` bytes so a pattern spanning a
/// boundary is still seen whole. The last buffer of a pass is truncated,
/// and the file is replayed `iterations` times (0 = forever).
#[derive(Debug, Clone)]
pub struct TextFileSource {
    data: Bytes,
    buf_len: usize,
    overlap: usize,
    iterations: u32,
    completed_passes: u32,
    offset: usize,
}

impl TextFileSource {
    /// Load `path` into memory
    pub fn open(path: &Path, buf_len: usize, overlap: usize, iterations: u32) -> Result<Self> {
        let data = std::fs::read(path)
            .map_err(|e| PipelineError::Ingress(format!("{}: {}", path.display(), e)))?;
        tracing::info!(path = %path.display(), bytes = data.len(), buf_len, overlap, "input file loaded");
        Self::from_bytes(Bytes::from(data), buf_len, overlap, iterations)
    }

    /// Serve buffers cut from `data`; `buf_len` is capped at `MAX_PACKET_SIZE`
    pub fn from_bytes(data: Bytes, buf_len: usize, overlap: usize, iterations: u32) -> Result<Self> {
        if data.is_empty() {
            return Err(PipelineError::Ingress("input file is empty".into()));
        }
        if buf_len == 0 || buf_len > MAX_PACKET_SIZE || overlap >= buf_len {
            return Err(PipelineError::Ingress(format!(
                "invalid buffer geometry: buf_len {} overlap {}",
                buf_len, overlap
            )));
        }
        Ok(Self {
            data,
            buf_len,
            overlap,
            iterations,
            completed_passes: 0,
            offset: 0,
        })
    }

    /// Full passes over the file so far
    pub fn completed_passes(&self) -> u32 {
        self.completed_passes
    }

    fn next_buffer(&mut self) -> Bytes {
        let end = self.offset + self.buf_len;
        if end >= self.data.len() {
            let chunk = self.data.slice(self.offset..);
            self.completed_passes += 1;
            self.offset = 0;
            chunk
        } else {
            let chunk = self.data.slice(self.offset..end);
            self.offset = end - self.overlap;
            chunk
        }
    }
}

impl IngressSource for TextFileSource {
    fn name(&self) -> &str {
        "text_file"
    }

    fn rx_burst(&mut self, out: &mut Vec<Packet>, max: usize) -> Result<usize> {
        let mut n = 0;
        while n < max && !self.is_exhausted() {
            let chunk = self.next_buffer();
            out.push(Packet::new(&chunk));
            n += 1;
        }
        Ok(n)
    }

    fn is_exhausted(&self) -> bool {
        self.iterations > 0 && self.completed_passes >= self.iterations
    }
}

/// Pre-built packets, mostly for tests and embedding
#[derive(Debug, Default)]
pub struct VecSource {
    packets: VecDeque<Packet>,
}

impl VecSource {
    /// Serve `packets` in order
    pub fn new(packets: Vec<Packet>) -> Self {
        Self {
            packets: packets.into(),
        }
    }

    /// One packet per payload
    pub fn from_payloads<I, P>(payloads: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        Self::new(payloads.into_iter().map(|p| Packet::new(p.as_ref())).collect())
    }
}

impl IngressSource for VecSource {
    fn name(&self) -> &str {
        "vec"
    }

    fn rx_burst(&mut self, out: &mut Vec<Packet>, max: usize) -> Result<usize> {
        let n = max.min(self.packets.len());
        out.extend(self.packets.drain(..n));
        Ok(n)
    }

    fn is_exhausted(&self) -> bool {
        self.packets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payloads(out: &[Packet]) -> Vec<&[u8]> {
        out.iter().map(|p| p.data()).collect()
    }

    #[test]
    fn test_synthetic_bounded() {
        let mut src = SyntheticSource::new(b"abc", 8, 5).unwrap();
        let mut out = Vec::new();
        assert_eq!(src.rx_burst(&mut out, 4).unwrap(), 4);
        assert_eq!(src.rx_burst(&mut out, 4).unwrap(), 1);
        assert_eq!(src.rx_burst(&mut out, 4).unwrap(), 0);
        assert!(src.is_exhausted());
        assert_eq!(out[0].data(), b"abcabcab");
        assert_eq!(src.generated(), 5);
    }

    #[test]
    fn test_synthetic_unbounded() {
        let mut src = SyntheticSource::new(b"x", 4, 0).unwrap();
        let mut out = Vec::new();
        for _ in 0..10 {
            src.rx_burst(&mut out, 32).unwrap();
        }
        assert_eq!(out.len(), 320);
        assert!(!src.is_exhausted());
    }

    #[test]
    fn test_text_file_overlap() {
        let mut src = TextFileSource::from_bytes(Bytes::from_static(b"abcdefghij"), 4, 1, 1).unwrap();
        let mut out = Vec::new();
        src.rx_burst(&mut out, 16).unwrap();
        assert_eq!(payloads(&out), vec![&b"abcd"[..], b"defg", b"ghij"]);
        assert!(src.is_exhausted());
    }

    #[test]
    fn test_text_file_truncated_tail_and_iterations() {
        let mut src = TextFileSource::from_bytes(Bytes::from_static(b"abcdefg"), 3, 0, 2).unwrap();
        let mut out = Vec::new();
        while !src.is_exhausted() {
            src.rx_burst(&mut out, 2).unwrap();
        }
        assert_eq!(
            payloads(&out),
            vec![&b"abc"[..], b"def", b"g", b"abc", b"def", b"g"]
        );
        assert_eq!(src.completed_passes(), 2);
    }

    #[test]
    fn test_text_file_geometry() {
        let data = Bytes::from_static(b"data");
        assert!(TextFileSource::from_bytes(data.clone(), 0, 0, 1).is_err());
        assert!(TextFileSource::from_bytes(data.clone(), 4, 4, 1).is_err());
        assert!(TextFileSource::from_bytes(Bytes::new(), 4, 0, 1).is_err());
        assert!(TextFileSource::from_bytes(data, 4, 3, 1).is_ok());
    }

    #[test]
    fn test_packet_size_capped() {
        assert!(SyntheticSource::new(b"x", MAX_PACKET_SIZE, 1).is_ok());
        assert!(SyntheticSource::new(b"x", MAX_PACKET_SIZE + 1, 1).is_err());
        assert!(SyntheticSource::new(b"x", 0, 1).is_err());

        let data = Bytes::from(vec![b'a'; MAX_PACKET_SIZE * 2]);
        assert!(TextFileSource::from_bytes(data.clone(), MAX_PACKET_SIZE + 1, 0, 1).is_err());
        let mut src = TextFileSource::from_bytes(data, MAX_PACKET_SIZE, 0, 1).unwrap();
        let mut out = Vec::new();
        src.rx_burst(&mut out, 8).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|p| p.len() == MAX_PACKET_SIZE));
    }

    #[test]
    fn test_from_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.txt");
        std::fs::write(&path, "GET /etc/passwd HTTP/1.1\r\n").unwrap();

        let config = InputConfig {
            mode: InputMode::TextFile,
            file: Some(path),
            buf_len: 8,
            ..Default::default()
        };
        let mut src = from_config(&config).unwrap();
        assert_eq!(src.name(), "text_file");
        let mut out = Vec::new();
        assert_eq!(src.rx_burst(&mut out, 64).unwrap(), 4);
        assert!(src.is_exhausted());

        let missing = InputConfig {
            mode: InputMode::TextFile,
            ..Default::default()
        };
        assert!(from_config(&missing).is_err());
    }

    #[test]
    fn test_vec_source() {
        let mut src = VecSource::from_payloads(["a", "b", "c"]);
        let mut out = Vec::new();
        assert_eq!(src.rx_burst(&mut out, 2).unwrap(), 2);
        assert!(!src.is_exhausted());
        assert_eq!(src.rx_burst(&mut out, 2).unwrap(), 1);
        assert!(src.is_exhausted());
    }
}
