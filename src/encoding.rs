//! Chunk cell encoding: delta-varint timestamps, float (Raw64/Gorilla) values, CRC32 per chunk.
//!
//! A chunk column cell holds every chunk of one series that falls into the column's
//! slice of the block time range:
//!
//! ```text
//! cell    := chunk_count(var_u32) chunk*
//! chunk   := min_time(var_i64) span(var_u64) payload_len(var_u32) payload crc32(u32)
//! payload := float_codec(u8) sample_count(var_u32) first_ts(i64) ts_delta(var_u64)* values
//! ```
//!
//! The header (`min_time`, `span = max_time - min_time`) lets the decoder skip chunks
//! outside the query window without touching their payload.

use crate::error::QueryError;
use crate::types::{Chunk, Sample, Timestamp};

use bytes::Bytes;
use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Cursor, Read};

/// Float encoding strategy for chunk payloads.
///
/// Serde: lowercase string (e.g. `"raw64"`, `"gorillaxor"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FloatEncoding {
    /// Store IEEE-754 bits verbatim (8 bytes/value).
    Raw64,
    /// Gorilla-style XOR + leading/trailing-zero bitpacking over consecutive values.
    #[default]
    GorillaXor,
}

const FLOAT_CODEC_RAW64: u8 = 1;
const FLOAT_CODEC_GORILLA_XOR: u8 = 2;

/// Upper bound on samples per decoded chunk; larger counts are treated as corruption.
const MAX_CHUNK_SAMPLES: usize = 1 << 24;

/// Decodes a chunk column cell into the chunks overlapping a time window.
///
/// Implementations must return chunks sorted by `min_time` and fail (rather than
/// return partial data) on any malformed input.
pub trait ChunksDecoder: fmt::Debug + Send + Sync {
    /// Decodes the chunks of `data` that overlap `[mint, maxt)`. Chunks are returned
    /// whole; clipping to the window is the caller's job.
    fn decode(
        &self,
        data: &[u8],
        mint: Timestamp,
        maxt: Timestamp,
    ) -> Result<Vec<Chunk>, QueryError>;
}

/// Decoder for cells written by [`XorChunksEncoder`].
#[derive(Debug, Clone, Copy, Default)]
pub struct XorChunksDecoder;

impl ChunksDecoder for XorChunksDecoder {
    fn decode(
        &self,
        data: &[u8],
        mint: Timestamp,
        maxt: Timestamp,
    ) -> Result<Vec<Chunk>, QueryError> {
        let mut cur = Cursor::new(data);
        let count = read_var_u32(&mut cur).map_err(QueryError::decode)? as usize;
        let mut out = Vec::new();
        let mut prev_min = Timestamp::MIN;

        for _ in 0..count {
            let min_time = read_var_i64(&mut cur).map_err(QueryError::decode)?;
            let span = read_var_u64(&mut cur).map_err(QueryError::decode)?;
            let max_time = min_time
                .checked_add_unsigned(span)
                .ok_or_else(|| QueryError::decode("Chunk time span overflow"))?;
            if min_time < prev_min {
                return Err(QueryError::decode("Chunks out of order in cell"));
            }
            prev_min = min_time;

            let payload_len = read_var_u32(&mut cur).map_err(QueryError::decode)? as usize;
            let start = cur.position() as usize;
            let end = start
                .checked_add(payload_len)
                .filter(|&e| e.checked_add(4).map_or(false, |t| t <= data.len()))
                .ok_or_else(|| QueryError::decode("Truncated chunk payload"))?;
            cur.set_position((end + 4) as u64);

            if max_time < mint || min_time >= maxt {
                continue;
            }

            let payload = &data[start..end];
            let expected_crc = u32::from_le_bytes([
                data[end],
                data[end + 1],
                data[end + 2],
                data[end + 3],
            ]);
            if crc32(payload) != expected_crc {
                return Err(QueryError::decode("Chunk payload CRC mismatch"));
            }

            let samples = decode_chunk_payload(payload)?;
            let chunk = Chunk::from_samples(samples)
                .ok_or_else(|| QueryError::decode("Empty chunk payload"))?;
            if chunk.min_time != min_time || chunk.max_time != max_time {
                return Err(QueryError::decode(format!(
                    "Chunk header [{}, {}] disagrees with samples [{}, {}]",
                    min_time, max_time, chunk.min_time, chunk.max_time
                )));
            }
            out.push(chunk);
        }

        if (cur.position() as usize) != data.len() {
            return Err(QueryError::decode("Trailing bytes after last chunk"));
        }
        Ok(out)
    }
}

/// Encoder producing cells readable by [`XorChunksDecoder`].
#[derive(Debug, Clone, Copy, Default)]
pub struct XorChunksEncoder {
    pub float_encoding: FloatEncoding,
}

impl XorChunksEncoder {
    pub fn new(float_encoding: FloatEncoding) -> Self {
        Self { float_encoding }
    }

    /// Encodes chunks (sorted by `min_time`, each non-empty) into one cell.
    pub fn encode(&self, chunks: &[Chunk]) -> Result<Bytes, QueryError> {
        let count: u32 = chunks
            .len()
            .try_into()
            .map_err(|_| QueryError::Internal("Too many chunks in cell".to_string()))?;
        let mut buf = Vec::new();
        write_var_u32(&mut buf, count);

        let mut prev_min = Timestamp::MIN;
        for chunk in chunks {
            if chunk.is_empty() {
                return Err(QueryError::Internal(
                    "Refusing to encode an empty chunk".to_string(),
                ));
            }
            if chunk.min_time < prev_min {
                return Err(QueryError::Internal(
                    "Chunks must be sorted by min_time".to_string(),
                ));
            }
            if chunk.max_time < chunk.min_time {
                return Err(QueryError::Internal(
                    "Chunk max_time precedes min_time".to_string(),
                ));
            }
            prev_min = chunk.min_time;

            let payload = self.encode_payload(&chunk.samples)?;
            let payload_len: u32 = payload
                .len()
                .try_into()
                .map_err(|_| QueryError::Internal("Chunk payload too large".to_string()))?;

            write_var_i64(&mut buf, chunk.min_time);
            write_var_u64(&mut buf, chunk.max_time.abs_diff(chunk.min_time));
            write_var_u32(&mut buf, payload_len);
            buf.extend_from_slice(&payload);
            write_u32(&mut buf, crc32(&payload));
        }
        Ok(Bytes::from(buf))
    }

    fn encode_payload(&self, samples: &[Sample]) -> Result<Vec<u8>, QueryError> {
        let mut payload = Vec::with_capacity(16 + samples.len() * 9);
        payload.push(match self.float_encoding {
            FloatEncoding::Raw64 => FLOAT_CODEC_RAW64,
            FloatEncoding::GorillaXor => FLOAT_CODEC_GORILLA_XOR,
        });
        write_var_u32(&mut payload, samples.len() as u32);

        let base_ts = samples[0].timestamp;
        payload.extend_from_slice(&base_ts.to_le_bytes());
        let mut prev = base_ts;
        for s in &samples[1..] {
            if s.timestamp < prev {
                return Err(QueryError::Internal(
                    "Samples must be sorted by timestamp for delta encoding".to_string(),
                ));
            }
            write_var_u64(&mut payload, s.timestamp.abs_diff(prev));
            prev = s.timestamp;
        }

        match self.float_encoding {
            FloatEncoding::Raw64 => {
                for s in samples {
                    payload.extend_from_slice(&s.value.to_bits().to_le_bytes());
                }
            }
            FloatEncoding::GorillaXor => {
                let values: Vec<u64> = samples.iter().map(|s| s.value.to_bits()).collect();
                encode_gorilla_xor_u64(&values, &mut payload);
            }
        }
        Ok(payload)
    }
}

fn decode_chunk_payload(payload: &[u8]) -> Result<Vec<Sample>, QueryError> {
    let mut cur = Cursor::new(payload);
    let mut codec = [0u8; 1];
    cur.read_exact(&mut codec)
        .map_err(|e| QueryError::decode(format!("Truncated chunk codec: {}", e)))?;
    let count = read_var_u32(&mut cur).map_err(QueryError::decode)? as usize;
    if count == 0 || count > MAX_CHUNK_SAMPLES {
        return Err(QueryError::decode(format!(
            "Invalid chunk sample count {}",
            count
        )));
    }

    let base = read_i64(&mut cur).map_err(QueryError::decode)?;
    let mut timestamps = Vec::with_capacity(count);
    timestamps.push(base);
    let mut prev = base;
    for _ in 1..count {
        let d = read_var_u64(&mut cur).map_err(QueryError::decode)?;
        prev = prev
            .checked_add_unsigned(d)
            .ok_or_else(|| QueryError::decode("Timestamp delta overflow"))?;
        timestamps.push(prev);
    }

    let bits: Vec<u64> = match codec[0] {
        FLOAT_CODEC_RAW64 => {
            let mut out = Vec::with_capacity(count);
            for _ in 0..count {
                out.push(read_u64(&mut cur).map_err(QueryError::decode)?);
            }
            out
        }
        FLOAT_CODEC_GORILLA_XOR => decode_gorilla_xor_u64(&mut cur, count)?,
        other => {
            return Err(QueryError::decode(format!("Unknown float codec {}", other)));
        }
    };

    if (cur.position() as usize) != payload.len() {
        return Err(QueryError::decode("Trailing bytes in chunk payload"));
    }

    Ok(timestamps
        .into_iter()
        .zip(bits)
        .map(|(t, b)| Sample::new(t, f64::from_bits(b)))
        .collect())
}

// --- Helpers (binary, varint, gorilla) ---

#[inline]
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut h = Crc32::new();
    h.update(bytes);
    h.finalize()
}

fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64, String> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)
        .map_err(|e| format!("Truncated u64: {}", e))?;
    Ok(u64::from_le_bytes(b))
}

fn read_i64<R: Read>(r: &mut R) -> Result<i64, String> {
    read_u64(r).map(|v| v as i64)
}

fn write_var_u64(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

fn write_var_u32(buf: &mut Vec<u8>, v: u32) {
    write_var_u64(buf, v as u64);
}

fn write_var_i64(buf: &mut Vec<u8>, v: i64) {
    write_var_u64(buf, ((v << 1) ^ (v >> 63)) as u64);
}

fn read_var_u64<R: Read>(r: &mut R) -> Result<u64, String> {
    let mut out: u64 = 0;
    let mut shift: u32 = 0;
    for _ in 0..10 {
        let mut b = [0u8; 1];
        r.read_exact(&mut b)
            .map_err(|e| format!("Truncated varint: {}", e))?;
        let byte = b[0];
        out |= ((byte & 0x7F) as u64) << shift;
        if (byte & 0x80) == 0 {
            return Ok(out);
        }
        shift = shift.saturating_add(7);
    }
    Err("Varint too long".to_string())
}

fn read_var_u32<R: Read>(r: &mut R) -> Result<u32, String> {
    let v = read_var_u64(r)?;
    if v > u32::MAX as u64 {
        return Err("Varint does not fit in u32".to_string());
    }
    Ok(v as u32)
}

fn read_var_i64<R: Read>(r: &mut R) -> Result<i64, String> {
    let u = read_var_u64(r)?;
    Ok(((u >> 1) as i64) ^ -((u & 1) as i64))
}

struct BitWriter<'a> {
    out: &'a mut Vec<u8>,
    cur: u8,
    used: u8,
}

impl<'a> BitWriter<'a> {
    fn new(out: &'a mut Vec<u8>) -> Self {
        Self {
            out,
            cur: 0,
            used: 0,
        }
    }

    fn push_bit(&mut self, bit: bool) {
        let b = if bit { 1u8 } else { 0u8 };
        self.cur |= b << (7 - self.used);
        self.used += 1;
        if self.used == 8 {
            self.out.push(self.cur);
            self.cur = 0;
            self.used = 0;
        }
    }

    fn push_bits(&mut self, mut v: u64, count: u8) {
        if count == 0 {
            return;
        }
        if count < 64 {
            v &= (1u64 << count) - 1;
        }
        for i in (0..count).rev() {
            self.push_bit(((v >> i) & 1) == 1);
        }
    }

    fn finish(self) {
        if self.used > 0 {
            self.out.push(self.cur);
        }
    }
}

struct BitReader<'a, R: Read> {
    r: &'a mut R,
    cur: u8,
    left: u8,
}

impl<'a, R: Read> BitReader<'a, R> {
    fn new(r: &'a mut R) -> Self {
        Self { r, cur: 0, left: 0 }
    }

    fn read_bit(&mut self) -> Result<bool, QueryError> {
        if self.left == 0 {
            let mut b = [0u8; 1];
            self.r
                .read_exact(&mut b)
                .map_err(|e| QueryError::decode(format!("Truncated Gorilla stream: {}", e)))?;
            self.cur = b[0];
            self.left = 8;
        }
        let bit = (self.cur & (1u8 << (self.left - 1))) != 0;
        self.left -= 1;
        Ok(bit)
    }

    fn read_bits(&mut self, count: u8) -> Result<u64, QueryError> {
        let mut out = 0u64;
        for _ in 0..count {
            out <<= 1;
            out |= if self.read_bit()? { 1 } else { 0 };
        }
        Ok(out)
    }
}

fn encode_gorilla_xor_u64(values: &[u64], out: &mut Vec<u8>) {
    out.extend_from_slice(&values[0].to_le_bytes());
    let mut bw = BitWriter::new(out);

    let mut prev = values[0];
    let mut prev_leading: u8 = 0;
    let mut prev_trailing: u8 = 0;
    let mut prev_sigbits: u8 = 0;

    for &cur in &values[1..] {
        let x = prev ^ cur;
        if x == 0 {
            bw.push_bit(false);
        } else {
            bw.push_bit(true);
            let leading = x.leading_zeros() as u8;
            let trailing = x.trailing_zeros() as u8;
            let sigbits = 64 - leading - trailing;

            if prev_sigbits != 0 && leading >= prev_leading && trailing >= prev_trailing {
                bw.push_bit(false);
                bw.push_bits(x >> prev_trailing, prev_sigbits);
            } else {
                bw.push_bit(true);
                bw.push_bits(leading as u64, 6);
                bw.push_bits((sigbits - 1) as u64, 6);
                bw.push_bits(x >> trailing, sigbits);
                prev_leading = leading;
                prev_trailing = trailing;
                prev_sigbits = sigbits;
            }
        }
        prev = cur;
    }
    bw.finish();
}

fn decode_gorilla_xor_u64<R: Read>(r: &mut R, count: usize) -> Result<Vec<u64>, QueryError> {
    let first = read_u64(r).map_err(QueryError::decode)?;
    let mut out = Vec::with_capacity(count);
    out.push(first);
    let mut br = BitReader::new(r);

    let mut prev = first;
    let mut prev_trailing: u8 = 0;
    let mut prev_sigbits: u8 = 0;

    for _ in 1..count {
        if !br.read_bit()? {
            out.push(prev);
            continue;
        }
        let (sigbits, trailing) = if !br.read_bit()? {
            if prev_sigbits == 0 {
                return Err(QueryError::decode(
                    "Gorilla reuse window before initialization",
                ));
            }
            (prev_sigbits, prev_trailing)
        } else {
            let leading = br.read_bits(6)? as u8;
            let sigbits = (br.read_bits(6)? as u8).saturating_add(1);
            if leading as u16 + sigbits as u16 > 64 {
                return Err(QueryError::decode("Invalid Gorilla bit widths"));
            }
            let trailing = 64 - leading - sigbits;
            prev_trailing = trailing;
            prev_sigbits = sigbits;
            (sigbits, trailing)
        };

        let significant = br.read_bits(sigbits)?;
        let cur = prev ^ (significant << trailing);
        out.push(cur);
        prev = cur;
    }
    Ok(out)
}
