//! Block erasure coding for fragmented datagrams. A batch of `k` data
//! fragments is expanded to `n = ceil(k * rate)` fragments such that *any*
//! `k` of them reconstruct the original buffer. The code is a systematic
//! Vandermonde Reed-Solomon code over GF(256): the first `k` output
//! fragments are the data itself, the rest are parity.
//!
//! The tunnel only engages the codec for batches of at least
//! [`MIN_FRAGMENTS_FOR_FEC`](crate::net::MIN_FRAGMENTS_FOR_FEC) fragments;
//! everything below that threshold uses plain (optionally duplicated)
//! fragmentation and never touches this module.

/// Outcome of feeding one fragment to a decoder.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DecodeStatus {
    /// More fragments are needed.
    NeedMore,
    /// The payload has been reconstructed; call `extract`.
    Done,
    /// Enough fragments arrived but reconstruction failed.
    Failed,
}

pub trait FecEncoder {
    /// Total number of fragments this encoder will produce, parity included.
    fn num_packets(&self) -> u32;

    /// Writes the next fragment's payload into `out` and returns its
    /// fragment index, plus `true` once the encoder is exhausted.
    fn next_packet(&mut self, out: &mut [u8]) -> (u32, bool);
}

pub trait FecDecoder {
    /// Feeds one received fragment. Duplicate fragment indices are ignored.
    fn process(&mut self, payload: &[u8], fragment: u32) -> DecodeStatus;

    /// Copies the reconstructed payload into `out`. Returns false unless
    /// `process` has reported `Done`.
    fn extract(&self, out: &mut [u8]) -> bool;
}

/// Creates an encoder for one coalesced buffer.
pub fn encoder(buf: &[u8], max_fragment_payload: usize, rate: f32) -> Box<dyn FecEncoder + Send> {
    Box::new(RsEncoder::new(buf, max_fragment_payload, rate))
}

/// Creates a decoder for a payload of the given reassembled size. Both ends
/// derive the data fragment count from the payload size, so the encoder and
/// decoder must agree on `max_fragment_payload` and `rate`.
pub fn decoder(payload_len: usize, max_fragment_payload: usize, _rate: f32) -> Box<dyn FecDecoder + Send> {
    Box::new(RsDecoder::new(payload_len, max_fragment_payload))
}

struct RsEncoder {
    shards: Vec<Vec<u8>>,
    next: usize,
}

impl RsEncoder {
    fn new(buf: &[u8], frag_len: usize, rate: f32) -> RsEncoder {
        assert!(rate >= 1.0, "block coding requires a rate of at least 1");
        assert!(!buf.is_empty(), "cannot encode an empty buffer");

        let k = (buf.len() + frag_len - 1) / frag_len;
        let n = ((k as f32 * rate).ceil() as usize).min(MAX_SHARDS);

        // data shards, the last one zero-padded to the fragment size
        let mut shards: Vec<Vec<u8>> = (0..k)
            .map(|i| {
                let start = i * frag_len;
                let end = ((i + 1) * frag_len).min(buf.len());
                let mut shard = vec![0u8; frag_len];
                shard[..end - start].copy_from_slice(&buf[start..end]);
                shard
            })
            .collect();

        let top_inv = matrix::invert(matrix::vandermonde(k, k)).expect("vandermonde is invertible");
        for row in k..n {
            let coefs = matrix::systematic_row(row, k, &top_inv);
            let mut parity = vec![0u8; frag_len];
            for (column, &coef) in coefs.iter().enumerate() {
                if coef != 0 {
                    for (out, &byte) in parity.iter_mut().zip(&shards[column]) {
                        *out ^= gf::mul(coef, byte);
                    }
                }
            }
            shards.push(parity);
        }

        RsEncoder { shards, next: 0 }
    }
}

impl FecEncoder for RsEncoder {
    fn num_packets(&self) -> u32 {
        self.shards.len() as u32
    }

    fn next_packet(&mut self, out: &mut [u8]) -> (u32, bool) {
        let index = self.next;
        debug_assert!(index < self.shards.len(), "encoder exhausted");

        let shard = &self.shards[index];
        out[..shard.len()].copy_from_slice(shard);
        self.next += 1;

        (index as u32, self.next == self.shards.len())
    }
}

/// Hard cap on fragment indices; Vandermonde rows must be distinct GF(256)
/// elements.
const MAX_SHARDS: usize = 255;

struct RsDecoder {
    payload_len: usize,
    frag_len: usize,
    k: usize,
    top_inv: Vec<Vec<u8>>,
    received: Vec<(usize, Vec<u8>)>,
    seen: [bool; MAX_SHARDS + 1],
    result: Option<Vec<u8>>,
    failed: bool,
}

impl RsDecoder {
    fn new(payload_len: usize, frag_len: usize) -> RsDecoder {
        assert!(payload_len > 0, "cannot decode an empty payload");

        let k = (payload_len + frag_len - 1) / frag_len;
        let top_inv = matrix::invert(matrix::vandermonde(k, k)).expect("vandermonde is invertible");

        RsDecoder {
            payload_len,
            frag_len,
            k,
            top_inv,
            received: Vec::with_capacity(k),
            seen: [false; MAX_SHARDS + 1],
            result: None,
            failed: false,
        }
    }

    fn solve(&self) -> Option<Vec<u8>> {
        let rows: Vec<Vec<u8>> = self.received[..self.k]
            .iter()
            .map(|(index, _)| matrix::systematic_row(*index, self.k, &self.top_inv))
            .collect();
        let inverse = matrix::invert(rows)?;

        let mut data = vec![0u8; self.k * self.frag_len];
        for column in 0..self.k {
            let out = &mut data[column * self.frag_len..(column + 1) * self.frag_len];
            for (j, (_, shard)) in self.received[..self.k].iter().enumerate() {
                let coef = inverse[column][j];
                if coef != 0 {
                    for (byte, &shard_byte) in out.iter_mut().zip(shard) {
                        *byte ^= gf::mul(coef, shard_byte);
                    }
                }
            }
        }

        Some(data)
    }
}

impl FecDecoder for RsDecoder {
    fn process(&mut self, payload: &[u8], fragment: u32) -> DecodeStatus {
        if self.result.is_some() {
            return DecodeStatus::Done;
        }
        if self.failed {
            return DecodeStatus::Failed;
        }

        let index = fragment as usize;
        if index >= MAX_SHARDS || self.seen[index] {
            return DecodeStatus::NeedMore;
        }
        self.seen[index] = true;

        let mut shard = vec![0u8; self.frag_len];
        let take = payload.len().min(self.frag_len);
        shard[..take].copy_from_slice(&payload[..take]);
        self.received.push((index, shard));

        if self.received.len() < self.k {
            return DecodeStatus::NeedMore;
        }

        match self.solve() {
            Some(data) => {
                self.result = Some(data);
                DecodeStatus::Done
            }
            None => {
                self.failed = true;
                DecodeStatus::Failed
            }
        }
    }

    fn extract(&self, out: &mut [u8]) -> bool {
        match &self.result {
            Some(data) => {
                out[..self.payload_len].copy_from_slice(&data[..self.payload_len]);
                true
            }
            None => false,
        }
    }
}

/// GF(256) arithmetic with the 0x11d reduction polynomial.
mod gf {
    use lazy_static::lazy_static;

    lazy_static! {
        static ref TABLES: (Vec<u8>, Vec<u8>) = build_tables();
    }

    fn build_tables() -> (Vec<u8>, Vec<u8>) {
        let mut exp = vec![0u8; 512];
        let mut log = vec![0u8; 256];

        let mut x: u16 = 1;
        for i in 0..255 {
            exp[i] = x as u8;
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= 0x11d;
            }
        }
        for i in 255..512 {
            exp[i] = exp[i - 255];
        }

        (exp, log)
    }

    #[inline]
    pub fn mul(a: u8, b: u8) -> u8 {
        if a == 0 || b == 0 {
            return 0;
        }
        let (exp, log) = (&TABLES.0, &TABLES.1);
        exp[log[a as usize] as usize + log[b as usize] as usize]
    }

    #[inline]
    pub fn inv(a: u8) -> u8 {
        debug_assert!(a != 0, "zero has no inverse");
        let (exp, log) = (&TABLES.0, &TABLES.1);
        exp[255 - log[a as usize] as usize]
    }

    #[inline]
    pub fn pow(a: u8, n: usize) -> u8 {
        if n == 0 {
            return 1;
        }
        if a == 0 {
            return 0;
        }
        let (exp, log) = (&TABLES.0, &TABLES.1);
        exp[(log[a as usize] as usize * n) % 255]
    }
}

/// Small dense matrices over GF(256).
mod matrix {
    use super::gf;

    /// `rows x cols` Vandermonde matrix with node `r` for row `r`. Any
    /// square submatrix formed from distinct rows is invertible, which is
    /// what makes any-k-of-n reconstruction work.
    pub fn vandermonde(rows: usize, cols: usize) -> Vec<Vec<u8>> {
        (0..rows)
            .map(|r| (0..cols).map(|c| gf::pow(r as u8, c)).collect())
            .collect()
    }

    /// Row `r` of the systematic encode matrix `V * inv(V_top)`: identity
    /// for `r < k`, parity coefficients otherwise.
    pub fn systematic_row(r: usize, k: usize, top_inv: &[Vec<u8>]) -> Vec<u8> {
        (0..k)
            .map(|c| {
                let mut acc = 0u8;
                for j in 0..k {
                    acc ^= gf::mul(gf::pow(r as u8, j), top_inv[j][c]);
                }
                acc
            })
            .collect()
    }

    /// Gauss-Jordan inversion; `None` when the matrix is singular.
    pub fn invert(mut m: Vec<Vec<u8>>) -> Option<Vec<Vec<u8>>> {
        let n = m.len();
        let mut inv: Vec<Vec<u8>> = (0..n)
            .map(|r| (0..n).map(|c| (r == c) as u8).collect())
            .collect();

        for col in 0..n {
            let pivot = (col..n).find(|&r| m[r][col] != 0)?;
            m.swap(col, pivot);
            inv.swap(col, pivot);

            let scale = gf::inv(m[col][col]);
            for j in 0..n {
                m[col][j] = gf::mul(m[col][j], scale);
                inv[col][j] = gf::mul(inv[col][j], scale);
            }

            for row in 0..n {
                if row == col || m[row][col] == 0 {
                    continue;
                }
                let factor = m[row][col];
                for j in 0..n {
                    let m_col_j = m[col][j];
                    let inv_col_j = inv[col][j];
                    m[row][j] ^= gf::mul(factor, m_col_j);
                    inv[row][j] ^= gf::mul(factor, inv_col_j);
                }
            }
        }

        Some(inv)
    }
}
