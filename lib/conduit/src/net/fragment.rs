use crate::net::fec::{self, DecodeStatus, FecDecoder};
use crate::net::frame::{self, UdpHeader};
use crate::net::queue::QueueEntry;
use crate::net::{
    MAX_FRAGMENTS_PER_BATCH, MAX_FRAGMENT_PAYLOAD, MIN_FRAGMENTS_FOR_FEC, SEQNO_WRAP, SEQNO_WRAP_GAP,
};
use chassis::logging::{self, Logger};
use std::collections::VecDeque;

/// Assigns sequence numbers and slices coalesced batches into datagrams.
/// Owned by the endpoint's send thread; the matching [`Reassembler`] lives
/// on the reactor side.
pub struct Fragmenter {
    seqno: i32,
}

impl Fragmenter {
    pub fn new() -> Fragmenter {
        Fragmenter { seqno: 0 }
    }

    /// Largest batch the fragment budget allows at the given rate. Coding
    /// multiplies the datagram count, so the budget shrinks accordingly.
    pub fn max_batch_bytes(fec_rate: f32) -> usize {
        if fec_rate > 1.0 {
            (MAX_FRAGMENTS_PER_BATCH as f32 / fec_rate) as usize * MAX_FRAGMENT_PAYLOAD
        } else {
            MAX_FRAGMENTS_PER_BATCH * MAX_FRAGMENT_PAYLOAD
        }
    }

    /// Drops whole messages from the head of the batch until it fits the
    /// fragment budget. Individual messages are never truncated.
    pub fn drop_to_fit(batch: &mut VecDeque<QueueEntry>, mut bytes: usize, fec_rate: f32, log: &Logger) -> usize {
        let max_bytes = Self::max_batch_bytes(fec_rate);
        if bytes <= max_bytes {
            return bytes;
        }

        logging::warn!(log, "batch exceeds the fragment budget, dropping oldest messages";
                       "bytes" => bytes,
                       "max_bytes" => max_bytes);

        while bytes > max_bytes {
            let dropped = batch.pop_front().expect("byte accounting implies entries");
            bytes -= dropped.accounted_size();
        }

        bytes
    }

    /// Concatenates the batch into one contiguous buffer of records.
    pub fn coalesce(batch: VecDeque<QueueEntry>, bytes: usize) -> Vec<u8> {
        let mut buf = Vec::with_capacity(bytes);
        for entry in batch {
            frame::append_record(&mut buf, &entry.channel, &entry.data);
        }
        debug_assert_eq!(buf.len(), bytes);
        buf
    }

    /// Emits the buffer as one sequence of datagrams through `emit`. Plain
    /// fragmentation below the coding threshold (repeated `ceil(|rate|)`
    /// times when the magnitude asks for redundancy), block coding above it.
    pub fn fragment<F: FnMut(&[u8])>(&mut self, buf: &[u8], fec_rate: f32, mut emit: F) {
        if buf.is_empty() {
            return;
        }

        self.seqno = (self.seqno + 1) % SEQNO_WRAP;
        let nfrags = (buf.len() + MAX_FRAGMENT_PAYLOAD - 1) / MAX_FRAGMENT_PAYLOAD;
        let mut packet = [0u8; UdpHeader::SIZE + MAX_FRAGMENT_PAYLOAD];

        if fec_rate < 1.0 || (nfrags as u32) < MIN_FRAGMENTS_FOR_FEC {
            let repeats = if fec_rate.abs() > 1.0 {
                fec_rate.abs().ceil() as usize
            } else {
                1
            };

            for _ in 0..repeats {
                let mut offset = 0;
                for fragment in 0..nfrags {
                    let take = (buf.len() - offset).min(MAX_FRAGMENT_PAYLOAD);
                    UdpHeader {
                        seqno: self.seqno,
                        fragment: fragment as u32,
                        nfrags: nfrags as u32,
                        payload_size: buf.len() as u32,
                    }
                    .write(&mut packet[..UdpHeader::SIZE]);
                    packet[UdpHeader::SIZE..UdpHeader::SIZE + take].copy_from_slice(&buf[offset..offset + take]);

                    emit(&packet[..UdpHeader::SIZE + take]);
                    offset += take;
                }
            }
        } else {
            let mut encoder = fec::encoder(buf, MAX_FRAGMENT_PAYLOAD, fec_rate);
            let nfrags = encoder.num_packets();

            loop {
                let (fragment, done) = encoder.next_packet(&mut packet[UdpHeader::SIZE..]);
                UdpHeader {
                    seqno: self.seqno,
                    fragment,
                    nfrags,
                    payload_size: buf.len() as u32,
                }
                .write(&mut packet[..UdpHeader::SIZE]);

                emit(&packet[..]);
                if done {
                    break;
                }
            }
        }
    }
}

/// Rebuilds coalesced payloads from inbound datagrams. At most one message
/// is in flight; a newer sequence abandons whatever was pending.
pub struct Reassembler {
    fec_rate: f32,
    cur_seqno: i32,
    nfrags: u32,
    frags_received: u32,
    rec_flags: Vec<bool>,
    complete_to: usize,
    buf: Vec<u8>,
    complete: bool,
    decoder: Option<Box<dyn FecDecoder + Send>>,
    log: Logger,
}

impl Reassembler {
    pub fn new(fec_rate: f32, log: Logger) -> Reassembler {
        Reassembler {
            fec_rate,
            cur_seqno: 0,
            nfrags: 0,
            frags_received: 0,
            rec_flags: Vec::new(),
            complete_to: 0,
            buf: Vec::new(),
            complete: false,
            decoder: None,
            log,
        }
    }

    /// Feeds one datagram; returns the finished payload when this fragment
    /// completes the message.
    pub fn process(&mut self, header: &UdpHeader, payload: &[u8]) -> Option<&[u8]> {
        if header.seqno < self.cur_seqno {
            logging::debug!(self.log, "out of order datagram";
                            "seqno" => header.seqno,
                            "cur_seqno" => self.cur_seqno);
        }

        if header.seqno > self.cur_seqno || header.seqno < self.cur_seqno - SEQNO_WRAP_GAP {
            self.begin_message(header);
        }

        if self.complete || header.seqno != self.cur_seqno || header.nfrags != self.nfrags {
            logging::trace!(self.log, "ignoring datagram";
                            "seqno" => header.seqno,
                            "nfrags" => header.nfrags,
                            "cur_seqno" => self.cur_seqno,
                            "cur_nfrags" => self.nfrags);
            return None;
        }

        self.frags_received += 1;

        match self.decoder.is_some() {
            false => self.place_fragment(header, payload),
            true => self.decode_fragment(header, payload),
        }
    }

    /// Resets the state for a fresh sequence, reporting whatever the old one
    /// was still missing.
    fn begin_message(&mut self, header: &UdpHeader) {
        if (!self.complete && self.cur_seqno > 0) || header.seqno > self.cur_seqno + 1 {
            logging::debug!(self.log, "datagram sequence gap, abandoning partial message";
                            "from_seqno" => self.cur_seqno,
                            "to_seqno" => header.seqno,
                            "frags_received" => self.frags_received,
                            "nfrags" => self.nfrags,
                            "fec" => self.decoder.is_some());
        }

        self.cur_seqno = header.seqno;
        self.nfrags = header.nfrags;
        self.frags_received = 0;
        self.rec_flags.clear();
        self.rec_flags.resize(header.nfrags as usize, false);
        self.complete_to = 0;
        self.buf.resize(header.payload_size as usize, 0);
        self.complete = false;

        self.decoder = if self.fec_rate > 1.0 && header.nfrags >= MIN_FRAGMENTS_FOR_FEC && header.payload_size > 0 {
            Some(fec::decoder(
                header.payload_size as usize,
                MAX_FRAGMENT_PAYLOAD,
                self.fec_rate,
            ))
        } else {
            None
        };
    }

    fn place_fragment(&mut self, header: &UdpHeader, payload: &[u8]) -> Option<&[u8]> {
        let fragment = header.fragment as usize;
        if fragment >= self.nfrags as usize || self.rec_flags[fragment] {
            logging::trace!(self.log, "ignoring duplicate or out of range fragment";
                            "fragment" => header.fragment);
            return None;
        }

        let start = fragment * MAX_FRAGMENT_PAYLOAD;
        let end = self.buf.len().min(start + MAX_FRAGMENT_PAYLOAD);
        if payload.len() < end - start {
            logging::debug!(self.log, "short fragment payload";
                            "fragment" => header.fragment,
                            "expected" => end - start,
                            "got" => payload.len());
            return None;
        }
        self.rec_flags[fragment] = true;
        self.buf[start..end].copy_from_slice(&payload[..end - start]);

        self.complete = true;
        for i in self.complete_to..self.nfrags as usize {
            if !self.rec_flags[i] {
                self.complete = false;
                break;
            }
            self.complete_to = i;
        }

        if self.complete {
            Some(&self.buf)
        } else {
            None
        }
    }

    fn decode_fragment(&mut self, header: &UdpHeader, payload: &[u8]) -> Option<&[u8]> {
        let decoder = self.decoder.as_mut().expect("checked by caller");

        match decoder.process(payload, header.fragment) {
            DecodeStatus::NeedMore => None,
            DecodeStatus::Done => {
                let extracted = decoder.extract(&mut self.buf);
                debug_assert!(extracted, "decoder reported done");
                self.complete = true;
                self.decoder = None;
                Some(&self.buf)
            }
            DecodeStatus::Failed => {
                logging::error!(self.log, "received enough fragments but reconstruction failed");
                self.complete = true;
                self.decoder = None;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::SEQNO_WRAP;
    use chassis::logging::{o, Discard};

    fn test_logger() -> Logger {
        Logger::root(Discard, o!())
    }

    fn entry(channel: &str, data: Vec<u8>) -> QueueEntry {
        QueueEntry {
            channel: channel.to_owned(),
            data,
            recv_utime: 0,
        }
    }

    fn batch_of(sizes: &[usize]) -> (VecDeque<QueueEntry>, usize) {
        let mut batch = VecDeque::new();
        let mut bytes = 0;
        for (i, &size) in sizes.iter().enumerate() {
            let e = entry(&format!("CHAN{}", i), vec![i as u8; size]);
            bytes += e.accounted_size();
            batch.push_back(e);
        }
        (batch, bytes)
    }

    fn collect_packets(buf: &[u8], fec_rate: f32) -> Vec<Vec<u8>> {
        let mut fragmenter = Fragmenter::new();
        let mut packets = Vec::new();
        fragmenter.fragment(buf, fec_rate, |p| packets.push(p.to_vec()));
        packets
    }

    fn reassemble(packets: &[Vec<u8>], fec_rate: f32) -> Option<Vec<u8>> {
        let mut reassembler = Reassembler::new(fec_rate, test_logger());
        for packet in packets {
            let header = UdpHeader::read(&packet[..UdpHeader::SIZE]).unwrap();
            if let Some(payload) = reassembler.process(&header, &packet[UdpHeader::SIZE..]) {
                return Some(payload.to_vec());
            }
        }
        None
    }

    fn sample_buf(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 13 + 5) as u8).collect()
    }

    #[test]
    fn test_single_fragment() {
        let buf = sample_buf(200);

        let packets = collect_packets(&buf, 0.0);

        assert_eq!(packets.len(), 1);
        let header = UdpHeader::read(&packets[0]).unwrap();
        assert_eq!(header.fragment, 0);
        assert_eq!(header.nfrags, 1);
        assert_eq!(header.payload_size, 200);
        assert_eq!(reassemble(&packets, 0.0).unwrap(), buf);
    }

    #[test]
    fn test_roundtrip_in_order() {
        let buf = sample_buf(MAX_FRAGMENT_PAYLOAD * 3 + 100);

        let packets = collect_packets(&buf, 0.0);

        assert_eq!(packets.len(), 4);
        assert_eq!(reassemble(&packets, 0.0).unwrap(), buf);
    }

    #[test]
    fn test_roundtrip_permuted() {
        let buf = sample_buf(MAX_FRAGMENT_PAYLOAD * 5);
        let mut packets = collect_packets(&buf, 0.0);

        // deterministic shuffle
        packets.reverse();
        packets.swap(0, 3);
        packets.swap(1, 4);

        assert_eq!(reassemble(&packets, 0.0).unwrap(), buf);
    }

    #[test]
    fn test_duplicate_fragments_idempotent() {
        let buf = sample_buf(MAX_FRAGMENT_PAYLOAD * 2 + 1);
        let packets = collect_packets(&buf, 0.0);

        let mut doubled = Vec::new();
        for p in &packets {
            doubled.push(p.clone());
            doubled.push(p.clone());
        }

        assert_eq!(reassemble(&doubled, 0.0).unwrap(), buf);
    }

    #[test]
    fn test_duplication_rate_repeats_batch() {
        // two fragments stay below the coding threshold, |rate| > 1 repeats
        let buf = sample_buf(MAX_FRAGMENT_PAYLOAD + 10);

        let packets = collect_packets(&buf, -2.0);

        assert_eq!(packets.len(), 4);
        assert_eq!(reassemble(&packets, -2.0).unwrap(), buf);
    }

    #[test]
    fn test_fec_engages_exactly_at_threshold() {
        // three fragments: coding on
        let coded = collect_packets(&sample_buf(MAX_FRAGMENT_PAYLOAD * 2 + 1), 2.0);
        assert_eq!(coded.len(), 6);

        // two fragments: plain duplication instead
        let plain = collect_packets(&sample_buf(MAX_FRAGMENT_PAYLOAD + 1), 2.0);
        assert_eq!(plain.len(), 4);
        let header = UdpHeader::read(&plain[0]).unwrap();
        assert_eq!(header.nfrags, 2);
    }

    #[test]
    fn test_fec_roundtrip_with_losses() {
        let buf = sample_buf(10 * 1024);
        let packets = collect_packets(&buf, 2.0);

        let nfrags = (buf.len() + MAX_FRAGMENT_PAYLOAD - 1) / MAX_FRAGMENT_PAYLOAD;
        assert_eq!(packets.len(), nfrags * 2);

        // drop every fifth packet (20%) and deliver the rest back to front
        let mut kept: Vec<Vec<u8>> = packets
            .iter()
            .enumerate()
            .filter(|(i, _)| i % 5 != 0)
            .map(|(_, p)| p.clone())
            .collect();
        kept.reverse();

        assert_eq!(reassemble(&kept, 2.0).unwrap(), buf);
    }

    #[test]
    fn test_new_sequence_abandons_partial() {
        let old = sample_buf(MAX_FRAGMENT_PAYLOAD * 3);
        let new = sample_buf(50);

        let mut fragmenter = Fragmenter::new();
        let mut old_packets = Vec::new();
        fragmenter.fragment(&old, 0.0, |p| old_packets.push(p.to_vec()));
        let mut new_packets = Vec::new();
        fragmenter.fragment(&new, 0.0, |p| new_packets.push(p.to_vec()));

        let mut reassembler = Reassembler::new(0.0, test_logger());

        // deliver only one fragment of the old message
        let header = UdpHeader::read(&old_packets[0]).unwrap();
        assert!(reassembler.process(&header, &old_packets[0][UdpHeader::SIZE..]).is_none());

        // the new message displaces it
        let header = UdpHeader::read(&new_packets[0]).unwrap();
        let payload = reassembler
            .process(&header, &new_packets[0][UdpHeader::SIZE..])
            .unwrap();
        assert_eq!(payload, &new[..]);

        // stragglers from the old message are ignored
        let header = UdpHeader::read(&old_packets[1]).unwrap();
        assert!(reassembler.process(&header, &old_packets[1][UdpHeader::SIZE..]).is_none());
    }

    #[test]
    fn test_stale_sequence_dropped() {
        let mut reassembler = Reassembler::new(0.0, test_logger());

        let fresh = UdpHeader {
            seqno: 100,
            fragment: 0,
            nfrags: 2,
            payload_size: 10,
        };
        assert!(reassembler.process(&fresh, &[0u8; 5]).is_none());

        // behind the current sequence but within the wrap gap
        let stale = UdpHeader {
            seqno: 99,
            fragment: 0,
            nfrags: 1,
            payload_size: 5,
        };
        assert!(reassembler.process(&stale, &[0u8; 5]).is_none());
    }

    #[test]
    fn test_sequence_wraps_around() {
        let mut reassembler = Reassembler::new(0.0, test_logger());

        let before_wrap = UdpHeader {
            seqno: SEQNO_WRAP - 1,
            fragment: 0,
            nfrags: 1,
            payload_size: 3,
        };
        assert!(reassembler.process(&before_wrap, &[1, 2, 3]).is_some());

        // a tiny seqno after the wrap point starts a new message
        let after_wrap = UdpHeader {
            seqno: 0,
            fragment: 0,
            nfrags: 1,
            payload_size: 4,
        };
        let payload = reassembler.process(&after_wrap, &[9, 9, 9, 9]).unwrap();
        assert_eq!(payload, &[9, 9, 9, 9]);
    }

    #[test]
    fn test_drop_to_fit_keeps_newest() {
        let (mut batch, bytes) = batch_of(&[100_000, 60_000, 30_000, 500]);
        let log = test_logger();

        let fitted = Fragmenter::drop_to_fit(&mut batch, bytes, 0.0, &log);

        assert!(fitted <= Fragmenter::max_batch_bytes(0.0));
        let total: usize = batch.iter().map(|e| e.accounted_size()).sum();
        assert_eq!(total, fitted);
        // the newest entry survives
        assert_eq!(batch.back().unwrap().channel, "CHAN3");
    }

    #[test]
    fn test_drop_to_fit_respects_fec_budget() {
        let (mut batch, bytes) = batch_of(&[60_000, 30_000]);
        let log = test_logger();

        let fitted = Fragmenter::drop_to_fit(&mut batch, bytes, 2.0, &log);

        assert!(fitted <= Fragmenter::max_batch_bytes(2.0));
        assert!(Fragmenter::max_batch_bytes(2.0) < Fragmenter::max_batch_bytes(0.0));
    }

    #[test]
    fn test_coalesce_accounts_bytes() {
        let (batch, bytes) = batch_of(&[10, 20, 30]);

        let buf = Fragmenter::coalesce(batch, bytes);

        assert_eq!(buf.len(), bytes);
        let records = frame::split_records(&buf).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].0, "CHAN0");
        assert_eq!(records[2].1.len(), 30);
    }
}
