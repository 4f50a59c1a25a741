use crate::net::support::{Deserialize, ErrorType, NetworkError, NetworkResult, Serialize, SizedRead, SizedWrite};
use crate::net::MAX_FRAME_BYTES;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

/// Session parameters exchanged length-prefixed during the handshake. The
/// connecting side fills `channels` with the regex the *remote* end should
/// forward; `udp_port` is only meaningful when `udp` is set. All integers
/// are big-endian on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelParams {
    pub udp: bool,
    /// Redundancy rate: <= 1 disables coding, > 1 enables the block code,
    /// negative magnitudes request plain duplicated sends.
    pub fec: f32,
    /// Coalescing window; 0 flushes each message immediately.
    pub max_delay_ms: u32,
    /// Queued TCP messages older than this are dropped; 0 keeps them forever.
    pub tcp_max_age_ms: u32,
    pub udp_port: u16,
    pub channels: String,
}

impl TunnelParams {
    /// Encoded size of everything but the channel bytes.
    pub const BASE_SIZE: usize = 1 + 4 + 4 + 4 + 2 + 4;

    #[inline]
    pub fn encoded_len(&self) -> usize {
        Self::BASE_SIZE + self.channels.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len()];
        let mut stream = Cursor::new(&mut buf[..]);
        self.serialize(&mut stream)
            .expect("buffer sized to encoded_len");
        buf
    }

    pub fn decode(bytes: &[u8]) -> NetworkResult<TunnelParams> {
        let mut stream = Cursor::new(bytes);
        Self::deserialize(&mut stream)
    }
}

impl Serialize for TunnelParams {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        if stream.free_capacity() < self.encoded_len() {
            return Err(NetworkError::Wait);
        }

        stream.write_u8(self.udp as u8)?;
        stream.write_f32::<BigEndian>(self.fec)?;
        stream.write_u32::<BigEndian>(self.max_delay_ms)?;
        stream.write_u32::<BigEndian>(self.tcp_max_age_ms)?;
        stream.write_u16::<BigEndian>(self.udp_port)?;
        stream.write_u32::<BigEndian>(self.channels.len() as u32)?;
        stream.write_all(self.channels.as_bytes())?;

        Ok(())
    }
}

impl Deserialize for TunnelParams {
    fn deserialize<R: SizedRead>(stream: &mut R) -> NetworkResult<Self> {
        if stream.remaining_data() < Self::BASE_SIZE {
            return Err(NetworkError::Fatal(ErrorType::BadParams));
        }

        let udp = stream.read_u8()? != 0;
        let fec = stream.read_f32::<BigEndian>()?;
        let max_delay_ms = stream.read_u32::<BigEndian>()?;
        let tcp_max_age_ms = stream.read_u32::<BigEndian>()?;
        let udp_port = stream.read_u16::<BigEndian>()?;

        let channels_len = stream.read_u32::<BigEndian>()? as usize;
        if channels_len != stream.remaining_data() {
            return Err(NetworkError::Fatal(ErrorType::BadParams));
        }

        let mut channels = vec![0u8; channels_len];
        stream.read_exact(&mut channels)?;
        let channels = String::from_utf8(channels).map_err(|_| NetworkError::Fatal(ErrorType::BadChannel))?;

        Ok(TunnelParams {
            udp,
            fec,
            max_delay_ms,
            tcp_max_age_ms,
            udp_port,
            channels,
        })
    }
}

/// Fixed header leading every tunnel datagram.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct UdpHeader {
    pub seqno: i32,
    pub fragment: u32,
    pub nfrags: u32,
    /// Size of the fully reassembled payload, not of this fragment.
    pub payload_size: u32,
}

impl UdpHeader {
    pub const SIZE: usize = 16;

    pub fn write(&self, out: &mut [u8]) {
        let mut stream = Cursor::new(out);
        stream.write_i32::<BigEndian>(self.seqno).expect("header buffer too small");
        stream.write_u32::<BigEndian>(self.fragment).expect("header buffer too small");
        stream.write_u32::<BigEndian>(self.nfrags).expect("header buffer too small");
        stream
            .write_u32::<BigEndian>(self.payload_size)
            .expect("header buffer too small");
    }

    pub fn read(buf: &[u8]) -> NetworkResult<UdpHeader> {
        if buf.len() < Self::SIZE {
            return Err(NetworkError::Fatal(ErrorType::BadHeader));
        }

        let mut stream = Cursor::new(buf);
        let header = UdpHeader {
            seqno: stream.read_i32::<BigEndian>()?,
            fragment: stream.read_u32::<BigEndian>()?,
            nfrags: stream.read_u32::<BigEndian>()?,
            payload_size: stream.read_u32::<BigEndian>()?,
        };

        if header.seqno < 0 || header.nfrags == 0 {
            return Err(NetworkError::Fatal(ErrorType::BadHeader));
        }

        Ok(header)
    }
}

/// Fixed header leading each record inside a coalesced datagram payload.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RecordHeader {
    pub channel_len: u32,
    pub data_len: u32,
}

impl RecordHeader {
    pub const SIZE: usize = 8;

    pub fn write(&self, out: &mut [u8]) {
        let mut stream = Cursor::new(out);
        stream
            .write_u32::<BigEndian>(self.channel_len)
            .expect("header buffer too small");
        stream.write_u32::<BigEndian>(self.data_len).expect("header buffer too small");
    }

    pub fn read(buf: &[u8]) -> NetworkResult<RecordHeader> {
        if buf.len() < Self::SIZE {
            return Err(NetworkError::Fatal(ErrorType::BadHeader));
        }

        let mut stream = Cursor::new(buf);
        Ok(RecordHeader {
            channel_len: stream.read_u32::<BigEndian>()?,
            data_len: stream.read_u32::<BigEndian>()?,
        })
    }
}

/// Prepends the 4-byte big-endian length to a control frame payload.
pub fn encode_length_prefixed(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.write_u32::<BigEndian>(payload.len() as u32).expect("vec write");
    buf.extend_from_slice(payload);
    buf
}

/// Decodes a frame length prefix, rejecting lengths beyond the local cap.
/// Remote lengths are otherwise trusted, so the cap is the only guard
/// between a hostile peer and an unbounded allocation.
pub fn decode_frame_len(buf: &[u8]) -> NetworkResult<usize> {
    if buf.len() < 4 {
        return Err(NetworkError::Fatal(ErrorType::ShortRead));
    }

    let mut stream = Cursor::new(buf);
    let len = stream.read_u32::<BigEndian>()? as usize;

    if len > MAX_FRAME_BYTES {
        return Err(NetworkError::Fatal(ErrorType::Oversize));
    }

    Ok(len)
}

/// Appends one `[header | channel | data]` record to a coalesced buffer.
pub fn append_record(buf: &mut Vec<u8>, channel: &str, data: &[u8]) {
    buf.write_u32::<BigEndian>(channel.len() as u32).expect("vec write");
    buf.write_u32::<BigEndian>(data.len() as u32).expect("vec write");
    buf.extend_from_slice(channel.as_bytes());
    buf.extend_from_slice(data);
}

/// Splits a reassembled payload back into `(channel, data)` records. The
/// records must cover the buffer exactly.
pub fn split_records(buf: &[u8]) -> NetworkResult<Vec<(String, Vec<u8>)>> {
    let mut records = Vec::new();
    let mut offset = 0;

    while offset < buf.len() {
        let header = RecordHeader::read(&buf[offset..])?;
        offset += RecordHeader::SIZE;

        let channel_len = header.channel_len as usize;
        let data_len = header.data_len as usize;
        if buf.len() - offset < channel_len + data_len {
            return Err(NetworkError::Fatal(ErrorType::BadHeader));
        }

        let channel = std::str::from_utf8(&buf[offset..offset + channel_len])
            .map_err(|_| NetworkError::Fatal(ErrorType::BadChannel))?
            .to_owned();
        offset += channel_len;

        records.push((channel, buf[offset..offset + data_len].to_vec()));
        offset += data_len;
    }

    Ok(records)
}
