use std::io;
use std::net;

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Two-level error plumbing for the non-blocking network code. `Wait` means
/// the operation cannot make progress right now and should be retried on the
/// next readiness event; `Fatal` tears down the affected tunnel (and only
/// that tunnel).
#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorType {
    /// Remote-supplied frame length exceeds the local cap.
    Oversize,
    /// The stream ended in the middle of a frame.
    ShortRead,
    BadHeader,
    BadParams,
    /// Channel names must be UTF-8.
    BadChannel,
    /// The decoder consumed enough fragments but could not reconstruct.
    FecFailed,
    AddrParse,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorType::AddrParse)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}

/// Augmented `io::Write` that is aware of the amount of remaining free capacity in the destination.
pub trait SizedWrite: io::Write {
    /// Remaining free capacity in the destination.
    fn free_capacity(&self) -> usize;
}

/// Augmented `io::Read` that is aware of the amount of remaining data in the source.
pub trait SizedRead: io::Read {
    /// Remaining data in the source.
    fn remaining_data(&self) -> usize;
}

impl SizedWrite for io::Cursor<&mut [u8]> {
    #[inline]
    fn free_capacity(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

impl SizedRead for io::Cursor<&[u8]> {
    #[inline]
    fn remaining_data(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

/// Trait for manually serialized wire records. Implementors must validate
/// the remaining free capacity upfront and only write if everything fits.
///
/// Should return `NetworkError::Wait` in case there is not enough capacity
/// in the stream.
pub trait Serialize {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()>;
}

/// Trait for manually deserialized wire records.
pub trait Deserialize: Sized {
    fn deserialize<R: SizedRead>(stream: &mut R) -> NetworkResult<Self>;
}

/// Writes the whole buffer, retrying short writes. A non-blocking
/// destination is spun on with a yield; callers on hot paths should prefer
/// waiting for writability instead.
pub fn write_fully<W: io::Write>(mut stream: W, buf: &[u8]) -> io::Result<()> {
    let mut written = 0;

    while written < buf.len() {
        match stream.write(&buf[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(count) => written += count,
            Err(err) => match err.kind() {
                io::ErrorKind::WouldBlock => std::thread::yield_now(),
                io::ErrorKind::Interrupted => (),
                _ => return Err(err),
            },
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_would_block_folds_to_wait() {
        let err: NetworkError = io::Error::from(io::ErrorKind::WouldBlock).into();

        assert_eq!(err, NetworkError::Wait);
    }

    #[test]
    fn test_other_io_errors_are_fatal() {
        let err: NetworkError = io::Error::from(io::ErrorKind::BrokenPipe).into();

        assert_eq!(err, NetworkError::Fatal(ErrorType::Io(io::ErrorKind::BrokenPipe)));
    }

    #[test]
    fn test_has_failed() {
        assert!(!Ok::<(), NetworkError>(()).has_failed());
        assert!(!Err::<(), _>(NetworkError::Wait).has_failed());
        assert!(Err::<(), _>(NetworkError::Fatal(ErrorType::Oversize)).has_failed());
    }

    #[test]
    fn test_sized_cursors() {
        let mut buf = [0u8; 8];
        let mut writer = Cursor::new(&mut buf[..]);
        assert_eq!(writer.free_capacity(), 8);
        io::Write::write(&mut writer, &[1, 2, 3]).unwrap();
        assert_eq!(writer.free_capacity(), 5);

        let data = [1u8, 2, 3];
        let mut reader = Cursor::new(&data[..]);
        assert_eq!(reader.remaining_data(), 3);
        let mut out = [0u8; 2];
        io::Read::read_exact(&mut reader, &mut out).unwrap();
        assert_eq!(reader.remaining_data(), 1);
    }

    struct TrickleWriter {
        data: Vec<u8>,
    }

    impl io::Write for TrickleWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.data.push(buf[0]);
            Ok(1)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_fully_retries_short_writes() {
        let mut writer = TrickleWriter { data: Vec::new() };

        write_fully(&mut writer, &[9, 8, 7, 6]).unwrap();

        assert_eq!(writer.data, vec![9, 8, 7, 6]);
    }
}
