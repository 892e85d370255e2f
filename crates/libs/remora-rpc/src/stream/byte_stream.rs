use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// A seekable byte stream a provider can expose to the remote side.
///
/// Calls are blocking; providers run them on the blocking pool.
pub trait ByteStream: Send {
    fn can_read(&self) -> bool;
    fn can_write(&self) -> bool;
    fn can_seek(&self) -> bool;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, data: &[u8]) -> io::Result<()>;
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64>;
    fn flush(&mut self) -> io::Result<()>;

    fn len(&mut self) -> io::Result<u64>;
    fn is_empty(&mut self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }
    fn position(&mut self) -> io::Result<u64>;
    fn set_len(&mut self, len: u64) -> io::Result<()>;

    /// Releases the underlying resource. Later calls may fail.
    fn close(&mut self) {}
}

impl ByteStream for Cursor<Vec<u8>> {
    fn can_read(&self) -> bool {
        true
    }

    fn can_write(&self) -> bool {
        true
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        Write::write_all(self, data)
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Seek::seek(self, pos)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn len(&mut self) -> io::Result<u64> {
        Ok(self.get_ref().len() as u64)
    }

    fn position(&mut self) -> io::Result<u64> {
        Ok(Cursor::position(self))
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "length exceeds memory"))?;
        self.get_mut().resize(len, 0);
        Ok(())
    }
}

/// A file exposed as a stream, with the access it was opened for.
#[derive(Debug)]
pub struct FileStream {
    file: File,
    readable: bool,
    writable: bool,
}

impl FileStream {
    /// Wraps `file`, which must have been opened with matching access.
    pub fn new(file: File, readable: bool, writable: bool) -> Self {
        Self { file, readable, writable }
    }

    pub fn read_only(file: File) -> Self {
        Self::new(file, true, false)
    }

    pub fn read_write(file: File) -> Self {
        Self::new(file, true, true)
    }

    /// Opens `path` for reading only.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::read_only(File::open(path)?))
    }

    /// Creates or truncates `path` for reading and writing.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let file =
            OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;
        Ok(Self::read_write(file))
    }

    pub fn into_inner(self) -> File {
        self.file
    }
}

fn not_open_for(access: &str) -> io::Error {
    io::Error::new(io::ErrorKind::PermissionDenied, format!("file is not open for {access}"))
}

impl ByteStream for FileStream {
    fn can_read(&self) -> bool {
        self.readable
    }

    fn can_write(&self) -> bool {
        self.writable
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.readable {
            return Err(not_open_for("reading"));
        }
        Read::read(&mut self.file, buf)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if !self.writable {
            return Err(not_open_for("writing"));
        }
        Write::write_all(&mut self.file, data)
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Seek::seek(&mut self.file, pos)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(&mut self.file)
    }

    fn len(&mut self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn position(&mut self) -> io::Result<u64> {
        self.file.stream_position()
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        if !self.writable {
            return Err(not_open_for("writing"));
        }
        self.file.set_len(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_tracks_position_and_length() {
        let mut stream = Cursor::new(b"hello world".to_vec());
        let mut buf = [0u8; 5];
        assert_eq!(ByteStream::read(&mut stream, &mut buf).expect("read"), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(ByteStream::position(&mut stream).expect("pos"), 5);

        ByteStream::set_len(&mut stream, 3).expect("truncate");
        assert_eq!(ByteStream::len(&mut stream).expect("len"), 3);
        assert_eq!(ByteStream::seek(&mut stream, SeekFrom::End(0)).expect("seek"), 3);
    }

    #[test]
    fn file_stream_writes_through_to_disk() {
        let mut stream = FileStream::read_write(tempfile::tempfile().expect("temp file"));
        assert!(stream.can_read() && stream.can_write());
        stream.write(b"abc").expect("write");
        stream.flush().expect("flush");
        assert_eq!(stream.len().expect("len"), 3);
        assert_eq!(stream.seek(SeekFrom::Start(1)).expect("seek"), 1);
        let mut buf = [0u8; 2];
        assert_eq!(stream.read(&mut buf).expect("read"), 2);
        assert_eq!(&buf, b"bc");
    }

    #[test]
    fn files_opened_for_reading_report_and_refuse_writes() {
        let file = tempfile::NamedTempFile::new().expect("temp file");
        std::fs::write(file.path(), b"fixed").expect("seed");

        let mut stream = FileStream::open(file.path()).expect("open");
        assert!(stream.can_read());
        assert!(!stream.can_write());
        let err = stream.write(b"x").expect_err("read-only");
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        assert!(stream.set_len(0).is_err());

        let mut buf = [0u8; 5];
        assert_eq!(stream.read(&mut buf).expect("read"), 5);
        assert_eq!(&buf, b"fixed");
    }
}
