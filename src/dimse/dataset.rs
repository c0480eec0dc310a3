//! The data-set payload handle.
//!
//! A DIMSE message may be followed by a data set of arbitrary size.
//! The assembler collects the data fragments into a [`DataSetSpool`]:
//! payloads below a configurable threshold stay in memory,
//! larger ones spill to an unnamed temporary file,
//! so that a multi-gigabyte C-STORE never has to fit in memory.
//!
//! The completed payload is handed to message handlers as a
//! [`DataSetHandle`], which can be read any number of times
//! (each [`reader`](DataSetHandle::reader) starts over from the
//! beginning) and must be released with a single call to
//! [`ack`](DataSetHandle::ack) once the handler is done with it.

use std::io::{Read, Seek, SeekFrom, Write};

use tempfile::SpooledTempFile;

/// The default spill threshold: 100 MiB.
pub const DEFAULT_SPOOL_THRESHOLD: usize = 100 * 1024 * 1024;

/// An accumulating data-set payload,
/// filled by the command assembler one fragment at a time.
#[derive(Debug)]
pub(crate) struct DataSetSpool {
    file: SpooledTempFile,
    len: u64,
}

impl DataSetSpool {
    /// Create an empty spool which moves to disk
    /// once `threshold` bytes have been written.
    pub(crate) fn new(threshold: usize) -> Self {
        DataSetSpool {
            file: SpooledTempFile::new(threshold),
            len: 0,
        }
    }

    /// Append one fragment.
    pub(crate) fn push(&mut self, fragment: &[u8]) -> std::io::Result<()> {
        self.file.write_all(fragment)?;
        self.len += fragment.len() as u64;
        Ok(())
    }

    /// Turn the accumulated bytes into a readable handle.
    pub(crate) fn into_handle(self) -> DataSetHandle {
        DataSetHandle {
            file: self.file,
            len: self.len,
        }
    }
}

/// A completed data-set payload, delivered alongside its DIMSE message.
///
/// The payload bytes are encoded in the transfer syntax
/// of the presentation context under which the message arrived;
/// decoding them is up to the handler.
///
/// The handler owning the handle must call [`ack`](DataSetHandle::ack)
/// exactly once when it is done;
/// the backing storage is released at that point.
/// (The storage is an unnamed temporary file,
/// so dropping the handle without acknowledging it
/// cannot leak files past the process lifetime.)
#[derive(Debug)]
pub struct DataSetHandle {
    file: SpooledTempFile,
    len: u64,
}

impl DataSetHandle {
    /// The total payload size in bytes.
    pub fn size(&self) -> u64 {
        self.len
    }

    /// Whether the payload was spilled to a temporary file.
    pub fn is_spooled(&self) -> bool {
        self.file.is_rolled()
    }

    /// Obtain a reader over the payload, positioned at the start.
    ///
    /// Each call rewinds, so the payload can be consumed
    /// multiple times.
    pub fn reader(&mut self) -> std::io::Result<DataSetReader<'_>> {
        self.file.seek(SeekFrom::Start(0))?;
        Ok(DataSetReader { inner: self })
    }

    /// Read the whole payload into memory.
    ///
    /// Convenient for payloads known to be small,
    /// such as C-FIND identifiers.
    pub fn read_all(&mut self) -> std::io::Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(self.len as usize);
        self.reader()?.read_to_end(&mut buffer)?;
        Ok(buffer)
    }

    /// Acknowledge the payload, releasing its backing storage.
    pub fn ack(self) -> std::io::Result<()> {
        // consuming self drops the spooled file,
        // which removes the on-disk storage if it was rolled
        Ok(())
    }
}

/// A reader over a [`DataSetHandle`] payload.
#[derive(Debug)]
pub struct DataSetReader<'a> {
    inner: &'a mut DataSetHandle,
}

impl Read for DataSetReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.file.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payload_stays_in_memory() {
        let mut spool = DataSetSpool::new(1024);
        spool.push(&[1, 2, 3]).unwrap();
        spool.push(&[4, 5]).unwrap();
        let mut handle = spool.into_handle();

        assert_eq!(handle.size(), 5);
        assert!(!handle.is_spooled());
        assert_eq!(handle.read_all().unwrap(), vec![1, 2, 3, 4, 5]);
        handle.ack().unwrap();
    }

    #[test]
    fn large_payload_spills_to_disk() {
        let mut spool = DataSetSpool::new(64);
        let chunk = vec![0xAB_u8; 48];
        spool.push(&chunk).unwrap();
        spool.push(&chunk).unwrap();
        let mut handle = spool.into_handle();

        assert_eq!(handle.size(), 96);
        assert!(handle.is_spooled());
        let contents = handle.read_all().unwrap();
        assert_eq!(contents.len(), 96);
        assert!(contents.iter().all(|b| *b == 0xAB));
        handle.ack().unwrap();
    }

    #[test]
    fn reader_rewinds_on_each_call() {
        let mut spool = DataSetSpool::new(1024);
        spool.push(b"abcdef").unwrap();
        let mut handle = spool.into_handle();

        let mut first = String::new();
        handle.reader().unwrap().read_to_string(&mut first).unwrap();
        let mut second = String::new();
        handle
            .reader()
            .unwrap()
            .read_to_string(&mut second)
            .unwrap();
        assert_eq!(first, "abcdef");
        assert_eq!(second, "abcdef");
    }

    #[test]
    fn empty_payload_has_size_zero() {
        let spool = DataSetSpool::new(1024);
        let mut handle = spool.into_handle();
        assert_eq!(handle.size(), 0);
        assert_eq!(handle.read_all().unwrap(), Vec::<u8>::new());
    }
}
