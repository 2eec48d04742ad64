//! Non-volatile server address: one NUL-terminated string at a fixed offset
//! inside a small storage image (a file standing in for the board's
//! EEPROM).

use anyhow::{ensure, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Size of the storage image in bytes.
pub(crate) const STORAGE_SIZE: u64 = 512;

pub(crate) struct ServerAddressStore<S> {
    inner: S,
    offset: u64,
}

impl<S> ServerAddressStore<S> {
    pub(crate) fn new(inner: S, offset: u64) -> Self {
        Self { inner, offset }
    }
}

impl ServerAddressStore<File> {
    /// Open (or create, zero-filled) the storage image at `path`.
    pub(crate) fn open(path: &str, offset: u64) -> Result<Self> {
        ensure!(
            offset < STORAGE_SIZE,
            "server address offset {offset} outside {STORAGE_SIZE}-byte storage"
        );
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to open storage image: {path}"))?;

        let len = file
            .metadata()
            .with_context(|| format!("failed to stat storage image: {path}"))?
            .len();
        if len < STORAGE_SIZE {
            file.set_len(STORAGE_SIZE)
                .with_context(|| format!("failed to size storage image: {path}"))?;
        }
        Ok(Self::new(file, offset))
    }
}

impl<S: Read + Seek> ServerAddressStore<S> {
    /// The stored address, or `None` when the slot is empty, unterminated,
    /// or not valid UTF-8.
    pub(crate) fn read(&mut self) -> io::Result<Option<String>> {
        self.inner.seek(SeekFrom::Start(self.offset))?;
        let mut region = Vec::new();
        (&mut self.inner)
            .take(STORAGE_SIZE.saturating_sub(self.offset))
            .read_to_end(&mut region)?;

        let Some(end) = region.iter().position(|&b| b == 0) else {
            tracing::warn!(offset = self.offset, "stored server address is not terminated");
            return Ok(None);
        };
        if end == 0 {
            return Ok(None);
        }
        match std::str::from_utf8(&region[..end]) {
            Ok(s) => Ok(Some(s.to_string())),
            Err(e) => {
                tracing::warn!("stored server address is not UTF-8: {e}");
                Ok(None)
            }
        }
    }
}

impl<S: Write + Seek> ServerAddressStore<S> {
    /// Store `addr` followed by a NUL terminator.
    pub(crate) fn write(&mut self, addr: &str) -> Result<()> {
        ensure!(!addr.contains('\0'), "server address contains a NUL byte");
        let room = STORAGE_SIZE.saturating_sub(self.offset);
        ensure!(
            (addr.len() as u64) < room,
            "server address is {} bytes, only {} fit at offset {}",
            addr.len(),
            room.saturating_sub(1),
            self.offset
        );

        self.inner.seek(SeekFrom::Start(self.offset))?;
        self.inner.write_all(addr.as_bytes())?;
        self.inner.write_all(&[0])?;
        self.inner.flush()?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn blank_image() -> Cursor<Vec<u8>> {
        Cursor::new(vec![0u8; STORAGE_SIZE as usize])
    }

    #[test]
    fn blank_image_reads_none() {
        let mut store = ServerAddressStore::new(blank_image(), 0);
        assert_eq!(store.read().unwrap(), None);
    }

    #[test]
    fn write_then_read() {
        let mut store = ServerAddressStore::new(blank_image(), 0);
        store.write("192.168.137.114").unwrap();
        assert_eq!(store.read().unwrap().as_deref(), Some("192.168.137.114"));
    }

    #[test]
    fn shorter_overwrite_is_terminated() {
        let mut store = ServerAddressStore::new(blank_image(), 0);
        store.write("http://192.168.137.114:3000").unwrap();
        store.write("10.0.0.2").unwrap();
        assert_eq!(store.read().unwrap().as_deref(), Some("10.0.0.2"));
    }

    #[test]
    fn respects_offset() {
        let mut store = ServerAddressStore::new(blank_image(), 100);
        store.write("broker.local").unwrap();

        let image = store.inner.into_inner();
        assert_eq!(&image[100..112], b"broker.local");
        assert_eq!(image[112], 0);
        assert!(image[..100].iter().all(|&b| b == 0));
    }

    #[test]
    fn unterminated_region_reads_none() {
        let mut store = ServerAddressStore::new(Cursor::new(vec![b'a'; STORAGE_SIZE as usize]), 0);
        assert_eq!(store.read().unwrap(), None);
    }

    #[test]
    fn erased_flash_reads_none() {
        // 0xFF is what an erased EEPROM holds; never valid UTF-8.
        let mut image = vec![0xFFu8; STORAGE_SIZE as usize];
        image[10] = 0;
        let mut store = ServerAddressStore::new(Cursor::new(image), 0);
        assert_eq!(store.read().unwrap(), None);
    }

    #[test]
    fn write_rejects_nul() {
        let mut store = ServerAddressStore::new(blank_image(), 0);
        assert!(store.write("a\0b").is_err());
    }

    #[test]
    fn write_rejects_oversized() {
        let mut store = ServerAddressStore::new(blank_image(), 500);
        let err = store.write("this-is-far-too-long").unwrap_err();
        assert!(format!("{err:#}").contains("only 11 fit"), "got: {err:#}");
    }

    #[test]
    fn open_rejects_offset_outside_image() {
        assert!(ServerAddressStore::open("unused.bin", STORAGE_SIZE).is_err());
    }
}
