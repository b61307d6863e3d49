/// File Table - host files opened on behalf of guest programs
///
/// Handles start at 1; 0 is the null handle returned by a failed open.

use crate::error::Fault;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

/// Guest open mode, taken from the low 3 bits of `Mb`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
    Append,
    ReadUpdate,
    WriteUpdate,
    AppendUpdate,
}

impl FileMode {
    pub fn from_bits(bits: u64) -> Self {
        match bits & 0b111 {
            1 => FileMode::Write,
            2 => FileMode::Append,
            3 => FileMode::ReadUpdate,
            4 => FileMode::WriteUpdate,
            5 => FileMode::AppendUpdate,
            _ => FileMode::Read,
        }
    }

    fn options(self) -> OpenOptions {
        let mut options = OpenOptions::new();
        match self {
            FileMode::Read => options.read(true),
            FileMode::Write => options.write(true).create(true).truncate(true),
            FileMode::Append => options.append(true).create(true),
            FileMode::ReadUpdate => options.read(true).write(true),
            FileMode::WriteUpdate => options.read(true).write(true).create(true).truncate(true),
            FileMode::AppendUpdate => options.read(true).append(true).create(true),
        };
        options
    }
}

struct OpenFile {
    file: File,
    eof: bool,
}

#[derive(Default)]
pub struct FileTable {
    files: HashMap<u64, OpenFile>,
    next: u64,
}

impl FileTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `path`. `None` when the host refuses.
    pub fn open(&mut self, path: impl AsRef<Path>, mode: FileMode) -> Option<u64> {
        let path = path.as_ref();
        match mode.options().open(path) {
            Ok(file) => {
                self.next += 1;
                let handle = self.next;
                self.files.insert(handle, OpenFile { file, eof: false });
                log::debug!("Opened {} ({:?}) as handle {}", path.display(), mode, handle);
                Some(handle)
            }
            Err(e) => {
                log::warn!("fopen {} ({:?}) failed: {}", path.display(), mode, e);
                None
            }
        }
    }

    fn entry(&mut self, handle: u64) -> Result<&mut OpenFile, Fault> {
        if handle == 0 {
            return Err(Fault::NullFileHandle);
        }
        self.files
            .get_mut(&handle)
            .ok_or(Fault::InvalidFileHandle(handle))
    }

    /// Fails the same way every other operation does on a bad handle
    pub fn validate(&mut self, handle: u64) -> Result<(), Fault> {
        self.entry(handle).map(|_| ())
    }

    pub fn close(&mut self, handle: u64) -> Result<(), Fault> {
        self.entry(handle)?;
        self.files.remove(&handle);
        Ok(())
    }

    /// Fill `buf` as far as possible. I/O errors end the transfer early.
    pub fn read(&mut self, handle: u64, buf: &mut [u8]) -> Result<usize, Fault> {
        let entry = self.entry(handle)?;
        let mut done = 0;
        while done < buf.len() {
            match entry.file.read(&mut buf[done..]) {
                Ok(0) => {
                    entry.eof = true;
                    break;
                }
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("fread on handle {} failed: {}", handle, e);
                    break;
                }
            }
        }
        Ok(done)
    }

    pub fn write(&mut self, handle: u64, bytes: &[u8]) -> Result<usize, Fault> {
        let entry = self.entry(handle)?;
        let mut done = 0;
        while done < bytes.len() {
            match entry.file.write(&bytes[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("fwrite on handle {} failed: {}", handle, e);
                    break;
                }
            }
        }
        Ok(done)
    }

    /// Whether a read on `handle` has hit end of file
    pub fn eof(&mut self, handle: u64) -> Result<bool, Fault> {
        Ok(self.entry(handle)?.eof)
    }

    pub fn close_all(&mut self) {
        if !self.files.is_empty() {
            log::debug!("Closing {} guest files", self.files.len());
        }
        self.files.clear();
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
