//! Scripted archive fetchers

use std::io::{self, Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use searcher::{ArchiveFetcher, ArchiveKey, ArchiveStream, Result, SearcherError};

/// Serves the same tar bytes for every key and counts calls
pub struct StaticFetcher {
    bytes: Vec<u8>,
    calls: AtomicUsize,
}

impl StaticFetcher {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ArchiveFetcher for StaticFetcher {
    fn open(&self, _key: &ArchiveKey) -> Result<ArchiveStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(Cursor::new(self.bytes.clone())))
    }

    fn describe(&self) -> String {
        "static".to_string()
    }
}

/// Blocks every `open` until the test opens the gate
pub struct GatedFetcher {
    bytes: Vec<u8>,
    calls: AtomicUsize,
    open: Mutex<bool>,
    gate: Condvar,
}

impl GatedFetcher {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            calls: AtomicUsize::new(0),
            open: Mutex::new(false),
            gate: Condvar::new(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Let every blocked and future `open` proceed
    pub fn release(&self) {
        *self.open.lock() = true;
        self.gate.notify_all();
    }

    /// Wait until at least `n` opens have started
    pub async fn wait_for_calls(&self, n: usize) {
        for _ in 0..500 {
            if self.calls() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("fetcher saw {} calls, expected {}", self.calls(), n);
    }
}

impl ArchiveFetcher for GatedFetcher {
    fn open(&self, _key: &ArchiveKey) -> Result<ArchiveStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.lock();
        while !*open {
            self.gate.wait(&mut open);
        }
        Ok(Box::new(Cursor::new(self.bytes.clone())))
    }

    fn describe(&self) -> String {
        "gated".to_string()
    }
}

/// Fails every `open` with a clone of `error`
pub struct FailingFetcher {
    error: SearcherError,
    calls: AtomicUsize,
}

impl FailingFetcher {
    pub fn new(error: SearcherError) -> Self {
        Self {
            error,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ArchiveFetcher for FailingFetcher {
    fn open(&self, _key: &ArchiveKey) -> Result<ArchiveStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }

    fn describe(&self) -> String {
        "failing".to_string()
    }
}

/// First `open` hands out a stream that stalls after a few bytes until the
/// test releases it; later opens serve the archive normally
pub struct StallingFetcher {
    bytes: Vec<u8>,
    calls: AtomicUsize,
    stall: Arc<(Mutex<bool>, Condvar)>,
}

impl StallingFetcher {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            calls: AtomicUsize::new(0),
            stall: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Unblock the stalled read; it then fails like a dropped connection
    pub fn release(&self) {
        *self.stall.0.lock() = true;
        self.stall.1.notify_all();
    }

    pub async fn wait_for_calls(&self, n: usize) {
        for _ in 0..500 {
            if self.calls() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("fetcher saw {} calls, expected {}", self.calls(), n);
    }
}

impl ArchiveFetcher for StallingFetcher {
    fn open(&self, _key: &ArchiveKey) -> Result<ArchiveStream> {
        if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
            return Ok(Box::new(Cursor::new(self.bytes.clone())));
        }
        Ok(Box::new(StalledStream {
            prefix_sent: false,
            stall: Arc::clone(&self.stall),
        }))
    }

    fn describe(&self) -> String {
        "stalling".to_string()
    }
}

struct StalledStream {
    prefix_sent: bool,
    stall: Arc<(Mutex<bool>, Condvar)>,
}

impl Read for StalledStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.prefix_sent {
            self.prefix_sent = true;
            let n = buf.len().min(4);
            buf[..n].fill(0);
            return Ok(n);
        }
        let (released, gate) = &*self.stall;
        let mut released = released.lock();
        while !*released {
            gate.wait(&mut released);
        }
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "upstream went away"))
    }
}
