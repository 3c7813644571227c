//! The kernel logger: a fixed-size ring buffer behind the `log` facade.
//!
//! Early boot messages written by the bootloader into its own buffer are
//! replayed here once the kernel owns memory, so one contiguous log
//! survives the handoff. Console/serial mirroring is a driver concern and
//! happens outside the core.

#![no_std]

use core::fmt::{self, Write as FmtWrite};
use kernel_config::memory::LOG_RING_SIZE;
use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// The ring storage. Writes wrap; readers see at most the last
/// `LOG_RING_SIZE` bytes.
struct LogRing {
    buf: [u8; LOG_RING_SIZE],
    /// Total bytes ever written; `head % LOG_RING_SIZE` is the write cursor.
    head: usize,
}

impl LogRing {
    const fn new() -> LogRing {
        LogRing { buf: [0; LOG_RING_SIZE], head: 0 }
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.buf[self.head % LOG_RING_SIZE] = b;
            self.head = self.head.wrapping_add(1);
        }
    }
}

impl fmt::Write for LogRing {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_bytes(s.as_bytes());
        Ok(())
    }
}

static LOG_RING: Mutex<LogRing> = Mutex::new(LogRing::new());

struct RingLogger;

static LOGGER: RingLogger = RingLogger;

impl Log for RingLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut ring = LOG_RING.lock();
        let _ = write!(
            &mut *ring,
            "[{}] {}: {}\n",
            level_str(record.level()),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

fn level_str(level: Level) -> &'static str {
    match level {
        Level::Error => "E",
        Level::Warn => "W",
        Level::Info => "I",
        Level::Debug => "D",
        Level::Trace => "T",
    }
}

/// Installs the ring logger as the `log` facade backend.
///
/// Idempotent: a second call returns an error from the facade, which is
/// ignored because the first installation already won.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

/// Changes the maximum level after init, e.g. from a `-loglevel=` boot
/// argument.
pub fn set_log_level(level: LevelFilter) {
    log::set_max_level(level);
}

/// Replays a raw byte buffer (the bootloader's log) into the ring, ahead of
/// anything the kernel itself logs.
pub fn replay_boot_log(bytes: &[u8]) {
    LOG_RING.lock().write_bytes(bytes);
}

/// Copies the most recent log contents into `out`, returning how many bytes
/// were written. Used by the panic path to dump the tail of the log.
pub fn snapshot_tail(out: &mut [u8]) -> usize {
    let ring = LOG_RING.lock();
    let avail = core::cmp::min(ring.head, LOG_RING_SIZE);
    let want = core::cmp::min(avail, out.len());
    let mut idx = ring.head - want;
    for slot in out[..want].iter_mut() {
        *slot = ring.buf[idx % LOG_RING_SIZE];
        idx += 1;
    }
    want
}
