//! Aggregate bandwidth limiter shared by both stream directions

use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Bytes per second granted by one Kbit/s of configured limit
/// (1024 bits per kilobit, 8 bits per byte).
pub const BYTES_PER_KBIT: u64 = 128;

const MICROS_PER_SECOND: u128 = 1_000_000;

/// Token bucket accounting the combined read and write volume of a session.
/// Credit accrues with wall-clock time and saturates at one second's worth
/// of budget; a debit larger than the credit sleeps the caller.
pub struct BwStats {
    rate: u64,
    avail: u64,
    last: Instant,
}

impl BwStats {
    /// `kbit` is the user-visible limit in Kbit/s.
    pub fn new(kbit: u64) -> Self {
        BwStats {
            rate: kbit * BYTES_PER_KBIT,
            avail: 0,
            last: Instant::now(),
        }
    }

    /// One shared bucket for a reader/writer pair.
    pub fn shared(kbit: u64) -> Arc<Mutex<BwStats>> {
        Arc::new(Mutex::new(BwStats::new(kbit)))
    }

    /// Configured ceiling in bytes per second.
    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Account for `n` bytes of traffic, sleeping first if the budget is
    /// exhausted.
    pub fn throttle(&mut self, n: u64) {
        if self.rate == 0 || n == 0 {
            return;
        }
        let now = Instant::now();
        let elapsed_us = now.duration_since(self.last).as_micros();
        let credit = elapsed_us.saturating_mul(self.rate as u128) / MICROS_PER_SECOND;
        let avail = (self.avail as u128 + credit).min(self.rate as u128) as u64;
        if avail < n {
            let deficit = n - avail;
            let sleep_us = deficit as u128 * MICROS_PER_SECOND / self.rate as u128;
            thread::sleep(Duration::from_micros(sleep_us as u64));
            self.avail = 0;
        } else {
            self.avail = avail - n;
        }
        self.last = Instant::now();
    }

    #[cfg(test)]
    fn backdate(&mut self, by: Duration) {
        self.last -= by;
    }
}

/// Reader half of the limited stream. Accounts bytes after each read so the
/// next operation pays for them.
pub struct LimitedReader<R> {
    inner: R,
    stats: Arc<Mutex<BwStats>>,
}

impl<R: Read> LimitedReader<R> {
    pub fn new(inner: R, stats: Arc<Mutex<BwStats>>) -> Self {
        LimitedReader { inner, stats }
    }
}

impl<R: Read> Read for LimitedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.stats.lock().throttle(n as u64);
        }
        Ok(n)
    }
}

/// Writer half of the limited stream. Pays for the bytes up front, then
/// writes them all.
pub struct LimitedWriter<W> {
    inner: W,
    stats: Arc<Mutex<BwStats>>,
}

impl<W: Write> LimitedWriter<W> {
    pub fn new(inner: W, stats: Arc<Mutex<BwStats>>) -> Self {
        LimitedWriter { inner, stats }
    }
}

impl<W: Write> Write for LimitedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stats.lock().throttle(buf.len() as u64);
        self.inner.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kbit_conversion() {
        assert_eq!(BwStats::new(1).rate(), 128);
        assert_eq!(BwStats::new(800).rate(), 102_400);
    }

    #[test]
    fn zero_rate_never_sleeps() {
        let mut st = BwStats::new(0);
        let start = Instant::now();
        st.throttle(1 << 30);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn overdraft_sleeps_proportionally() {
        // 8 Kbit/s = 1024 B/s; an immediate 512-byte debit owes ~500ms
        let mut st = BwStats::new(8);
        let start = Instant::now();
        st.throttle(512);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(400), "slept {elapsed:?}");
    }

    #[test]
    fn idle_time_credits_budget_up_to_one_second() {
        let mut st = BwStats::new(8); // 1024 B/s
        st.backdate(Duration::from_secs(10));
        let start = Instant::now();
        // a full second of burst is available despite 10s of idle time
        st.throttle(1024);
        assert!(start.elapsed() < Duration::from_millis(100));
        // the bucket is now empty; the next debit must wait again
        let start = Instant::now();
        st.throttle(256);
        assert!(start.elapsed() >= Duration::from_millis(180));
    }

    #[test]
    fn wrappers_share_one_bucket() {
        let stats = BwStats::shared(8); // 1024 B/s
        let mut r = LimitedReader::new(io::Cursor::new(vec![0u8; 256]), stats.clone());
        let mut w = LimitedWriter::new(io::sink(), stats);
        let mut buf = [0u8; 256];
        let start = Instant::now();
        r.read_exact(&mut buf).unwrap();
        w.write_all(&buf).unwrap();
        // 512 combined bytes at 1024 B/s is roughly half a second
        assert!(start.elapsed() >= Duration::from_millis(400));
    }
}
