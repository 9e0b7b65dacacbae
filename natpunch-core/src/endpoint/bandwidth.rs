use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

const SECONDS: usize = 60;
const MINUTES: usize = 24;
const HOURS: usize = 12;

/// Running byte totals shared by every channel of an endpoint.
#[derive(Default, Debug)]
pub struct Counters {
    read: AtomicU64,
    written: AtomicU64,
}

impl Counters {
    #[inline]
    pub fn add_read(&self, n: usize) {
        self.read.fetch_add(n as u64, Ordering::Relaxed);
    }
    #[inline]
    pub fn add_written(&self, n: usize) {
        self.written.fetch_add(n as u64, Ordering::Relaxed);
    }
    pub fn total_read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }
    pub fn total_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthStats {
    /// Bytes read during the last second.
    pub read_bps: u64,
    /// Bytes written during the last second.
    pub write_bps: u64,
    /// Bytes read over the last 60 one-second samples.
    pub read_last_min: u64,
    pub write_last_min: u64,
}

/// Rolling per-second, per-minute and per-hour byte sums.
#[derive(Debug, Default)]
pub struct BandwidthSampler {
    last_read: u64,
    last_written: u64,
    ticks: u64,
    seconds: Window,
    minutes: Window,
    hours: Window,
    minute_acc: (u64, u64),
    hour_acc: (u64, u64),
}

#[derive(Debug, Default)]
struct Window {
    read: VecDeque<u64>,
    written: VecDeque<u64>,
}

impl Window {
    fn push(&mut self, cap: usize, read: u64, written: u64) {
        if self.read.len() == cap {
            self.read.pop_front();
            self.written.pop_front();
        }
        self.read.push_back(read);
        self.written.push_back(written);
    }
}

impl BandwidthSampler {
    /// Consumes the current counter totals; call once per second.
    pub fn tick(&mut self, total_read: u64, total_written: u64) -> BandwidthStats {
        let read = total_read.saturating_sub(self.last_read);
        let written = total_written.saturating_sub(self.last_written);
        self.last_read = total_read;
        self.last_written = total_written;
        self.ticks += 1;

        self.seconds.push(SECONDS, read, written);
        self.minute_acc.0 += read;
        self.minute_acc.1 += written;
        if self.ticks % SECONDS as u64 == 0 {
            let (r, w) = std::mem::take(&mut self.minute_acc);
            self.minutes.push(MINUTES, r, w);
            self.hour_acc.0 += r;
            self.hour_acc.1 += w;
            if self.ticks % (SECONDS as u64 * 60) == 0 {
                let (r, w) = std::mem::take(&mut self.hour_acc);
                self.hours.push(HOURS, r, w);
            }
        }
        BandwidthStats {
            read_bps: read,
            write_bps: written,
            read_last_min: self.read_last_min(),
            write_last_min: self.written_last_min(),
        }
    }

    pub fn read_last_min(&self) -> u64 {
        self.seconds.read.iter().sum()
    }

    pub fn written_last_min(&self) -> u64 {
        self.seconds.written.iter().sum()
    }

    pub fn minutes_read(&self) -> impl Iterator<Item = &u64> {
        self.minutes.read.iter()
    }

    pub fn minutes_written(&self) -> impl Iterator<Item = &u64> {
        self.minutes.written.iter()
    }

    pub fn hours_read(&self) -> impl Iterator<Item = &u64> {
        self.hours.read.iter()
    }

    pub fn hours_written(&self) -> impl Iterator<Item = &u64> {
        self.hours.written.iter()
    }
}
