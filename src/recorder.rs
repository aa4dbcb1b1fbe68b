//! Bounded in-memory history of controller samples.
//!
//! Storage is reserved once at construction. Appending never reallocates, so the sampling thread
//! never pays for an allocation mid-run; once the reserved capacity is used up the recorder
//! reports itself exhausted and drops further samples.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Result of [`SampleRecorder::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Append {
    Recorded,
    /// History is full. `first` is `true` only for the first rejected sample.
    Exhausted { first: bool },
}

/// One recorded tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample<'a> {
    /// Time since the controller's timing baseline.
    pub elapsed: Duration,
    pub lengths: &'a [usize],
    pub quotas: &'a [u64],
}

/// Fixed-capacity, structure-of-arrays sample history.
#[derive(Debug)]
pub struct SampleRecorder {
    width: usize,
    capacity: usize,
    /// Wall-clock time matching `elapsed == 0`.
    epoch: SystemTime,
    elapsed: Vec<Duration>,
    lengths: Vec<usize>,
    quotas: Vec<u64>,
    exhausted: bool,
}

impl SampleRecorder {
    /// Reserve room for `capacity` samples of `width` queues/quotas each.
    ///
    /// # Panics
    /// If [`footprint`](Self::footprint) is `None` for the same arguments.
    pub fn new(width: usize, capacity: usize) -> Self {
        Self {
            width,
            capacity,
            epoch: SystemTime::now(),
            elapsed: Vec::with_capacity(capacity),
            lengths: Vec::with_capacity(capacity * width),
            quotas: Vec::with_capacity(capacity * width),
            exhausted: false,
        }
    }

    /// Bytes [`new`](Self::new) reserves, or `None` if that exceeds what a `Vec` can hold.
    pub fn footprint(width: usize, capacity: usize) -> Option<usize> {
        let cells = capacity.checked_mul(width)?;
        let times = capacity.checked_mul(std::mem::size_of::<Duration>())?;
        let lengths = cells.checked_mul(std::mem::size_of::<usize>())?;
        let quotas = cells.checked_mul(std::mem::size_of::<u64>())?;
        times
            .checked_add(lengths)?
            .checked_add(quotas)
            .filter(|&bytes| bytes <= isize::MAX as usize)
    }

    /// Anchor relative times to `epoch` when rendering absolute timestamps.
    pub fn set_epoch(&mut self, epoch: SystemTime) {
        self.epoch = epoch;
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.elapsed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elapsed.is_empty()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Append one sample in O(1).
    ///
    /// `lengths` and `quotas` must both hold exactly [`width`](Self::width) entries.
    pub fn push(&mut self, elapsed: Duration, lengths: &[usize], quotas: &[u64]) -> Append {
        debug_assert_eq!(lengths.len(), self.width);
        debug_assert_eq!(quotas.len(), self.width);
        if self.elapsed.len() >= self.capacity {
            let first = !self.exhausted;
            self.exhausted = true;
            return Append::Exhausted { first };
        }
        self.elapsed.push(elapsed);
        self.lengths.extend_from_slice(&lengths[..self.width]);
        self.quotas.extend_from_slice(&quotas[..self.width]);
        Append::Recorded
    }

    pub fn get(&self, index: usize) -> Option<Sample<'_>> {
        let elapsed = *self.elapsed.get(index)?;
        let row = index * self.width..(index + 1) * self.width;
        Some(Sample {
            elapsed,
            lengths: &self.lengths[row.clone()],
            quotas: &self.quotas[row],
        })
    }

    pub fn samples(&self) -> impl Iterator<Item = Sample<'_>> + '_ {
        (0..self.len()).filter_map(move |index| self.get(index))
    }

    /// Write the history as CSV: `abs_time,rel_time,node_#i..,runtime_#i..`.
    ///
    /// Times are seconds with nanosecond precision; `abs_time` is seconds since the Unix epoch.
    pub fn write_csv<W: Write>(&self, mut out: W) -> io::Result<()> {
        write!(out, "abs_time,rel_time")?;
        for i in 0..self.width {
            write!(out, ",node_#{i}")?;
        }
        for i in 0..self.width {
            write!(out, ",runtime_#{i}")?;
        }
        writeln!(out)?;

        let base = self.epoch.duration_since(UNIX_EPOCH).unwrap_or_default();
        for sample in self.samples() {
            let abs = base + sample.elapsed;
            write!(
                out,
                "{}.{:09},{}.{:09}",
                abs.as_secs(),
                abs.subsec_nanos(),
                sample.elapsed.as_secs(),
                sample.elapsed.subsec_nanos()
            )?;
            for len in sample.lengths {
                write!(out, ",{len}")?;
            }
            for quota in sample.quotas {
                write!(out, ",{quota}")?;
            }
            writeln!(out)?;
        }
        out.flush()
    }

    /// Write the CSV to `path`, truncating any existing file.
    pub fn save_csv(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let file = File::create(path)?;
        self.write_csv(BufWriter::new(file))
    }
}
