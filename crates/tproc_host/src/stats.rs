//! Readout timing statistics.
//!
//! Tracks the gaps between consecutive chunks and their sizes so a run can
//! be checked against the buffer capacity: a gap that grows close to the time
//! the board needs to fill the buffer means the stride is too large.

use std::time::Duration;

const BUCKETS: usize = 20;

/// Bucket width of the gap histogram, in microseconds.
const BUCKET_US: u64 = 500;

pub struct ChunkTimings {
    pub min_gap: u64,
    pub max_gap: u64,
    pub sum_gap: u64,
    pub chunks: u64,
    pub samples: u64,
    pub max_length: usize,
    pub buckets: [u64; BUCKETS],
    last: Option<Duration>,
}

impl ChunkTimings {
    pub fn new() -> Self {
        Self {
            min_gap: u64::MAX,
            max_gap: 0,
            sum_gap: 0,
            chunks: 0,
            samples: 0,
            max_length: 0,
            buckets: [0; BUCKETS],
            last: None,
        }
    }

    /// Records a chunk delivered `elapsed` after the readout started.
    ///
    /// # Arguments
    ///
    /// * `elapsed` - Chunk timestamp relative to readout start
    /// * `length` - Samples per channel in the chunk
    pub fn update(&mut self, elapsed: Duration, length: usize) {
        let gap = elapsed
            .saturating_sub(self.last.unwrap_or_default())
            .as_nanos() as u64;
        self.last = Some(elapsed);

        self.min_gap = self.min_gap.min(gap);
        self.max_gap = self.max_gap.max(gap);
        self.sum_gap += gap;
        self.chunks += 1;
        self.samples += length as u64;
        self.max_length = self.max_length.max(length);

        let idx = (gap / (BUCKET_US * 1000)).min(BUCKETS as u64 - 1) as usize;
        self.buckets[idx] += 1;
    }

    /// Mean gap in nanoseconds, 0.0 before the first chunk.
    pub fn avg_gap(&self) -> f64 {
        if self.chunks == 0 {
            0.0
        } else {
            self.sum_gap as f64 / self.chunks as f64
        }
    }

    pub fn print_report(&self) {
        println!("\nChunk Timing");
        println!("Chunks:     {}", self.chunks);
        println!("Samples:    {}", self.samples);
        println!("Max chunk:  {}", self.max_length);
        if self.chunks == 0 {
            return;
        }
        println!("Min gap:    {:.2} us", self.min_gap as f64 / 1000.0);
        println!("Avg gap:    {:.2} us", self.avg_gap() / 1000.0);
        println!("Max gap:    {:.2} us", self.max_gap as f64 / 1000.0);

        println!("Distribution ({BUCKET_US}us buckets):");
        for (i, &count) in self.buckets.iter().enumerate() {
            if count > 0 {
                let open = if i == BUCKETS - 1 { ">" } else { "" };
                let lower = i as u64 * BUCKET_US;
                let upper = (i as u64 + 1) * BUCKET_US;
                println!("[{lower:5}-{upper:5}{open} us]: {count}");
            }
        }
    }
}

impl Default for ChunkTimings {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gaps_are_measured_between_chunks() {
        let mut t = ChunkTimings::new();
        t.update(Duration::from_micros(100), 10);
        t.update(Duration::from_micros(400), 20);
        t.update(Duration::from_millis(30), 4);

        assert_eq!(t.chunks, 3);
        assert_eq!(t.samples, 34);
        assert_eq!(t.max_length, 20);
        assert_eq!(t.min_gap, 100_000);
        assert_eq!(t.max_gap, 29_600_000);
        assert_eq!(t.buckets[0], 2);
        assert_eq!(t.buckets[BUCKETS - 1], 1);
    }
}
