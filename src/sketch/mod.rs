//! Hierarchical Count-Min sketch over the integer domain `[0, 2^U)`.
//!
//! The domain is split into dyadic levels. Level 0 holds individual values, and each level above
//! it merges `2^gran` cells of the level below. Coarse levels have few enough cells that counting
//! them exactly costs no more than a sketch, so only the fine levels are hashed.
//!
//! Range sums walk upward from level 0, summing the ragged ends at each level and handing the
//! aligned middle to the next level. Quantiles binary search those range sums from both ends.

mod hash;

use rand::{rngs::StdRng, SeedableRng};

use super::config::SketchConfig;
use super::error::{PacerError, PacerResult};
use hash::PairwiseHash;

const DOMAIN_BITS_MAX: u32 = 32;

enum Level {
    // One counter per cell
    Exact(Box<[i64]>),
    // depth x width counters, one hash per row
    Hashed {
        counts: Box<[i64]>,
        hashes: Box<[PairwiseHash]>,
    },
}

pub struct Sketch {
    width: u32,
    depth: u32,
    domain_bits: u32,
    gran: u32,
    // Levels at or above this index are exact
    freelim: usize,
    levels: Box<[Level]>,
    // Total weight inserted
    count: i64,
    // Largest value inserted
    max: u32,
}

impl Sketch {
    pub fn check_params(width: u32, depth: u32, domain_bits: u32, gran: u32) -> PacerResult<()> {
        let fail = |message: String| Err(PacerError::InvalidSketch { message });

        if domain_bits == 0 || domain_bits > DOMAIN_BITS_MAX {
            return fail(format!("domain bits {} not in 1..=32", domain_bits));
        }
        if gran == 0 || gran > domain_bits {
            return fail(format!("granularity {} not in 1..={}", gran, domain_bits));
        }
        if width == 0 || depth == 0 {
            return fail(format!("width {} and depth {} must be nonzero", width, depth));
        }
        if width as u64 * depth as u64 > u32::MAX as u64 {
            return fail(format!("width {} x depth {} too large", width, depth));
        }

        Ok(())
    }

    pub fn new(
        width: u32,
        depth: u32,
        domain_bits: u32,
        gran: u32,
        seed: u64,
    ) -> PacerResult<Self> {
        Self::check_params(width, depth, domain_bits, gran)?;

        let level_count = ((domain_bits + gran - 1) / gran) as usize;
        let cells = width as u64 * depth as u64;

        // Number of top levels whose exact arrays are no larger than a sketch
        let mut cheap = 0;
        for j in 0..level_count {
            if (1u64 << (gran as usize * j)) <= cells {
                cheap = j;
            } else {
                break;
            }
        }
        let freelim = level_count - cheap;

        let mut rng = StdRng::seed_from_u64(seed);

        let levels = (0..level_count)
            .map(|i| {
                if i >= freelim {
                    let size = 1usize << (gran as usize * (level_count - i));
                    Level::Exact(vec![0; size].into_boxed_slice())
                } else {
                    let hashes = (0..depth)
                        .map(|_| PairwiseHash::draw(&mut rng))
                        .collect::<Vec<_>>();
                    Level::Hashed {
                        counts: vec![0; cells as usize].into_boxed_slice(),
                        hashes: hashes.into_boxed_slice(),
                    }
                }
            })
            .collect::<Vec<_>>();

        Ok(Self {
            width,
            depth,
            domain_bits,
            gran,
            freelim,
            levels: levels.into_boxed_slice(),
            count: 0,
            max: 0,
        })
    }

    pub fn from_config(config: &SketchConfig) -> PacerResult<Self> {
        Self::new(
            config.width,
            config.depth,
            config.domain_bits,
            config.granularity,
            config.seed,
        )
    }

    /// Adds `diff` to the weight of `value`. Values beyond the domain are saturated to its last
    /// value.
    pub fn update(&mut self, value: u32, diff: i64) {
        let value = value.min(self.domain_last() as u32);

        self.max = self.max.max(value);
        self.count += diff;

        let width = self.width;
        let mut item = value as u64;

        for level in self.levels.iter_mut() {
            match level {
                Level::Exact(counts) => {
                    counts[item as usize] += diff;
                }
                Level::Hashed { counts, hashes } => {
                    for (row, h) in hashes.iter().enumerate() {
                        counts[row * width as usize + h.bucket(item, width)] += diff;
                    }
                }
            }

            item >>= self.gran;
        }
    }

    /// Estimated weight of cell `item` at `level`. Exact levels are exact; hashed levels return
    /// the minimum over rows, which never underestimates non-negative weights.
    pub fn point_estimate(&self, level: usize, item: u64) -> i64 {
        match self.levels.get(level) {
            None => self.count,
            Some(Level::Exact(counts)) => counts.get(item as usize).copied().unwrap_or(0),
            Some(Level::Hashed { counts, hashes }) => hashes
                .iter()
                .enumerate()
                .map(|(row, h)| counts[row * self.width as usize + h.bucket(item, self.width)])
                .min()
                .unwrap_or(0),
        }
    }

    /// Estimated total weight of values in `[start, end]`.
    pub fn range_sum(&self, start: u64, end: u64) -> i64 {
        let last = self.domain_last();
        let end = end.min(last);

        if start > end {
            return 0;
        }
        if start == 0 && end == last {
            return self.count;
        }

        let block = 1u64 << self.gran;
        let mut lo = start;
        let mut hi = end + 1;
        let mut result = 0;

        for level in 0..=self.levels.len() {
            if lo >= hi {
                break;
            }

            let lo_up = (lo + block - 1) >> self.gran;
            let hi_up = hi >> self.gran;

            if lo_up >= hi_up {
                // No whole parent cell inside the range, finish at this level
                result += (lo..hi).map(|item| self.point_estimate(level, item)).sum::<i64>();
                break;
            }

            result += (lo..lo_up << self.gran)
                .map(|item| self.point_estimate(level, item))
                .sum::<i64>();
            result += (hi_up << self.gran..hi)
                .map(|item| self.point_estimate(level, item))
                .sum::<i64>();

            lo = lo_up;
            hi = hi_up;
        }

        result
    }

    /// Smallest `x` (to within one part in 2^U) such that the weight of `[0, x]` exceeds `sum`.
    pub fn find_range(&self, sum: i64) -> u64 {
        if self.count < sum {
            return self.max as u64;
        }

        let mut low = 0;
        let mut high = self.domain_top();
        let mut mid = 0;

        for _ in 0..self.domain_bits {
            mid = (low + high) / 2;
            if self.range_sum(0, mid) > sum {
                high = mid;
            } else {
                low = mid;
            }
        }

        mid
    }

    /// Largest `x` (to within one part in 2^U) such that the weight of `[x, top]` reaches `sum`.
    pub fn alt_find_range(&self, sum: i64) -> u64 {
        if self.count < sum {
            return self.max as u64;
        }

        let top = self.domain_top();
        let mut low = 0;
        let mut high = top;
        let mut mid = 0;

        for _ in 0..self.domain_bits {
            mid = (low + high) / 2;
            if self.range_sum(mid, top) < sum {
                high = mid;
            } else {
                low = mid;
            }
        }

        mid
    }

    /// Estimated `frac` quantile: the midpoint of a search from below and a search from above.
    pub fn quantile(&self, frac: f64) -> u64 {
        if !(frac > 0.0) {
            return 0;
        }
        if frac >= 1.0 {
            return self.domain_top();
        }

        let below = self.find_range((self.count as f64 * frac) as i64);
        let above = self.alt_find_range((self.count as f64 * (1.0 - frac)) as i64);

        (below + above) / 2
    }

    pub fn count(&self) -> i64 {
        self.count
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Index of the first exactly counted level.
    pub fn freelim(&self) -> usize {
        self.freelim
    }

    pub fn is_exact_level(&self, level: usize) -> bool {
        matches!(self.levels.get(level), Some(Level::Exact(_)))
    }

    /// 2^U, one past the last value of the domain.
    pub fn domain_top(&self) -> u64 {
        1u64 << self.domain_bits
    }

    fn domain_last(&self) -> u64 {
        self.domain_top() - 1
    }

    /// Approximate memory footprint in bytes.
    pub fn size_bytes(&self) -> usize {
        let counter = std::mem::size_of::<i64>();
        let counts = self
            .levels
            .iter()
            .map(|level| match level {
                Level::Exact(counts) => counts.len() * counter,
                Level::Hashed { counts, .. } => counts.len() * counter,
            })
            .sum::<usize>();
        let hashes = self.freelim * self.depth as usize * std::mem::size_of::<PairwiseHash>();

        std::mem::size_of::<Self>() + counts + hashes
    }
}
