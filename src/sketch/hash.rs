use rand::Rng;

// Mersenne prime 2^31 - 1
const MOD: u64 = (1 << 31) - 1;
const HL: u32 = 31;

/// One member of the pairwise-independent family `h(x) = ((a * x + b) mod p) mod w`.
#[derive(Clone, Copy, Debug)]
pub struct PairwiseHash {
    a: u64,
    b: u64,
}

impl PairwiseHash {
    pub fn draw<R: Rng>(rng: &mut R) -> Self {
        Self {
            a: rng.gen::<u32>() as u64 & MOD,
            b: rng.gen::<u32>() as u64 & MOD,
        }
    }

    /// Reduces `a * x + b` modulo 2^31 - 1 without a division.
    pub fn hash31(&self, x: u64) -> u64 {
        // a < 2^31 and x < 2^32, so the product fits in 63 bits
        let result = self.a * x + self.b;
        ((result >> HL) + result) & MOD
    }

    pub fn bucket(&self, x: u64, width: u32) -> usize {
        (self.hash31(x) % width as u64) as usize
    }
}
