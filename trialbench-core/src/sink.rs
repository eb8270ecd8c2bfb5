//! Blackhole sink
//!
//! Values handed to the sink must look used to the optimizer without the
//! sink becoming a measurable cost. Every consume advances a linear
//! congruential generator; only when its low bits under a growing mask are
//! all zero is the value stored. Stores therefore become exponentially rare
//! while remaining unpredictable to the compiler.

use std::hint::black_box;

const LCG_MULTIPLIER: u64 = 6_364_136_223_846_793_005;
const LCG_INCREMENT: u64 = 1_442_695_040_888_963_407;

/// Keeps its payload on its own cache lines.
#[repr(align(128))]
#[derive(Debug, Default)]
struct Padded<T>(T);

#[derive(Debug, Default)]
struct Generator {
    state: u64,
    mask: u64,
}

#[derive(Debug, Default)]
struct Slot {
    word: u64,
    float: f64,
    address: usize,
    stores: u64,
}

/// Thread-owned sink defeating dead-code elimination.
#[derive(Debug)]
pub struct Blackhole {
    generator: Padded<Generator>,
    slot: Padded<Slot>,
}

impl Blackhole {
    /// Sink seeded from the thread-local RNG
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    /// Sink with a fixed seed
    pub fn with_seed(seed: u64) -> Self {
        Self {
            generator: Padded(Generator {
                state: seed,
                mask: 1,
            }),
            slot: Padded(Slot::default()),
        }
    }

    #[inline(always)]
    fn tick(&mut self) -> bool {
        let generator = &mut self.generator.0;
        generator.state = generator
            .state
            .wrapping_mul(LCG_MULTIPLIER)
            .wrapping_add(LCG_INCREMENT);
        if generator.state & generator.mask == 0 {
            generator.mask = (generator.mask << 1) | 1;
            self.slot.0.stores += 1;
            true
        } else {
            false
        }
    }

    /// Consume an integer
    #[inline]
    pub fn consume_u64(&mut self, value: u64) {
        let value = black_box(value);
        if self.tick() {
            self.slot.0.word = value;
        }
    }

    /// Consume a float
    #[inline]
    pub fn consume_f64(&mut self, value: f64) {
        let value = black_box(value);
        if self.tick() {
            self.slot.0.float = value;
        }
    }

    /// Consume a boolean
    #[inline]
    pub fn consume_bool(&mut self, value: bool) {
        self.consume_u64(value as u64);
    }

    /// Consume any value; its address escapes on a trigger
    #[inline]
    pub fn consume<T>(&mut self, value: T) {
        let value = black_box(value);
        if self.tick() {
            self.slot.0.address = &value as *const T as usize;
        }
        drop(value);
    }

    /// Number of stores performed so far
    pub fn stores(&self) -> u64 {
        self.slot.0.stores
    }
}

impl Default for Blackhole {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_padded() {
        assert!(std::mem::align_of::<Blackhole>() >= 128);
        assert!(std::mem::size_of::<Blackhole>() >= 256);
    }

    #[test]
    fn test_stores_are_sparse() {
        let mut sink = Blackhole::with_seed(42);
        for i in 0..1_000_000u64 {
            sink.consume_u64(i);
        }
        let stores = sink.stores();
        assert!(stores >= 5, "expected some stores, got {stores}");
        assert!(stores <= 40, "expected sparse stores, got {stores}");
    }

    #[test]
    fn test_mixed_consumes_share_trigger() {
        let mut sink = Blackhole::new();
        for i in 0..10_000 {
            sink.consume_f64(i as f64);
            sink.consume_bool(i % 2 == 0);
            sink.consume(vec![i]);
        }
        assert!(sink.stores() > 0);
        assert!(sink.stores() < 64);
    }
}
