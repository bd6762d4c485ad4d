// Block state tracker: picks the row or column path for each block in a scan.
use std::sync::Arc;

use getrandom::fill as fill_random;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::core::block::{BlockSnapshot, FrozenColumns};
use crate::core::error::{Error, ErrorKind};

/// Probability that a frozen block is materialized anyway. Always finite and
/// within `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub struct SamplingRatio(f64);

impl SamplingRatio {
    pub const NEVER: Self = Self(0.0);
    pub const ALWAYS: Self = Self(1.0);

    pub fn new(ratio: f64) -> Result<Self, Error> {
        if !ratio.is_finite() || !(0.0..=1.0).contains(&ratio) {
            return Err(Error::new(ErrorKind::InvalidPolicy)
                .with_message(format!("sampling ratio {ratio} is outside [0, 1]"))
                .with_hint("Pass a number between 0 and 1, e.g. 0.25."));
        }
        Ok(Self(ratio))
    }

    pub fn parse(input: &str) -> Result<Self, Error> {
        let trimmed = input.trim();
        let ratio = trimmed.parse::<f64>().map_err(|err| {
            Error::new(ErrorKind::InvalidPolicy)
                .with_message(format!("sampling ratio {trimmed:?} is not a number"))
                .with_hint("Pass a number between 0 and 1, e.g. 0.25.")
                .with_source(err)
        })?;
        Self::new(ratio)
    }

    pub fn get(self) -> f64 {
        self.0
    }
}

impl Default for SamplingRatio {
    fn default() -> Self {
        Self::NEVER
    }
}

/// Which pipeline a block's rows take.
#[derive(Clone, Debug)]
pub enum ScanPath {
    Row,
    Column(Arc<FrozenColumns>),
}

impl ScanPath {
    pub fn is_row(&self) -> bool {
        matches!(self, ScanPath::Row)
    }
}

/// Shared Bernoulli source. Draws are serialized so a seeded sampler yields
/// the same sequence across runs.
#[derive(Debug)]
pub struct Sampler {
    rng: Mutex<StdRng>,
}

impl Sampler {
    pub fn from_entropy() -> Result<Self, Error> {
        let mut seed = [0u8; 32];
        fill_random(&mut seed).map_err(|err| {
            Error::new(ErrorKind::Internal).with_message(format!("failed to seed sampler: {err}"))
        })?;
        Ok(Self {
            rng: Mutex::new(StdRng::from_seed(seed)),
        })
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn draw(&self, ratio: SamplingRatio) -> bool {
        self.rng.lock().gen_bool(ratio.get())
    }
}

/// Classifies one observed block state. Only frozen blocks consume a draw.
pub fn classify(snapshot: BlockSnapshot, ratio: SamplingRatio, sampler: &Sampler) -> ScanPath {
    match snapshot {
        BlockSnapshot::Hot | BlockSnapshot::Freezing => ScanPath::Row,
        BlockSnapshot::Frozen(frozen) => {
            if sampler.draw(ratio) {
                ScanPath::Row
            } else {
                ScanPath::Column(frozen)
            }
        }
    }
}

/// Active sampling ratio plus the generator it is applied with.
#[derive(Debug)]
pub struct ExportPolicy {
    ratio: RwLock<SamplingRatio>,
    sampler: Sampler,
}

impl ExportPolicy {
    pub fn new(ratio: SamplingRatio, sampler: Sampler) -> Self {
        Self {
            ratio: RwLock::new(ratio),
            sampler,
        }
    }

    pub fn ratio(&self) -> SamplingRatio {
        *self.ratio.read()
    }

    pub fn set_ratio(&self, ratio: SamplingRatio) {
        *self.ratio.write() = ratio;
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }
}

#[cfg(test)]
mod tests {
    use super::{SamplingRatio, Sampler, ScanPath, classify};
    use crate::core::block::{BlockSnapshot, FrozenColumns};
    use crate::core::error::ErrorKind;
    use arrow::datatypes::Schema;
    use std::sync::Arc;

    fn frozen() -> BlockSnapshot {
        let columns = FrozenColumns::new(Arc::new(Schema::empty()), Vec::new()).expect("frozen");
        BlockSnapshot::Frozen(Arc::new(columns))
    }

    #[test]
    fn ratio_bounds_are_enforced() {
        assert_eq!(SamplingRatio::new(0.0).expect("zero"), SamplingRatio::NEVER);
        assert_eq!(SamplingRatio::parse(" 1 ").expect("one"), SamplingRatio::ALWAYS);
        for bad in [-0.01, 1.5, f64::NAN, f64::INFINITY] {
            let err = SamplingRatio::new(bad).expect_err("out of range");
            assert_eq!(err.kind(), ErrorKind::InvalidPolicy);
        }
        let err = SamplingRatio::parse("lots").expect_err("not a number");
        assert_eq!(err.kind(), ErrorKind::InvalidPolicy);
    }

    #[test]
    fn hot_and_freezing_always_take_row_path() {
        let sampler = Sampler::seeded(1);
        for snapshot in [BlockSnapshot::Hot, BlockSnapshot::Freezing] {
            assert!(classify(snapshot, SamplingRatio::NEVER, &sampler).is_row());
        }
    }

    #[test]
    fn extremes_are_deterministic_for_frozen_blocks() {
        let sampler = Sampler::seeded(7);
        for _ in 0..100 {
            assert!(matches!(
                classify(frozen(), SamplingRatio::NEVER, &sampler),
                ScanPath::Column(_)
            ));
            assert!(classify(frozen(), SamplingRatio::ALWAYS, &sampler).is_row());
        }
    }

    #[test]
    fn seeded_samplers_agree() {
        let ratio = SamplingRatio::new(0.5).expect("ratio");
        let a = Sampler::seeded(99);
        let b = Sampler::seeded(99);
        let draws_a: Vec<bool> = (0..64).map(|_| a.draw(ratio)).collect();
        let draws_b: Vec<bool> = (0..64).map(|_| b.draw(ratio)).collect();
        assert_eq!(draws_a, draws_b);
        assert!(draws_a.contains(&true) && draws_a.contains(&false));
    }
}
