/// Number of samples averaged before exponential decay kicks in.
const WARMUP_SAMPLES: u32 = 10;

/// Exponentially weighted moving average over samples added at a fixed rate.
///
/// `age` is the approximate number of samples the average spans, so a backend
/// ticking once per second with `age = 30` averages over roughly half a minute.
/// The first [`WARMUP_SAMPLES`] samples are averaged arithmetically and
/// [`Ewma::value`] reports `0.0` until that warmup is complete.
#[derive(Debug, Clone, PartialEq)]
pub struct Ewma {
    decay: f64,
    value: f64,
    count: u32,
}

impl Ewma {
    pub fn new(age: f64) -> Self {
        Self {
            decay: 2.0 / (age.max(1.0) + 1.0),
            value: 0.0,
            count: 0,
        }
    }

    pub fn add(&mut self, sample: f64) {
        if self.count < WARMUP_SAMPLES {
            self.count += 1;
            self.value += sample;
            if self.count == WARMUP_SAMPLES {
                self.value /= f64::from(WARMUP_SAMPLES);
            }
        } else {
            self.value = sample * self.decay + self.value * (1.0 - self.decay);
        }
    }

    pub fn value(&self) -> f64 {
        if self.is_warm() { self.value } else { 0.0 }
    }

    pub fn is_warm(&self) -> bool {
        self.count >= WARMUP_SAMPLES
    }

    /// Overwrite the average, skipping warmup.
    pub fn set(&mut self, value: f64) {
        self.value = value;
        self.count = WARMUP_SAMPLES;
    }
}
