/// Default smoothing factor for the exponential averages
pub const DEFAULT_ALPHA: f64 = 0.125;

/// One round-trip measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSample {
    /// Round-trip time (ms)
    pub rtt: f64,
    /// Remote clock minus local clock (ms)
    pub offset: f64,
}

/// Measures RTT and offset from a ping/pong exchange.
///
/// `sent` and `received` are local times of the ping leaving and the pong
/// arriving; `remote` is the responder's timestamp in the pong.
pub fn measure(sent: f64, remote: f64, received: f64) -> ClockSample {
    let rtt = received - sent;
    ClockSample {
        rtt,
        offset: remote - sent - rtt / 2.0,
    }
}

/// Smoothed link estimate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockFilterState {
    /// Smoothed round-trip time (ms)
    pub rtt: f64,
    /// Smoothed remote-minus-local offset (ms)
    pub offset: f64,
    /// Mean absolute RTT deviation (ms)
    pub jitter: f64,
    /// Samples folded in so far
    pub samples: u64,
}

impl ClockFilterState {
    /// Maps a remote timestamp onto the local clock
    pub fn to_local(&self, remote: f64) -> f64 {
        remote - self.offset
    }
}

/// Exponential-average filter over [`ClockSample`]s
#[derive(Debug, Clone)]
pub struct ClockFilter {
    alpha: f64,
    state: Option<ClockFilterState>,
}

impl Default for ClockFilter {
    fn default() -> Self {
        ClockFilter::new(DEFAULT_ALPHA)
    }
}

impl ClockFilter {
    /// Creates a filter; `alpha` is clamped into (0, 1]
    pub fn new(alpha: f64) -> Self {
        ClockFilter {
            alpha: alpha.clamp(f64::EPSILON, 1.0),
            state: None,
        }
    }

    /// Folds a sample in. Negative or non-finite RTTs are discarded.
    pub fn update(&mut self, sample: ClockSample) -> Option<&ClockFilterState> {
        if !sample.rtt.is_finite() || !sample.offset.is_finite() || sample.rtt < 0.0 {
            return self.state.as_ref();
        }

        let alpha = self.alpha;
        let next = match self.state {
            None => ClockFilterState {
                rtt: sample.rtt,
                offset: sample.offset,
                jitter: 0.0,
                samples: 1,
            },
            Some(prev) => {
                let deviation = (sample.rtt - prev.rtt).abs();
                ClockFilterState {
                    rtt: prev.rtt + alpha * (sample.rtt - prev.rtt),
                    offset: prev.offset + alpha * (sample.offset - prev.offset),
                    jitter: prev.jitter + alpha * (deviation - prev.jitter),
                    samples: prev.samples + 1,
                }
            }
        };
        self.state = Some(next);
        self.state.as_ref()
    }

    /// Current estimate, if any sample arrived
    pub fn state(&self) -> Option<&ClockFilterState> {
        self.state.as_ref()
    }

    /// Forgets all samples
    pub fn reset(&mut self) {
        self.state = None;
    }
}
