use std::time::Duration;
use parking_lot::Mutex;

const SRTT_ALPHA: f64 = 1.0 / 8.0;
const RTTVAR_BETA: f64 = 1.0 / 4.0;

#[derive(Default)]
struct RttState {
    srtt_millis: f64,
    rttvar_millis: f64,
    initialized: bool,
}

/// Smoothed round trip time and deviation as in RFC 6298, shared by all substreams of a
///  connection
#[derive(Default)]
pub struct Rtt {
    state: Mutex<RttState>,
}

impl Rtt {
    pub fn new() -> Rtt {
        Default::default()
    }

    pub fn adjust(&self, sample: Duration) {
        let sample = sample.as_secs_f64() * 1000.0;
        let mut state = self.state.lock();

        if !state.initialized {
            state.srtt_millis = sample;
            state.rttvar_millis = sample / 2.0;
            state.initialized = true;
        }
        else {
            state.rttvar_millis = (1.0 - RTTVAR_BETA) * state.rttvar_millis + RTTVAR_BETA * (state.srtt_millis - sample).abs();
            state.srtt_millis = (1.0 - SRTT_ALPHA) * state.srtt_millis + SRTT_ALPHA * sample;
        }
    }

    pub fn initialized(&self) -> bool {
        self.state.lock().initialized
    }

    pub fn smoothed_average(&self) -> Duration {
        Duration::from_secs_f64(self.state.lock().srtt_millis / 1000.0)
    }

    pub fn smoothed_deviation(&self) -> Duration {
        Duration::from_secs_f64(self.state.lock().rttvar_millis / 1000.0)
    }

    pub fn reset(&self) {
        *self.state.lock() = RttState::default();
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample() {
        let rtt = Rtt::new();
        assert!(!rtt.initialized());

        rtt.adjust(Duration::from_millis(100));
        assert!(rtt.initialized());
        assert_eq!(rtt.smoothed_average(), Duration::from_millis(100));
        assert_eq!(rtt.smoothed_deviation(), Duration::from_millis(50));
    }

    #[test]
    fn test_smoothing() {
        let rtt = Rtt::new();
        rtt.adjust(Duration::from_millis(100));
        rtt.adjust(Duration::from_millis(200));

        // rttvar = 3/4 * 50 + 1/4 * 100, srtt = 7/8 * 100 + 1/8 * 200
        assert_eq!(rtt.smoothed_deviation().as_millis(), 62);
        assert_eq!(rtt.smoothed_average().as_millis(), 112);

        rtt.reset();
        assert!(!rtt.initialized());
    }
}
