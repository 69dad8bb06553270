//! Counters for various statistics about a connection or torrent, and the
//! running averages derived from them.

use std::time::Duration;

/// The weight of a new sample in the exponentially weighted moving averages
/// below. A factor of 1/5 is responsive enough to drive the choker while
/// smoothing out single-roundtrip noise.
const EWMA_WEIGHT: f64 = 0.2;

/// A cumulative byte counter that also maintains a per-second rate estimate.
///
/// The owner records bytes as they are transferred and calls [`tick`] once a
/// second; the rate is an exponentially weighted moving average over the
/// per-round byte counts.
///
/// [`tick`]: Self::tick
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Counter {
    /// The total number of bytes recorded since the counter was created.
    total: u64,
    /// The bytes recorded in the current (not yet ticked) round.
    round: u64,
    /// The smoothed per-second rate, in bytes.
    rate: f64,
    /// The highest rate ever measured.
    peak: f64,
}

impl Counter {
    /// Records transferred bytes in the current round.
    pub fn add(&mut self, bytes: u64) {
        self.total += bytes;
        self.round += bytes;
    }

    /// Closes the current round and folds it into the rate estimate. Must be
    /// called at one second intervals for the rate unit to be bytes/s.
    pub fn tick(&mut self) {
        self.rate = EWMA_WEIGHT * self.round as f64
            + (1.0 - EWMA_WEIGHT) * self.rate;
        if self.rate > self.peak {
            self.peak = self.rate;
        }
        self.round = 0;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// The smoothed transfer rate, in bytes per second.
    pub fn rate(&self) -> u64 {
        self.rate as u64
    }

    pub fn peak(&self) -> u64 {
        self.peak as u64
    }
}

/// The pair of counters every connection (and the torrent itself) keeps for
/// the two transfer directions.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ThruputCounters {
    /// Payload bytes received from the peer.
    pub down: Counter,
    /// Payload bytes sent to the peer.
    pub up: Counter,
    /// Received payload bytes that were dropped (duplicate or unrequested
    /// blocks).
    pub waste: Counter,
}

impl ThruputCounters {
    pub fn tick(&mut self) {
        self.down.tick();
        self.up.tick();
        self.waste.tick();
    }
}

/// A smoothed estimate of the request round trip time to a peer, used to size
/// the request pipeline to the link's bandwidth-delay product.
///
/// Uses the the same 7/8 smoothing factor TCP's RTT estimation uses
/// (RFC 6298).
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct RttEstimator {
    srtt: Option<f64>,
}

impl RttEstimator {
    /// Folds a new round trip sample into the estimate.
    pub fn update(&mut self, sample: Duration) {
        let sample = sample.as_secs_f64();
        self.srtt = Some(match self.srtt {
            Some(srtt) => srtt * 7.0 / 8.0 + sample / 8.0,
            None => sample,
        });
    }

    /// The smoothed round trip time, if any sample has been recorded.
    pub fn get(&self) -> Option<Duration> {
        self.srtt.map(Duration::from_secs_f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_totals_and_rounds() {
        let mut c = Counter::default();
        c.add(100);
        c.add(50);
        assert_eq!(c.total(), 150);
        c.tick();
        c.add(10);
        assert_eq!(c.total(), 160);
    }

    #[test]
    fn test_counter_rate_converges() {
        let mut c = Counter::default();
        // a steady 1000 bytes/s stream converges to a 1000 bytes/s estimate
        for _ in 0..50 {
            c.add(1000);
            c.tick();
        }
        assert!(c.rate() > 950 && c.rate() <= 1000);
        assert!(c.peak() >= c.rate());
    }

    #[test]
    fn test_rtt_first_sample_taken_verbatim() {
        let mut rtt = RttEstimator::default();
        assert!(rtt.get().is_none());
        rtt.update(Duration::from_millis(100));
        assert_eq!(rtt.get(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_rtt_smoothing() {
        let mut rtt = RttEstimator::default();
        rtt.update(Duration::from_millis(100));
        rtt.update(Duration::from_millis(200));
        // 100 * 7/8 + 200 / 8 = 112.5ms
        let est = rtt.get().unwrap();
        assert!(est > Duration::from_millis(110));
        assert!(est < Duration::from_millis(115));
    }
}
