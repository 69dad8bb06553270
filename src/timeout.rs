//! Adaptive timeouts scaled by swarm health.
//!
//! When a torrent has few active peers, losing one of them to an overly eager
//! timeout hurts much more than waiting a little longer for a slow response,
//! so the network timeouts (handshake, block request, tracker and DHT
//! queries) stretch as the active peer count drops. The scale factor is
//! capped at [`MAX_SCALE`].

use std::time::Duration;

/// The ceiling for timeout stretching: a timeout never exceeds three times
/// its configured base value.
const MAX_SCALE: f64 = 3.0;

/// Below this many active peers the torrent counts as desperate.
const DESPERATE_PEER_COUNT: usize = 5;
/// Below this many active peers the torrent counts as degraded.
const DEGRADED_PEER_COUNT: usize = 10;

/// The coarse health of a torrent's swarm, judged by its active peer count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PeerHealth {
    Healthy,
    Degraded,
    Desperate,
}

impl PeerHealth {
    pub fn from_active_peer_count(count: usize) -> Self {
        if count < DESPERATE_PEER_COUNT {
            Self::Desperate
        } else if count < DEGRADED_PEER_COUNT {
            Self::Degraded
        } else {
            Self::Healthy
        }
    }

    fn scale(self) -> f64 {
        match self {
            Self::Healthy => 1.0,
            Self::Degraded => 1.5,
            Self::Desperate => MAX_SCALE,
        }
    }
}

/// Scales a base timeout by the swarm's health.
pub(crate) fn adaptive_timeout(
    base: Duration,
    active_peer_count: usize,
) -> Duration {
    let scale = PeerHealth::from_active_peer_count(active_peer_count).scale();
    debug_assert!(scale <= MAX_SCALE);
    base.mul_f64(scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_thresholds() {
        assert_eq!(
            PeerHealth::from_active_peer_count(0),
            PeerHealth::Desperate
        );
        assert_eq!(
            PeerHealth::from_active_peer_count(4),
            PeerHealth::Desperate
        );
        assert_eq!(PeerHealth::from_active_peer_count(5), PeerHealth::Degraded);
        assert_eq!(PeerHealth::from_active_peer_count(9), PeerHealth::Degraded);
        assert_eq!(PeerHealth::from_active_peer_count(10), PeerHealth::Healthy);
    }

    #[test]
    fn test_timeout_never_exceeds_ceiling() {
        let base = Duration::from_secs(20);
        for count in 0..50 {
            assert!(adaptive_timeout(base, count) <= base.mul_f64(MAX_SCALE));
        }
    }

    #[test]
    fn test_desperate_mode_stretches_timeout() {
        let base = Duration::from_secs(10);
        assert_eq!(adaptive_timeout(base, 20), base);
        assert_eq!(adaptive_timeout(base, 7), Duration::from_secs(15));
        assert_eq!(adaptive_timeout(base, 2), Duration::from_secs(30));
    }
}
