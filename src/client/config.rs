use std::ops::RangeInclusive;
use std::time::Duration;

use anyhow::anyhow;

/// Tunable protocol parameters read by the endpoint and exchange engine.  Defaults come from
/// the [CoAP RFC](https://datatracker.ietf.org/doc/html/rfc7252#section-4.8.2).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub transmission: TransmissionParameters,

    /// Horizon after which an exchange (and its deduplication entry) is eligible for
    /// eviction by the mark-and-sweep task.
    pub exchange_lifetime: Duration,

    /// Upper bound on how long a Non-confirmable request waits for its response.
    pub non_lifetime: Duration,

    /// Period of the deduplicator/exchange sweep task.
    pub mark_and_sweep_interval: Duration,

    /// Block size offered when a request opts into early Block2 negotiation without naming
    /// its own size.
    pub default_block_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transmission: TransmissionParameters::default(),
            exchange_lifetime: Duration::from_millis(247_000),
            non_lifetime: Duration::from_millis(145_000),
            mark_and_sweep_interval: Duration::from_millis(10_000),
            default_block_size: 512,
        }
    }
}

/// Ack timeout and retry policy applied to Confirmable messages.
#[derive(Debug, Clone, Copy)]
pub struct TransmissionParameters {
    ack_timeout: Duration,
    ack_random_factor: f32,
    max_retransmit: usize,
}

impl Default for TransmissionParameters {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
        }
    }
}

impl TransmissionParameters {
    pub fn new(
        ack_timeout: Duration,
        ack_random_factor: f32,
        max_retransmit: usize,
    ) -> anyhow::Result<Self> {
        if ack_random_factor < 1.0 {
            return Err(anyhow!("Invalid ack_random_factor={ack_random_factor}"));
        }
        if ack_timeout.is_zero() {
            return Err(anyhow!("Invalid ack_timeout={ack_timeout:?}"));
        }
        Ok(Self {
            ack_timeout,
            ack_random_factor,
            max_retransmit,
        })
    }

    pub fn max_retransmit(&self) -> usize {
        self.max_retransmit
    }

    /// Range the initial retransmission timeout is drawn from; each retry then doubles it.
    pub fn ack_timeout_range(&self) -> RangeInclusive<Duration> {
        let timeout_low = self.ack_timeout;
        if self.ack_random_factor != 1.0 {
            let timeout_high = timeout_low.mul_f32(self.ack_random_factor);
            timeout_low..=timeout_high
        } else {
            timeout_low..=timeout_low
        }
    }
}

/// Clamp a requested early-negotiation block size to the nearest supported power of two in
/// the RFC 7959 range.  Zero means late negotiation (no Block2 option on the first request).
pub(crate) fn round_block_size(requested: usize) -> Option<usize> {
    if requested == 0 {
        return None;
    }
    let clamped = requested.clamp(16, 1024);
    let rounded = if clamped.is_power_of_two() {
        clamped
    } else {
        clamped.next_power_of_two() >> 1
    };
    Some(rounded)
}

/// RFC 7959 SZX exponent for a block size already normalized by [`round_block_size`].
pub(crate) fn block_size_exponent(size: usize) -> u8 {
    (size.trailing_zeros() - 4) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_parameters() {
        assert!(TransmissionParameters::new(Duration::from_secs(2), 0.5, 4).is_err());
        assert!(TransmissionParameters::new(Duration::ZERO, 1.5, 4).is_err());
    }

    #[test]
    fn test_ack_timeout_range() {
        let parameters = TransmissionParameters::new(Duration::from_secs(2), 1.5, 4).unwrap();
        let range = parameters.ack_timeout_range();
        assert_eq!(*range.start(), Duration::from_secs(2));
        assert_eq!(*range.end(), Duration::from_secs(3));

        let fixed = TransmissionParameters::new(Duration::from_secs(2), 1.0, 4).unwrap();
        assert_eq!(fixed.ack_timeout_range(), Duration::from_secs(2)..=Duration::from_secs(2));
    }

    #[test]
    fn test_block_size_rounding() {
        assert_eq!(round_block_size(0), None);
        assert_eq!(round_block_size(16), Some(16));
        assert_eq!(round_block_size(9), Some(16));
        assert_eq!(round_block_size(100), Some(64));
        assert_eq!(round_block_size(512), Some(512));
        assert_eq!(round_block_size(4096), Some(1024));
    }

    #[test]
    fn test_block_size_exponent() {
        assert_eq!(block_size_exponent(16), 0);
        assert_eq!(block_size_exponent(512), 5);
        assert_eq!(block_size_exponent(1024), 6);
    }
}
