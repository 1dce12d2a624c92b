//! Retry counters for the policy engine's give-up ladders.

/// Error returned when a counter exceeds its limit.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The counter was incremented past its maximum value.
    Exceeded,
}

/// A saturating retry counter with a type-specific limit.
#[derive(Debug, Clone, Copy)]
pub struct Counter {
    value: u8,
    max_value: u8,
}

/// Counter roles, each with the limit the engine gives up at.
#[derive(Debug, Clone, Copy)]
pub enum CounterType {
    /// Source_Capabilities retransmissions before `SrcDisabled`.
    Caps,
    /// Discover Identity attempts on SOP' before marking discovery failed.
    DiscoverIdentity,
    /// Hard Resets before ErrorRecovery (or Disabled).
    HardReset,
    /// Wait responses to PR_Swap before the requester stops retrying.
    PrSwapWait,
}

impl Counter {
    /// Create a zeroed counter for a given role.
    pub fn new(counter_type: CounterType) -> Self {
        let max_value = match counter_type {
            CounterType::Caps => 25,
            CounterType::DiscoverIdentity => 6,
            CounterType::HardReset => 2,
            CounterType::PrSwapWait => 5,
        };

        Self { value: 0, max_value }
    }

    /// The current count.
    pub fn value(&self) -> u8 {
        self.value
    }

    /// The limit for this counter's role.
    pub fn max_value(&self) -> u8 {
        self.max_value
    }

    /// Count one more attempt.
    ///
    /// Returns [`Error::Exceeded`] once the count passes the limit; the
    /// value saturates so repeated calls keep failing.
    pub fn increment(&mut self) -> Result<(), Error> {
        if self.value > self.max_value {
            return Err(Error::Exceeded);
        }

        self.value += 1;

        if self.value > self.max_value {
            Err(Error::Exceeded)
        } else {
            Ok(())
        }
    }

    /// Restart the ladder.
    pub fn reset(&mut self) {
        self.value = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::{Counter, CounterType, Error};

    #[test]
    fn hard_reset_ladder_gives_up_after_limit() {
        let mut counter = Counter::new(CounterType::HardReset);

        assert!(counter.increment().is_ok());
        assert!(counter.increment().is_ok());
        assert_eq!(counter.increment(), Err(Error::Exceeded));
        // Saturates; stays exceeded.
        assert_eq!(counter.increment(), Err(Error::Exceeded));

        counter.reset();
        assert_eq!(counter.value(), 0);
        assert!(counter.increment().is_ok());
    }
}
