use std::time::{Duration, Instant};

/// Waiting mode of a blocking call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MTTimeout
{
    /// Fails immediately if the condition is not already satisfiable.
    NoWait,
    /// Blocks with no deadline.
    Forever,
    /// Blocks at most for the duration. A zero duration behaves as `NoWait`.
    After(Duration)
}

impl MTTimeout
{
    /// Bounded wait in milliseconds.
    pub const fn ms(ms: u64) -> MTTimeout
    {
        MTTimeout::After(Duration::from_millis(ms))
    }

    /// Bounded wait in seconds.
    pub const fn secs(secs: u64) -> MTTimeout
    {
        MTTimeout::After(Duration::from_secs(secs))
    }

    pub(crate) fn is_no_wait(&self) -> bool
    {
        match self {
            MTTimeout::NoWait => true,
            MTTimeout::Forever => false,
            MTTimeout::After(d) => d.is_zero()
        }
    }

    /// `None` for no-wait, `Some(None)` for forever.
    pub(crate) fn deadline(&self) -> Option<Option<Instant>>
    {
        if self.is_no_wait() {
            return None;
        }

        match self {
            MTTimeout::After(d) => Some(Instant::now().checked_add(*d)),
            _ => Some(None)
        }
    }
}

/// Upper bound of a relative deadline; longer delays never expire in practice.
const MAX_DELAY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Deadline `d` after `from`, clamped so that adding never overflows.
pub(crate) fn deadline_after(from: Instant, d: Duration) -> Instant
{
    from.checked_add(d).unwrap_or_else(|| from + MAX_DELAY)
}

impl From<Duration> for MTTimeout
{
    fn from(d: Duration) -> MTTimeout
    {
        MTTimeout::After(d)
    }
}
