use std::time::Duration;

/// Creates a backoff iterator for websocket reconnection.
/// Delay is `base × min(attempt, cap_multiplier)` for attempt 1, 2, 3, ...
/// A linear ramp with a hard ceiling; unlimited retries, the stream loop
/// recreates the iterator on a successful open so the ramp starts over.
pub fn reconnect_backoff(base: Duration, cap_multiplier: u32) -> impl Iterator<Item = Duration> {
    let cap = cap_multiplier.max(1);
    (1u32..).map(move |attempt| base * attempt.min(cap))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_ramps_linearly_then_caps() {
        let mut delays = reconnect_backoff(Duration::from_secs(1), 4);
        assert_eq!(delays.next(), Some(Duration::from_secs(1)));
        assert_eq!(delays.next(), Some(Duration::from_secs(2)));
        assert_eq!(delays.next(), Some(Duration::from_secs(3)));
        assert_eq!(delays.next(), Some(Duration::from_secs(4)));
        assert_eq!(delays.next(), Some(Duration::from_secs(4)));
    }

    #[test]
    fn zero_cap_still_yields_base_delay() {
        let mut delays = reconnect_backoff(Duration::from_millis(500), 0);
        assert_eq!(delays.next(), Some(Duration::from_millis(500)));
        assert_eq!(delays.next(), Some(Duration::from_millis(500)));
    }
}
