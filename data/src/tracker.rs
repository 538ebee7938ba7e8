//! Redraw gating. A live feed repeats values constantly (every trade re-sends
//! the candle, panning re-reports the same viewport); consumers only want to
//! hear about updates that actually moved something.

use feed::{Candle, ChannelKey};
use rustc_hash::FxHashMap;

/// The logical channels a consumer can react to independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Any of open, high, low, close moved, or a new bucket opened.
    Price,
    Volume,
    VisibleRange,
}

/// Which channels an observation actually changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub price: bool,
    pub volume: bool,
    pub visible_range: bool,
}

impl ChangeSet {
    pub fn any(&self) -> bool {
        self.price || self.volume || self.visible_range
    }

    pub fn contains(&self, channel: Channel) -> bool {
        match channel {
            Channel::Price => self.price,
            Channel::Volume => self.volume,
            Channel::VisibleRange => self.visible_range,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct LastSeen {
    candle: Option<Candle>,
    visible_range: Option<(i64, i64)>,
}

/// Per-series dedup state. Feed every inbound update through
/// [`observe_candle`](Self::observe_candle) and only notify on a non-empty
/// [`ChangeSet`].
#[derive(Debug, Default)]
pub struct ChangeTracker {
    seen: FxHashMap<ChannelKey, LastSeen>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe_candle(&mut self, key: ChannelKey, candle: &Candle) -> ChangeSet {
        let last = self.seen.entry(key).or_default();

        let mut changes = ChangeSet::default();
        match last.candle {
            Some(prev) if prev.time == candle.time => {
                changes.price = prev.open != candle.open
                    || prev.high != candle.high
                    || prev.low != candle.low
                    || prev.close != candle.close;
                changes.volume = prev.volume != candle.volume;
            }
            // a new bucket moves both channels by definition
            _ => {
                changes.price = true;
                changes.volume = true;
            }
        }

        last.candle = Some(*candle);
        changes
    }

    pub fn observe_visible_range(&mut self, key: ChannelKey, start: i64, end: i64) -> ChangeSet {
        let last = self.seen.entry(key).or_default();
        let changed = last.visible_range != Some((start, end));
        last.visible_range = Some((start, end));

        ChangeSet {
            visible_range: changed,
            ..ChangeSet::default()
        }
    }

    /// Forgets the dedup state for one series. First observation afterwards
    /// reports every channel as changed, which is what a consumer wants right
    /// after a timeframe switch.
    pub fn reset(&mut self, key: ChannelKey) {
        self.seen.remove(&key);
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feed::{Granularity, Symbol};

    fn key(symbol: &str) -> ChannelKey {
        ChannelKey::new(Symbol::new(symbol), Granularity::M1)
    }

    fn candle(time: i64, close: f64, volume: f64) -> Candle {
        Candle {
            time,
            open: 1.0,
            high: close.max(2.0),
            low: 0.5,
            close,
            volume,
        }
    }

    #[test]
    fn identical_update_is_quiet() {
        let mut tracker = ChangeTracker::new();
        let k = key("BTC-USD");
        let c = candle(60, 1.5, 10.0);

        assert!(tracker.observe_candle(k, &c).any(), "first sight notifies");
        assert!(!tracker.observe_candle(k, &c).any(), "repeat stays quiet");
    }

    #[test]
    fn price_and_volume_move_independently() {
        let mut tracker = ChangeTracker::new();
        let k = key("BTC-USD");

        tracker.observe_candle(k, &candle(60, 1.5, 10.0));

        let volume_only = tracker.observe_candle(k, &candle(60, 1.5, 11.0));
        assert!(!volume_only.price);
        assert!(volume_only.volume);

        let price_only = tracker.observe_candle(k, &candle(60, 1.6, 11.0));
        assert!(price_only.price);
        assert!(!price_only.volume);
    }

    #[test]
    fn new_bucket_notifies_everything() {
        let mut tracker = ChangeTracker::new();
        let k = key("BTC-USD");

        tracker.observe_candle(k, &candle(60, 1.5, 10.0));
        let next_bucket = tracker.observe_candle(k, &candle(120, 1.5, 10.0));
        assert!(next_bucket.price && next_bucket.volume);
    }

    #[test]
    fn visible_range_dedups_repeats() {
        let mut tracker = ChangeTracker::new();
        let k = key("BTC-USD");

        assert!(tracker.observe_visible_range(k, 60, 600).visible_range);
        assert!(!tracker.observe_visible_range(k, 60, 600).visible_range);
        assert!(tracker.observe_visible_range(k, 120, 660).visible_range);
    }

    #[test]
    fn series_track_separately() {
        let mut tracker = ChangeTracker::new();
        let c = candle(60, 1.5, 10.0);

        tracker.observe_candle(key("BTC-USD"), &c);
        assert!(
            tracker.observe_candle(key("ETH-USD"), &c).any(),
            "a different series has its own history"
        );
    }

    #[test]
    fn reset_forgets_one_series() {
        let mut tracker = ChangeTracker::new();
        let c = candle(60, 1.5, 10.0);

        tracker.observe_candle(key("BTC-USD"), &c);
        tracker.observe_candle(key("ETH-USD"), &c);
        tracker.reset(key("BTC-USD"));

        assert!(tracker.observe_candle(key("BTC-USD"), &c).any());
        assert!(!tracker.observe_candle(key("ETH-USD"), &c).any());
    }
}
