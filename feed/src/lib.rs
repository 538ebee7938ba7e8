pub mod connect;
pub mod health;
pub mod history;
pub mod resilience;
pub mod stream;
pub mod wire;

pub use health::ConnectionHealth;
pub use history::{CandleSource, HttpSource};
pub use stream::{StreamClient, StreamEvent};

use serde::{Deserialize, Serialize};

use std::{fmt, str::FromStr};

/// Candle bucket width. Closed set: anything else coming from config or the
/// wire is rejected before any I/O happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, enum_map::Enum)]
pub enum Granularity {
    M1,
    M5,
    M15,
    H1,
    H6,
    D1,
}

impl Granularity {
    pub const ALL: [Granularity; 6] = [
        Granularity::M1,
        Granularity::M5,
        Granularity::M15,
        Granularity::H1,
        Granularity::H6,
        Granularity::D1,
    ];

    pub fn as_secs(self) -> u64 {
        match self {
            Granularity::M1 => 60,
            Granularity::M5 => 300,
            Granularity::M15 => 900,
            Granularity::H1 => 3_600,
            Granularity::H6 => 21_600,
            Granularity::D1 => 86_400,
        }
    }

    pub fn as_millis(self) -> u64 {
        self.as_secs() * 1_000
    }

    /// Floor `time` (seconds) to the start of its bucket.
    pub fn bucket_start(self, time: i64) -> i64 {
        let span = self.as_secs() as i64;
        time - time.rem_euclid(span)
    }
}

impl TryFrom<u64> for Granularity {
    type Error = InvalidGranularity;

    fn try_from(secs: u64) -> Result<Self, Self::Error> {
        match secs {
            60 => Ok(Granularity::M1),
            300 => Ok(Granularity::M5),
            900 => Ok(Granularity::M15),
            3_600 => Ok(Granularity::H1),
            21_600 => Ok(Granularity::H6),
            86_400 => Ok(Granularity::D1),
            other => Err(InvalidGranularity(other)),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Granularity::M1 => "1m",
                Granularity::M5 => "5m",
                Granularity::M15 => "15m",
                Granularity::H1 => "1h",
                Granularity::H6 => "6h",
                Granularity::D1 => "1d",
            }
        )
    }
}

// On the wire and in persisted records a granularity is its width in seconds.
impl Serialize for Granularity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.as_secs())
    }
}

impl<'de> Deserialize<'de> for Granularity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Granularity::try_from(secs).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidGranularity(pub u64);

impl fmt::Display for InvalidGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unsupported granularity seconds: {}", self.0)
    }
}

impl std::error::Error for InvalidGranularity {}

/// Visible chart horizon. Determines the historical fetch span and which
/// granularities make sense for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Period {
    Day,
    Week,
    Month,
    ThreeMonths,
    Year,
}

impl Period {
    pub const ALL: [Period; 5] = [
        Period::Day,
        Period::Week,
        Period::Month,
        Period::ThreeMonths,
        Period::Year,
    ];

    pub fn span_secs(self) -> u64 {
        match self {
            Period::Day => 86_400,
            Period::Week => 7 * 86_400,
            Period::Month => 30 * 86_400,
            Period::ThreeMonths => 90 * 86_400,
            Period::Year => 365 * 86_400,
        }
    }

    pub fn granularities(self) -> &'static [Granularity] {
        match self {
            Period::Day => &[Granularity::M1, Granularity::M5, Granularity::M15],
            Period::Week => &[Granularity::M15, Granularity::H1, Granularity::H6],
            Period::Month => &[Granularity::H1, Granularity::H6, Granularity::D1],
            Period::ThreeMonths => &[Granularity::H6, Granularity::D1],
            Period::Year => &[Granularity::D1],
        }
    }

    pub fn default_granularity(self) -> Granularity {
        match self {
            Period::Day => Granularity::M5,
            Period::Week => Granularity::H1,
            Period::Month => Granularity::H6,
            Period::ThreeMonths => Granularity::H6,
            Period::Year => Granularity::D1,
        }
    }

    pub fn supports(self, granularity: Granularity) -> bool {
        self.granularities().contains(&granularity)
    }

    /// Long horizons are positioned by the historical fetch itself instead of
    /// the post-load reposition step, so the chart does not visibly snap.
    pub fn is_long_horizon(self) -> bool {
        matches!(self, Period::ThreeMonths | Period::Year)
    }

    /// Shortest horizon that a granularity is usually viewed at. Background
    /// fetches use this to size their historical range.
    pub fn natural_for(granularity: Granularity) -> Period {
        match granularity {
            Granularity::M1 | Granularity::M5 => Period::Day,
            Granularity::M15 => Period::Week,
            Granularity::H1 => Period::Month,
            Granularity::H6 => Period::ThreeMonths,
            Granularity::D1 => Period::Year,
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Period::Day => "1D",
                Period::Week => "1W",
                Period::Month => "1M",
                Period::ThreeMonths => "3M",
                Period::Year => "1Y",
            }
        )
    }
}

impl FromStr for Period {
    type Err = InvalidPeriod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1D" => Ok(Period::Day),
            "1W" => Ok(Period::Week),
            "1M" => Ok(Period::Month),
            "3M" => Ok(Period::ThreeMonths),
            "1Y" => Ok(Period::Year),
            other => Err(InvalidPeriod(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidPeriod(pub String);

impl fmt::Display for InvalidPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unknown period: {}", self.0)
    }
}

impl std::error::Error for InvalidPeriod {}

/// Market symbol as a fixed-capacity ASCII key, cheap to copy and hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Symbol {
    bytes: [u8; Symbol::MAX_LEN],
    len: u8,
}

impl Symbol {
    pub const MAX_LEN: usize = 24;

    /// # Panics
    ///
    /// Panics when the symbol is empty, too long, or not ASCII. Use the
    /// `FromStr` impl for untrusted input.
    pub fn new(symbol: &str) -> Self {
        match Self::try_new(symbol) {
            Ok(s) => s,
            Err(e) => panic!("{e}"),
        }
    }

    fn try_new(symbol: &str) -> Result<Self, InvalidSymbol> {
        if symbol.is_empty() || symbol.len() > Self::MAX_LEN {
            return Err(InvalidSymbol(symbol.to_string()));
        }
        let valid = symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
        if !valid {
            return Err(InvalidSymbol(symbol.to_string()));
        }

        let mut bytes = [0u8; Self::MAX_LEN];
        bytes[..symbol.len()].copy_from_slice(symbol.as_bytes());
        Ok(Symbol {
            bytes,
            len: symbol.len() as u8,
        })
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or_default()
    }
}

impl FromStr for Symbol {
    type Err = InvalidSymbol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_new(s)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self.as_str())
    }
}

impl Serialize for Symbol {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Symbol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Symbol::try_new(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidSymbol(pub String);

impl fmt::Display for InvalidSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid symbol: {:?}", self.0)
    }
}

impl std::error::Error for InvalidSymbol {}

/// Logical stream channel and cache key: one symbol at one granularity.
///
/// Serialized as `"SYMBOL:secs"` so it can key JSON maps in persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub symbol: Symbol,
    pub granularity: Granularity,
}

impl ChannelKey {
    pub fn new(symbol: Symbol, granularity: Granularity) -> Self {
        Self {
            symbol,
            granularity,
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.symbol, self.granularity.as_secs())
    }
}

impl Serialize for ChannelKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ChannelKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let (symbol_str, secs_str) = s
            .split_once(':')
            .ok_or_else(|| serde::de::Error::custom("expected \"Symbol:secs\""))?;
        let symbol = Symbol::try_new(symbol_str).map_err(serde::de::Error::custom)?;
        let secs = secs_str
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom(format!("bad granularity in key: {s}")))?;
        let granularity = Granularity::try_from(secs).map_err(serde::de::Error::custom)?;
        Ok(ChannelKey {
            symbol,
            granularity,
        })
    }
}

/// One OHLCV bar. `time` is the bucket start in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Returns the first integrity violation, if any. Callers log it and drop
    /// the row; a malformed candle never reaches a store.
    pub fn integrity_error(&self) -> Option<&'static str> {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite()) || !self.volume.is_finite() {
            return Some("non-finite field");
        }
        if self.volume < 0.0 {
            return Some("negative volume");
        }
        let body_low = self.open.min(self.close);
        let body_high = self.open.max(self.close);
        if self.low > body_low || self.high < body_high {
            return Some("OHLC ordering violated");
        }
        None
    }
}

/// How a streamed candle relates to the series it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    /// A brand new bucket was opened.
    Append,
    /// Revision of the current (last) bucket.
    Update,
}

/// One streamed revision of a candle on some channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandleUpdate {
    pub key: ChannelKey,
    pub candle: Candle,
    pub kind: UpdateKind,
}

#[derive(thiserror::Error, Debug)]
pub enum FeedError {
    #[error("{0}")]
    Fetch(#[from] reqwest::Error),
    #[error("Parsing: {0}")]
    Parse(String),
    #[error("Stream: {0}")]
    Websocket(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Timed out: {0}")]
    Timeout(String),
}

impl FeedError {
    pub fn user_facing_message(&self) -> String {
        match self {
            FeedError::Fetch(_) => "Connection issue: check your internet connection".to_string(),
            FeedError::Parse(_) => "Data processing issue from the server response".to_string(),
            FeedError::Websocket(_) => "Real-time stream issue, reconnecting".to_string(),
            FeedError::InvalidRequest(_) => "Request rejected before sending".to_string(),
            FeedError::Timeout(_) => "The server took too long to respond".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn granularity_seconds_roundtrip() {
        for g in Granularity::ALL {
            assert_eq!(Granularity::try_from(g.as_secs()), Ok(g));
        }
        assert_eq!(Granularity::try_from(61), Err(InvalidGranularity(61)));
    }

    #[test]
    fn granularity_serde_uses_seconds() {
        let json = serde_json::to_string(&Granularity::M5).unwrap();
        assert_eq!(json, "300");
        let back: Granularity = serde_json::from_str("3600").unwrap();
        assert_eq!(back, Granularity::H1);
        assert!(serde_json::from_str::<Granularity>("7").is_err());
    }

    #[test]
    fn bucket_start_floors_to_granularity() {
        assert_eq!(Granularity::M1.bucket_start(125), 120);
        assert_eq!(Granularity::H1.bucket_start(7_300), 7_200);
        assert_eq!(Granularity::M5.bucket_start(300), 300);
    }

    #[test]
    fn symbol_rejects_garbage() {
        assert!("BTC-USD".parse::<Symbol>().is_ok());
        assert!("".parse::<Symbol>().is_err());
        assert!("BTC USD".parse::<Symbol>().is_err());
        assert!("X".repeat(Symbol::MAX_LEN + 1).parse::<Symbol>().is_err());
    }

    #[test]
    fn channel_key_serde_roundtrip() {
        let key = ChannelKey::new(Symbol::new("ETH-USD"), Granularity::M15);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"ETH-USD:900\"");
        let back: ChannelKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn period_supports_its_own_defaults() {
        for p in Period::ALL {
            assert!(p.supports(p.default_granularity()));
        }
        assert!(!Period::Year.supports(Granularity::M1));
    }

    #[test]
    fn candle_integrity_checks() {
        let good = Candle {
            time: 60,
            open: 10.0,
            high: 12.0,
            low: 9.0,
            close: 11.0,
            volume: 3.5,
        };
        assert_eq!(good.integrity_error(), None);

        let nan = Candle {
            close: f64::NAN,
            ..good
        };
        assert_eq!(nan.integrity_error(), Some("non-finite field"));

        let inverted = Candle {
            high: 10.5,
            close: 11.0,
            ..good
        };
        assert_eq!(inverted.integrity_error(), Some("OHLC ordering violated"));
    }
}
