//! Frame formats for the streaming endpoint. Outbound control frames are
//! built with `serde_json`; inbound frames are parsed with `sonic-rs` since
//! the candle path runs per tick.

use crate::{Candle, CandleUpdate, ChannelKey, FeedError, Granularity, Symbol, UpdateKind};

use serde::Deserialize;
use serde_json::json;

/// Client-to-server control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame {
    Subscribe(ChannelKey),
    Unsubscribe(ChannelKey),
}

impl ControlFrame {
    pub fn key(&self) -> ChannelKey {
        match self {
            ControlFrame::Subscribe(key) | ControlFrame::Unsubscribe(key) => *key,
        }
    }

    pub fn to_text(&self) -> String {
        let (kind, key) = match self {
            ControlFrame::Subscribe(key) => ("subscribe", key),
            ControlFrame::Unsubscribe(key) => ("unsubscribe", key),
        };
        json!({
            "type": kind,
            "symbol": key.symbol.as_str(),
            "granularity": key.granularity.as_secs(),
        })
        .to_string()
    }
}

/// Server-to-client frame after tag dispatch. Kinds the client does not
/// understand come back as `Other` and are dropped without noise, so new
/// server-side frame kinds cannot break old clients.
#[derive(Debug)]
pub enum InboundFrame {
    Candle(CandleFrame),
    Error(String),
    Other,
}

#[derive(Deserialize)]
struct FrameTag {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct ErrorFrame {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CandleFrame {
    pub symbol: Symbol,
    pub granularity: Granularity,
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(rename = "updateKind", default = "default_update_kind")]
    pub update_kind: UpdateKind,
}

fn default_update_kind() -> UpdateKind {
    UpdateKind::Update
}

impl CandleFrame {
    pub fn channel_key(&self) -> ChannelKey {
        ChannelKey::new(self.symbol, self.granularity)
    }

    pub fn into_update(self) -> CandleUpdate {
        CandleUpdate {
            key: self.channel_key(),
            candle: Candle {
                time: self.time,
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
                volume: self.volume,
            },
            kind: self.update_kind,
        }
    }
}

pub fn parse_frame(payload: &[u8]) -> Result<InboundFrame, FeedError> {
    let tag: FrameTag =
        sonic_rs::from_slice(payload).map_err(|e| FeedError::Parse(e.to_string()))?;

    match tag.kind.as_str() {
        "candle" => {
            let frame: CandleFrame =
                sonic_rs::from_slice(payload).map_err(|e| FeedError::Parse(e.to_string()))?;
            Ok(InboundFrame::Candle(frame))
        }
        "error" => {
            let frame: ErrorFrame =
                sonic_rs::from_slice(payload).map_err(|e| FeedError::Parse(e.to_string()))?;
            Ok(InboundFrame::Error(frame.message))
        }
        _ => Ok(InboundFrame::Other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_frame_shape() {
        let key = ChannelKey::new(Symbol::new("BTC-USD"), Granularity::M1);
        let text = ControlFrame::Subscribe(key).to_text();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "subscribe");
        assert_eq!(value["symbol"], "BTC-USD");
        assert_eq!(value["granularity"], 60);

        let text = ControlFrame::Unsubscribe(key).to_text();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "unsubscribe");
    }

    #[test]
    fn parses_candle_frame() {
        let payload = br#"{"type":"candle","symbol":"ETH-USD","granularity":300,
            "time":1700000100,"open":2000.0,"high":2010.5,"low":1995.0,
            "close":2005.25,"volume":12.5,"updateKind":"append"}"#;

        match parse_frame(payload).unwrap() {
            InboundFrame::Candle(frame) => {
                assert_eq!(frame.symbol.as_str(), "ETH-USD");
                assert_eq!(frame.granularity, Granularity::M5);
                assert_eq!(frame.update_kind, UpdateKind::Append);
                let update = frame.into_update();
                assert_eq!(update.candle.time, 1_700_000_100);
                assert_eq!(update.candle.close, 2005.25);
            }
            other => panic!("expected candle frame, got {other:?}"),
        }
    }

    #[test]
    fn missing_update_kind_defaults_to_update() {
        let payload = br#"{"type":"candle","symbol":"BTC-USD","granularity":60,
            "time":60,"open":1.0,"high":1.0,"low":1.0,"close":1.0,"volume":0.0}"#;

        match parse_frame(payload).unwrap() {
            InboundFrame::Candle(frame) => assert_eq!(frame.update_kind, UpdateKind::Update),
            other => panic!("expected candle frame, got {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_is_other() {
        let payload = br#"{"type":"heartbeat","seq":42}"#;
        assert!(matches!(parse_frame(payload).unwrap(), InboundFrame::Other));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(parse_frame(b"not json").is_err());
        assert!(parse_frame(br#"{"no_type":1}"#).is_err());
    }
}
