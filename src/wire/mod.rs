use serde_json::{Map, Value};
use std::fmt;

/// A single frame on the feed socket, JSON text with a `type` discriminant.
///
/// Producers and consumers share one vocabulary: `emit` carries a reading,
/// `subscribe`/`unsubscribe` are advisory interest declarations. Unknown
/// discriminants are rejected at decode time so the relay never caches or
/// fans out traffic it cannot name.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Emit(Reading),
    Subscribe { symbol: String },
    Unsubscribe { symbol: String },
}

/// Payload of an `emit` frame.
///
/// The producer owns the shape of its measurements, so everything except the
/// optional `symbol` tag stays in an opaque field map. A `symbol` that is not
/// a JSON string is producer payload, not a tag, and remains in `fields`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub symbol: Option<String>,
    pub fields: Map<String, Value>,
}

impl Reading {
    /// True when no filter is given, or the reading's symbol equals the
    /// filter. A reading without a symbol never matches a present filter.
    pub fn matches(&self, filter: Option<&str>) -> bool {
        match filter {
            None => true,
            Some(wanted) => self.symbol.as_deref() == Some(wanted),
        }
    }

    /// True when the producer flagged this reading with `"alarm": true`.
    pub fn is_alarm(&self) -> bool {
        self.fields.get("alarm").and_then(Value::as_bool) == Some(true)
    }
}

impl Frame {
    /// Discriminant as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Emit(_) => "emit",
            Frame::Subscribe { .. } => "subscribe",
            Frame::Unsubscribe { .. } => "unsubscribe",
        }
    }

    /// Symbol tag of the frame, when it carries one.
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Frame::Emit(reading) => reading.symbol.as_deref(),
            Frame::Subscribe { symbol } | Frame::Unsubscribe { symbol } => Some(symbol),
        }
    }
}

/// Why an inbound frame was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    Malformed(String),
    NotAnObject,
    MissingKind,
    UnknownKind(String),
    MissingSymbol(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Malformed(detail) => write!(f, "malformed JSON: {}", detail),
            DecodeError::NotAnObject => write!(f, "frame must be a JSON object"),
            DecodeError::MissingKind => write!(f, "missing 'type' discriminant"),
            DecodeError::UnknownKind(kind) => write!(f, "unknown frame kind '{}'", kind),
            DecodeError::MissingSymbol(kind) => {
                write!(f, "'{}' frame requires a string 'symbol'", kind)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Parse one frame of wire text.
pub fn decode(text: &str) -> Result<Frame, DecodeError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let Value::Object(mut map) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let kind = match map.remove("type") {
        Some(Value::String(kind)) => kind,
        _ => return Err(DecodeError::MissingKind),
    };

    match kind.as_str() {
        "emit" => {
            let symbol = match map.remove("symbol") {
                Some(Value::String(symbol)) => Some(symbol),
                Some(other) => {
                    map.insert("symbol".to_string(), other);
                    None
                }
                None => None,
            };
            Ok(Frame::Emit(Reading {
                symbol,
                fields: map,
            }))
        }
        "subscribe" | "unsubscribe" => {
            let symbol = match map.remove("symbol") {
                Some(Value::String(symbol)) => symbol,
                _ => return Err(DecodeError::MissingSymbol(kind)),
            };
            if kind == "subscribe" {
                Ok(Frame::Subscribe { symbol })
            } else {
                Ok(Frame::Unsubscribe { symbol })
            }
        }
        _ => Err(DecodeError::UnknownKind(kind)),
    }
}

/// Render a frame as wire text: the discriminant, the symbol tag when
/// present, and the reading's own fields in one flat object.
pub fn encode(frame: &Frame) -> String {
    let mut map = Map::new();
    map.insert(
        "type".to_string(),
        Value::String(frame.kind().to_string()),
    );

    match frame {
        Frame::Emit(reading) => {
            if let Some(symbol) = &reading.symbol {
                map.insert("symbol".to_string(), Value::String(symbol.clone()));
            }
            for (key, value) in &reading.fields {
                map.insert(key.clone(), value.clone());
            }
        }
        Frame::Subscribe { symbol } | Frame::Unsubscribe { symbol } => {
            map.insert("symbol".to_string(), Value::String(symbol.clone()));
        }
    }

    Value::Object(map).to_string()
}
