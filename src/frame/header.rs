//! Source metadata for a raw exposure.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const KEY_SITE: &str = "SITEID";
pub const KEY_ENCLOSURE: &str = "ENCID";
pub const KEY_TELESCOPE: &str = "TELID";
pub const KEY_CAMERA: &str = "INSTRUME";
pub const KEY_OBSTYPE: &str = "OBSTYPE";
pub const KEY_DATE_OBS: &str = "DATE-OBS";
pub const KEY_EXPTIME: &str = "EXPTIME";
pub const KEY_BINNING: &str = "CCDSUM";
pub const KEY_FILTER: &str = "FILTER";
pub const KEY_CONFMODE: &str = "CONFMODE";
pub const KEY_IS_MASTER: &str = "ISMASTER";
pub const KEY_RLEVEL: &str = "RLEVEL";
pub const KEY_FRAME_ID: &str = "FRAMEID";

/// Header keyword value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HeaderValue {
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HeaderValue::Float(f) => Some(*f),
            HeaderValue::Integer(i) => Some(*i as f64),
            HeaderValue::String(s) => s.trim().parse().ok(),
            HeaderValue::Bool(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Integer(i) => Some(*i),
            HeaderValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            HeaderValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HeaderValue::Bool(b) => Some(*b),
            HeaderValue::Integer(i) => Some(*i != 0),
            HeaderValue::String(s) => match s.trim().to_ascii_uppercase().as_str() {
                "T" | "TRUE" => Some(true),
                "F" | "FALSE" => Some(false),
                _ => None,
            },
            HeaderValue::Float(_) => None,
        }
    }

    /// Render any value as text (used for attribute extraction).
    pub fn to_text(&self) -> String {
        match self {
            HeaderValue::String(s) => s.trim().to_string(),
            HeaderValue::Integer(i) => i.to_string(),
            HeaderValue::Float(f) => f.to_string(),
            HeaderValue::Bool(b) => if *b { "T" } else { "F" }.to_string(),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        HeaderValue::Float(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Integer(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

/// Keyword map; keys are stored upper case.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Header(BTreeMap<String, HeaderValue>);

impl Header {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn set(&mut self, key: &str, value: impl Into<HeaderValue>) {
        self.0.insert(key.to_ascii_uppercase(), value.into());
    }

    /// Builder-style `set`
    pub fn with(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.0.get(&key.to_ascii_uppercase())
    }

    pub fn remove(&mut self, key: &str) -> Option<HeaderValue> {
        self.0.remove(&key.to_ascii_uppercase())
    }

    /// Text value, with blank strings treated as absent
    pub fn get_text(&self, key: &str) -> Option<String> {
        self.get(key)
            .map(HeaderValue::to_text)
            .filter(|s| !s.is_empty())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(HeaderValue::as_f64)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(HeaderValue::as_i64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(HeaderValue::as_bool)
    }

    /// Overlay every keyword from `other` onto this header.
    pub fn merge(&mut self, other: &Header) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HeaderValue)> {
        self.0.iter()
    }
}
