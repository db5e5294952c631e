//! Single-or-batch message lists.
//!
//! JSON-RPC lets a peer send either one message or a JSON array of messages.
//! [`Batch`] remembers which of the two it was built from so that the reply
//! takes the same shape, including the one-element batch case.

use serde::de::{self, DeserializeOwned, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T> {
    pub is_batch: bool,
    pub messages: Vec<T>,
}

impl<T> Batch<T> {
    /// A list that goes on the wire as a JSON array, whatever its length
    pub fn batch(messages: Vec<T>) -> Self {
        Self {
            is_batch: true,
            messages,
        }
    }

    /// A lone message, written without array brackets
    pub fn single(message: T) -> Self {
        Self {
            is_batch: false,
            messages: vec![message],
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl<T> IntoIterator for Batch<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.into_iter()
    }
}

impl Batch<Box<RawValue>> {
    /// Split a JSON unit into its messages without decoding them.
    ///
    /// A unit whose first non-whitespace byte is `[` is a batch (possibly
    /// empty); anything else is a single message.
    pub fn split(unit: Box<RawValue>) -> Result<Self, serde_json::Error> {
        if is_array(unit.get()) {
            Ok(Self::batch(serde_json::from_str(unit.get())?))
        } else {
            Ok(Self::single(unit))
        }
    }
}

fn is_array(json: &str) -> bool {
    json.trim_start().starts_with('[')
}

impl<T: Serialize> Serialize for Batch<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.messages.as_slice() {
            [single] if !self.is_batch => single.serialize(serializer),
            messages => messages.serialize(serializer),
        }
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Batch<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let unit = Box::<RawValue>::deserialize(deserializer)?;
        if is_array(unit.get()) {
            serde_json::from_str(unit.get())
                .map(Self::batch)
                .map_err(de::Error::custom)
        } else {
            serde_json::from_str(unit.get())
                .map(Self::single)
                .map_err(de::Error::custom)
        }
    }
}
