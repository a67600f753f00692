use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// The unit routed between the broker and clients.
///
/// Serialized as `{"address": ..., "content": ...}` both towards clients and
/// in broker requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub address: String,
    pub content: String,
}

impl Envelope {
    pub fn new(address: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            content: content.into(),
        }
    }

    /// Build an envelope from a two-frame broker message.
    ///
    /// Returns `None` unless there are exactly two frames. Frames are decoded
    /// lossily since the broker does not promise UTF-8.
    pub fn from_frames(frames: &[Bytes]) -> Option<Self> {
        match frames {
            [address, content] => Some(Self {
                address: String::from_utf8_lossy(address).into_owned(),
                content: String::from_utf8_lossy(content).into_owned(),
            }),
            _ => None,
        }
    }

    /// Literal, case-sensitive prefix match on the address
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        self.address.starts_with(prefix)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
