// Stream creation options.
//
// Options are serialized as a string->string argument map of
// server-recognized keys. Only explicitly set values are sent, except
// the queue leader locator which defaults to "least-leaders".

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::error::StreamError;

/// A byte quantity for stream retention settings.
///
/// Construct from a raw count or with the `kb`/`mb`/`gb`/`tb` helpers;
/// `"100mb"`-style strings parse via [`FromStr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteCapacity {
    bytes: u64,
}

impl ByteCapacity {
    pub fn bytes(n: u64) -> Self {
        ByteCapacity { bytes: n }
    }

    pub fn kb(n: u64) -> Self {
        ByteCapacity { bytes: n * 1_000 }
    }

    pub fn mb(n: u64) -> Self {
        ByteCapacity {
            bytes: n * 1_000_000,
        }
    }

    pub fn gb(n: u64) -> Self {
        ByteCapacity {
            bytes: n * 1_000_000_000,
        }
    }

    pub fn tb(n: u64) -> Self {
        ByteCapacity {
            bytes: n * 1_000_000_000_000,
        }
    }

    pub fn as_bytes(&self) -> u64 {
        self.bytes
    }
}

impl fmt::Display for ByteCapacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bytes)
    }
}

impl FromStr for ByteCapacity {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
            Some(pos) => s.split_at(pos),
            None => (s, ""),
        };
        let n: u64 = digits
            .parse()
            .map_err(|_| StreamError::invalid_argument(format!("invalid byte capacity {s:?}")))?;
        match unit.to_ascii_lowercase().as_str() {
            "" | "b" => Ok(ByteCapacity::bytes(n)),
            "kb" => Ok(ByteCapacity::kb(n)),
            "mb" => Ok(ByteCapacity::mb(n)),
            "gb" => Ok(ByteCapacity::gb(n)),
            "tb" => Ok(ByteCapacity::tb(n)),
            _ => Err(StreamError::invalid_argument(format!(
                "invalid byte capacity unit {unit:?} in {s:?}"
            ))),
        }
    }
}

/// Arguments for CreateStream.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    max_age: Option<Duration>,
    max_length_bytes: Option<ByteCapacity>,
    max_segment_size_bytes: Option<ByteCapacity>,
    queue_leader_locator: Option<String>,
    initial_cluster_size: Option<u32>,
}

impl StreamOptions {
    pub fn new() -> Self {
        StreamOptions::default()
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn max_length_bytes(mut self, capacity: ByteCapacity) -> Self {
        self.max_length_bytes = Some(capacity);
        self
    }

    pub fn max_segment_size_bytes(mut self, capacity: ByteCapacity) -> Self {
        self.max_segment_size_bytes = Some(capacity);
        self
    }

    pub fn queue_leader_locator(mut self, locator: impl Into<String>) -> Self {
        self.queue_leader_locator = Some(locator.into());
        self
    }

    pub fn initial_cluster_size(mut self, size: u32) -> Self {
        self.initial_cluster_size = Some(size);
        self
    }

    /// Serialize into the argument map sent on the wire. Keys and value
    /// formats are fixed by the broker: `max-age` is whole seconds with
    /// an `s` suffix, sizes are plain byte counts.
    pub(crate) fn build_parameters(&self) -> Vec<(String, String)> {
        let mut args = Vec::new();

        let locator = self
            .queue_leader_locator
            .clone()
            .unwrap_or_else(|| "least-leaders".to_string());
        args.push(("queue-leader-locator".to_string(), locator));

        if let Some(size) = self.initial_cluster_size {
            if size > 0 {
                args.push(("initial-cluster-size".to_string(), size.to_string()));
            }
        }

        if let Some(max_length) = self.max_length_bytes {
            if max_length.as_bytes() > 0 {
                args.push(("max-length-bytes".to_string(), max_length.to_string()));
            }
        }

        if let Some(segment_size) = self.max_segment_size_bytes {
            if segment_size.as_bytes() > 0 {
                args.push((
                    "stream-max-segment-size-bytes".to_string(),
                    segment_size.to_string(),
                ));
            }
        }

        if let Some(max_age) = self.max_age {
            if max_age.as_secs() > 0 {
                args.push(("max-age".to_string(), format!("{}s", max_age.as_secs())));
            }
        }

        args
    }
}
