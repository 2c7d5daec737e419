//! Processing modes.
//!
//! A mode ties together which external tool runs, how its output is parsed,
//! where its cache and error ledger live, and how forgiving the run is about
//! a damaged cache file.

use std::fmt;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::cache::{CacheEntry, Payload};
use crate::config::ToolPaths;
use crate::tool::parse::{self, ParseError};
use crate::tool::ToolSpec;

/// What a run computes for each track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Mood vector (valence/arousal, tempo, key) via the analyzer
    Moods,
    /// Acoustic fingerprint, duration and content hash via `fpcalc`
    Fingerprint,
    /// Codec and stream properties via `ffprobe`
    Properties,
}

impl Mode {
    /// Stem used for the cache (`<stem>.json`) and ledger
    /// (`<stem>-errors.csv`) file names.
    #[must_use]
    pub fn file_stem(self) -> &'static str {
        match self {
            Mode::Moods => "moods",
            Mode::Fingerprint => "fingerprints",
            Mode::Properties => "properties",
        }
    }

    /// Build the invocation for this mode's tool.
    #[must_use]
    pub fn tool_spec(self, tools: &ToolPaths) -> ToolSpec {
        match self {
            Mode::Moods => ToolSpec::new("analyzer", &tools.analyzer, ["{input}"]),
            Mode::Fingerprint => ToolSpec::new("fpcalc", &tools.fpcalc, ["-json", "{input}"]),
            Mode::Properties => ToolSpec::new(
                "ffprobe",
                &tools.ffprobe,
                [
                    "-v",
                    "error",
                    "-print_format",
                    "json",
                    "-show_format",
                    "-show_streams",
                    "{input}",
                ],
            ),
        }
    }

    /// Parse raw tool output into this mode's payload.
    pub fn parse_output(self, raw: &str) -> Result<Payload, ParseError> {
        match self {
            Mode::Moods => parse::parse_moods(raw).map(Payload::Moods),
            Mode::Fingerprint => parse::parse_fingerprint(raw).map(Payload::Fingerprint),
            Mode::Properties => parse::parse_properties(raw).map(Payload::Properties),
        }
    }

    /// Decode the payload fields of a persisted track record.
    pub fn decode_payload(
        self,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> serde_json::Result<Payload> {
        let value = serde_json::Value::Object(fields);
        Ok(match self {
            Mode::Moods => Payload::Moods(serde_json::from_value(value)?),
            Mode::Fingerprint => Payload::Fingerprint(serde_json::from_value(value)?),
            Mode::Properties => Payload::Properties(serde_json::from_value(value)?),
        })
    }

    /// Whether an entry holds this mode's payload type.
    #[must_use]
    pub fn owns(self, entry: &CacheEntry) -> bool {
        matches!(
            (self, &entry.payload),
            (Mode::Moods, Payload::Moods(_))
                | (Mode::Fingerprint, Payload::Fingerprint(_))
                | (Mode::Properties, Payload::Properties(_))
        )
    }

    /// Whether a corrupt cache file aborts the run instead of starting
    /// empty. Mood analysis takes hours over a large library, so losing it
    /// silently is not acceptable.
    #[must_use]
    pub fn fatal_on_corrupt_cache(self) -> bool {
        matches!(self, Mode::Moods)
    }

    /// Whether the tool decodes audio itself and may reject multichannel
    /// input, making the downmix fallback worthwhile.
    #[must_use]
    pub fn supports_downmix(self) -> bool {
        matches!(self, Mode::Moods | Mode::Fingerprint)
    }

    /// Whether entries always carry a content hash.
    #[must_use]
    pub fn requires_content_hash(self) -> bool {
        matches!(self, Mode::Fingerprint)
    }

    /// Longest input the tool handles before its internal buffers overflow.
    #[must_use]
    pub fn default_max_duration(self) -> Option<Duration> {
        match self {
            Mode::Moods => Some(Duration::from_secs(2 * 60 * 60)),
            Mode::Fingerprint | Mode::Properties => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Moods => write!(f, "moods"),
            Mode::Fingerprint => write!(f, "fingerprint"),
            Mode::Properties => write!(f, "properties"),
        }
    }
}
