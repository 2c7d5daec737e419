//! Typed builders for external tool output.
//!
//! Tool output is treated as untrusted: every field of a result is read
//! through an explicit list of candidate locations, validated, and either
//! required or given a declared default. Nothing is looked up dynamically
//! downstream of this module.
//!
//! The module also interprets stderr: separating informational chatter from
//! real error lines, and recognising the "too many channels" rejection that
//! triggers the downmix fallback.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::cache::{Fingerprint, MediaProperties, MoodFeatures};

/// Output could not be decoded into the expected shape.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ParseError(pub String);

impl ParseError {
    fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// What to do when none of a field's candidates is present.
#[derive(Debug, Clone, Copy)]
enum Fallback<T> {
    Required,
    Default(T),
}

/// Reads fields from a JSON document through dotted candidate paths.
struct FieldReader<'a> {
    root: &'a Value,
}

impl<'a> FieldReader<'a> {
    fn new(root: &'a Value) -> Self {
        Self { root }
    }

    fn lookup(&self, dotted: &str) -> Option<&'a Value> {
        let pointer = format!("/{}", dotted.replace('.', "/"));
        self.root
            .pointer(&pointer)
            .filter(|v| !v.is_null() && v.as_str() != Some("N/A"))
    }

    /// First candidate that holds a finite number (numeric strings accepted).
    fn number(&self, field: &str, candidates: &[&str], fallback: Fallback<f64>) -> Result<f64, ParseError> {
        for candidate in candidates {
            let Some(value) = self.lookup(candidate) else {
                continue;
            };
            let number = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            match number {
                Some(n) if n.is_finite() => return Ok(n),
                _ => {
                    return Err(ParseError::new(format!(
                        "field '{}' at '{}' is not a finite number: {}",
                        field, candidate, value
                    )))
                }
            }
        }
        match fallback {
            Fallback::Default(v) => Ok(v),
            Fallback::Required => Err(ParseError::new(format!("missing field '{}'", field))),
        }
    }

    /// First candidate that holds a non-empty string.
    fn string(&self, field: &str, candidates: &[&str], fallback: Fallback<&str>) -> Result<String, ParseError> {
        for candidate in candidates {
            if let Some(s) = self.lookup(candidate).and_then(Value::as_str) {
                let s = s.trim();
                if !s.is_empty() {
                    return Ok(s.to_string());
                }
            }
        }
        match fallback {
            Fallback::Default(v) => Ok(v.to_string()),
            Fallback::Required => Err(ParseError::new(format!("missing field '{}'", field))),
        }
    }
}

fn parse_json(raw: &str) -> Result<Value, ParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ParseError::new("empty output"));
    }
    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| ParseError::new(format!("invalid JSON: {}", e)))?;
    if !value.is_object() {
        return Err(ParseError::new("expected a JSON object"));
    }
    if let Some(err) = value.get("error").and_then(Value::as_str) {
        return Err(ParseError::new(format!("tool reported error: {}", err)));
    }
    Ok(value)
}

/// Build [`MoodFeatures`] from analyzer JSON.
///
/// Accepts both the flat analyzer output and the nested music-extractor
/// layout. The key estimate falls back through the EDMA, Krumhansl and
/// Temperley profiles in that order.
pub fn parse_moods(raw: &str) -> Result<MoodFeatures, ParseError> {
    let doc = parse_json(raw)?;
    let r = FieldReader::new(&doc);

    let bpm = r.number("bpm", &["bpm", "rhythm.bpm"], Fallback::Required)?;
    if bpm <= 0.0 {
        return Err(ParseError::new(format!("bpm must be positive, got {}", bpm)));
    }
    let loudness = r.number(
        "loudness",
        &["loudness", "lowlevel.loudness_ebu128.integrated", "lowlevel.average_loudness"],
        Fallback::Default(0.0),
    )?;
    let spectral_centroid = r.number(
        "spectral_centroid",
        &["spectral_centroid", "lowlevel.spectral_centroid.mean"],
        Fallback::Default(0.0),
    )?;
    let spectral_flux = r.number(
        "spectral_flux",
        &["spectral_flux", "lowlevel.spectral_flux.mean"],
        Fallback::Default(0.0),
    )?;
    let key = r.string(
        "key",
        &[
            "key",
            "tonal.key_edma.key",
            "tonal.key_krumhansl.key",
            "tonal.key_temperley.key",
        ],
        Fallback::Required,
    )?;
    let mode = r
        .string(
            "mode",
            &[
                "mode",
                "scale",
                "tonal.key_edma.scale",
                "tonal.key_krumhansl.scale",
                "tonal.key_temperley.scale",
            ],
            Fallback::Required,
        )?
        .to_lowercase();
    if mode != "major" && mode != "minor" {
        return Err(ParseError::new(format!("unknown mode '{}'", mode)));
    }
    let valence = r.number("valence", &["valence", "mood.valence"], Fallback::Required)?;
    let arousal = r.number("arousal", &["arousal", "mood.arousal"], Fallback::Required)?;

    Ok(MoodFeatures {
        bpm,
        loudness,
        spectral_centroid,
        spectral_flux,
        key,
        mode,
        valence: valence.clamp(0.0, 1.0),
        arousal: arousal.clamp(0.0, 1.0),
    })
}

/// Build a [`Fingerprint`] from `fpcalc` output, either `-json` or the
/// plain `KEY=value` form.
pub fn parse_fingerprint(raw: &str) -> Result<Fingerprint, ParseError> {
    let trimmed = raw.trim();
    let (fingerprint, duration) = if trimmed.starts_with('{') {
        let doc = parse_json(trimmed)?;
        let r = FieldReader::new(&doc);
        (
            r.string("fingerprint", &["fingerprint"], Fallback::Required)?,
            r.number("duration", &["duration"], Fallback::Required)?,
        )
    } else {
        let mut fingerprint = None;
        let mut duration = None;
        for line in trimmed.lines() {
            if let Some(v) = line.strip_prefix("FINGERPRINT=") {
                fingerprint = Some(v.trim().to_string()).filter(|s| !s.is_empty());
            } else if let Some(v) = line.strip_prefix("DURATION=") {
                duration = Some(
                    v.trim()
                        .parse::<f64>()
                        .map_err(|_| ParseError::new(format!("invalid DURATION '{}'", v)))?,
                );
            }
        }
        (
            fingerprint.ok_or_else(|| ParseError::new("missing field 'fingerprint'"))?,
            duration.ok_or_else(|| ParseError::new("missing field 'duration'"))?,
        )
    };

    if !duration.is_finite() || duration < 0.0 {
        return Err(ParseError::new(format!("invalid duration {}", duration)));
    }
    Ok(Fingerprint {
        fingerprint,
        duration,
    })
}

/// Build [`MediaProperties`] from `ffprobe -print_format json -show_format
/// -show_streams` output, using the first audio stream.
pub fn parse_properties(raw: &str) -> Result<MediaProperties, ParseError> {
    let doc = parse_json(raw)?;
    let stream = doc
        .get("streams")
        .and_then(Value::as_array)
        .and_then(|streams| {
            streams
                .iter()
                .find(|s| s.get("codec_type").and_then(Value::as_str) == Some("audio"))
        })
        .ok_or_else(|| ParseError::new("no audio stream"))?;

    let s = FieldReader::new(stream);
    let f = FieldReader::new(&doc);

    let codec = s.string("codec", &["codec_name"], Fallback::Required)?;
    let container = f.string("container", &["format.format_name"], Fallback::Default("unknown"))?;
    let sample_rate = s.number("sample_rate", &["sample_rate"], Fallback::Required)?;
    let channels = s.number("channels", &["channels"], Fallback::Required)?;
    if sample_rate <= 0.0 || channels < 1.0 {
        return Err(ParseError::new(format!(
            "implausible stream: {} Hz, {} channels",
            sample_rate, channels
        )));
    }
    let bit_rate = s.number("bit_rate", &["bit_rate"], Fallback::Default(-1.0))?;
    let bit_rate = if bit_rate >= 0.0 {
        bit_rate
    } else {
        f.number("bit_rate", &["format.bit_rate"], Fallback::Default(-1.0))?
    };
    let bits = s.number(
        "bits_per_sample",
        &["bits_per_raw_sample", "bits_per_sample"],
        Fallback::Default(0.0),
    )?;
    let duration = s.number("duration", &["duration"], Fallback::Default(-1.0))?;
    let duration = if duration >= 0.0 {
        duration
    } else {
        f.number("duration", &["format.duration"], Fallback::Default(0.0))?
    };

    Ok(MediaProperties {
        codec,
        container,
        sample_rate: sample_rate as u32,
        channels: channels as u32,
        bit_rate: (bit_rate >= 0.0).then_some(bit_rate as u64),
        bits_per_sample: (bits > 0.0).then_some(bits as u32),
        duration,
    })
}

fn informational_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(\[\s*info\s*\]|info\b\s*[:\]]?|\[\s*(debug|verbose)\s*\]|progress\b|frame=|size=|\d{1,3}(\.\d+)?\s*%)")
            .expect("informational line pattern is valid")
    })
}

fn channel_rejection() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(channel.*(unsupported|not supported|too many|exceed)|(unsupported|too many|invalid).*channel)")
            .expect("channel rejection pattern is valid")
    })
}

/// Keep the last `max_lines` stderr lines that are not informational.
///
/// Tools interleave progress and `INFO` chatter with real errors; only the
/// latter are useful as a failure reason.
#[must_use]
pub fn summarize_stderr(stderr: &str, max_lines: usize) -> Vec<String> {
    let re = informational_line();
    let mut lines: Vec<String> = stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !re.is_match(l))
        .map(str::to_string)
        .collect();
    if lines.len() > max_lines {
        lines.drain(..lines.len() - max_lines);
    }
    lines
}

/// Whether any of the lines reports an unsupported channel count.
#[must_use]
pub fn mentions_channel_limit(lines: &[String]) -> bool {
    let re = channel_rejection();
    lines.iter().any(|l| re.is_match(l))
}

/// Last `max_chars` characters of `text`, on a char boundary.
#[must_use]
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}
