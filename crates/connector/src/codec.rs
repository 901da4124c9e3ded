//! `~m~<N>~m~<payload>` frame codec
//!
//! `<N>` is the decimal byte length of `<payload>`. One physical read may
//! carry several frames, and a frame may be split across reads, so the
//! decoder keeps whatever trails the last complete frame until the next
//! call.

use crate::error::CodecError;

const MARKER: &str = "~m~";

/// Upper bound on a single frame. Anything larger is treated as a
/// corrupted length marker rather than buffered.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Longest length marker accepted (`MAX_FRAME_LEN` has 8 digits)
const MAX_LEN_DIGITS: usize = 8;

/// Frame one payload.
pub fn encode(payload: &str) -> String {
    format!("{MARKER}{}{MARKER}{payload}", payload.len())
}

/// Decode a chunk that must hold only complete frames.
pub fn decode(chunk: &str) -> Result<Vec<String>, CodecError> {
    let mut decoder = FrameDecoder::new();
    let frames = decoder.decode(chunk)?;
    match decoder.pending() {
        0 => Ok(frames),
        n => Err(CodecError::Truncated(n)),
    }
}

/// Stateful decoder for one connection.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: String,
}

enum Step {
    Frame { payload: String, consumed: usize },
    Incomplete,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Append `chunk` and return every payload it completes, in order.
    ///
    /// After an error the buffered bytes are discarded; callers drop the
    /// connection anyway.
    pub fn decode(&mut self, chunk: &str) -> Result<Vec<String>, CodecError> {
        self.buf.push_str(chunk);

        let mut out = Vec::new();
        let mut offset = 0;
        loop {
            match next_frame(&self.buf[offset..]) {
                Ok(Step::Frame { payload, consumed }) => {
                    out.push(payload);
                    offset += consumed;
                }
                Ok(Step::Incomplete) => break,
                Err(e) => {
                    self.buf.clear();
                    return Err(e);
                }
            }
        }

        self.buf.drain(..offset);
        Ok(out)
    }
}

fn next_frame(buf: &str) -> Result<Step, CodecError> {
    if buf.is_empty() {
        return Ok(Step::Incomplete);
    }

    let Some(rest) = buf.strip_prefix(MARKER) else {
        if MARKER.starts_with(buf) {
            return Ok(Step::Incomplete);
        }
        return Err(CodecError::MissingMarker(preview(buf)));
    };

    let Some(len_end) = rest.find(MARKER) else {
        // Still reading the length or the closing marker
        let digits = rest.trim_end_matches('~').trim_end_matches('m').trim_end_matches('~');
        let tail = &rest[digits.len()..];
        if digits.len() <= MAX_LEN_DIGITS
            && digits.bytes().all(|b| b.is_ascii_digit())
            && MARKER.starts_with(tail)
        {
            return Ok(Step::Incomplete);
        }
        return Err(CodecError::InvalidLength(preview(rest)));
    };

    let declared = parse_length(&rest[..len_end])?;
    let start = MARKER.len() + len_end + MARKER.len();
    let end = start + declared;
    if end > buf.len() {
        return Ok(Step::Incomplete);
    }

    let payload = buf
        .get(start..end)
        .ok_or(CodecError::LengthMismatch { declared })?;

    // The next byte must open another frame (or be absent)
    let after = &buf[end..];
    if !after.is_empty() && !after.starts_with('~') {
        return Err(CodecError::LengthMismatch { declared });
    }

    Ok(Step::Frame {
        payload: payload.to_string(),
        consumed: end,
    })
}

fn parse_length(digits: &str) -> Result<usize, CodecError> {
    let valid = !digits.is_empty()
        && digits.len() <= MAX_LEN_DIGITS
        && digits.bytes().all(|b| b.is_ascii_digit())
        && !(digits.len() > 1 && digits.starts_with('0'));
    if !valid {
        return Err(CodecError::InvalidLength(digits.to_string()));
    }

    let n: usize = digits
        .parse()
        .map_err(|_| CodecError::InvalidLength(digits.to_string()))?;
    if n > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(n));
    }
    Ok(n)
}

fn preview(s: &str) -> String {
    s.chars().take(16).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode() {
        assert_eq!(encode("~h~1"), "~m~4~m~~h~1");
        assert_eq!(encode(r#"{"m":"x"}"#), r#"~m~9~m~{"m":"x"}"#);
        assert_eq!(encode(""), "~m~0~m~");
    }

    #[test]
    fn test_length_counts_bytes() {
        let payload = r#"{"n":"é"}"#;
        assert_eq!(encode(payload), format!("~m~{}~m~{}", payload.len(), payload));
        assert_eq!(decode(&encode(payload)).unwrap(), vec![payload]);
    }

    #[test]
    fn test_roundtrip_single() {
        for payload in ["~h~42", r#"{"m":"qsd","p":["qs_abc",{"n":"NASDAQ:AAPL"}]}"#, "", "~m~"] {
            assert_eq!(decode(&encode(payload)).unwrap(), vec![payload.to_string()]);
        }
    }

    #[test]
    fn test_concatenated_frames_keep_order() {
        let payloads = ["~h~1", r#"{"m":"a"}"#, r#"{"m":"b"}"#, "~h~2"];
        let wire: String = payloads.iter().map(|p| encode(p)).collect();
        assert_eq!(decode(&wire).unwrap(), payloads);
    }

    #[test]
    fn test_partial_frame_survives_across_calls() {
        let wire = format!("{}{}", encode(r#"{"m":"first"}"#), encode(r#"{"m":"second"}"#));
        let mut decoder = FrameDecoder::new();

        // Split inside every region: marker, length, payload
        for split in 1..wire.len() {
            let (head, tail) = wire.split_at(split);
            let mut got = decoder.decode(head).unwrap();
            got.extend(decoder.decode(tail).unwrap());
            assert_eq!(got, vec![r#"{"m":"first"}"#, r#"{"m":"second"}"#], "split at {split}");
            assert_eq!(decoder.pending(), 0);
        }
    }

    #[test]
    fn test_non_numeric_length_is_error() {
        assert!(matches!(decode("~m~abc~m~xyz"), Err(CodecError::InvalidLength(_))));
        assert!(matches!(decode("~m~-3~m~abc"), Err(CodecError::InvalidLength(_))));
        assert!(matches!(decode("~m~03~m~abc"), Err(CodecError::InvalidLength(_))));
    }

    #[test]
    fn test_length_shorter_than_payload_is_error() {
        assert!(matches!(
            decode(r#"~m~3~m~{"m":"x"}"#),
            Err(CodecError::LengthMismatch { declared: 3 })
        ));
    }

    #[test]
    fn test_missing_marker_is_error() {
        assert!(matches!(decode("hello"), Err(CodecError::MissingMarker(_))));
    }

    #[test]
    fn test_truncated_chunk_is_error_for_one_shot_decode() {
        assert_eq!(decode("~m~10~m~abc"), Err(CodecError::Truncated(11)));
    }

    #[test]
    fn test_oversized_length_is_error() {
        assert!(matches!(decode("~m~99999999~m~"), Err(CodecError::FrameTooLarge(_))));
    }

    #[test]
    fn test_error_resets_buffer() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.decode("garbage").is_err());
        assert_eq!(decoder.pending(), 0);
        assert_eq!(decoder.decode(&encode("~h~1")).unwrap(), vec!["~h~1"]);
    }
}
