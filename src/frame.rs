//! Frame encoding/decoding (§4.2). A closed tagged sum, not open polymorphism
//! (§9): exactly the four wire shapes plus the checksum-mismatch record.

use crate::error::CoreError;

/// XOR-8 checksum over a byte slice, initial value 0.
pub fn xor8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

fn upper_hex_2(byte: u8) -> String {
    format!("{:02X}", byte)
}

/// Encodes a reliable command frame: `cmd_text:SEQ=<seq>:CHK=<hex>`.
pub fn encode_reliable(cmd_text: &str, seq: u16) -> String {
    let body = format!("{}:SEQ={}", cmd_text, seq);
    let chk = xor8(body.as_bytes());
    format!("{}:CHK={}", body, upper_hex_2(chk))
}

/// Encodes a best-effort command frame with no trailer, used during
/// identification probes. The device must accept both forms.
pub fn encode_bare(cmd_text: &str) -> String {
    cmd_text.to_string()
}

/// One decoded inbound line. `ChecksumMismatch` is a frame-error record, not
/// a [`CoreError`]: the reader logs and drops it rather than raising.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Response {
        payload: String,
        seq: Option<u16>,
        cmd_seq: Option<u16>,
    },
    Event {
        payload: String,
        seq: Option<u16>,
    },
    LiveSample {
        payload: String,
    },
    ChecksumMismatch {
        claimed: u8,
        computed: u8,
    },
}

/// Decodes one line (terminator already stripped by the transport).
pub fn decode_line(line: &str) -> Frame {
    if let Some(p) = line.find(":CHK=") {
        let hex_start = p + 5;
        let hex = line.get(hex_start..hex_start + 2);
        let trailer_is_hex2 = hex.map(|h| h.len() == 2 && h.chars().all(|c| c.is_ascii_hexdigit()));
        if trailer_is_hex2 == Some(true) {
            let claimed = u8::from_str_radix(hex.unwrap(), 16).unwrap_or(0);
            let computed = xor8(line[..p].as_bytes());
            if claimed != computed {
                return Frame::ChecksumMismatch { claimed, computed };
            }
            let after_chk = &line[hex_start + 2..];
            let before_chk = &line[..p];
            let trimmed = before_chk
                .strip_suffix(":END")
                .or_else(|| after_chk.strip_prefix(":END").map(|_| before_chk))
                .unwrap_or(before_chk);
            return parse_trailered(trimmed);
        }
    }

    if let Some(rest) = line.strip_prefix("EVENT:") {
        return Frame::Event {
            payload: format!("EVENT:{}", rest),
            seq: None,
        };
    }
    if let Some(rest) = line.strip_prefix("LIVE:") {
        return Frame::LiveSample {
            payload: format!("LIVE:{}", rest),
        };
    }

    Frame::Response {
        payload: line.to_string(),
        seq: None,
        cmd_seq: None,
    }
}

/// Splits a trailer-bearing (and now checksum-verified, `:END`-stripped)
/// remainder on `:SEQ=` / `:CMDSEQ=` to recover `seq`, `cmd_seq`, and payload.
/// Uses `rfind` so that `:SEQ=`/`:CMDSEQ=` occurring inside the payload
/// itself (arbitrary printable content) cannot be mistaken for the trailer.
fn parse_trailered(text: &str) -> Frame {
    let cmd_seq_pos = text.rfind(":CMDSEQ=");
    let (before_cmdseq, cmd_seq) = match cmd_seq_pos {
        Some(p) => {
            let digits = &text[p + 8..];
            (&text[..p], digits.parse::<u16>().ok())
        }
        None => (text, None),
    };

    let seq_pos = before_cmdseq.rfind(":SEQ=");
    let (payload, seq) = match seq_pos {
        Some(p) => {
            let digits = &before_cmdseq[p + 5..];
            (&before_cmdseq[..p], digits.parse::<u16>().ok())
        }
        None => (before_cmdseq, None),
    };

    if payload.starts_with("EVENT:") {
        return Frame::Event {
            payload: payload.to_string(),
            seq,
        };
    }
    if payload.starts_with("LIVE:") {
        return Frame::LiveSample {
            payload: payload.to_string(),
        };
    }

    Frame::Response {
        payload: payload.to_string(),
        seq,
        cmd_seq,
    }
}

/// Extracts the response payload, validating it begins with `discriminator`
/// (e.g. `"PANELX:"`). Used by the Command Channel after a response is
/// delivered to a completed slot.
pub fn validate_discriminator<'a>(
    payload: &'a str,
    discriminator: &str,
) -> Result<&'a str, CoreError> {
    if payload.starts_with(discriminator) {
        Ok(payload)
    } else {
        Err(CoreError::Protocol {
            expected: discriminator.to_string(),
            got: payload.to_string(),
        })
    }
}
