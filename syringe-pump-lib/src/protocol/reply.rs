use super::round3;

pub const REPLY_PREFIX: &[u8] = &[0xFF, b'/', b'0'];
pub const REPLY_SUFFIX: &[u8] = &[0x03, b'\r', b'\n'];

pub const NO_DEVICE: &str = "no device found";
pub const MALFORMED_REPLY: &str = "malformed reply";

/// Status byte reported for requests refused before reaching the wire.
pub const LOCAL_REJECT_CODE: u8 = b'!';

/// Decoded pump answer. Every field is either populated or explicitly absent.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub value: Option<String>,
    pub error_code: Option<u8>,
    pub busy: Option<bool>,
    pub error: Option<String>,
}

impl Reply {
    pub fn no_device() -> Self {
        Self {
            value: None,
            error_code: None,
            busy: None,
            error: Some(NO_DEVICE.to_string()),
        }
    }

    pub fn malformed() -> Self {
        Self {
            value: None,
            error_code: None,
            busy: None,
            error: Some(MALFORMED_REPLY.to_string()),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            value: Some(String::new()),
            error_code: Some(LOCAL_REJECT_CODE),
            busy: None,
            error: Some(message.into()),
        }
    }

    /// Payload as a number, rounded to the pump's display precision.
    pub fn number(&self) -> Option<f64> {
        self.value
            .as_deref()
            .and_then(|v| v.trim().parse::<f64>().ok())
            .map(round3)
    }

    /// A status byte came back from the pump.
    pub fn is_well_formed(&self) -> bool {
        self.error_code.is_some() && self.error_code != Some(LOCAL_REJECT_CODE)
    }

    pub fn error_code_char(&self) -> Option<char> {
        self.error_code.map(char::from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusInfo {
    pub busy: Option<bool>,
    pub error: Option<&'static str>,
}

static STATUS_TABLE: &[(u8, bool, &str)] = &[
    (b'`', false, "No Error"),
    (b'@', true, "No Error"),
    (b'a', false, "Initialization Error"),
    (b'A', true, "Initialization Error"),
    (b'b', false, "Invalid Command"),
    (b'B', true, "Invalid Command"),
    (b'c', false, "Invalid Operand"),
    (b'C', true, "Invalid Operand"),
    (b'o', false, "Command Buffer Overflow"),
    (b'O', true, "Command Buffer Overflow"),
];

/// Looks a status byte up. Unknown bytes yield `busy: None, error: None`,
/// which callers must treat as indeterminate.
pub fn convert_error_code(code: u8) -> StatusInfo {
    STATUS_TABLE
        .iter()
        .find(|(c, _, _)| *c == code)
        .map(|&(_, busy, error)| StatusInfo {
            busy: Some(busy),
            error: Some(error),
        })
        .unwrap_or(StatusInfo {
            busy: None,
            error: None,
        })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Status byte plus payload, with the framing stripped. A reply cut short
/// before its suffix has no body.
fn frame_body(raw: &[u8]) -> Option<&[u8]> {
    let start = find(raw, REPLY_PREFIX)? + REPLY_PREFIX.len();
    let body = &raw[start..];
    let end = find(body, REPLY_SUFFIX)?;
    Some(&body[..end])
}

pub fn decode(raw: &[u8]) -> Reply {
    if raw.is_empty() {
        return Reply::no_device();
    }

    let body = match frame_body(raw) {
        Some(body) if !body.is_empty() => body,
        _ => return Reply::malformed(),
    };

    let code = body[0];
    let status = convert_error_code(code);

    Reply {
        value: Some(String::from_utf8_lossy(&body[1..]).into_owned()),
        error_code: Some(code),
        busy: status.busy,
        error: status.error.map(str::to_string),
    }
}

/// Builds the raw bytes the pump sends for `status` and `value`.
pub fn encode_reply(status: u8, value: &str) -> Vec<u8> {
    let mut raw = Vec::with_capacity(REPLY_PREFIX.len() + 1 + value.len() + REPLY_SUFFIX.len());
    raw.extend_from_slice(REPLY_PREFIX);
    raw.push(status);
    raw.extend_from_slice(value.as_bytes());
    raw.extend_from_slice(REPLY_SUFFIX);
    raw
}

/// Pump id from an identification reply, a single digit at offset 3 of the body.
pub fn parse_pump_id(raw: &[u8]) -> Option<u8> {
    frame_body(raw)?
        .get(3)
        .filter(|c| c.is_ascii_digit())
        .map(|c| c - b'0')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::format_number;

    #[test]
    fn decode_position_reply() {
        let reply = decode(b"\xff/0`12.500\x03\r\n");
        assert_eq!(reply.value.as_deref(), Some("12.500"));
        assert_eq!(reply.error_code, Some(b'`'));
        assert_eq!(reply.busy, Some(false));
        assert_eq!(reply.error.as_deref(), Some("No Error"));
        assert_eq!(reply.number(), Some(12.5));
    }

    #[test]
    fn decode_busy_reply_without_value() {
        let reply = decode(b"\xff/0@\x03\r\n");
        assert_eq!(reply.value.as_deref(), Some(""));
        assert_eq!(reply.busy, Some(true));
        assert_eq!(reply.number(), None);
    }

    #[test]
    fn decode_empty_is_no_device() {
        let reply = decode(b"");
        assert_eq!(reply, Reply::no_device());
        assert_eq!(reply.error.as_deref(), Some(NO_DEVICE));
        assert_eq!(reply.busy, None);
        assert_eq!(reply.value, None);
    }

    #[test]
    fn decode_garbage_is_malformed() {
        assert_eq!(decode(b"garbage\r\n"), Reply::malformed());
        assert_eq!(decode(b"\xff/0\x03\r\n"), Reply::malformed());
    }

    #[test]
    fn decode_truncated_reply_is_malformed() {
        let reply = decode(b"\xff/0`12");
        assert_eq!(reply, Reply::malformed());
        assert_eq!(reply.number(), None);
        assert_eq!(decode(b"\xff/0`12.500\x03"), Reply::malformed());
        assert_eq!(parse_pump_id(b"\xff/0`103"), None);
    }

    #[test]
    fn decode_unknown_status_is_indeterminate() {
        let reply = decode(b"\xff/0g\x03\r\n");
        assert_eq!(reply.error_code, Some(b'g'));
        assert_eq!(reply.busy, None);
        assert_eq!(reply.error, None);
    }

    #[test]
    fn status_table_is_exact() {
        let expected: &[(u8, bool, &str)] = &[
            (b'`', false, "No Error"),
            (b'@', true, "No Error"),
            (b'a', false, "Initialization Error"),
            (b'A', true, "Initialization Error"),
            (b'b', false, "Invalid Command"),
            (b'B', true, "Invalid Command"),
            (b'c', false, "Invalid Operand"),
            (b'C', true, "Invalid Operand"),
            (b'o', false, "Command Buffer Overflow"),
            (b'O', true, "Command Buffer Overflow"),
        ];
        for &(code, busy, error) in expected {
            assert_eq!(
                convert_error_code(code),
                StatusInfo {
                    busy: Some(busy),
                    error: Some(error)
                }
            );
        }
        let known: Vec<u8> = expected.iter().map(|e| e.0).collect();
        for code in (0u8..=255).filter(|c| !known.contains(c)) {
            assert_eq!(
                convert_error_code(code),
                StatusInfo {
                    busy: None,
                    error: None
                }
            );
        }
    }

    #[test]
    fn numbers_survive_the_wire_at_three_decimals() {
        for v in [0.0, 0.001, 12.5, 99.999, 123.4567, 250.0] {
            let raw = encode_reply(b'`', &format_number(v));
            assert_eq!(decode(&raw).number(), Some(round3(v)));
        }
    }

    #[test]
    fn pump_id_from_identity_reply() {
        assert_eq!(parse_pump_id(b"\xff/0`103\x03\r\n"), Some(3));
        assert_eq!(parse_pump_id(b"\xff/0`10\x03\r\n"), None);
        assert_eq!(parse_pump_id(b""), None);
    }
}
