//! Wire-protocol constants and framing primitives
//!
//! Everything here is pure: parsing and formatting of the line-oriented
//! rcp frames, independent of where the bytes come from. The byte-stream
//! side lives in `session`.

use crate::errors::CopyError;

// Acknowledgement / error-line marker bytes
pub const ACK_OK: u8 = 0x00;
pub const ERR_SOFT: u8 = 0x01;
pub const ERR_FATAL: u8 = 0x02;

// A complete error line (marker + body + newline + trailing NUL) must fit
// in a 1024-byte peer buffer
pub const MAX_ERR_LEN: usize = 1024;

// Safety cap for inbound lines; the grammar itself has no limit
pub const MAX_LINE_LEN: usize = 64 * 1024;

// Chunk size for payload copies in both directions
pub const COPY_BUF_LEN: usize = 64 * 1024;

pub const PROTOCOL_ERROR: &str = "protocol error";

// POSIX permission bits that cross the wire
pub const S_IWUSR: u32 = 0o200;
pub const S_IRWXU: u32 = 0o700;
pub const S_ISUID: u32 = 0o4000;
pub const S_ISGID: u32 = 0o2000;

const MODE_MASK: u32 = 0o777 | S_ISUID | S_ISGID;

/// Restrict a mode to the nine permission bits plus setuid/setgid.
/// No other bits cross the protocol in either direction.
pub fn wire_mode(mode: u32) -> u32 {
    mode & MODE_MASK
}

/// One field of a `T` frame: whole seconds plus microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeStamp {
    pub sec: i64,
    pub usec: i64,
}

/// Parsed `T` frame, pending application to the next `D` or `C`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTimes {
    pub mtime: TimeStamp,
    pub atime: TimeStamp,
}

/// Parsed `C` or `D` header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub mode: u32,
    pub size: u64,
    pub name: String,
}

/// An inbound frame, discriminated by its first byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    SoftErr(String),
    FatalErr(String),
    EndDir,
    Times(FileTimes),
    Dir(FileHeader),
    File(FileHeader),
}

impl Frame {
    pub fn known_prefix(b: u8) -> bool {
        matches!(b, ERR_SOFT | ERR_FATAL | b'E' | b'T' | b'D' | b'C')
    }

    /// Parse the frame named by `prefix` from the rest of its line.
    pub fn parse(prefix: u8, line: &str) -> Result<Frame, CopyError> {
        match prefix {
            ERR_SOFT => Ok(Frame::SoftErr(line.to_string())),
            ERR_FATAL => Ok(Frame::FatalErr(line.to_string())),
            b'E' => Ok(Frame::EndDir),
            b'T' => parse_times(line).map(Frame::Times),
            b'D' => parse_header(line).map(Frame::Dir),
            b'C' => parse_header(line).map(Frame::File),
            _ => Err(CopyError::fatal(PROTOCOL_ERROR)),
        }
    }
}

/// Parse `<mode octal> <size decimal> <name>`. The name is the remainder of
/// the line; it must be non-empty, must not be `..`, and must not contain
/// `/`. Header damage is unrecoverable, so every failure here is fatal.
pub fn parse_header(line: &str) -> Result<FileHeader, CopyError> {
    let mut fields = line.splitn(3, ' ');
    let mode = fields
        .next()
        .and_then(|f| u32::from_str_radix(f, 8).ok())
        .ok_or_else(|| CopyError::fatal(PROTOCOL_ERROR))?;
    let size = fields
        .next()
        .and_then(|f| f.parse::<u64>().ok())
        .ok_or_else(|| CopyError::fatal(PROTOCOL_ERROR))?;
    let name = fields
        .next()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| CopyError::fatal(PROTOCOL_ERROR))?;
    if name == ".." || name.contains('/') {
        return Err(CopyError::fatal(format!("{name}: invalid name")));
    }
    Ok(FileHeader {
        mode: wire_mode(mode),
        size,
        name: name.to_string(),
    })
}

/// Parse the four-field `T` body: mtime.sec mtime.usec atime.sec atime.usec.
pub fn parse_times(line: &str) -> Result<FileTimes, CopyError> {
    let fields: Vec<i64> = line
        .split_whitespace()
        .map(|f| f.parse::<i64>())
        .collect::<Result<_, _>>()
        .map_err(|e| CopyError::fatal(e.to_string()))?;
    if fields.len() != 4 {
        return Err(CopyError::fatal(PROTOCOL_ERROR));
    }
    Ok(FileTimes {
        mtime: TimeStamp {
            sec: fields[0],
            usec: fields[1],
        },
        atime: TimeStamp {
            sec: fields[2],
            usec: fields[3],
        },
    })
}

/// Flatten an error message onto one line and clamp it so the framed error
/// line fits the peer's buffer. Truncation backs up to a UTF-8 boundary
/// before appending `...`.
pub fn error_line(msg: &str) -> String {
    let mut line = msg.replace('\n', "; ");
    if line.len() > MAX_ERR_LEN - 3 {
        let mut cut = MAX_ERR_LEN - 6;
        while !line.is_char_boundary(cut) {
            cut -= 1;
        }
        line.truncate(cut);
        line.push_str("...");
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_basic() {
        let h = parse_header("0644 3 hello.txt").unwrap();
        assert_eq!(h.mode, 0o644);
        assert_eq!(h.size, 3);
        assert_eq!(h.name, "hello.txt");
    }

    #[test]
    fn header_setuid_setgid_survive() {
        let h = parse_header("4755 0 su").unwrap();
        assert_eq!(h.mode, 0o4755);
        let h = parse_header("2711 0 sg").unwrap();
        assert_eq!(h.mode, 0o2711);
    }

    #[test]
    fn header_strips_unknown_mode_bits() {
        // sticky bit is not part of the protocol
        let h = parse_header("1777 0 tmp").unwrap();
        assert_eq!(h.mode, 0o777);
    }

    #[test]
    fn header_name_keeps_embedded_spaces() {
        let h = parse_header("0644 5 two words").unwrap();
        assert_eq!(h.name, "two words");
    }

    #[test]
    fn header_rejects_bad_names() {
        assert!(parse_header("0644 1 ..").is_err());
        assert!(parse_header("0644 1 a/b").is_err());
        assert!(parse_header("0644 1 /etc").is_err());
    }

    #[test]
    fn header_rejects_damage() {
        assert!(parse_header("").is_err());
        assert!(parse_header("0644").is_err());
        assert!(parse_header("0644 3").is_err());
        assert!(parse_header("worm 3 x").is_err());
        assert!(parse_header("0644 -3 x").is_err());
    }

    #[test]
    fn wire_mode_round_trip() {
        for mode in 0..=0o7777u32 {
            let permitted = mode & (0o777 | S_ISUID | S_ISGID);
            assert_eq!(wire_mode(wire_mode(mode)), permitted);
        }
    }

    #[test]
    fn times_basic() {
        let t = parse_times("1000 0 500 0").unwrap();
        assert_eq!(t.mtime, TimeStamp { sec: 1000, usec: 0 });
        assert_eq!(t.atime, TimeStamp { sec: 500, usec: 0 });
    }

    #[test]
    fn times_honors_usec_and_sign() {
        let t = parse_times("-5 250000 7 1").unwrap();
        assert_eq!(t.mtime, TimeStamp { sec: -5, usec: 250000 });
        assert_eq!(t.atime, TimeStamp { sec: 7, usec: 1 });
    }

    #[test]
    fn times_rejects_field_count() {
        assert!(parse_times("1 2 3").is_err());
        assert!(parse_times("1 2 3 4 5").is_err());
        assert!(parse_times("a b c d").is_err());
    }

    #[test]
    fn frame_dispatch() {
        assert_eq!(
            Frame::parse(0x01, "oops").unwrap(),
            Frame::SoftErr("oops".into())
        );
        assert_eq!(
            Frame::parse(0x02, "dead").unwrap(),
            Frame::FatalErr("dead".into())
        );
        assert_eq!(Frame::parse(b'E', "").unwrap(), Frame::EndDir);
        assert!(matches!(Frame::parse(b'T', "1 0 2 0").unwrap(), Frame::Times(_)));
        assert!(matches!(Frame::parse(b'D', "0755 0 d").unwrap(), Frame::Dir(_)));
        assert!(matches!(Frame::parse(b'C', "0644 1 f").unwrap(), Frame::File(_)));
        assert!(Frame::parse(b'Q', "junk").is_err());
        assert!(!Frame::known_prefix(b'Q'));
    }

    #[test]
    fn error_line_flattens_newlines() {
        assert_eq!(error_line("a\nb\nc"), "a; b; c");
    }

    #[test]
    fn error_line_clamps_long_messages() {
        let line = error_line(&"x".repeat(4096));
        assert_eq!(line.len(), MAX_ERR_LEN - 3);
        assert!(line.ends_with("..."));
    }

    #[test]
    fn error_line_respects_utf8_boundaries() {
        // a multi-byte char straddling the cut must not split
        let line = error_line(&"é".repeat(MAX_ERR_LEN));
        assert!(line.len() <= MAX_ERR_LEN - 3);
        assert!(line.ends_with("..."));
        assert!(std::str::from_utf8(line.as_bytes()).is_ok());
    }

    #[test]
    fn error_line_short_messages_untouched() {
        assert_eq!(error_line("fine"), "fine");
    }
}
