//! Source role: walk the named paths and emit the frame stream

use std::fs::{self, File, Metadata};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::CopyError;
use crate::protocol::{wire_mode, COPY_BUF_LEN};
use crate::session::Session;

/// Emit every named path, gated on the sink-ready handshake. Fatal errors
/// abort; per-path soft errors accumulate into the final result.
pub fn source<R: Read, W: Write>(
    sess: &mut Session<R, W>,
    paths: &[PathBuf],
) -> Result<(), CopyError> {
    sess.read_ack()?;

    let mut errs = Vec::new();
    for path in paths {
        match send(sess, path) {
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => errs.push(e),
            Ok(()) => {}
        }
    }
    CopyError::collect(errs)
}

/// Transmit one path; directories recurse when enabled.
fn send<R: Read, W: Write>(sess: &mut Session<R, W>, path: &Path) -> Result<(), CopyError> {
    let md = match fs::metadata(path) {
        Ok(md) => md,
        Err(e) => return Err(sess.tee(CopyError::soft(format!("{}: {}", path.display(), e)))),
    };
    let name = match base_name(path) {
        Some(n) => n,
        None => return Err(sess.tee(CopyError::soft(format!("{}: invalid path", path.display())))),
    };

    if md.is_dir() {
        if sess.opts.recursive {
            return send_dir(sess, path, &md, &name);
        }
        return Err(sess.tee(CopyError::soft(format!("{name}: is a directory"))));
    }
    if !md.is_file() {
        return Err(sess.tee(CopyError::soft(format!("{name}: not a regular file"))));
    }

    let mut f = match File::open(path) {
        Ok(f) => f,
        Err(e) => return Err(sess.tee(CopyError::soft(format!("{}: {}", path.display(), e)))),
    };

    if sess.opts.preserve_attrs {
        send_attr(sess, &md)?;
    }

    let size = md.len();
    let mode = wire_mode(md.permissions().mode());
    sess.write_line(&format!("C{mode:04o} {size} {name}"))?;
    sess.read_ack()?;

    send_payload(sess, &mut f, size, path)?;

    sess.stats.files += 1;
    sess.stats.bytes += size;
    sess.log.sent(path, size);
    Ok(())
}

/// Copy exactly `size` bytes from the file to the wire, then complete the
/// trailer exchange. A failed or short file read pads the declared length
/// with zeros so the peer's reader stays aligned, and reports the failure
/// in the trailer slot.
fn send_payload<R: Read, W: Write>(
    sess: &mut Session<R, W>,
    f: &mut File,
    size: u64,
    path: &Path,
) -> Result<(), CopyError> {
    let mut buf = vec![0u8; COPY_BUF_LEN];
    let mut remaining = size;

    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let fail = match f.read(&mut buf[..want]) {
            Ok(0) => Some(CopyError::soft(format!(
                "{}: file truncated during transfer",
                path.display()
            ))),
            Ok(n) => {
                sess.write_all(&buf[..n])?;
                remaining -= n as u64;
                None
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => None,
            Err(e) => Some(CopyError::soft(format!("{}: {}", path.display(), e))),
        };

        if let Some(err) = fail {
            buf.fill(0);
            while remaining > 0 {
                let n = remaining.min(buf.len() as u64) as usize;
                sess.write_all(&buf[..n])?;
                remaining -= n as u64;
            }
            let err = sess.tee(err);
            return match sess.read_ack() {
                Err(ack) if ack.is_fatal() => Err(ack),
                Err(ack) => Err(CopyError::Many(vec![err, ack])),
                Ok(()) => Err(err),
            };
        }
    }

    sess.write_ok()?;
    sess.read_ack()
}

fn send_dir<R: Read, W: Write>(
    sess: &mut Session<R, W>,
    path: &Path,
    md: &Metadata,
    name: &str,
) -> Result<(), CopyError> {
    let mut children = Vec::new();
    let listing = fs::read_dir(path).and_then(|rd| {
        for entry in rd {
            children.push(entry?.path());
        }
        Ok(())
    });
    if let Err(e) = listing {
        return Err(sess.tee(CopyError::soft(format!("{}: {}", path.display(), e))));
    }

    if sess.opts.preserve_attrs {
        send_attr(sess, md)?;
    }

    let mode = wire_mode(md.permissions().mode());
    sess.write_line(&format!("D{mode:04o} 0 {name}"))?;
    sess.read_ack()?;

    let mut errs = Vec::new();
    for child in &children {
        match send(sess, child) {
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => errs.push(e),
            Ok(()) => {}
        }
    }

    sess.write_line("E")?;
    match sess.read_ack() {
        Err(e) if e.is_fatal() => Err(e),
        ack => {
            if errs.is_empty() {
                ack
            } else {
                CopyError::collect(errs)
            }
        }
    }
}

/// `T` frame for the next entry. Seconds only; the usec slots are always 0.
fn send_attr<R: Read, W: Write>(sess: &mut Session<R, W>, md: &Metadata) -> Result<(), CopyError> {
    let mtime = unix_secs(md.modified());
    let atime = unix_secs(md.accessed());
    sess.write_line(&format!("T{mtime} 0 {atime} 0"))?;
    sess.read_ack()
}

fn unix_secs(t: std::io::Result<SystemTime>) -> i64 {
    t.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// The transmitted name is the path's final component, so trailing slashes
/// and relative prefixes never cross the wire.
fn base_name(path: &Path) -> Option<String> {
    let name = match path.file_name() {
        Some(n) => n.to_owned(),
        None => fs::canonicalize(path).ok()?.file_name()?.to_owned(),
    };
    name.to_str().map(str::to_string)
}
