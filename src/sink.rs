//! Sink role: materialize the inbound frame stream under a target path

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;

use filetime::FileTime;

use crate::errors::CopyError;
use crate::protocol::{
    FileHeader, FileTimes, Frame, TimeStamp, COPY_BUF_LEN, PROTOCOL_ERROR, S_IRWXU, S_IWUSR,
};
use crate::session::Session;

/// Run the dispatch loop against `path`. `recur` is false for the outer
/// invocation and true inside a received directory; the loop pops one
/// level when it acks `E`.
pub fn sink<R: Read, W: Write>(
    sess: &mut Session<R, W>,
    path: &Path,
    recur: bool,
) -> Result<(), CopyError> {
    if !recur && sess.opts.target_dir {
        match fs::metadata(path) {
            Err(e) => {
                return Err(sess.tee(CopyError::fatal(format!("{}: {}", path.display(), e))))
            }
            Ok(md) if !md.is_dir() => {
                return Err(sess.tee(CopyError::fatal(format!(
                    "{}: is not a directory",
                    path.display()
                ))))
            }
            Ok(_) => {}
        }
    }

    // doubles as the ready handshake and as the ack for the enclosing D
    sess.write_ok()?;

    let mut errs: Vec<CopyError> = Vec::new();
    let mut times: Option<FileTimes> = None;
    let mut first = true;
    loop {
        let prefix = match sess.read_byte()? {
            None => break, // clean end of stream
            Some(b) => b,
        };
        let line = sess.read_line()?;
        let frame = match Frame::parse(prefix, &line) {
            Ok(f) => f,
            Err(err) => {
                // an unknown first byte surfaces the raw line, which turns
                // e.g. a shell banner on the transport into a readable error
                let err = if first && !Frame::known_prefix(prefix) {
                    CopyError::fatal(format!("{}{}", prefix as char, line))
                } else {
                    err
                };
                return Err(sess.tee(err));
            }
        };
        first = false;

        match frame {
            Frame::SoftErr(msg) => {
                sess.log.error(&msg);
                errs.push(CopyError::Soft(msg));
                times = None;
            }
            Frame::FatalErr(msg) => return Err(CopyError::Fatal(msg)),
            Frame::EndDir => {
                if !recur {
                    return Err(sess.tee(CopyError::fatal(PROTOCOL_ERROR)));
                }
                sess.write_ok()?;
                return CopyError::collect(errs);
            }
            Frame::Times(t) => {
                times = Some(t);
                sess.write_ok()?;
            }
            Frame::Dir(header) => match sink_dir(sess, path, &header, times.take()) {
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => errs.push(e),
                Ok(()) => {}
            },
            Frame::File(header) => match sink_file(sess, path, &header, times.take()) {
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => errs.push(e),
                Ok(()) => {}
            },
        }
    }

    CopyError::collect(errs)
}

fn sink_dir<R: Read, W: Write>(
    sess: &mut Session<R, W>,
    parent: &Path,
    header: &FileHeader,
    times: Option<FileTimes>,
) -> Result<(), CopyError> {
    if !sess.opts.recursive {
        return Err(sess.tee(CopyError::fatal("received directory without -r flag")));
    }

    let target = parent.join(&header.name);
    let reset_perm = match prepare_dir(&target, header.mode, sess.opts.preserve_attrs) {
        Ok(r) => r,
        Err(e) => return Err(sess.tee(e)),
    };

    let mut errs = Vec::new();
    match sink(sess, &target, true) {
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => errs.push(e),
        Ok(()) => {}
    }

    // post-phase order: utimes, then the deferred chmod
    let mut pend = Vec::new();
    if let Some(t) = times {
        if let Err(e) = filetime::set_file_times(&target, file_time(&t.atime), file_time(&t.mtime))
        {
            pend.push(CopyError::soft(format!("{}: {}", target.display(), e)));
        }
    }
    if reset_perm {
        if let Err(e) = fs::set_permissions(&target, fs::Permissions::from_mode(header.mode)) {
            pend.push(CopyError::soft(format!("{}: {}", target.display(), e)));
        }
    }
    if !pend.is_empty() {
        let agg = CopyError::Many(pend);
        sess.send_error(&agg);
        errs.push(agg);
    }

    CopyError::collect(errs)
}

/// Ensure the directory exists and stays owner-writable while it fills.
/// Returns whether the received permissions still need to be applied once
/// the body is in place.
fn prepare_dir(path: &Path, mode: u32, preserve: bool) -> Result<bool, CopyError> {
    match fs::metadata(path) {
        Ok(md) => {
            if !md.is_dir() {
                return Err(CopyError::soft(format!(
                    "{}: is not a directory",
                    path.display()
                )));
            }
            if preserve {
                fs::set_permissions(path, fs::Permissions::from_mode(mode))
                    .map_err(|e| CopyError::soft(format!("{}: {}", path.display(), e)))?;
            }
            Ok(false)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            DirBuilder::new()
                .mode(mode | S_IRWXU)
                .create(path)
                .map_err(|e| CopyError::soft(format!("{}: {}", path.display(), e)))?;
            Ok(true)
        }
        Err(e) => Err(CopyError::soft(format!("{}: {}", path.display(), e))),
    }
}

fn sink_file<R: Read, W: Write>(
    sess: &mut Session<R, W>,
    dest: &Path,
    header: &FileHeader,
    times: Option<FileTimes>,
) -> Result<(), CopyError> {
    let mut dest = dest.to_path_buf();
    let mut existed = false;
    if let Ok(md) = fs::metadata(&dest) {
        existed = true;
        if md.is_dir() {
            dest.push(&header.name);
        }
    }

    // owner-writable while the payload lands; creation mode only, so an
    // existing file keeps its permissions
    let f = match OpenOptions::new()
        .write(true)
        .create(true)
        .mode(header.mode | S_IWUSR)
        .open(&dest)
    {
        Ok(f) => f,
        Err(e) => return Err(sess.tee(CopyError::soft(format!("{}: {}", dest.display(), e)))),
    };
    let md = match f.metadata() {
        Ok(md) => md,
        Err(e) => return Err(sess.tee(CopyError::soft(format!("{}: {}", dest.display(), e)))),
    };
    let is_regular = md.is_file();

    sess.write_ok()?; // ready for payload

    let mut pend = Vec::new();
    recv_payload(sess, &f, header.size, &dest, &mut pend)?;

    // a shorter transfer over a longer pre-existing regular file must not
    // leave a tail
    if !existed || is_regular {
        if let Err(e) = f.set_len(header.size) {
            pend.push(CopyError::soft(format!("{}: {}", dest.display(), e)));
        }
    }
    if let Err(e) = f.sync_all() {
        pend.push(CopyError::soft(format!("{}: {}", dest.display(), e)));
    }
    if sess.opts.preserve_attrs || !existed {
        if let Err(e) = f.set_permissions(fs::Permissions::from_mode(header.mode)) {
            pend.push(CopyError::soft(format!("{}: {}", dest.display(), e)));
        }
    }
    if let Some(t) = times {
        if let Err(e) = filetime::set_file_times(&dest, file_time(&t.atime), file_time(&t.mtime)) {
            pend.push(CopyError::soft(format!("{}: {}", dest.display(), e)));
        }
    }

    // the peer's trailer slot: a NUL on success or its own error line
    let ack_err = match sess.read_ack() {
        Ok(()) => None,
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => Some(e),
    };

    if pend.is_empty() {
        sess.write_ok()?;
    } else {
        sess.send_error(&CopyError::Many(pend.clone()));
    }

    if let Some(e) = ack_err {
        pend.push(e);
    }
    if pend.is_empty() {
        sess.stats.files += 1;
        sess.stats.bytes += header.size;
        sess.log.received(&dest, header.size);
        return Ok(());
    }
    CopyError::collect(pend)
}

/// Copy exactly `size` bytes from the wire into the file. A filesystem
/// write failure is recorded in `pend` and the rest of the declared
/// payload is discarded so framing stays aligned; losing the stream
/// itself is fatal.
fn recv_payload<R: Read, W: Write>(
    sess: &mut Session<R, W>,
    mut f: &File,
    size: u64,
    dest: &Path,
    pend: &mut Vec<CopyError>,
) -> Result<(), CopyError> {
    let mut buf = vec![0u8; COPY_BUF_LEN];
    let mut remaining = size;

    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = sess.read_chunk(&mut buf[..want])?;
        if n == 0 {
            return Err(CopyError::fatal("unexpected end of stream"));
        }
        remaining -= n as u64;

        if let Err(e) = f.write_all(&buf[..n]) {
            pend.push(CopyError::soft(format!("{}: {}", dest.display(), e)));
            while remaining > 0 {
                let want = remaining.min(buf.len() as u64) as usize;
                let n = sess.read_chunk(&mut buf[..want])?;
                if n == 0 {
                    return Err(CopyError::fatal("unexpected end of stream"));
                }
                remaining -= n as u64;
            }
            break;
        }
    }
    Ok(())
}

fn file_time(t: &TimeStamp) -> FileTime {
    let nanos = t.usec.clamp(0, 999_999) as u32 * 1000;
    FileTime::from_unix_time(t.sec, nanos)
}
