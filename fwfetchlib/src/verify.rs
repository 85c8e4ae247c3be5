use std::io::{self, Read};

use log::debug;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Outcome},
    progress::{Progress, ProgressReporter},
};

/// Fill `buf` as far as possible. Returns less than `buf.len()` only at EOF.
pub(crate) fn read_full(reader: &mut (impl Read + ?Sized), buf: &mut [u8]) -> io::Result<usize> {
    let mut n = 0;

    while n < buf.len() {
        match reader.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(r) => n += r,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    Ok(n)
}

/// Feed the whole input through `update` one chunk at a time, checking for
/// cancellation before every read. Returns the number of bytes consumed.
fn digest_stream<F: FnMut(Progress)>(
    reader: &mut (impl Read + ?Sized),
    chunk_size: usize,
    cancel: &CancellationToken,
    progress: &mut ProgressReporter<F>,
    mut update: impl FnMut(&[u8]),
) -> Result<Outcome<u64>, Error> {
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut total = 0u64;

    progress.report(0);

    loop {
        if cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        let n = read_full(reader, &mut buf).map_err(Error::Storage)?;
        if n == 0 {
            break;
        }

        update(&buf[..n]);
        total += n as u64;
        progress.report(total);
    }

    Ok(Outcome::Completed(total))
}

/// Compute the CRC32 of the input and compare it to `expected`. An input whose
/// length differs from `total_size` never verifies.
pub fn verify_crc32<F: FnMut(Progress)>(
    reader: &mut (impl Read + ?Sized),
    total_size: u64,
    expected: u32,
    chunk_size: usize,
    cancel: &CancellationToken,
    progress: &mut ProgressReporter<F>,
) -> Result<Outcome<bool>, Error> {
    let mut hasher = crc32fast::Hasher::new();

    let outcome = digest_stream(reader, chunk_size, cancel, progress, |d| hasher.update(d))?;

    Ok(outcome.map(|size| {
        let actual = hasher.finalize();
        debug!("CRC32: expected={expected:08x}, actual={actual:08x}, size={size}/{total_size}");

        size == total_size && actual == expected
    }))
}

/// Compute the MD5 digest of the input and compare it to the hex string
/// `expected`, ignoring case.
pub fn verify_md5<F: FnMut(Progress)>(
    reader: &mut (impl Read + ?Sized),
    total_size: u64,
    expected: &str,
    chunk_size: usize,
    cancel: &CancellationToken,
    progress: &mut ProgressReporter<F>,
) -> Result<Outcome<bool>, Error> {
    let mut context = md5::Context::new();

    let outcome = digest_stream(reader, chunk_size, cancel, progress, |d| context.consume(d))?;

    Ok(outcome.map(|size| {
        let actual = format!("{:x}", context.compute());
        debug!("MD5: expected={expected}, actual={actual}, size={size}/{total_size}");

        size == total_size && actual.eq_ignore_ascii_case(expected.trim())
    }))
}
