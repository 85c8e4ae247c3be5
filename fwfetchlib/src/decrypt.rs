use std::io::{Read, Write};

use cipher::generic_array::typenum::Unsigned;
use log::debug;
use tokio_util::sync::CancellationToken;

use crate::{
    crypto::{CryptoError, FileBlockSize, FileCipher},
    error::{Error, Outcome},
    key::DecryptionKey,
    progress::{Progress, ProgressReporter},
    sink::finish_output,
    verify::read_full,
};

fn decrypt_stream<F: FnMut(Progress)>(
    input: &mut (impl Read + ?Sized),
    output: &mut (impl Write + ?Sized),
    cipher: &FileCipher,
    total_size: u64,
    chunk_size: usize,
    cancel: &CancellationToken,
    progress: &mut ProgressReporter<F>,
) -> Result<Outcome<()>, Error> {
    let mut buf = vec![0u8; chunk_size];
    let mut processed = 0u64;

    progress.report(0);

    while processed < total_size {
        if cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        let to_read = (total_size - processed).min(buf.len() as u64) as usize;
        let n = read_full(input, &mut buf[..to_read])
            .map_err(|e| Error::Decryption(e.into()))?;
        if n < to_read {
            return Err(Error::Decryption(format!(
                "Ciphertext ended after {} of {total_size} bytes", processed + n as u64).into()));
        }

        cipher.decrypt_in_place(&mut buf[..n])
            .map_err(|e| Error::Decryption(e.into()))?;
        output.write_all(&buf[..n])
            .map_err(|e| Error::Decryption(e.into()))?;

        processed += n as u64;
        progress.report(processed);
    }

    Ok(Outcome::Completed(()))
}

/// Decrypt `total_size` bytes of firmware ciphertext from `input` into
/// `output`. The size must be a whole number of cipher blocks; this is
/// checked before anything is written. `chunk_size` is rounded down to a
/// block multiple. The output is flushed on every exit path.
pub fn decrypt<F: FnMut(Progress)>(
    input: &mut (impl Read + ?Sized),
    output: &mut (impl Write + ?Sized),
    key: &DecryptionKey,
    total_size: u64,
    chunk_size: usize,
    cancel: &CancellationToken,
    progress: &mut ProgressReporter<F>,
) -> Result<Outcome<()>, Error> {
    let block_size = FileBlockSize::USIZE;

    if total_size % block_size as u64 != 0 {
        return Err(Error::Decryption(CryptoError::CiphertextNotAligned.into()));
    }

    let chunk_size = (chunk_size / block_size).max(1) * block_size;
    debug!("Decrypting {total_size} bytes with {} key", key.scheme);

    let cipher = FileCipher::new(&key.bytes);
    let result = decrypt_stream(input, output, &cipher, total_size, chunk_size, cancel, progress);

    finish_output(result, output, |e| Error::Decryption(e.into()))
}
