//! Subsample and pattern decryption of a single sample.
use crate::cipher::{provider_for, CipherProvider};
use crate::crypto_info::CryptoInfo;
use crate::error::{Error, ParseError, Result};
use crate::scheme::{CbcBoundary, CipherMode, Pattern, BLOCK_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Decrypt,
    Encrypt,
}

/// Key and conventions used to process one sample.
#[derive(Clone, Copy)]
pub struct SampleKey<'a> {
    pub key: &'a [u8],
    pub boundary: CbcBoundary,
}

struct RunState {
    ctr_offset: u64,
    cbc_iv: [u8; 16],
}

/// Decrypt `input` into the caller's `output` buffer.
///
/// Writes exactly `info.data_length` bytes and returns that count. Clear
/// samples are copied unchanged. Nothing is allocated and `output` is not
/// retained.
pub fn decrypt_sample(
    info: &CryptoInfo,
    key: SampleKey<'_>,
    input: &[u8],
    output: &mut [u8],
) -> Result<usize> {
    transform(Direction::Decrypt, info, key, input, output)
}

/// Encrypt a clear sample following the same subsample and pattern layout.
///
/// Packagers and test fixtures use this to produce protected samples.
pub fn encrypt_sample(
    info: &CryptoInfo,
    key: SampleKey<'_>,
    input: &[u8],
    output: &mut [u8],
) -> Result<usize> {
    transform(Direction::Encrypt, info, key, input, output)
}

fn transform(
    direction: Direction,
    info: &CryptoInfo,
    key: SampleKey<'_>,
    input: &[u8],
    output: &mut [u8],
) -> Result<usize> {
    let len = info.data_length;
    if input.len() < len {
        return Err(ParseError::Truncated {
            needed: len,
            available: input.len(),
        }
        .into());
    }
    if output.len() < len {
        return Err(Error::BufferTooSmall {
            needed: len,
            available: output.len(),
        });
    }
    info.validate()?;

    let out = &mut output[..len];
    out.copy_from_slice(&input[..len]);

    let Some(key_type) = info.mode.key_type() else {
        return Ok(len);
    };
    let provider = provider_for(key_type);

    let mut state = RunState {
        ctr_offset: 0,
        cbc_iv: info.iv,
    };
    let mut pos = 0usize;
    for run in info.runs() {
        pos += run.clear_bytes as usize;
        let end = pos + run.encrypted_bytes as usize;
        if key.boundary == CbcBoundary::Subsample {
            state.cbc_iv = info.iv;
        }
        apply_run(
            direction,
            provider,
            info,
            key.key,
            &mut out[pos..end],
            &mut state,
        )?;
        pos = end;
    }

    Ok(len)
}

fn apply_run(
    direction: Direction,
    provider: &dyn CipherProvider,
    info: &CryptoInfo,
    key: &[u8],
    run: &mut [u8],
    state: &mut RunState,
) -> Result<()> {
    let pattern = match info.pattern {
        Some(pattern) if pattern.is_passthrough() => return Ok(()),
        Some(pattern) if !pattern.is_full() => pattern,
        _ => return apply_span(direction, provider, info, key, run, state),
    };

    let Pattern {
        encrypted_blocks,
        clear_blocks,
    } = pattern;
    let crypt = encrypted_blocks as usize * BLOCK_SIZE;
    let skip = clear_blocks as usize * BLOCK_SIZE;

    let mut off = 0usize;
    loop {
        let remaining = run.len() - off;
        if remaining == 0 {
            break;
        }
        // A trailing partial block is never skipped.
        if remaining < BLOCK_SIZE {
            apply_span(direction, provider, info, key, &mut run[off..], state)?;
            break;
        }
        let n = crypt.min(remaining);
        apply_span(direction, provider, info, key, &mut run[off..off + n], state)?;
        off += n;

        let remaining = run.len() - off;
        if remaining < BLOCK_SIZE {
            continue;
        }
        off += skip.min(remaining - remaining % BLOCK_SIZE);
    }
    Ok(())
}

fn apply_span(
    direction: Direction,
    provider: &dyn CipherProvider,
    info: &CryptoInfo,
    key: &[u8],
    span: &mut [u8],
    state: &mut RunState,
) -> Result<()> {
    if span.is_empty() {
        return Ok(());
    }
    match info.mode {
        CipherMode::AesCtr | CipherMode::Sm4Ctr => {
            provider.ctr_apply(key, &info.iv, state.ctr_offset, span)?;
            state.ctr_offset += span.len() as u64;
        }
        CipherMode::AesCbc | CipherMode::Sm4Cbc => {
            // CBC only covers whole blocks; a partial tail stays as it is.
            let whole = span.len() - span.len() % BLOCK_SIZE;
            if whole > 0 {
                let blocks = &mut span[..whole];
                state.cbc_iv = match direction {
                    Direction::Decrypt => provider.cbc_decrypt(key, &state.cbc_iv, blocks)?,
                    Direction::Encrypt => provider.cbc_encrypt(key, &state.cbc_iv, blocks)?,
                };
            }
        }
        CipherMode::Unencrypted => {}
    }
    Ok(())
}
