//! Per-sample encryption metadata and its inline header.
//!
//! Every access unit starts with a small big-endian header describing how
//! the payload that follows is protected:
//!
//! ```text
//! flags            u8       0x01 encrypted, 0x02 subsamples, 0x04 pattern, 0x08 iv
//! cipher mode      u8       0 none, 1 aes-ctr, 2 aes-cbc, 3 sm4-ctr, 4 sm4-cbc
//! key id           [u8;16]  when encrypted
//! iv size, iv      u8, n    when the iv flag is set (8 or 16 bytes)
//! pattern          u8       when the pattern flag is set (crypt << 4 | skip)
//! subsample count  u16      when the subsample flag is set
//!   clear, cipher  u16, u32 repeated `count` times
//! payload          ...
//! ```
use byteorder::{BigEndian, ByteOrder};
use uuid::Uuid;

use crate::error::ParseError;
use crate::scheme::{CipherMode, DrmScheme, Pattern};

pub const FLAG_ENCRYPTED: u8 = 0x01;
pub const FLAG_SUBSAMPLES: u8 = 0x02;
pub const FLAG_PATTERN: u8 = 0x04;
pub const FLAG_IV: u8 = 0x08;

const SUBSAMPLE_ENTRY_SIZE: usize = 6;

/// One clear run followed by one encrypted run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Subsample {
    pub clear_bytes: u32,
    pub encrypted_bytes: u32,
}

impl Subsample {
    pub fn new(clear_bytes: u32, encrypted_bytes: u32) -> Self {
        Self {
            clear_bytes,
            encrypted_bytes,
        }
    }

    /// Total bytes covered by this entry.
    pub fn total(&self) -> usize {
        self.clear_bytes as usize + self.encrypted_bytes as usize
    }
}

/// Encryption metadata for one sample.
///
/// An empty subsample table means the whole payload is a single encrypted
/// run in the signalled mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoInfo {
    pub data_length: usize,
    pub mode: CipherMode,
    pub key_id: Uuid,
    pub iv: [u8; 16],
    pub pattern: Option<Pattern>,
    pub subsamples: Vec<Subsample>,
}

impl CryptoInfo {
    /// Metadata for a clear sample.
    pub fn unencrypted(data_length: usize) -> Self {
        Self {
            data_length,
            mode: CipherMode::Unencrypted,
            key_id: Uuid::nil(),
            iv: [0u8; 16],
            pattern: None,
            subsamples: Vec::new(),
        }
    }

    /// Metadata for an encrypted sample covered by a single run.
    pub fn encrypted(data_length: usize, mode: CipherMode, key_id: Uuid, iv: [u8; 16]) -> Self {
        Self {
            data_length,
            mode,
            key_id,
            iv,
            pattern: None,
            subsamples: Vec::new(),
        }
    }

    /// Attach a subsample table built from parallel clear/encrypted run lists.
    pub fn with_runs(mut self, clear: &[u32], encrypted: &[u32]) -> Result<Self, ParseError> {
        if clear.len() != encrypted.len() {
            return Err(ParseError::MalformedSubsampleTable(format!(
                "{} clear runs but {} encrypted runs",
                clear.len(),
                encrypted.len()
            )));
        }
        self.subsamples = clear
            .iter()
            .zip(encrypted)
            .map(|(&c, &e)| Subsample::new(c, e))
            .collect();
        self.validate()?;
        Ok(self)
    }

    pub fn with_pattern(mut self, pattern: Pattern) -> Self {
        self.pattern = Some(pattern);
        self
    }

    pub fn is_encrypted(&self) -> bool {
        self.mode.is_encrypted()
    }

    pub fn num_subsamples(&self) -> usize {
        self.subsamples.len()
    }

    /// Runs to process: the table, or one run spanning the payload.
    pub fn runs(&self) -> impl Iterator<Item = Subsample> + '_ {
        let whole = self
            .subsamples
            .is_empty()
            .then(|| Subsample::new(0, self.data_length as u32));
        whole.into_iter().chain(self.subsamples.iter().copied())
    }

    /// Check that the subsample table covers exactly `data_length` bytes.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.subsamples.is_empty() {
            if self.data_length > u32::MAX as usize {
                return Err(ParseError::MalformedSubsampleTable(
                    "payload too large for a single run".to_string(),
                ));
            }
            return Ok(());
        }
        let covered: usize = self.subsamples.iter().map(Subsample::total).sum();
        if covered != self.data_length {
            return Err(ParseError::MalformedSubsampleTable(format!(
                "runs cover {} bytes, payload has {}",
                covered, self.data_length
            )));
        }
        Ok(())
    }

    /// Serialize the inline header for this sample (packager side).
    ///
    /// The IV is always written as 16 bytes and the pattern only when set.
    /// Fails when the table or pattern does not fit the header fields.
    pub fn write_header(&self, out: &mut Vec<u8>) -> Result<(), ParseError> {
        let mut flags = 0u8;
        if self.is_encrypted() {
            flags |= FLAG_ENCRYPTED | FLAG_IV;
            if self.pattern.is_some() {
                flags |= FLAG_PATTERN;
            }
            if !self.subsamples.is_empty() {
                flags |= FLAG_SUBSAMPLES;
            }
        }
        out.push(flags);
        out.push(self.mode as u8);
        if !self.is_encrypted() {
            return Ok(());
        }
        out.extend_from_slice(self.key_id.as_bytes());
        out.push(16);
        out.extend_from_slice(&self.iv);
        if let Some(pattern) = self.pattern {
            let byte = pattern.to_byte().ok_or_else(|| {
                ParseError::MalformedHeader(format!(
                    "pattern {}:{} does not fit in nibbles",
                    pattern.encrypted_blocks, pattern.clear_blocks
                ))
            })?;
            out.push(byte);
        }
        if !self.subsamples.is_empty() {
            let count = u16::try_from(self.subsamples.len()).map_err(|_| {
                ParseError::MalformedSubsampleTable(format!(
                    "{} subsamples exceed the header limit",
                    self.subsamples.len()
                ))
            })?;
            let mut buf = [0u8; 4];
            BigEndian::write_u16(&mut buf[..2], count);
            out.extend_from_slice(&buf[..2]);
            for subsample in &self.subsamples {
                let clear = u16::try_from(subsample.clear_bytes).map_err(|_| {
                    ParseError::MalformedSubsampleTable(format!(
                        "clear run of {} bytes exceeds the header limit",
                        subsample.clear_bytes
                    ))
                })?;
                BigEndian::write_u16(&mut buf[..2], clear);
                out.extend_from_slice(&buf[..2]);
                BigEndian::write_u32(&mut buf, subsample.encrypted_bytes);
                out.extend_from_slice(&buf);
            }
        }
        Ok(())
    }
}

/// Session-provided context for decoding a header.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseContext {
    /// Scheme deciding the default pattern.
    pub scheme: DrmScheme,
    /// IV used when the unit does not carry one (offline key material).
    pub constant_iv: Option<[u8; 16]>,
}

/// A decoded access unit: metadata plus the payload it describes.
#[derive(Debug, Clone)]
pub struct AccessUnit<'a> {
    pub info: CryptoInfo,
    pub payload: &'a [u8],
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(ParseError::Truncated {
                needed: end,
                available: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ParseError> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    fn u32(&mut self) -> Result<u32, ParseError> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

/// Decode the inline encryption header of `raw`.
///
/// A failure only concerns this unit; callers drop or pass it through and
/// carry on with the next one.
pub fn parse_unit<'a>(raw: &'a [u8], ctx: &ParseContext) -> Result<AccessUnit<'a>, ParseError> {
    let mut reader = Reader { data: raw, pos: 0 };
    let flags = reader.u8()?;
    let mode = CipherMode::try_from(reader.u8()?)?;
    let encrypted = flags & FLAG_ENCRYPTED != 0;

    if !encrypted {
        if mode.is_encrypted() {
            return Err(ParseError::MalformedHeader(format!(
                "cipher mode {} on a clear unit",
                mode
            )));
        }
        let payload = reader.rest();
        return Ok(AccessUnit {
            info: CryptoInfo::unencrypted(payload.len()),
            payload,
        });
    }
    if !mode.is_encrypted() {
        return Err(ParseError::MalformedHeader(
            "encryption flag set without a cipher mode".to_string(),
        ));
    }

    let key_id = Uuid::from_slice(reader.take(16)?).unwrap_or_else(|_| Uuid::nil());

    let iv = if flags & FLAG_IV != 0 {
        let size = reader.u8()?;
        if size != 8 && size != 16 {
            return Err(ParseError::InvalidIvSize(size));
        }
        let mut iv = [0u8; 16];
        iv[..size as usize].copy_from_slice(reader.take(size as usize)?);
        iv
    } else {
        ctx.constant_iv.ok_or(ParseError::MissingIv)?
    };

    let pattern = if flags & FLAG_PATTERN != 0 {
        Some(Pattern::from_byte(reader.u8()?))
    } else {
        ctx.scheme.default_pattern(mode)
    };

    let mut subsamples = Vec::new();
    if flags & FLAG_SUBSAMPLES != 0 {
        let count = reader.u16()? as usize;
        if reader.rest().len() < count * SUBSAMPLE_ENTRY_SIZE {
            return Err(ParseError::MalformedSubsampleTable(format!(
                "{} entries do not fit in {} remaining bytes",
                count,
                reader.rest().len()
            )));
        }
        subsamples.reserve(count);
        for _ in 0..count {
            let clear = reader.u16()? as u32;
            let cipher = reader.u32()?;
            subsamples.push(Subsample::new(clear, cipher));
        }
    }

    let payload = reader.rest();
    let info = CryptoInfo {
        data_length: payload.len(),
        mode,
        key_id,
        iv,
        pattern,
        subsamples,
    };
    info.validate()?;
    Ok(AccessUnit { info, payload })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const KID: Uuid = Uuid::from_u128(0x0102030405060708090a0b0c0d0e0f10);

    fn unit(info: &CryptoInfo, payload: &[u8]) -> Vec<u8> {
        let mut raw = Vec::new();
        info.write_header(&mut raw).unwrap();
        raw.extend_from_slice(payload);
        raw
    }

    #[test]
    fn clear_unit_is_not_encrypted() {
        let raw = [0u8, 0, 0xAA, 0xBB, 0xCC];
        let unit = parse_unit(&raw, &ParseContext::default()).unwrap();
        assert!(!unit.info.is_encrypted());
        assert_eq!(unit.info.data_length, 3);
        assert_eq!(unit.payload, &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn subsample_table_is_decoded() {
        let info = CryptoInfo::encrypted(30, CipherMode::AesCtr, KID, [7u8; 16])
            .with_runs(&[4, 2], &[20, 4])
            .unwrap();
        let raw = unit(&info, &[0u8; 30]);

        let parsed = parse_unit(&raw, &ParseContext::default()).unwrap();
        assert_eq!(parsed.info, info);
        assert_eq!(parsed.payload.len(), 30);
        assert_eq!(parsed.info.num_subsamples(), 2);
    }

    #[test]
    fn missing_iv_without_constant_iv() {
        let raw = unit(&CryptoInfo::encrypted(4, CipherMode::AesCtr, KID, [0u8; 16]), &[1, 2, 3, 4]);
        // Drop the IV flag and the IV bytes from the header.
        let mut stripped = vec![FLAG_ENCRYPTED, CipherMode::AesCtr as u8];
        stripped.extend_from_slice(KID.as_bytes());
        stripped.extend_from_slice(&raw[raw.len() - 4..]);

        let err = parse_unit(&stripped, &ParseContext::default()).unwrap_err();
        assert_eq!(err, ParseError::MissingIv);

        let ctx = ParseContext {
            constant_iv: Some([9u8; 16]),
            ..Default::default()
        };
        let parsed = parse_unit(&stripped, &ctx).unwrap();
        assert_eq!(parsed.info.iv, [9u8; 16]);
    }

    #[test]
    fn eight_byte_iv_is_zero_padded() {
        let mut raw = vec![FLAG_ENCRYPTED | FLAG_IV, CipherMode::AesCtr as u8];
        raw.extend_from_slice(KID.as_bytes());
        raw.push(8);
        raw.extend_from_slice(&[0x11; 8]);
        raw.extend_from_slice(&[0u8; 5]);

        let parsed = parse_unit(&raw, &ParseContext::default()).unwrap();
        assert_eq!(&parsed.info.iv[..8], &[0x11; 8]);
        assert_eq!(&parsed.info.iv[8..], &[0u8; 8]);
        assert_eq!(parsed.info.data_length, 5);
    }

    #[test]
    fn scheme_default_pattern_applies() {
        let info = CryptoInfo::encrypted(32, CipherMode::Sm4Cbc, KID, [0u8; 16]);
        let raw = unit(&info, &[0u8; 32]);
        let ctx = ParseContext {
            scheme: DrmScheme::ChinaDrm,
            constant_iv: None,
        };
        let parsed = parse_unit(&raw, &ctx).unwrap();
        assert_eq!(parsed.info.pattern, Some(Pattern::new(1, 9)));
    }

    #[test]
    fn runs_cover_the_payload() {
        let whole = CryptoInfo::encrypted(48, CipherMode::AesCtr, KID, [0u8; 16]);
        assert_eq!(whole.runs().collect::<Vec<_>>(), [Subsample::new(0, 48)]);

        let table = whole.with_runs(&[8, 0], &[32, 8]).unwrap();
        let runs: Vec<_> = table.runs().collect();
        assert_eq!(runs, table.subsamples);
    }

    #[test]
    fn oversized_header_fields_are_rejected() {
        let info = CryptoInfo::encrypted(70_016, CipherMode::AesCtr, KID, [0u8; 16])
            .with_runs(&[70_000], &[16])
            .unwrap();
        let err = info.write_header(&mut Vec::new()).unwrap_err();
        assert!(matches!(err, ParseError::MalformedSubsampleTable(_)));

        let info = CryptoInfo::encrypted(65_551, CipherMode::AesCtr, KID, [0u8; 16])
            .with_runs(&[65_535], &[16])
            .unwrap();
        let raw = unit(&info, &vec![0u8; 65_551]);
        let parsed = parse_unit(&raw, &ParseContext::default()).unwrap();
        assert_eq!(parsed.info.subsamples, info.subsamples);

        let info = CryptoInfo::encrypted(32, CipherMode::AesCbc, KID, [0u8; 16])
            .with_pattern(Pattern::new(16, 0));
        let err = info.write_header(&mut Vec::new()).unwrap_err();
        assert!(matches!(err, ParseError::MalformedHeader(_)));
    }

    #[rstest]
    #[case::short_runs(&[4], &[10], 30)]
    #[case::long_runs(&[4, 4], &[20, 10], 30)]
    fn mismatched_table_is_rejected(
        #[case] clear: &[u32],
        #[case] encrypted: &[u32],
        #[case] payload_len: usize,
    ) {
        let mut info = CryptoInfo::encrypted(payload_len, CipherMode::AesCtr, KID, [0u8; 16]);
        info.subsamples = clear
            .iter()
            .zip(encrypted)
            .map(|(&c, &e)| Subsample::new(c, e))
            .collect();
        let raw = unit(&info, &vec![0u8; payload_len]);

        let err = parse_unit(&raw, &ParseContext::default()).unwrap_err();
        assert!(matches!(err, ParseError::MalformedSubsampleTable(_)));
    }

    #[test]
    fn unequal_run_lists_are_rejected() {
        let err = CryptoInfo::encrypted(10, CipherMode::AesCtr, KID, [0u8; 16])
            .with_runs(&[1, 2], &[7])
            .unwrap_err();
        assert!(matches!(err, ParseError::MalformedSubsampleTable(_)));
    }

    #[rstest]
    #[case::empty(&[])]
    #[case::no_mode(&[0x00])]
    #[case::short_key_id(&[FLAG_ENCRYPTED | FLAG_IV, 1, 0xAA, 0xBB])]
    fn truncated_headers(#[case] raw: &[u8]) {
        let err = parse_unit(raw, &ParseContext::default()).unwrap_err();
        assert!(matches!(err, ParseError::Truncated { .. }));
    }

    #[test]
    fn encrypted_flag_requires_mode() {
        let err = parse_unit(&[FLAG_ENCRYPTED, 0], &ParseContext::default()).unwrap_err();
        assert!(matches!(err, ParseError::MalformedHeader(_)));
    }
}
