//! Transaction extra field codec
//!
//! Parses and builds the `extra` byte string carried by transactions:
//! padding, transaction public key, extra nonce (used for payment ids) and
//! the merge-mining tag written into parent-block coinbases.

use crate::{Error, Hash, Result};

/// Zero padding, must extend to the end of the field
pub const TX_EXTRA_TAG_PADDING: u8 = 0x00;
/// Transaction public key
pub const TX_EXTRA_TAG_PUBKEY: u8 = 0x01;
/// Arbitrary extra nonce
pub const TX_EXTRA_NONCE: u8 = 0x02;
/// Merge-mining tag
pub const TX_EXTRA_MERGE_MINING_TAG: u8 = 0x03;

/// Extra nonce sub-tag marking a payment id
pub const TX_EXTRA_NONCE_PAYMENT_ID: u8 = 0x00;

const TX_EXTRA_PADDING_MAX_COUNT: usize = 255;
const TX_EXTRA_NONCE_MAX_COUNT: usize = 255;

/// Merge-mining tag linking a block to an auxiliary chain header hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeMiningTag {
    pub depth: u64,
    pub merkle_root: Hash,
}

/// One parsed field of a transaction extra
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtraField {
    Padding(usize),
    PublicKey([u8; 32]),
    Nonce(Vec<u8>),
    MergeMiningTag(MergeMiningTag),
}

/// Append a LEB128 varint
pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Read a LEB128 varint starting at `*pos`, advancing it
pub fn read_varint(data: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;

    loop {
        let byte = *data
            .get(*pos)
            .ok_or_else(|| Error::payment_id("Unexpected end of varint"))?;
        *pos += 1;

        if shift >= 64 || (shift == 63 && byte > 1) {
            return Err(Error::payment_id("Varint overflow"));
        }
        value |= u64::from(byte & 0x7f) << shift;

        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn take<'a>(data: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = pos
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| Error::payment_id("Can't parse extra"))?;
    let slice = &data[*pos..end];
    *pos = end;
    Ok(slice)
}

/// Parse all fields of an extra
pub fn parse_extra(extra: &[u8]) -> Result<Vec<ExtraField>> {
    let mut fields = Vec::new();
    let mut pos = 0;

    while pos < extra.len() {
        let tag = extra[pos];
        pos += 1;

        match tag {
            TX_EXTRA_TAG_PADDING => {
                let rest = &extra[pos..];
                if rest.len() + 1 > TX_EXTRA_PADDING_MAX_COUNT || rest.iter().any(|b| *b != 0) {
                    return Err(Error::payment_id("Can't parse extra"));
                }
                fields.push(ExtraField::Padding(rest.len() + 1));
                pos = extra.len();
            }
            TX_EXTRA_TAG_PUBKEY => {
                let mut key = [0u8; 32];
                key.copy_from_slice(take(extra, &mut pos, 32)?);
                fields.push(ExtraField::PublicKey(key));
            }
            TX_EXTRA_NONCE => {
                let len = usize::from(*take(extra, &mut pos, 1)?.first().unwrap_or(&0));
                fields.push(ExtraField::Nonce(take(extra, &mut pos, len)?.to_vec()));
            }
            TX_EXTRA_MERGE_MINING_TAG => {
                let len = read_varint(extra, &mut pos)
                    .map_err(|_| Error::payment_id("Can't parse extra"))? as usize;
                let body = take(extra, &mut pos, len)?;
                let mut body_pos = 0;
                let depth = read_varint(body, &mut body_pos)
                    .map_err(|_| Error::payment_id("Can't parse extra"))?;
                let root = take(body, &mut body_pos, 32)?;
                let mut merkle_root = [0u8; 32];
                merkle_root.copy_from_slice(root);
                fields.push(ExtraField::MergeMiningTag(MergeMiningTag {
                    depth,
                    merkle_root: Hash(merkle_root),
                }));
            }
            _ => return Err(Error::payment_id("Can't parse extra")),
        }
    }

    Ok(fields)
}

/// Append a merge-mining tag field
pub fn append_merge_mining_tag(extra: &mut Vec<u8>, tag: &MergeMiningTag) -> Result<()> {
    let mut body = Vec::with_capacity(41);
    write_varint(&mut body, tag.depth);
    body.extend_from_slice(tag.merkle_root.as_bytes());

    extra.push(TX_EXTRA_MERGE_MINING_TAG);
    write_varint(extra, body.len() as u64);
    extra.extend_from_slice(&body);
    Ok(())
}

/// Find the merge-mining tag of an extra, if any
pub fn merge_mining_tag(extra: &[u8]) -> Result<Option<MergeMiningTag>> {
    Ok(parse_extra(extra)?.into_iter().find_map(|field| match field {
        ExtraField::MergeMiningTag(tag) => Some(tag),
        _ => None,
    }))
}

/// Append an extra nonce field
pub fn add_extra_nonce(extra: &mut Vec<u8>, nonce: &[u8]) -> Result<()> {
    if nonce.len() > TX_EXTRA_NONCE_MAX_COUNT {
        return Err(Error::payment_id(format!(
            "Extra nonce too long: {} bytes",
            nonce.len()
        )));
    }
    extra.push(TX_EXTRA_NONCE);
    extra.push(nonce.len() as u8);
    extra.extend_from_slice(nonce);
    Ok(())
}

/// Append a transaction public key field
pub fn add_public_key(extra: &mut Vec<u8>, key: &[u8; 32]) {
    extra.push(TX_EXTRA_TAG_PUBKEY);
    extra.extend_from_slice(key);
}

/// Build the extra nonce that carries a payment id
pub fn payment_id_nonce(payment_id: &Hash) -> Vec<u8> {
    let mut nonce = Vec::with_capacity(33);
    nonce.push(TX_EXTRA_NONCE_PAYMENT_ID);
    nonce.extend_from_slice(payment_id.as_bytes());
    nonce
}

/// Read a payment id back out of an extra nonce
pub fn payment_id_from_nonce(nonce: &[u8]) -> Option<Hash> {
    if nonce.len() != 33 || nonce[0] != TX_EXTRA_NONCE_PAYMENT_ID {
        return None;
    }
    let mut id = [0u8; 32];
    id.copy_from_slice(&nonce[1..]);
    Some(Hash(id))
}

/// Turn a user supplied payment id string into transaction extra bytes
///
/// An empty string yields an empty extra.
pub fn convert_payment_id(payment_id: &str) -> Result<Vec<u8>> {
    if payment_id.is_empty() {
        return Ok(Vec::new());
    }

    let id: Hash = payment_id.parse().map_err(|_| {
        Error::payment_id(format!(
            "Payment id has invalid format: \"{}\", expected 64-character string",
            payment_id
        ))
    })?;

    let mut extra = Vec::with_capacity(35);
    add_extra_nonce(&mut extra, &payment_id_nonce(&id))?;
    Ok(extra)
}

/// Extract the payment id (uppercase hex) from transaction extra bytes
///
/// Returns an empty string when the extra carries no payment id.
pub fn extract_payment_id(extra: &[u8]) -> Result<String> {
    let fields = parse_extra(extra)?;

    let id = fields.iter().find_map(|field| match field {
        ExtraField::Nonce(nonce) => Some(nonce),
        _ => None,
    });

    Ok(id
        .and_then(|nonce| payment_id_from_nonce(nonce))
        .map(|id| hex::encode_upper(id.as_bytes()))
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYMENT_ID: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn test_varint() {
        for value in [0u64, 1, 127, 128, 300, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            let mut pos = 0;
            assert_eq!(read_varint(&buf, &mut pos).unwrap(), value);
            assert_eq!(pos, buf.len());
        }

        let mut pos = 0;
        assert!(read_varint(&[0x80, 0x80], &mut pos).is_err());
    }

    #[test]
    fn test_convert_payment_id_layout() {
        let extra = convert_payment_id(PAYMENT_ID).unwrap();
        assert_eq!(extra.len(), 35);
        assert_eq!(&extra[..3], &[TX_EXTRA_NONCE, 33, TX_EXTRA_NONCE_PAYMENT_ID]);
        assert_eq!(hex::encode(&extra[3..]), PAYMENT_ID);
    }

    #[test]
    fn test_convert_payment_id_empty_and_invalid() {
        assert!(convert_payment_id("").unwrap().is_empty());

        let err = convert_payment_id("abc").unwrap_err();
        assert!(err.to_string().contains("Payment id has invalid format"));
    }

    #[test]
    fn test_extract_payment_id() {
        let mut extra = Vec::new();
        add_public_key(&mut extra, &[7u8; 32]);
        extra.extend(convert_payment_id(PAYMENT_ID).unwrap());

        assert_eq!(
            extract_payment_id(&extra).unwrap(),
            PAYMENT_ID.to_uppercase()
        );
    }

    #[test]
    fn test_extract_payment_id_absent_or_malformed() {
        let mut extra = Vec::new();
        add_public_key(&mut extra, &[1u8; 32]);
        assert_eq!(extract_payment_id(&extra).unwrap(), "");

        // Extra nonce that is not a payment id
        add_extra_nonce(&mut extra, &[0xaa, 0xbb]).unwrap();
        assert_eq!(extract_payment_id(&extra).unwrap(), "");

        // Truncated public key
        assert!(extract_payment_id(&[TX_EXTRA_TAG_PUBKEY, 1, 2]).is_err());
        // Unknown tag
        assert!(extract_payment_id(&[0x42]).is_err());
    }

    #[test]
    fn test_merge_mining_tag() {
        let tag = MergeMiningTag {
            depth: 0,
            merkle_root: Hash([9u8; 32]),
        };
        let mut extra = Vec::new();
        append_merge_mining_tag(&mut extra, &tag).unwrap();

        assert_eq!(extra[0], TX_EXTRA_MERGE_MINING_TAG);
        assert_eq!(merge_mining_tag(&extra).unwrap(), Some(tag));
    }

    #[test]
    fn test_padding() {
        let fields = parse_extra(&[TX_EXTRA_TAG_PADDING, 0, 0, 0]).unwrap();
        assert_eq!(fields, vec![ExtraField::Padding(4)]);
        assert!(parse_extra(&[TX_EXTRA_TAG_PADDING, 0, 1]).is_err());
    }
}
