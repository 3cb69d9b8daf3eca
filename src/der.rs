//! Canonical form of DER-encoded distinguished names.
//!
//! Issuer attributes are matched on normalized content: the outer SEQUENCE
//! header is dropped and every string attribute value is re-encoded as a
//! UTF8String with surrounding whitespace trimmed, inner whitespace runs
//! collapsed to a single space and letters upper-cased. Non-string values are
//! copied through untouched.

use crate::error::{Error, Result};

const TAG_SEQUENCE: u8 = 0x30;
const TAG_SET: u8 = 0x31;
const TAG_UTF8_STRING: u8 = 0x0c;
const TAG_PRINTABLE_STRING: u8 = 0x13;
const TAG_T61_STRING: u8 = 0x14;
const TAG_IA5_STRING: u8 = 0x16;
const TAG_BMP_STRING: u8 = 0x1e;

/// Whether `bytes` starts with a top-level SEQUENCE.
#[must_use]
pub fn is_sequence(bytes: &[u8]) -> bool {
    bytes.first() == Some(&TAG_SEQUENCE)
}

struct Tlv<'a> {
    tag: u8,
    content: &'a [u8],
    raw: &'a [u8],
}

fn read_tlv(input: &[u8]) -> Result<(Tlv<'_>, &[u8])> {
    let (&tag, rest) = input
        .split_first()
        .ok_or_else(|| Error::decode("truncated DER tag"))?;
    let (&first, mut rest) = rest
        .split_first()
        .ok_or_else(|| Error::decode("truncated DER length"))?;
    let len = if first < 0x80 {
        usize::from(first)
    } else {
        let count = usize::from(first & 0x7f);
        if count == 0 || count > 4 || rest.len() < count {
            return Err(Error::decode("unsupported DER length encoding"));
        }
        let (len_bytes, tail) = rest.split_at(count);
        rest = tail;
        len_bytes
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | usize::from(b))
    };
    if rest.len() < len {
        return Err(Error::decode("DER content shorter than its length"));
    }
    let header_len = input.len() - rest.len();
    let (content, tail) = rest.split_at(len);
    Ok((
        Tlv {
            tag,
            content,
            raw: &input[..header_len + len],
        },
        tail,
    ))
}

fn write_tlv(out: &mut Vec<u8>, tag: u8, content: &[u8]) {
    out.push(tag);
    let len = content.len();
    if len < 0x80 {
        #[allow(clippy::cast_possible_truncation)]
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        let significant = &bytes[skip..];
        #[allow(clippy::cast_possible_truncation)]
        out.push(0x80 | significant.len() as u8);
        out.extend_from_slice(significant);
    }
    out.extend_from_slice(content);
}

fn decode_string(tag: u8, content: &[u8]) -> Option<String> {
    match tag {
        TAG_UTF8_STRING | TAG_PRINTABLE_STRING | TAG_IA5_STRING => {
            String::from_utf8(content.to_vec()).ok()
        }
        // Latin-1 is the practical reading of T61 in certificates.
        TAG_T61_STRING => Some(content.iter().map(|&b| char::from(b)).collect()),
        TAG_BMP_STRING => {
            if content.len() % 2 != 0 {
                return None;
            }
            let units: Vec<u16> = content
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16(&units).ok()
        }
        _ => None,
    }
}

fn canonical_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

fn normalize_attribute(atv: &[u8]) -> Result<Vec<u8>> {
    let (oid, rest) = read_tlv(atv)?;
    let (value, _) = read_tlv(rest)?;
    let mut body = oid.raw.to_vec();
    match decode_string(value.tag, value.content) {
        Some(text) => write_tlv(&mut body, TAG_UTF8_STRING, canonical_text(&text).as_bytes()),
        None => body.extend_from_slice(value.raw),
    }
    let mut out = Vec::with_capacity(body.len() + 4);
    write_tlv(&mut out, TAG_SEQUENCE, &body);
    Ok(out)
}

/// Normalize a DER-encoded name into its canonical content form.
///
/// # Errors
///
/// Returns a `Decode` error if `name` is not a well-formed Name.
pub fn normalize_name(name: &[u8]) -> Result<Vec<u8>> {
    let (outer, trailing) = read_tlv(name)?;
    if outer.tag != TAG_SEQUENCE || !trailing.is_empty() {
        return Err(Error::decode("name is not a single SEQUENCE"));
    }
    let mut out = Vec::with_capacity(name.len());
    let mut rdns = outer.content;
    while !rdns.is_empty() {
        let (rdn, rest) = read_tlv(rdns)?;
        if rdn.tag != TAG_SET {
            return Err(Error::decode("relative distinguished name is not a SET"));
        }
        let mut set_body = Vec::with_capacity(rdn.content.len());
        let mut atvs = rdn.content;
        while !atvs.is_empty() {
            let (atv, more) = read_tlv(atvs)?;
            if atv.tag != TAG_SEQUENCE {
                return Err(Error::decode("attribute is not a SEQUENCE"));
            }
            set_body.extend(normalize_attribute(atv.content)?);
            atvs = more;
        }
        write_tlv(&mut out, TAG_SET, &set_body);
        rdns = rest;
    }
    Ok(out)
}
