//! Frame encoding for the bootloader wire format
//!
//! Every function here is pure, failing only when handed input the
//! protocol cannot express.

use crate::protocol::{
    EraseTarget, EXT_ERASE_BANK1, EXT_ERASE_BANK2, EXT_ERASE_GLOBAL, EXT_ERASE_RESERVED,
    MAX_CHUNK, MAX_LEGACY_SECTORS,
};

/// Caller misuse detected before anything was sent
#[derive(Copy, Clone, Debug, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct Violation(pub &'static str);

/// Encode a single byte for transmission
#[inline]
pub fn encode_byte(v: u8) -> u8 {
    v
}

/// Command selection checksum, sent directly after the opcode
#[inline]
pub fn control_byte(opcode: u8) -> u8 {
    !opcode
}

/// Address as four big-endian bytes followed by their XOR
pub fn encode_address(addr: u32) -> [u8; 5] {
    let b = addr.to_be_bytes();
    [b[0], b[1], b[2], b[3], b[0] ^ b[1] ^ b[2] ^ b[3]]
}

/// Reassemble an encoded address, `None` if the checksum doesn't match
pub fn decode_address(data: &[u8; 5]) -> Option<u32> {
    if running_xor_checksum(&data[..4], 0) != data[4] {
        return None;
    }
    Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

/// Count byte followed by its complement
pub fn encode_length_prefixed(n_minus_1: u8) -> [u8; 2] {
    [n_minus_1, n_minus_1 ^ 0xFF]
}

/// XOR of `seed` with every byte in `data`
pub fn running_xor_checksum(data: &[u8], seed: u8) -> u8 {
    data.iter().fold(seed, |acc, b| acc ^ b)
}

/// `len - 1` as transmitted for a 1..=256 byte transaction
fn chunk_len(len: usize) -> Result<u8, Violation> {
    match len {
        0 => Err(Violation("transaction length must be at least one byte")),
        n if n > MAX_CHUNK => Err(Violation("transaction length exceeds 256 bytes")),
        n => Ok((n - 1) as u8),
    }
}

/// Length request for a ReadMemory transaction
pub fn encode_read_length(len: usize) -> Result<[u8; 2], Violation> {
    chunk_len(len).map(encode_length_prefixed)
}

/// Data block for a WriteMemory transaction: `len - 1`, data, checksum
pub fn encode_write_block(data: &[u8]) -> Result<Vec<u8>, Violation> {
    let n = chunk_len(data.len())?;

    let mut block = Vec::with_capacity(data.len() + 2);
    block.push(n);
    block.extend(data.iter().map(|b| encode_byte(*b)));
    block.push(running_xor_checksum(data, n));

    Ok(block)
}

/// Single byte sector list used by legacy erase and write protect
pub fn encode_sector_list(sectors: &[u16]) -> Result<Vec<u8>, Violation> {
    if sectors.is_empty() {
        return Err(Violation("sector list is empty"));
    }
    if sectors.len() > MAX_LEGACY_SECTORS {
        return Err(Violation("sector list exceeds 255 entries"));
    }

    let n = (sectors.len() - 1) as u8;
    let mut frame = Vec::with_capacity(sectors.len() + 2);
    frame.push(n);
    for s in sectors {
        if *s > 0xFF {
            return Err(Violation("sector number does not fit in a single byte"));
        }
        frame.push(*s as u8);
    }
    frame.push(running_xor_checksum(&frame[1..], n));

    Ok(frame)
}

/// Payload for the legacy (0x43) erase command
pub fn encode_legacy_erase(target: &EraseTarget) -> Result<Vec<u8>, Violation> {
    match target {
        EraseTarget::Global => Ok(vec![0xFF, 0x00]),
        EraseTarget::Sectors(s) => encode_sector_list(s),
        EraseTarget::Bank1 | EraseTarget::Bank2 => {
            Err(Violation("bank erase requires extended erase"))
        }
    }
}

/// Payload for the extended (0x44) erase command
///
/// Special erases send the two byte code and its checksum, sector
/// erases send `N - 1`, N sector numbers, then the XOR of everything.
pub fn encode_extended_erase(target: &EraseTarget) -> Result<Vec<u8>, Violation> {
    let mut frame = match target {
        EraseTarget::Global => EXT_ERASE_GLOBAL.to_be_bytes().to_vec(),
        EraseTarget::Bank1 => EXT_ERASE_BANK1.to_be_bytes().to_vec(),
        EraseTarget::Bank2 => EXT_ERASE_BANK2.to_be_bytes().to_vec(),
        EraseTarget::Sectors(sectors) => {
            if sectors.is_empty() {
                return Err(Violation("sector list is empty"));
            }
            if sectors.len() >= EXT_ERASE_RESERVED as usize {
                return Err(Violation("sector list too long for extended erase"));
            }

            let mut frame = Vec::with_capacity(sectors.len() * 2 + 3);
            frame.extend_from_slice(&((sectors.len() - 1) as u16).to_be_bytes());
            for s in sectors {
                if *s >= EXT_ERASE_RESERVED {
                    return Err(Violation("sector number collides with a special erase code"));
                }
                frame.extend_from_slice(&s.to_be_bytes());
            }
            frame
        }
    };

    frame.push(running_xor_checksum(&frame, 0));
    Ok(frame)
}
