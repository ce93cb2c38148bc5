use byteorder::{BigEndian, ByteOrder};

fn sum_big_endian_words(bs: &[u8]) -> u32 {
    let mut data = bs;
    let mut sum = 0u32;
    // Iterate by word which is two bytes.
    while data.len() >= 2 {
        sum = sum.wrapping_add(BigEndian::read_u16(&data[0..2]) as u32);
        data = &data[2..];
    }

    if let Some(&last) = data.first() {
        // Odd length: the trailing byte is padded with a zero byte.
        sum = sum.wrapping_add((last as u32) << 8);
    }
    sum
}

/// Internet checksum (RFC 1071) over `bytes`.
///
/// The result is meant to be stored big-endian in the checksum field.
pub fn checksum(bytes: &[u8]) -> u16 {
    let mut sum = sum_big_endian_words(bytes);

    // handle the carry
    while sum >> 16 != 0 {
        sum = (sum >> 16) + (sum & 0xFFFF);
    }
    !sum as u16
}

/// True when `bytes` already carries a correct checksum field.
pub fn verify(bytes: &[u8]) -> bool {
    checksum(bytes) == 0
}
