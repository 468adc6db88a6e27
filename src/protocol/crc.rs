use crc::Crc;

/// IEEE CRC-32 over a packet's payload, i.e. everything after the six byte frame header.
///
/// The value travels on the wire as the little-endian bytes of this u32 at offset 2 of the
///  frame header.
pub fn payload_checksum(payload: &[u8]) -> u32 {
    let hasher = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
    let mut digest = hasher.digest();
    digest.update(payload);
    digest.finalize()
}
