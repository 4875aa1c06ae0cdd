//! The 20-byte coded-protocol header carried at the front of every UDP
//! payload (§6). Big-endian on the wire, as is conventional for this kind
//! of framing header.

pub const HEADER_LEN: usize = 20;
pub const PROTOCOL_OVERHEAD: usize = HEADER_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacType {
    Raw = 0,
    Coded = 1,
}

#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    pub flow_id: u64,
    pub file_id: u32,
    pub batch_id: u32,
    pub pac_num: u16,
    pub pac_type: PacType,
}

impl PacketHeader {
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let flow_id = u64::from_be_bytes(buf[0..8].try_into().ok()?);
        let file_id = u32::from_be_bytes(buf[8..12].try_into().ok()?);
        let batch_id = u32::from_be_bytes(buf[12..16].try_into().ok()?);
        let pac_num = u16::from_be_bytes(buf[16..18].try_into().ok()?);
        let pac_type = match buf[18] {
            0 => PacType::Raw,
            1 => PacType::Coded,
            other => {
                tracing::warn!("unknown pac_type {other} in wire header");
                return None;
            }
        };
        Some(PacketHeader {
            flow_id,
            file_id,
            batch_id,
            pac_num,
            pac_type,
        })
    }

    /// Writes the header (host-to-network) into the first [`HEADER_LEN`]
    /// bytes of `buf`.
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_LEN);
        buf[0..8].copy_from_slice(&self.flow_id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.file_id.to_be_bytes());
        buf[12..16].copy_from_slice(&self.batch_id.to_be_bytes());
        buf[16..18].copy_from_slice(&self.pac_num.to_be_bytes());
        buf[18] = self.pac_type as u8;
        buf[19] = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_header() {
        let header = PacketHeader {
            flow_id: 0xdead_beef_cafe_babe,
            file_id: 7,
            batch_id: 42,
            pac_num: 3,
            pac_type: PacType::Coded,
        };
        let mut buf = [0u8; HEADER_LEN];
        header.encode_into(&mut buf);

        let decoded = PacketHeader::decode(&buf).unwrap();
        assert_eq!(decoded.flow_id, header.flow_id);
        assert_eq!(decoded.file_id, header.file_id);
        assert_eq!(decoded.batch_id, header.batch_id);
        assert_eq!(decoded.pac_num, header.pac_num);
        assert_eq!(decoded.pac_type, PacType::Coded);
    }

    #[test]
    fn decode_rejects_short_buffer() {
        assert!(PacketHeader::decode(&[0u8; 10]).is_none());
    }
}
