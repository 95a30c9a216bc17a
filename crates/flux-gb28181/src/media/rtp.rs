// RTP 数据包解析
// RFC 3550 - RTP: A Transport Protocol for Real-Time Applications

use bytes::Bytes;

use crate::error::{Gb28181Error, Result};

/// 固定头部长度
pub const RTP_HEADER_LEN: usize = 12;

/// RTP 头部
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// 版本（2 bits）
    pub version: u8,

    /// 填充标志（1 bit）
    pub padding: bool,

    /// 扩展标志（1 bit）
    pub extension: bool,

    /// 标记位（1 bit）
    pub marker: bool,

    /// 负载类型（7 bits）
    pub payload_type: u8,

    /// 序列号（16 bits）
    pub sequence: u16,

    /// 时间戳（32 bits）
    pub timestamp: u32,

    /// SSRC（32 bits）
    pub ssrc: u32,

    /// CSRC 列表
    pub csrc: Vec<u32>,
}

/// RTP 数据包
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub header: RtpHeader,

    /// 负载数据（GB28181 中为 PS 流），与原始缓冲区共享内存
    pub payload: Bytes,
}

impl RtpPacket {
    /// 解析 RTP 数据包
    ///
    /// 跳过 CSRC 列表和扩展头，去掉尾部填充。
    pub fn parse(data: Bytes) -> Result<Self> {
        if data.len() < RTP_HEADER_LEN {
            return Err(Gb28181Error::InvalidRtp("packet shorter than RTP header"));
        }

        let byte0 = data[0];
        let byte1 = data[1];

        let version = byte0 >> 6;
        if version != 2 {
            return Err(Gb28181Error::InvalidRtp("unsupported RTP version"));
        }

        let padding = (byte0 & 0x20) != 0;
        let extension = (byte0 & 0x10) != 0;
        let csrc_count = (byte0 & 0x0F) as usize;

        let mut offset = RTP_HEADER_LEN;
        if data.len() < offset + csrc_count * 4 {
            return Err(Gb28181Error::InvalidRtp("truncated CSRC list"));
        }
        let csrc = (0..csrc_count)
            .map(|i| {
                let at = offset + i * 4;
                u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
            })
            .collect();
        offset += csrc_count * 4;

        if extension {
            if data.len() < offset + 4 {
                return Err(Gb28181Error::InvalidRtp("truncated extension header"));
            }
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + words * 4;
            if data.len() < offset {
                return Err(Gb28181Error::InvalidRtp("truncated extension body"));
            }
        }

        let mut end = data.len();
        if padding {
            let pad = data[end - 1] as usize;
            if pad == 0 || offset + pad > end {
                return Err(Gb28181Error::InvalidRtp("invalid padding"));
            }
            end -= pad;
        }

        let header = RtpHeader {
            version,
            padding,
            extension,
            marker: (byte1 & 0x80) != 0,
            payload_type: byte1 & 0x7F,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            csrc,
        };

        Ok(Self {
            header,
            payload: data.slice(offset..end),
        })
    }

    pub fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    /// 获取序列号
    pub fn sequence(&self) -> u16 {
        self.header.sequence
    }

    /// 获取时间戳
    pub fn timestamp(&self) -> u32 {
        self.header.timestamp
    }

    pub fn is_marker(&self) -> bool {
        self.header.marker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(byte0: u8, extra: &[u8], payload: &[u8]) -> Bytes {
        let mut data = vec![
            byte0, 0xE0, // M=1, PT=96
            0x00, 0x2A, // seq 42
            0x00, 0x00, 0x0B, 0xB8, // ts 3000
            0x0B, 0xEB, 0xC2, 0x00, // ssrc 200000000
        ];
        data.extend_from_slice(extra);
        data.extend_from_slice(payload);
        Bytes::from(data)
    }

    #[test]
    fn test_parse_basic_packet() {
        let pkt = RtpPacket::parse(packet(0x80, &[], &[0x00, 0x00, 0x01, 0xBA])).unwrap();

        assert_eq!(pkt.ssrc(), 200_000_000);
        assert_eq!(pkt.sequence(), 42);
        assert_eq!(pkt.timestamp(), 3000);
        assert!(pkt.is_marker());
        assert_eq!(pkt.header.payload_type, 96);
        assert_eq!(&pkt.payload[..], &[0x00, 0x00, 0x01, 0xBA]);
    }

    #[test]
    fn test_parse_csrc_and_extension() {
        let extra = [
            0x00, 0x00, 0x00, 0x07, // csrc
            0xBE, 0xDE, 0x00, 0x01, // extension, 1 word
            0x11, 0x22, 0x33, 0x44,
        ];
        let pkt = RtpPacket::parse(packet(0x91, &extra, b"ps")).unwrap();
        assert_eq!(pkt.header.csrc, vec![7]);
        assert!(pkt.header.extension);
        assert_eq!(&pkt.payload[..], b"ps");
    }

    #[test]
    fn test_parse_padding() {
        let pkt = RtpPacket::parse(packet(0xA0, &[], &[1, 2, 3, 0, 0, 3])).unwrap();
        assert_eq!(&pkt.payload[..], &[1, 2, 3]);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(RtpPacket::parse(Bytes::from_static(&[0x80, 0x60, 0x00])).is_err());
        assert!(RtpPacket::parse(packet(0x40, &[], b"x")).is_err());
        assert!(RtpPacket::parse(packet(0x82, &[0, 0, 0, 1], &[])).is_err());
        assert!(RtpPacket::parse(packet(0x90, &[0xBE, 0xDE, 0x00, 0x05], &[])).is_err());
        assert!(RtpPacket::parse(packet(0xA0, &[], &[9])).is_err());
    }
}
