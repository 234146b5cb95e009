//! 세그먼트 와이어 포맷
//!
//! 모든 데이터그램은 고정 크기 헤더 + 페이로드로 구성된 [`Segment`] 하나다.
//! 정수는 모두 big-endian.
//!
//! ```text
//!  0               1               2               3
//! +---------------+---------------+---------------+---------------+
//! |         Magic (0x4D44)        |    Version    |     Flags     |
//! +---------------+---------------+---------------+---------------+
//! |                        Sequence Number                        |
//! +---------------+---------------+---------------+---------------+
//! |                  Cumulative Acknowledgment                    |
//! +---------------+---------------+---------------+---------------+
//! |                  Receive Window (bytes free)                  |
//! +---------------+---------------+---------------+---------------+
//! |                     Selective ACK bitmap                      |
//! +---------------+---------------+---------------+---------------+
//! |        Payload Length         |          CRC32 ...            |
//! +---------------+---------------+---------------+---------------+
//! |        ... CRC32              |          Payload ...          |
//! +---------------+---------------+---------------+---------------+
//! ```
//!
//! CRC32는 체크섬 필드를 0으로 둔 헤더와 페이로드 전체에 대해 계산한다.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::{Result, MAGIC_NUMBER, PROTOCOL_VERSION};

/// 세그먼트 시퀀스 번호 (u32, wrap-around)
pub type SeqNo = u32;

/// 헤더 플래그 비트
pub mod flags {
    /// 핸드쉐이크 (rendezvous)
    pub const SYN: u8 = 0b0000_0001;
    /// ack / window / sack 필드 유효
    pub const ACK: u8 = 0b0000_0010;
    /// 애플리케이션 데이터 포함
    pub const DATA: u8 = 0b0000_0100;
    /// 송신 종료
    pub const FIN: u8 = 0b0000_1000;

    pub(crate) const ALL: u8 = SYN | ACK | DATA | FIN;
}

/// 고정 헤더 크기 (바이트)
pub const HEADER_LEN: usize = 26;

/// UDP 데이터그램 하나에 담을 수 있는 최대 페이로드
pub const MAX_PAYLOAD: usize = 65_507 - HEADER_LEN;

/// SACK 비트맵이 커버하는 세그먼트 수
pub const SACK_WINDOW: u32 = 32;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 2;
const OFF_FLAGS: usize = 3;
const OFF_SEQ: usize = 4;
const OFF_ACK: usize = 8;
const OFF_WINDOW: usize = 12;
const OFF_SACK: usize = 16;
const OFF_PAYLOAD_LEN: usize = 20;
const OFF_CHECKSUM: usize = 22;

/// `a < b` (wrap-around 공간)
#[inline]
pub fn seq_lt(a: SeqNo, b: SeqNo) -> bool {
    a != b && b.wrapping_sub(a) < (1 << 31)
}

/// `a <= b` (wrap-around 공간)
#[inline]
pub fn seq_le(a: SeqNo, b: SeqNo) -> bool {
    a == b || seq_lt(a, b)
}

/// 프레이밍 단위 세그먼트
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// 시퀀스 번호 (SYN, DATA, FIN만 소비)
    pub seq: SeqNo,

    /// 누적 ACK: 연속으로 수신한 가장 높은 시퀀스 번호 (포함)
    pub ack: SeqNo,

    /// [`flags`] 비트마스크
    pub flags: u8,

    /// 수신 버퍼 여유 공간 (바이트)
    pub window: u32,

    /// 비트 i = `ack + 2 + i` 세그먼트 수신 여부
    pub sack: u32,

    /// 페이로드
    pub payload: Bytes,
}

impl Segment {
    /// 데이터 세그먼트
    pub fn data(seq: SeqNo, payload: Bytes) -> Self {
        Self {
            seq,
            ack: 0,
            flags: flags::DATA,
            window: 0,
            sack: 0,
            payload,
        }
    }

    /// 핸드쉐이크 세그먼트
    pub fn handshake(seq: SeqNo, info: &HandshakeInfo) -> Result<Self> {
        Ok(Self {
            seq,
            ack: 0,
            flags: flags::SYN,
            window: info.recv_window,
            sack: 0,
            payload: info.to_payload()?,
        })
    }

    /// 종료 세그먼트
    pub fn fin(seq: SeqNo) -> Self {
        Self {
            seq,
            ack: 0,
            flags: flags::FIN,
            window: 0,
            sack: 0,
            payload: Bytes::new(),
        }
    }

    /// 순수 ACK 세그먼트 (시퀀스 번호 소비 없음)
    pub fn ack_only(ack: SeqNo, window: u32, sack: u32) -> Self {
        Self {
            seq: 0,
            ack,
            flags: flags::ACK,
            window,
            sack,
            payload: Bytes::new(),
        }
    }

    /// ACK 정보 덧붙이기 (piggyback)
    pub fn with_ack(mut self, ack: SeqNo, window: u32, sack: u32) -> Self {
        self.flags |= flags::ACK;
        self.ack = ack;
        self.window = window;
        self.sack = sack;
        self
    }

    pub fn is_syn(&self) -> bool {
        self.flags & flags::SYN != 0
    }

    pub fn is_ack(&self) -> bool {
        self.flags & flags::ACK != 0
    }

    pub fn is_data(&self) -> bool {
        self.flags & flags::DATA != 0
    }

    pub fn is_fin(&self) -> bool {
        self.flags & flags::FIN != 0
    }

    /// 시퀀스 공간을 차지하는 세그먼트인지 (재전송 대상)
    pub fn consumes_seq(&self) -> bool {
        self.flags & (flags::SYN | flags::DATA | flags::FIN) != 0
    }

    /// 인코딩된 전체 길이
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// 바이트로 직렬화
    ///
    /// 페이로드가 [`MAX_PAYLOAD`]를 넘는 세그먼트는 만들지 않는 것이 호출자의 책임이다.
    pub fn encode(&self) -> Bytes {
        debug_assert!(self.payload.len() <= MAX_PAYLOAD);

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u16(MAGIC_NUMBER);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.flags);
        buf.put_u32(self.seq);
        buf.put_u32(self.ack);
        buf.put_u32(self.window);
        buf.put_u32(self.sack);
        buf.put_u16(self.payload.len() as u16);
        buf.put_u32(0);
        buf.put_slice(&self.payload);

        let crc = checksum(&buf[..OFF_CHECKSUM], &self.payload);
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 4].copy_from_slice(&crc.to_be_bytes());
        buf.freeze()
    }

    /// 바이트에서 역직렬화
    ///
    /// 선언된 길이 뒤의 잉여 바이트는 무시한다.
    pub fn decode(buf: &[u8]) -> std::result::Result<Self, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::Truncated {
                expected: HEADER_LEN,
                got: buf.len(),
            });
        }

        let magic = read_u16(buf, OFF_MAGIC);
        if magic != MAGIC_NUMBER {
            return Err(DecodeError::BadMagic(magic));
        }

        let version = buf[OFF_VERSION];
        if version != PROTOCOL_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }

        let payload_len = read_u16(buf, OFF_PAYLOAD_LEN) as usize;
        if payload_len > MAX_PAYLOAD {
            return Err(DecodeError::PayloadTooLarge {
                len: payload_len,
                max: MAX_PAYLOAD,
            });
        }

        let total = HEADER_LEN + payload_len;
        if buf.len() < total {
            return Err(DecodeError::Truncated {
                expected: total,
                got: buf.len(),
            });
        }

        let payload = &buf[HEADER_LEN..total];
        let expected = read_u32(buf, OFF_CHECKSUM);
        let got = checksum(&buf[..OFF_CHECKSUM], payload);
        if expected != got {
            return Err(DecodeError::ChecksumMismatch { expected, got });
        }

        Ok(Self {
            seq: read_u32(buf, OFF_SEQ),
            ack: read_u32(buf, OFF_ACK),
            flags: buf[OFF_FLAGS] & flags::ALL,
            window: read_u32(buf, OFF_WINDOW),
            sack: read_u32(buf, OFF_SACK),
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

fn checksum(header_prefix: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header_prefix);
    hasher.update(&[0u8; 4]);
    hasher.update(payload);
    hasher.finalize()
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// 핸드쉐이크 세그먼트 페이로드 (로컬 능력 광고)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeInfo {
    /// 프로토콜 버전
    pub version: u8,

    /// 송신측 초기 시퀀스 번호 (핸드쉐이크 세그먼트가 소비)
    pub initial_seq: SeqNo,

    /// 송신측 최대 페이로드 크기
    pub mtu: u16,

    /// 초기 수신 윈도우 (바이트)
    pub recv_window: u32,

    /// 소켓 인스턴스 식별자 (피어 재시작 감지용)
    pub cookie: u64,
}

impl HandshakeInfo {
    pub fn to_payload(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn from_payload(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
