//! 에러 타입 정의

use thiserror::Error;

use crate::handle::Handle;
use crate::state::ConnectionState;

/// mead 전송 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("패킷 디코딩 실패: {0}")]
    Decode(#[from] DecodeError),

    #[error("유효하지 않은 주소: {0}")]
    AddressInvalid(String),

    #[error("핸드쉐이크 타임아웃: {attempts}회 전송 후 응답 없음")]
    HandshakeTimeout { attempts: u32 },

    #[error("유효하지 않은 핸들: {0}")]
    InvalidHandle(Handle),

    #[error("연결되지 않음: 현재 상태 {state}")]
    NotConnected { state: ConnectionState },

    #[error("연결 끊김: {0}")]
    ConnectionBroken(BrokenReason),

    #[error("타임아웃")]
    Timeout,

    #[error("초기화되지 않음 (startup 이전 또는 cleanup 이후)")]
    NotInitialized,

    #[error("열린 핸들 {0}개가 남아 있음")]
    HandlesOpen(usize),

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("채널 에러")]
    ChannelError,
}

/// 패킷 디코딩 에러
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("잘린 패킷: 최소 {expected} 바이트 필요, {got} 바이트 수신")]
    Truncated { expected: usize, got: usize },

    #[error("체크섬 불일치: expected {expected:08X}, got {got:08X}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("유효하지 않은 매직 넘버: {0:04X}")]
    BadMagic(u16),

    #[error("지원하지 않는 프로토콜 버전: {0}")]
    UnsupportedVersion(u8),

    #[error("페이로드 크기 초과: {len} > {max}")]
    PayloadTooLarge { len: usize, max: usize },
}

/// 연결이 `Broken` 상태로 전이된 원인
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokenReason {
    #[error("피어 응답 없음")]
    PeerUnresponsive,

    #[error("핸드쉐이크 타임아웃")]
    HandshakeTimeout,

    #[error("연속된 체크섬 오류")]
    ChecksumStorm,

    #[error("피어 재시작 감지")]
    PeerReset,

    #[error("전송 계층 오류: {0}")]
    Transport(String),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
