//! # mead
//!
//! UDP 위의 신뢰성 있는 순서 보장 전송 계층
//!
//! ## 핵심 특징
//! - **Rendezvous 연결**: 서버 역할 없이 양쪽이 동시에 핸드쉐이크
//! - **신뢰성**: 누적 ACK + SACK, 세그먼트별 재전송 타이머, fast retransmit
//! - **순서 보장**: 순서 밖 세그먼트는 앞 번호가 모두 올 때까지 보관
//! - **혼잡 제어**: slow start + AIMD, 피어 수신 윈도우 준수
//! - **명시적 수명**: `Transport::startup` / `Transport::cleanup`
//!
//! ## 구조
//! [`connection::Connection`]은 소켓 없이 시각만 받아 동작하는 엔진이고,
//! [`driver::Driver`]가 연결마다 tokio 태스크 하나로 소켓과 타이머를 붙인다.
//! [`Transport`]는 세대 핸들 테이블로 드라이버들을 관리한다.

pub mod config;
pub mod congestion;
pub mod connection;
pub mod driver;
pub mod error;
pub mod handle;
pub mod packet;
pub mod recv_buffer;
pub mod rtt;
pub mod send_buffer;
pub mod state;
pub mod stats;
pub mod transport;

pub use config::Config;
pub use connection::{Connection, ReadOutcome};
pub use error::{BrokenReason, DecodeError, Error, Result};
pub use handle::{CloseOutcome, Handle};
pub use packet::{HandshakeInfo, Segment, SeqNo};
pub use state::ConnectionState;
pub use stats::ConnectionStats;
pub use transport::{CleanupMode, Transport};

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 기본 MTU (세그먼트 페이로드, 바이트)
pub const DEFAULT_MTU: usize = 1456;

/// 매직 넘버 (패킷 식별용)
pub const MAGIC_NUMBER: u16 = 0x4D44; // "MD"
