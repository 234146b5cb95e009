//! 연결 상태 머신 상태 정의
//!
//! ```text
//!  Closed ──start──▶ RendezvousSent ──peer SYN──▶ Connected ──close──▶ Closing ──drained──▶ Closed
//!                        │      ▲                                          │
//!             peer ACK   │      │                                 linger 만료
//!                        ▼      │                                          ▼
//!                    RendezvousWait ──peer SYN──▶ Connected              Closed
//!
//!  (모든 상태) ──fatal──▶ Broken
//! ```
//!
//! 전이 자체는 [`crate::connection::Connection`]이 수행하고,
//! 여기서는 어떤 전이가 합법인지만 정의한다.

use std::fmt;

/// 연결 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// 연결 없음 (초기 상태이자 정상 종료 상태)
    #[default]
    Closed,

    /// 로컬 핸드쉐이크 전송, 피어 소식 없음
    RendezvousSent,

    /// 피어가 로컬 핸드쉐이크를 확인했으나 피어 핸드쉐이크는 아직 못 받음
    RendezvousWait,

    /// 데이터 송수신 가능
    Connected,

    /// FIN 전송, 미확인 데이터 drain 중
    Closing,

    /// 복구 불가 오류 (종단 상태)
    Broken,
}

impl ConnectionState {
    /// 핸드쉐이크 진행 중인지
    pub fn is_handshaking(self) -> bool {
        matches!(self, Self::RendezvousSent | Self::RendezvousWait)
    }

    /// 더 이상 전이하지 않는 상태인지
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Broken)
    }

    /// 합법적인 전이인지
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        if next == Broken {
            return self != Broken;
        }

        matches!(
            (self, next),
            (Closed, RendezvousSent)
                | (RendezvousSent, RendezvousWait)
                | (RendezvousSent, Connected)
                | (RendezvousWait, Connected)
                | (RendezvousSent, Closed)
                | (RendezvousWait, Closed)
                | (Connected, Closing)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "Closed",
            Self::RendezvousSent => "Rendezvous-Sent",
            Self::RendezvousWait => "Rendezvous-Wait",
            Self::Connected => "Connected",
            Self::Closing => "Closing",
            Self::Broken => "Broken",
        };
        f.write_str(name)
    }
}
