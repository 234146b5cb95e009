//! 전송 설정

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::packet::MAX_PAYLOAD;
use crate::{Error, Result, DEFAULT_MTU};

/// mead 전송 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 세그먼트당 최대 페이로드 (바이트)
    pub mtu: usize,

    /// 수신 버퍼 크기 (재정렬 + 전달 대기 바이트 합계 상한)
    pub recv_buffer_size: usize,

    /// 초기 혼잡 윈도우 (세그먼트)
    pub initial_cwnd: u32,

    /// 초기 slow-start 임계값 (세그먼트)
    pub initial_ssthresh: u32,

    /// 최대 혼잡 윈도우 (세그먼트)
    pub max_cwnd: u32,

    /// RTT 샘플 이전 재전송 타임아웃 (밀리초)
    pub initial_rto_ms: u64,

    /// 최소 재전송 타임아웃 (밀리초)
    pub min_rto_ms: u64,

    /// 최대 재전송 타임아웃 (밀리초)
    pub max_rto_ms: u64,

    /// 같은 세그먼트의 연속 재전송 한도
    /// 초과 시 연결은 `Broken`
    pub max_retransmits: u32,

    /// fast retransmit을 유발하는 중복 ACK 수
    pub dup_ack_threshold: u32,

    /// 핸드쉐이크 재전송 간격 (밀리초)
    pub handshake_retry_interval_ms: u64,

    /// 핸드쉐이크 최대 재전송 횟수
    pub handshake_max_retries: u32,

    /// heartbeat ACK 주기 (밀리초)
    pub heartbeat_interval_ms: u64,

    /// 피어 무응답 허용 시간 (밀리초)
    pub peer_idle_timeout_ms: u64,

    /// close 후 미확인 데이터 대기 시간 (밀리초)
    pub linger_ms: u64,

    /// 연속 손상 데이터그램 허용 수
    pub max_consecutive_corrupt: u32,

    /// 로컬 바인드 IP
    pub bind_ip: IpAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            recv_buffer_size: 8 * 1024 * 1024, // 8MB
            initial_cwnd: 10,
            initial_ssthresh: 256,
            max_cwnd: 8192,
            initial_rto_ms: 1000,
            min_rto_ms: 200,
            max_rto_ms: 8000,
            max_retransmits: 12,
            dup_ack_threshold: 3,
            handshake_retry_interval_ms: 250,
            handshake_max_retries: 20, // 약 5초
            heartbeat_interval_ms: 100,
            peer_idle_timeout_ms: 5000,
            linger_ms: 3000,
            max_consecutive_corrupt: 64,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 설정 값 검증
    pub fn validate(&self) -> Result<()> {
        if self.mtu == 0 || self.mtu > MAX_PAYLOAD {
            return Err(Error::InvalidConfig(format!(
                "mtu는 1 ~ {} 범위여야 함: {}",
                MAX_PAYLOAD, self.mtu
            )));
        }
        if self.recv_buffer_size < self.mtu {
            return Err(Error::InvalidConfig(format!(
                "recv_buffer_size({})가 mtu({})보다 작음",
                self.recv_buffer_size, self.mtu
            )));
        }
        if self.initial_cwnd == 0 || self.initial_cwnd > self.max_cwnd {
            return Err(Error::InvalidConfig(format!(
                "initial_cwnd는 1 ~ max_cwnd({}) 범위여야 함: {}",
                self.max_cwnd, self.initial_cwnd
            )));
        }
        if self.min_rto_ms == 0 || self.min_rto_ms > self.max_rto_ms {
            return Err(Error::InvalidConfig(format!(
                "min_rto_ms({})는 0보다 크고 max_rto_ms({}) 이하여야 함",
                self.min_rto_ms, self.max_rto_ms
            )));
        }
        if self.max_retransmits == 0 || self.dup_ack_threshold == 0 {
            return Err(Error::InvalidConfig(
                "max_retransmits, dup_ack_threshold는 0일 수 없음".into(),
            ));
        }
        if self.handshake_retry_interval_ms == 0 || self.heartbeat_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "타이머 주기는 0일 수 없음".into(),
            ));
        }
        Ok(())
    }

    pub fn initial_rto(&self) -> Duration {
        Duration::from_millis(self.initial_rto_ms)
    }

    pub fn min_rto(&self) -> Duration {
        Duration::from_millis(self.min_rto_ms)
    }

    pub fn max_rto(&self) -> Duration {
        Duration::from_millis(self.max_rto_ms)
    }

    pub fn handshake_retry_interval(&self) -> Duration {
        Duration::from_millis(self.handshake_retry_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn peer_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_idle_timeout_ms)
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    /// 핸드쉐이크 전체 예산 (첫 전송 + 재전송)
    pub fn handshake_budget(&self) -> Duration {
        self.handshake_retry_interval() * (self.handshake_max_retries + 1)
    }

    /// 저지연 LAN용 설정
    pub fn low_latency() -> Self {
        Self {
            initial_rto_ms: 200,
            min_rto_ms: 20,
            max_rto_ms: 2000,
            handshake_retry_interval_ms: 50,
            handshake_max_retries: 40,
            heartbeat_interval_ms: 10,
            peer_idle_timeout_ms: 2000,
            linger_ms: 500,
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            mtu: 1200,                        // 작은 세그먼트
            initial_cwnd: 4,
            initial_ssthresh: 64,
            initial_rto_ms: 1500,
            min_rto_ms: 300,
            max_rto_ms: 15000,
            handshake_retry_interval_ms: 500,
            handshake_max_retries: 30,
            heartbeat_interval_ms: 200,
            peer_idle_timeout_ms: 15000,
            linger_ms: 10000,
            max_consecutive_corrupt: 256,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        Config::default().validate().unwrap();
        Config::low_latency().validate().unwrap();
        Config::unstable_network().validate().unwrap();
    }

    #[test]
    fn test_invalid_mtu() {
        let config = Config {
            mtu: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = Config {
            mtu: MAX_PAYLOAD + 1,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_handshake_budget() {
        let config = Config::default();
        assert_eq!(config.handshake_budget(), Duration::from_millis(250 * 21));
    }
}
