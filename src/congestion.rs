//! 혼잡 제어 / 흐름 제어
//!
//! - 혼잡 윈도우 (cwnd, 세그먼트 단위): slow start 후 AIMD
//! - 수신 윈도우 (rwnd, 바이트): 피어가 광고한 여유 공간
//!
//! 전송 조건: `bytes_in_flight + len <= min(cwnd * mtu, rwnd)`

use tracing::debug;

use crate::packet::{seq_le, SeqNo};
use crate::Config;

/// 손실 감지 경로
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossSignal {
    /// 중복 ACK 임계값 도달
    DuplicateAcks,
    /// 재전송 타임아웃
    Timeout,
}

/// 연결별 혼잡/흐름 제어기
#[derive(Debug, Clone)]
pub struct CongestionController {
    /// 혼잡 윈도우 (세그먼트, 소수부는 congestion avoidance 누적분)
    cwnd: f64,

    /// slow-start 임계값 (세그먼트)
    ssthresh: f64,

    max_cwnd: f64,

    /// 세그먼트 최대 페이로드
    mtu: usize,

    /// 피어 광고 수신 윈도우 (바이트)
    peer_window: u32,

    /// 미확인 페이로드 바이트
    bytes_in_flight: usize,

    /// 이 시퀀스가 확인될 때까지 추가 감소 없음
    recovery_point: Option<SeqNo>,

    /// 윈도우 감소 횟수
    loss_events: u64,
}

impl CongestionController {
    pub fn new(config: &Config) -> Self {
        Self {
            cwnd: config.initial_cwnd as f64,
            ssthresh: config.initial_ssthresh as f64,
            max_cwnd: config.max_cwnd as f64,
            mtu: config.mtu,
            peer_window: config.recv_buffer_size.min(u32::MAX as usize) as u32,
            bytes_in_flight: 0,
            recovery_point: None,
            loss_events: 0,
        }
    }

    /// 현재 허용 전송량 (바이트)
    pub fn send_limit(&self) -> usize {
        let cwnd_bytes = self.cwnd.floor() as usize * self.mtu;
        cwnd_bytes.min(self.peer_window as usize)
    }

    /// `len` 바이트 세그먼트 전송 가능 여부
    pub fn can_send(&self, len: usize) -> bool {
        self.bytes_in_flight + len <= self.send_limit()
    }

    /// 새 세그먼트 전송 (재전송은 호출하지 않음)
    pub fn on_segment_sent(&mut self, len: usize) {
        self.bytes_in_flight += len;
    }

    /// 세그먼트 확인 (누적 ACK 또는 SACK)
    pub fn on_segment_acked(&mut self, len: usize) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(len);

        if self.recovery_point.is_some() {
            return;
        }

        if self.in_slow_start() {
            self.cwnd += 1.0;
        } else {
            self.cwnd += 1.0 / self.cwnd;
        }
        self.cwnd = self.cwnd.min(self.max_cwnd);
    }

    /// 누적 ACK 진행: recovery 종료 판단
    pub fn on_cumulative_ack(&mut self, ack: SeqNo) {
        if let Some(point) = self.recovery_point {
            if seq_le(point, ack) {
                self.recovery_point = None;
            }
        }
    }

    /// 손실 감지: 윈도우 절반, ssthresh = 절반 값
    ///
    /// `highest_sent` 이하의 손실은 같은 손실 이벤트로 보고 한 번만 줄인다.
    /// 실제로 윈도우를 줄였으면 true.
    pub fn on_loss(&mut self, signal: LossSignal, lost_seq: SeqNo, highest_sent: SeqNo) -> bool {
        if let Some(point) = self.recovery_point {
            if seq_le(lost_seq, point) {
                return false;
            }
        }

        let halved = (self.cwnd / 2.0).floor().max(2.0);
        self.ssthresh = halved;
        self.cwnd = halved;
        self.recovery_point = Some(highest_sent);
        self.loss_events += 1;

        debug!(
            "손실 감지 ({:?}): cwnd={} ssthresh={}",
            signal,
            self.cwnd,
            self.ssthresh
        );
        true
    }

    /// 핸드쉐이크로 합의한 MTU 반영
    pub fn set_mtu(&mut self, mtu: usize) {
        self.mtu = mtu;
    }

    /// 피어 광고 윈도우 갱신
    pub fn set_peer_window(&mut self, window: u32) {
        self.peer_window = window;
    }

    /// 연결 종료/리셋 시 in-flight 제거
    pub fn reset_in_flight(&mut self) {
        self.bytes_in_flight = 0;
    }

    pub fn in_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }

    pub fn in_recovery(&self) -> bool {
        self.recovery_point.is_some()
    }

    pub fn cwnd(&self) -> f64 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> f64 {
        self.ssthresh
    }

    pub fn peer_window(&self) -> u32 {
        self.peer_window
    }

    pub fn bytes_in_flight(&self) -> usize {
        self.bytes_in_flight
    }

    pub fn loss_events(&self) -> u64 {
        self.loss_events
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> CongestionController {
        let config = Config {
            mtu: 1000,
            initial_cwnd: 2,
            initial_ssthresh: 4,
            ..Config::default()
        };
        CongestionController::new(&config)
    }

    #[test]
    fn test_window_limits_in_flight() {
        let mut cc = controller();
        assert_eq!(cc.send_limit(), 2000);
        assert!(cc.can_send(1000));

        cc.on_segment_sent(1000);
        cc.on_segment_sent(1000);
        assert!(!cc.can_send(1));

        cc.set_peer_window(500);
        cc.reset_in_flight();
        assert_eq!(cc.send_limit(), 500);
        assert!(cc.can_send(500));
        assert!(!cc.can_send(501));
    }

    #[test]
    fn test_slow_start_then_avoidance() {
        let mut cc = controller();
        cc.on_segment_sent(1000);
        cc.on_segment_sent(1000);

        cc.on_segment_acked(1000);
        cc.on_segment_acked(1000);
        assert_eq!(cc.cwnd(), 4.0);
        assert!(!cc.in_slow_start());

        for _ in 0..4 {
            cc.on_segment_acked(0);
        }
        assert!(cc.cwnd() > 4.9 && cc.cwnd() < 5.1);
    }

    #[test]
    fn test_loss_halves_once_per_window() {
        let mut cc = controller();
        for _ in 0..6 {
            cc.on_segment_acked(0);
        }
        let before = cc.cwnd();

        assert!(cc.on_loss(LossSignal::DuplicateAcks, 10, 20));
        assert_eq!(cc.cwnd(), (before / 2.0).floor());
        assert_eq!(cc.ssthresh(), cc.cwnd());

        // 같은 윈도우 안의 추가 손실은 무시
        assert!(!cc.on_loss(LossSignal::Timeout, 15, 25));
        assert!(cc.in_recovery());

        // recovery 동안 윈도우 증가 없음
        let during = cc.cwnd();
        cc.on_segment_acked(0);
        assert_eq!(cc.cwnd(), during);

        cc.on_cumulative_ack(20);
        assert!(!cc.in_recovery());
        assert!(cc.on_loss(LossSignal::Timeout, 21, 30));
    }

    #[test]
    fn test_window_floor() {
        let mut cc = controller();
        cc.on_loss(LossSignal::Timeout, 1, 1);
        cc.on_cumulative_ack(1);
        cc.on_loss(LossSignal::Timeout, 2, 2);
        assert_eq!(cc.cwnd(), 2.0);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_huge_recv_buffer_saturates_peer_window() {
        let config = Config {
            mtu: 1000,
            recv_buffer_size: 1usize << 32,
            ..Config::default()
        };
        let cc = CongestionController::new(&config);
        assert_eq!(cc.send_limit(), config.initial_cwnd as usize * 1000);
        assert!(cc.can_send(1000));
    }
}
