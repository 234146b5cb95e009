//! 연결별 전송 통계

use std::time::{Duration, Instant};

/// 연결 하나의 전송 통계
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 최초 전송 세그먼트 수 (SYN/DATA/FIN)
    pub segments_sent: u64,

    /// 재전송 세그먼트 수 (타임아웃 + fast retransmit)
    pub segments_retransmitted: u64,

    /// 그중 fast retransmit 수
    pub fast_retransmits: u64,

    /// 재전송 타이머 만료 횟수
    pub rto_expirations: u64,

    /// 수신 세그먼트 수 (유효한 것만)
    pub segments_received: u64,

    /// 애플리케이션이 넘긴 바이트
    pub bytes_sent: u64,

    /// 애플리케이션에 전달한 바이트
    pub bytes_delivered: u64,

    /// 버린 중복 세그먼트 수
    pub duplicate_segments: u64,

    /// 버린 손상 데이터그램 수
    pub corrupt_datagrams: u64,

    /// 수신 버퍼 부족으로 버린 세그먼트 수
    pub overflow_drops: u64,

    /// 보낸 ACK 수 (순수 ACK만)
    pub acks_sent: u64,

    /// 받은 ACK 수
    pub acks_received: u64,

    /// 혼잡 윈도우 감소 횟수
    pub loss_events: u64,

    /// 현재 평활 RTT
    pub srtt: Option<Duration>,

    /// 현재 재전송 타임아웃
    pub rto: Duration,

    /// 현재 혼잡 윈도우 (세그먼트)
    pub cwnd: f64,

    /// 현재 미확인 바이트
    pub bytes_in_flight: usize,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            segments_sent: 0,
            segments_retransmitted: 0,
            fast_retransmits: 0,
            rto_expirations: 0,
            segments_received: 0,
            bytes_sent: 0,
            bytes_delivered: 0,
            duplicate_segments: 0,
            corrupt_datagrams: 0,
            overflow_drops: 0,
            acks_sent: 0,
            acks_received: 0,
            loss_events: 0,
            srtt: None,
            rto: Duration::ZERO,
            cwnd: 0.0,
            bytes_in_flight: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 송신 처리율 (bytes/sec)
    pub fn send_throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.bytes_sent as f64 / elapsed
    }

    /// 재전송 비율
    pub fn retransmit_ratio(&self) -> f64 {
        let total = self.segments_sent + self.segments_retransmitted;
        if total == 0 {
            return 0.0;
        }
        self.segments_retransmitted as f64 / total as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Sent: {} B / {} seg | Delivered: {} B | Retx: {} ({:.2}%) | Dup: {} | Corrupt: {} | SRTT: {} | RTO: {}ms | cwnd: {:.1}",
            self.elapsed().as_secs_f64(),
            self.bytes_sent,
            self.segments_sent,
            self.bytes_delivered,
            self.segments_retransmitted,
            self.retransmit_ratio() * 100.0,
            self.duplicate_segments,
            self.corrupt_datagrams,
            self.srtt
                .map(|d| format!("{:.2}ms", d.as_secs_f64() * 1000.0))
                .unwrap_or_else(|| "-".into()),
            self.rto.as_millis(),
            self.cwnd,
        )
    }
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new()
    }
}
