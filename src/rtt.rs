//! RTT 추정과 재전송 타이머
//!
//! RTO = SRTT + 4 * RTTVAR (RFC 6298), `[min_rto, max_rto]`로 제한.
//!
//! - 첫 샘플: SRTT = R, RTTVAR = R/2
//! - 이후: RTTVAR = 3/4 * RTTVAR + 1/4 * |SRTT - R|, SRTT = 7/8 * SRTT + 1/8 * R
//!
//! 타임아웃마다 RTO를 두 배로 늘리고 (exponential back-off),
//! 다음 유효 샘플에서 추정값으로 복원한다.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use crate::packet::SeqNo;
use crate::Config;

/// 평활 RTT 추정기
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    min_rto: Duration,
    max_rto: Duration,
}

impl RttEstimator {
    pub fn new(initial_rto: Duration, min_rto: Duration, max_rto: Duration) -> Self {
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: initial_rto.clamp(min_rto, max_rto),
            min_rto,
            max_rto,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.initial_rto(), config.min_rto(), config.max_rto())
    }

    /// RTT 샘플 반영
    pub fn on_sample(&mut self, sample: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                let diff = sample.abs_diff(srtt);
                self.rttvar = self.rttvar * 3 / 4 + diff / 4;
                self.srtt = Some(srtt * 7 / 8 + sample / 8);
            }
        }
        self.rto = self.computed_rto();
    }

    /// 재전송 타임아웃 발생: RTO 두 배
    pub fn on_timeout(&mut self) {
        self.rto = (self.rto * 2).min(self.max_rto);
    }

    fn computed_rto(&self) -> Duration {
        match self.srtt {
            Some(srtt) => (srtt + self.rttvar * 4).clamp(self.min_rto, self.max_rto),
            None => self.rto,
        }
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }
}

/// 세그먼트별 재전송 타이머 집합
///
/// 미확인 세그먼트 하나당 타이머는 정확히 하나.
#[derive(Debug, Default)]
pub struct RetransmitTimers {
    deadlines: BTreeSet<(Instant, SeqNo)>,
    by_seq: HashMap<SeqNo, Instant>,
}

impl RetransmitTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// 타이머 설정 (기존 타이머는 교체)
    pub fn schedule(&mut self, seq: SeqNo, now: Instant, rto: Duration) -> Instant {
        self.cancel(seq);
        let deadline = now + rto;
        self.deadlines.insert((deadline, seq));
        self.by_seq.insert(seq, deadline);
        deadline
    }

    /// 타이머 해제, 존재했으면 true
    pub fn cancel(&mut self, seq: SeqNo) -> bool {
        match self.by_seq.remove(&seq) {
            Some(deadline) => {
                self.deadlines.remove(&(deadline, seq));
                true
            }
            None => false,
        }
    }

    /// 가장 이른 만료 시각
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.iter().next().map(|(deadline, _)| *deadline)
    }

    /// `now`까지 만료된 타이머를 꺼낸다 (만료 순서)
    pub fn pop_expired(&mut self, now: Instant) -> Vec<SeqNo> {
        let mut expired = Vec::new();
        while let Some(&(deadline, seq)) = self.deadlines.iter().next() {
            if deadline > now {
                break;
            }
            self.deadlines.remove(&(deadline, seq));
            self.by_seq.remove(&seq);
            expired.push(seq);
        }
        expired
    }

    pub fn deadline_of(&self, seq: SeqNo) -> Option<Instant> {
        self.by_seq.get(&seq).copied()
    }

    pub fn len(&self) -> usize {
        self.by_seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_seq.is_empty()
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
        self.by_seq.clear();
    }
}
