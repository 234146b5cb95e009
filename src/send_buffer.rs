//! 송신 버퍼
//!
//! 시퀀스 번호를 부여하고 미확인 세그먼트 집합을 순서대로 보관한다.
//!
//! ```text
//!  send_base                       next_seq
//!      │                               │
//!  ────┼───────────────────────────────┼─────────▶ seq
//!      │ [seg][----][seg][seg][----]   │
//!      │   미확인     SACK됨            │
//! ```
//!
//! 소켓 I/O와 타이머는 호출자 몫이다.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;

use crate::packet::{seq_le, seq_lt, Segment, SeqNo, SACK_WINDOW};

/// 미확인 세그먼트
#[derive(Debug, Clone)]
pub struct Outstanding {
    /// 원본 세그먼트 (ACK 필드는 전송 시점에 덧붙임)
    pub segment: Segment,

    /// 최초 전송 시각
    pub first_sent: Instant,

    /// 마지막 전송 시각
    pub last_sent: Instant,

    /// 총 전송 횟수
    pub transmissions: u32,
}

impl Outstanding {
    /// 재전송 횟수
    pub fn retransmits(&self) -> u32 {
        self.transmissions.saturating_sub(1)
    }

    /// Karn 규칙: 한 번만 전송된 세그먼트만 RTT 샘플이 됨
    pub fn rtt_sample(&self, now: Instant) -> Option<std::time::Duration> {
        (self.transmissions == 1).then(|| now.saturating_duration_since(self.first_sent))
    }

    pub fn payload_len(&self) -> usize {
        self.segment.payload.len()
    }
}

/// 송신측 미확인 세그먼트 집합
#[derive(Debug)]
pub struct SendBuffer {
    /// 가장 오래된 미확인 시퀀스
    send_base: SeqNo,

    /// 다음에 부여할 시퀀스
    next_seq: SeqNo,

    /// `send_base`부터의 슬롯 (SACK된 슬롯은 None)
    slots: VecDeque<Option<Outstanding>>,

    /// Some 슬롯 수
    live: usize,
}

impl SendBuffer {
    /// `first_seq`: 첫 데이터 세그먼트의 시퀀스 번호
    pub fn new(first_seq: SeqNo) -> Self {
        Self {
            send_base: first_seq,
            next_seq: first_seq,
            slots: VecDeque::new(),
            live: 0,
        }
    }

    /// 데이터 세그먼트 추가, 전송할 세그먼트 반환
    pub fn push_data(&mut self, payload: Bytes, now: Instant) -> Segment {
        let segment = Segment::data(self.next_seq, payload);
        self.push(segment.clone(), now);
        segment
    }

    /// FIN 세그먼트 추가
    pub fn push_fin(&mut self, now: Instant) -> Segment {
        let segment = Segment::fin(self.next_seq);
        self.push(segment.clone(), now);
        segment
    }

    fn push(&mut self, segment: Segment, now: Instant) {
        self.slots.push_back(Some(Outstanding {
            segment,
            first_sent: now,
            last_sent: now,
            transmissions: 1,
        }));
        self.live += 1;
        self.next_seq = self.next_seq.wrapping_add(1);
    }

    /// 누적 ACK 처리: `ack` 이하 세그먼트 제거
    ///
    /// 범위 밖 (이미 확인됐거나 아직 보내지 않은) ACK는 무시한다.
    pub fn on_cumulative_ack(&mut self, ack: SeqNo) -> Vec<Outstanding> {
        let mut acked = Vec::new();
        if !self.acks_new_data(ack) {
            return acked;
        }

        while seq_le(self.send_base, ack) {
            match self.slots.pop_front() {
                Some(Some(entry)) => {
                    self.live -= 1;
                    acked.push(entry);
                }
                Some(None) => {}
                None => break,
            }
            self.send_base = self.send_base.wrapping_add(1);
        }
        self.trim_front();
        acked
    }

    /// SACK 비트맵 처리: 비트 i = `ack + 2 + i`
    pub fn on_sack(&mut self, ack: SeqNo, bitmap: u32) -> Vec<Outstanding> {
        let mut acked = Vec::new();
        if bitmap == 0 {
            return acked;
        }

        for i in 0..SACK_WINDOW {
            if bitmap & (1 << i) == 0 {
                continue;
            }
            let seq = ack.wrapping_add(2 + i);
            if let Some(slot) = self.slot_mut(seq) {
                if let Some(entry) = slot.take() {
                    self.live -= 1;
                    acked.push(entry);
                }
            }
        }
        self.trim_front();
        acked
    }

    /// `ack`가 새 데이터를 확인하는지
    pub fn acks_new_data(&self, ack: SeqNo) -> bool {
        seq_le(self.send_base, ack) && seq_lt(ack, self.next_seq)
    }

    fn trim_front(&mut self) {
        while let Some(None) = self.slots.front() {
            self.slots.pop_front();
            self.send_base = self.send_base.wrapping_add(1);
        }
    }

    fn slot_mut(&mut self, seq: SeqNo) -> Option<&mut Option<Outstanding>> {
        if !seq_le(self.send_base, seq) {
            return None;
        }
        let idx = seq.wrapping_sub(self.send_base) as usize;
        self.slots.get_mut(idx)
    }

    /// 미확인 세그먼트 조회
    pub fn get(&self, seq: SeqNo) -> Option<&Outstanding> {
        if !seq_le(self.send_base, seq) {
            return None;
        }
        let idx = seq.wrapping_sub(self.send_base) as usize;
        self.slots.get(idx).and_then(|slot| slot.as_ref())
    }

    /// 재전송 기록, 재전송할 세그먼트 반환
    pub fn mark_retransmitted(&mut self, seq: SeqNo, now: Instant) -> Option<(Segment, u32)> {
        let entry = self.slot_mut(seq)?.as_mut()?;
        entry.transmissions += 1;
        entry.last_sent = now;
        Some((entry.segment.clone(), entry.retransmits()))
    }

    /// 가장 오래된 미확인 시퀀스
    pub fn first_unacked(&self) -> Option<SeqNo> {
        self.slots
            .iter()
            .position(|slot| slot.is_some())
            .map(|idx| self.send_base.wrapping_add(idx as u32))
    }

    /// 마지막으로 부여한 시퀀스
    pub fn highest_sent(&self) -> SeqNo {
        self.next_seq.wrapping_sub(1)
    }

    pub fn next_seq(&self) -> SeqNo {
        self.next_seq
    }

    pub fn send_base(&self) -> SeqNo {
        self.send_base
    }

    /// 미확인 세그먼트 수
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// 미확인 세그먼트 순회 (오래된 순)
    pub fn iter(&self) -> impl Iterator<Item = &Outstanding> {
        self.slots.iter().flatten()
    }

    /// 연결 종료 시 전부 폐기
    pub fn clear(&mut self) {
        self.slots.clear();
        self.live = 0;
        self.send_base = self.next_seq;
    }
}
