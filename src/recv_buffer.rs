//! 수신 버퍼
//!
//! 순서가 뒤바뀐 세그먼트를 시퀀스 번호로 보관했다가, 앞선 번호가 모두
//! 도착한 뒤에야 애플리케이션 스트림으로 내보낸다. 중복 세그먼트는
//! 시퀀스 비교로 버려지므로 애플리케이션에는 정확히 한 번만 전달된다.

use std::collections::{HashMap, VecDeque};

use bytes::{Bytes, BytesMut};

use crate::packet::{seq_le, SeqNo, SACK_WINDOW};

/// 수신 세그먼트 처리 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    /// 순서대로 도착, 연속 구간 확장
    InOrder,
    /// 순서 밖 도착, 보관
    Buffered,
    /// 이미 받은 세그먼트
    Duplicate,
    /// 버퍼 여유 없음, 폐기
    Overflow,
}

#[derive(Debug)]
struct Pending {
    payload: Bytes,
    fin: bool,
}

/// 수신측 재정렬 버퍼
#[derive(Debug)]
pub struct ReceiveBuffer {
    capacity: usize,

    /// 연속으로 받은 가장 높은 시퀀스 (누적 ACK 값)
    last_contiguous: SeqNo,

    /// 순서 밖 세그먼트
    out_of_order: HashMap<SeqNo, Pending>,
    out_of_order_bytes: usize,

    /// 애플리케이션 전달 대기
    ready: VecDeque<Bytes>,
    ready_bytes: usize,

    /// FIN이 순서대로 도착했는지
    fin_received: bool,

    /// 중복 세그먼트 수
    duplicates: u64,
}

impl ReceiveBuffer {
    /// `peer_initial_seq`: 피어 핸드쉐이크가 소비한 시퀀스
    pub fn new(capacity: usize, peer_initial_seq: SeqNo) -> Self {
        Self {
            capacity,
            last_contiguous: peer_initial_seq,
            out_of_order: HashMap::new(),
            out_of_order_bytes: 0,
            ready: VecDeque::new(),
            ready_bytes: 0,
            fin_received: false,
            duplicates: 0,
        }
    }

    /// 세그먼트 수신
    pub fn accept(&mut self, seq: SeqNo, payload: Bytes, fin: bool) -> Accepted {
        if seq_le(seq, self.last_contiguous) || self.out_of_order.contains_key(&seq) {
            self.duplicates += 1;
            return Accepted::Duplicate;
        }

        if self.fin_received {
            // FIN 이후 시퀀스는 존재하지 않음
            self.duplicates += 1;
            return Accepted::Duplicate;
        }

        if payload.len() > self.window() as usize {
            return Accepted::Overflow;
        }

        if seq != self.last_contiguous.wrapping_add(1) {
            self.out_of_order_bytes += payload.len();
            self.out_of_order.insert(seq, Pending { payload, fin });
            return Accepted::Buffered;
        }

        self.deliver(seq, payload, fin);

        // 뒤에 보관된 연속 구간 방출
        loop {
            let next = self.last_contiguous.wrapping_add(1);
            match self.out_of_order.remove(&next) {
                Some(pending) => {
                    self.out_of_order_bytes -= pending.payload.len();
                    self.deliver(next, pending.payload, pending.fin);
                }
                None => break,
            }
        }

        Accepted::InOrder
    }

    fn deliver(&mut self, seq: SeqNo, payload: Bytes, fin: bool) {
        self.last_contiguous = seq;
        if !payload.is_empty() {
            self.ready_bytes += payload.len();
            self.ready.push_back(payload);
        }
        if fin {
            self.fin_received = true;
            self.out_of_order.clear();
            self.out_of_order_bytes = 0;
        }
    }

    /// 연속 데이터 최대 `max`바이트 읽기
    pub fn read(&mut self, max: usize) -> Bytes {
        if max == 0 || self.ready_bytes == 0 {
            return Bytes::new();
        }

        // 첫 조각만으로 충분하면 복사 없이 반환
        let single = self.ready.len() == 1;
        if let Some(front) = self.ready.front_mut() {
            if front.len() >= max || single {
                let taken = if front.len() > max {
                    front.split_to(max)
                } else {
                    self.ready.pop_front().unwrap_or_default()
                };
                self.ready_bytes -= taken.len();
                return taken;
            }
        }

        let mut out = BytesMut::with_capacity(max.min(self.ready_bytes));
        while out.len() < max {
            let Some(front) = self.ready.front_mut() else {
                break;
            };
            let want = max - out.len();
            if front.len() > want {
                out.extend_from_slice(&front.split_to(want));
            } else {
                out.extend_from_slice(front);
                self.ready.pop_front();
            }
        }
        self.ready_bytes -= out.len();
        out.freeze()
    }

    /// 읽었지만 전달하지 못한 데이터를 스트림 앞에 되돌림
    pub fn unread(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.ready_bytes += data.len();
        self.ready.push_front(data);
    }

    /// 누적 ACK 값
    pub fn cumulative_ack(&self) -> SeqNo {
        self.last_contiguous
    }

    /// SACK 비트맵: 비트 i = `ack + 2 + i` 보관 중
    pub fn sack_bitmap(&self) -> u32 {
        if self.out_of_order.is_empty() {
            return 0;
        }
        (0..SACK_WINDOW).fold(0u32, |bitmap, i| {
            let seq = self.last_contiguous.wrapping_add(2 + i);
            if self.out_of_order.contains_key(&seq) {
                bitmap | (1 << i)
            } else {
                bitmap
            }
        })
    }

    /// 광고할 수신 윈도우 (바이트)
    pub fn window(&self) -> u32 {
        self.capacity
            .saturating_sub(self.ready_bytes + self.out_of_order_bytes)
            .min(u32::MAX as usize) as u32
    }

    /// 읽을 수 있는 바이트
    pub fn available(&self) -> usize {
        self.ready_bytes
    }

    /// 순서 밖 보관 세그먼트 수
    pub fn pending_count(&self) -> usize {
        self.out_of_order.len()
    }

    /// 피어 FIN 수신 + 남은 데이터 없음 (스트림 끝)
    pub fn is_finished(&self) -> bool {
        self.fin_received && self.ready_bytes == 0
    }

    pub fn fin_received(&self) -> bool {
        self.fin_received
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
