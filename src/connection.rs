//! 연결 엔진
//!
//! 연결 하나의 상태 머신, 신뢰성 계층, 혼잡 제어를 묶는다.
//! 소켓도 시계도 직접 다루지 않는다: 모든 입력은 명시적인 `now`와 함께
//! 들어오고, 보낼 세그먼트는 [`Connection::poll_transmit`]으로 꺼내 간다.
//! 덕분에 같은 로직을 tokio 드라이버 ([`crate::driver`])와
//! 결정적인 단위 테스트 양쪽에서 그대로 쓴다.
//!
//! 한 `Connection`의 모든 변경은 `&mut self`를 통해서만 일어나므로
//! 시퀀스 카운터, 윈도우, 버퍼는 자연히 단일 작성자 규율을 따른다.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::congestion::{CongestionController, LossSignal};
use crate::error::BrokenReason;
use crate::packet::{HandshakeInfo, Segment, SeqNo};
use crate::recv_buffer::{Accepted, ReceiveBuffer};
use crate::rtt::{RetransmitTimers, RttEstimator};
use crate::send_buffer::{Outstanding, SendBuffer};
use crate::state::ConnectionState;
use crate::stats::ConnectionStats;
use crate::{Config, Error, Result, PROTOCOL_VERSION};

/// 읽기 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// 연속 데이터
    Data(Bytes),
    /// 아직 읽을 데이터 없음
    WouldBlock,
    /// 피어가 스트림을 닫음
    Eof,
}

/// close 진행 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseProgress {
    /// 즉시 해제 가능
    Done,
    /// FIN 전송, drain 중
    Draining,
}

/// 피어 연결 하나
pub struct Connection {
    config: Config,
    state: ConnectionState,
    broken: Option<BrokenReason>,

    local_addr: SocketAddr,
    remote_addr: SocketAddr,

    /// 로컬 초기 시퀀스 (핸드쉐이크가 소비)
    local_isn: SeqNo,
    cookie: u64,
    peer: Option<HandshakeInfo>,

    /// 합의된 MTU
    mtu: usize,

    send_buf: SendBuffer,
    recv_buf: Option<ReceiveBuffer>,
    rtt: RttEstimator,
    timers: RetransmitTimers,
    cc: CongestionController,

    handshake: Option<Segment>,
    handshake_attempts: u32,
    handshake_deadline: Option<Instant>,

    last_ack_received: SeqNo,
    dup_acks: u32,
    /// 피어가 마지막으로 알려온 윈도우와 SACK
    last_peer_window: u32,
    last_peer_sack: u32,
    last_advertised_window: u32,

    next_heartbeat: Option<Instant>,
    last_received: Instant,
    last_sent: Instant,
    consecutive_corrupt: u32,

    linger_deadline: Option<Instant>,

    outbox: VecDeque<Segment>,
    stats: ConnectionStats,
}

impl Connection {
    /// 새 연결 생성 (`Closed` 상태)
    pub fn new(config: Config, local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        let mut rng = rand::thread_rng();
        let local_isn: SeqNo = rng.gen();
        let cookie: u64 = rng.gen();
        Self::with_identity(config, local_addr, remote_addr, local_isn, cookie)
    }

    /// 초기 시퀀스와 쿠키를 지정해 생성
    pub fn with_identity(
        config: Config,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        local_isn: SeqNo,
        cookie: u64,
    ) -> Self {
        let now = Instant::now();
        Self {
            mtu: config.mtu,
            send_buf: SendBuffer::new(local_isn.wrapping_add(1)),
            rtt: RttEstimator::from_config(&config),
            cc: CongestionController::new(&config),
            config,
            state: ConnectionState::Closed,
            broken: None,
            local_addr,
            remote_addr,
            local_isn,
            cookie,
            peer: None,
            recv_buf: None,
            timers: RetransmitTimers::new(),
            handshake: None,
            handshake_attempts: 0,
            handshake_deadline: None,
            last_ack_received: local_isn,
            dup_acks: 0,
            last_peer_window: 0,
            last_peer_sack: 0,
            last_advertised_window: 0,
            next_heartbeat: None,
            last_received: now,
            last_sent: now,
            consecutive_corrupt: 0,
            linger_deadline: None,
            outbox: VecDeque::new(),
            stats: ConnectionStats::new(),
        }
    }

    // ─── 상태 전이 ───────────────────────────────────────────────────────────

    fn transition(&mut self, next: ConnectionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        debug!("{} -> {}: {} -> {}", self.local_addr, self.remote_addr, self.state, next);
        self.state = next;
    }

    fn fail(&mut self, reason: BrokenReason) {
        if self.state == ConnectionState::Broken {
            return;
        }
        warn!(
            "연결 끊김 {} -> {} ({}): {}",
            self.local_addr, self.remote_addr, self.state, reason
        );
        self.transition(ConnectionState::Broken);
        self.broken = Some(reason);
        self.release();
    }

    fn release(&mut self) {
        self.timers.clear();
        self.send_buf.clear();
        self.cc.reset_in_flight();
        self.outbox.clear();
        self.handshake_deadline = None;
        self.linger_deadline = None;
        self.next_heartbeat = None;
    }

    /// rendezvous 시작: 핸드쉐이크 전송 + 재시도 타이머
    pub fn start_rendezvous(&mut self, now: Instant) -> Result<()> {
        if self.state != ConnectionState::Closed {
            return Err(Error::NotConnected { state: self.state });
        }

        let info = HandshakeInfo {
            version: PROTOCOL_VERSION,
            initial_seq: self.local_isn,
            mtu: self.config.mtu as u16,
            recv_window: self.config.recv_buffer_size.min(u32::MAX as usize) as u32,
            cookie: self.cookie,
        };
        let segment = Segment::handshake(self.local_isn, &info)?;

        self.transition(ConnectionState::RendezvousSent);
        self.outbox.push_back(segment.clone());
        self.handshake = Some(segment);
        self.handshake_attempts = 1;
        self.handshake_deadline = Some(now + self.config.handshake_retry_interval());
        self.last_received = now;
        self.stats.segments_sent += 1;

        info!("Rendezvous started: {} -> {}", self.local_addr, self.remote_addr);
        Ok(())
    }

    /// 피어 핸드쉐이크 수락 → Connected
    fn establish(&mut self, info: HandshakeInfo, now: Instant) {
        self.mtu = self.config.mtu.min(info.mtu as usize).max(1);
        self.cc.set_mtu(self.mtu);
        self.cc.set_peer_window(info.recv_window);
        self.last_peer_window = info.recv_window;
        self.last_peer_sack = 0;
        self.recv_buf = Some(ReceiveBuffer::new(
            self.config.recv_buffer_size,
            info.initial_seq,
        ));
        self.last_ack_received = self.local_isn;
        self.handshake_deadline = None;
        self.next_heartbeat = Some(now + self.config.heartbeat_interval());
        self.last_received = now;
        self.peer = Some(info);

        self.transition(ConnectionState::Connected);
        info!(
            "Connected: {} <-> {} (mtu {})",
            self.local_addr, self.remote_addr, self.mtu
        );
    }

    fn queue_handshake_reply(&mut self) {
        let (Some(handshake), Some(recv)) = (&self.handshake, &self.recv_buf) else {
            return;
        };
        let reply = handshake
            .clone()
            .with_ack(recv.cumulative_ack(), recv.window(), 0);
        self.outbox.push_back(reply);
    }

    // ─── 수신 경로 ───────────────────────────────────────────────────────────

    /// 원시 데이터그램 처리
    ///
    /// 기대한 피어가 아닌 주소에서 온 데이터그램과 손상된 데이터그램은
    /// 조용히 버린다. 손상이 연속되면 연결을 끊는다.
    pub fn handle_datagram(&mut self, from: SocketAddr, bytes: &[u8], now: Instant) {
        if from != self.remote_addr {
            debug!("예상 밖 주소에서 데이터그램 수신: {} (피어 {})", from, self.remote_addr);
            return;
        }
        if matches!(self.state, ConnectionState::Closed | ConnectionState::Broken) {
            return;
        }

        match Segment::decode(bytes) {
            Ok(segment) => {
                self.consecutive_corrupt = 0;
                self.handle_segment(segment, now);
            }
            Err(e) => {
                self.stats.corrupt_datagrams += 1;
                self.consecutive_corrupt += 1;
                debug!("손상된 데이터그램 폐기: {}", e);
                if self.consecutive_corrupt >= self.config.max_consecutive_corrupt {
                    self.fail(BrokenReason::ChecksumStorm);
                }
            }
        }
    }

    /// 디코딩된 세그먼트 처리
    pub fn handle_segment(&mut self, segment: Segment, now: Instant) {
        self.last_received = now;
        self.stats.segments_received += 1;

        match self.state {
            ConnectionState::RendezvousSent | ConnectionState::RendezvousWait => {
                self.handle_handshaking(segment, now)
            }
            ConnectionState::Connected | ConnectionState::Closing => {
                self.handle_established(segment, now)
            }
            ConnectionState::Closed | ConnectionState::Broken => {}
        }
    }

    fn decode_handshake(segment: &Segment) -> Option<HandshakeInfo> {
        match HandshakeInfo::from_payload(&segment.payload) {
            Ok(info) if info.version == PROTOCOL_VERSION => Some(info),
            Ok(info) => {
                warn!("지원하지 않는 핸드쉐이크 버전: {}", info.version);
                None
            }
            Err(e) => {
                warn!("핸드쉐이크 페이로드 파싱 실패: {}", e);
                None
            }
        }
    }

    fn handle_handshaking(&mut self, segment: Segment, now: Instant) {
        if segment.is_syn() {
            let Some(info) = Self::decode_handshake(&segment) else {
                return;
            };
            // 순수 SYN에만 응답; SYN|ACK는 피어가 이미 연결됐다는 뜻
            let reply = !segment.is_ack();
            self.establish(info, now);
            if reply {
                self.queue_handshake_reply();
            }
            return;
        }

        // 피어는 우리 핸드쉐이크를 받았지만 피어의 핸드쉐이크는 유실됨
        if self.state == ConnectionState::RendezvousSent
            && segment.is_ack()
            && segment.ack == self.local_isn
        {
            self.transition(ConnectionState::RendezvousWait);
        }
    }

    fn handle_established(&mut self, segment: Segment, now: Instant) {
        if segment.is_syn() {
            let Some(info) = Self::decode_handshake(&segment) else {
                return;
            };
            if self.peer.as_ref().map(|p| p.cookie) != Some(info.cookie) {
                self.fail(BrokenReason::PeerReset);
                return;
            }
            // 피어가 아직 핸드쉐이크 중: 응답 재전송
            if !segment.is_ack() {
                self.queue_handshake_reply();
            }
            return;
        }

        if segment.is_ack() {
            self.process_ack(&segment, now);
        }
        if segment.is_data() || segment.is_fin() {
            self.process_data(segment);
        }

        if self.state == ConnectionState::Closing && self.send_buf.is_empty() {
            self.finish_close();
        }
    }

    fn process_ack(&mut self, segment: &Segment, now: Instant) {
        self.stats.acks_received += 1;
        self.cc.set_peer_window(segment.window);

        // 새 도착을 알리는 ACK만 중복으로 센다 (윈도우 감소 또는 새 SACK 비트).
        // 윈도우 갱신, heartbeat ACK는 제외
        let reports_arrival = segment.window < self.last_peer_window
            || segment.sack & !self.last_peer_sack != 0;
        self.last_peer_window = segment.window;
        self.last_peer_sack = segment.sack;

        if self.send_buf.acks_new_data(segment.ack) {
            let acked = self.send_buf.on_cumulative_ack(segment.ack);
            self.on_acked(acked, now);
            self.cc.on_cumulative_ack(segment.ack);
            self.last_ack_received = segment.ack;
            self.dup_acks = 0;
        } else if !segment.consumes_seq()
            && segment.ack == self.last_ack_received
            && reports_arrival
            && !self.send_buf.is_empty()
        {
            self.dup_acks += 1;
            if self.dup_acks == self.config.dup_ack_threshold {
                self.fast_retransmit(now);
            }
        }

        let sacked = self.send_buf.on_sack(segment.ack, segment.sack);
        self.on_acked(sacked, now);
    }

    fn on_acked(&mut self, entries: Vec<Outstanding>, now: Instant) {
        let mut sample = None;
        for entry in entries {
            self.timers.cancel(entry.segment.seq);
            self.cc.on_segment_acked(entry.payload_len());
            if let Some(rtt) = entry.rtt_sample(now) {
                sample = Some(rtt);
            }
        }
        if let Some(rtt) = sample {
            self.rtt.on_sample(rtt);
        }
    }

    fn fast_retransmit(&mut self, now: Instant) {
        let Some(seq) = self.send_buf.first_unacked() else {
            return;
        };
        let highest = self.send_buf.highest_sent();
        if let Some((segment, retransmits)) = self.send_buf.mark_retransmitted(seq, now) {
            self.cc.on_loss(LossSignal::DuplicateAcks, seq, highest);
            self.timers.schedule(seq, now, self.rtt.rto());
            self.outbox.push_back(segment);
            self.stats.segments_retransmitted += 1;
            self.stats.fast_retransmits += 1;
            debug!("fast retransmit: seq={} (재전송 {}회)", seq, retransmits);
        }
    }

    fn process_data(&mut self, segment: Segment) {
        let Some(recv) = self.recv_buf.as_mut() else {
            return;
        };

        let had_fin = recv.fin_received();
        let fin = segment.is_fin();
        match recv.accept(segment.seq, segment.payload, fin) {
            Accepted::InOrder | Accepted::Buffered => {}
            Accepted::Duplicate => self.stats.duplicate_segments += 1,
            Accepted::Overflow => self.stats.overflow_drops += 1,
        }
        if !had_fin && recv.fin_received() {
            debug!("피어 FIN 수신: {}", self.remote_addr);
        }

        self.queue_ack();
    }

    /// ACK 예약: 이미 나갈 세그먼트가 있으면 거기에 실린다
    fn queue_ack(&mut self) {
        if self.outbox.is_empty() {
            self.outbox.push_back(Segment::ack_only(0, 0, 0));
        }
    }

    // ─── 송신 경로 ───────────────────────────────────────────────────────────

    /// 다음 전송 세그먼트 (ACK 정보는 이 시점 값으로 채움)
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Segment> {
        let mut segment = self.outbox.pop_front()?;

        if !segment.is_syn() {
            if let Some(recv) = &self.recv_buf {
                let window = recv.window();
                segment = segment.with_ack(recv.cumulative_ack(), window, recv.sack_bitmap());
                self.last_advertised_window = window;
            }
        }
        if !segment.consumes_seq() {
            self.stats.acks_sent += 1;
        }

        self.last_sent = now;
        Some(segment)
    }

    /// 애플리케이션 데이터 투입
    ///
    /// 윈도우가 허락하는 만큼 `data` 앞부분을 MTU 단위로 잘라 미확인 집합에
    /// 넣고, 넣은 바이트 수를 반환한다. 남은 부분은 `data`에 그대로 남는다.
    pub fn write(&mut self, data: &mut Bytes, now: Instant) -> Result<usize> {
        self.check_connected()?;

        let mut admitted = 0;
        while !data.is_empty() {
            let len = data.len().min(self.mtu);
            if !self.cc.can_send(len) {
                break;
            }

            let piece = data.split_to(len);
            let segment = self.send_buf.push_data(piece, now);
            self.timers.schedule(segment.seq, now, self.rtt.rto());
            self.cc.on_segment_sent(len);
            self.outbox.push_back(segment);

            self.stats.segments_sent += 1;
            self.stats.bytes_sent += len as u64;
            admitted += len;
        }
        Ok(admitted)
    }

    /// 연속 데이터 최대 `max`바이트 읽기
    ///
    /// `Broken` 이후에도 이미 받아 둔 데이터는 모두 읽을 수 있고, 그 뒤에야
    /// 에러를 반환한다. `max`가 0이면 아무것도 소비하지 않는다.
    pub fn read(&mut self, max: usize) -> Result<ReadOutcome> {
        let salvage = self.state == ConnectionState::Broken
            && self.recv_buf.as_ref().is_some_and(|recv| recv.available() > 0);
        if !salvage {
            self.check_connected()?;
        }
        let state = self.state;
        let mtu = self.mtu as u32;
        let last_advertised = self.last_advertised_window;

        let recv = self
            .recv_buf
            .as_mut()
            .ok_or(Error::NotConnected { state })?;

        if max == 0 || recv.available() == 0 {
            return Ok(if recv.is_finished() {
                ReadOutcome::Eof
            } else {
                ReadOutcome::WouldBlock
            });
        }

        let data = recv.read(max);
        let reopened = last_advertised < mtu && recv.window() >= mtu;
        self.stats.bytes_delivered += data.len() as u64;

        // 닫혀 있던 윈도우가 열렸으면 즉시 알림
        if reopened && state != ConnectionState::Broken {
            self.queue_ack();
        }
        Ok(ReadOutcome::Data(data))
    }

    /// 전달하지 못한 읽기 결과를 스트림 앞에 되돌림
    pub fn unread(&mut self, data: Bytes) {
        let Some(recv) = self.recv_buf.as_mut() else {
            return;
        };
        self.stats.bytes_delivered = self.stats.bytes_delivered.saturating_sub(data.len() as u64);
        recv.unread(data);
    }

    fn check_connected(&self) -> Result<()> {
        match self.state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Broken => Err(Error::ConnectionBroken(
                self.broken
                    .clone()
                    .unwrap_or_else(|| BrokenReason::Transport("unknown".into())),
            )),
            state => Err(Error::NotConnected { state }),
        }
    }

    /// close 요청
    pub fn close(&mut self, now: Instant) -> CloseProgress {
        match self.state {
            ConnectionState::Connected => {
                let fin = self.send_buf.push_fin(now);
                self.timers.schedule(fin.seq, now, self.rtt.rto());
                self.outbox.push_back(fin);
                self.stats.segments_sent += 1;
                self.linger_deadline = Some(now + self.config.linger());
                self.transition(ConnectionState::Closing);
                info!("Closing: {} -> {}", self.local_addr, self.remote_addr);
                CloseProgress::Draining
            }
            ConnectionState::Closing => CloseProgress::Draining,
            ConnectionState::RendezvousSent | ConnectionState::RendezvousWait => {
                self.transition(ConnectionState::Closed);
                self.release();
                CloseProgress::Done
            }
            ConnectionState::Closed | ConnectionState::Broken => CloseProgress::Done,
        }
    }

    fn finish_close(&mut self) {
        // 피어 FIN에 대한 ACK는 해제 후에도 내보낸다
        let acks: VecDeque<Segment> = self
            .outbox
            .drain(..)
            .filter(|segment| !segment.consumes_seq())
            .collect();
        self.transition(ConnectionState::Closed);
        self.release();
        self.outbox = acks;
        info!("Connection closed: {} -> {}", self.local_addr, self.remote_addr);
    }

    // ─── 타이머 ──────────────────────────────────────────────────────────────

    /// 만료된 타이머 처리
    pub fn poll_timers(&mut self, now: Instant) {
        match self.state {
            ConnectionState::RendezvousSent | ConnectionState::RendezvousWait => {
                self.on_handshake_timer(now)
            }
            ConnectionState::Connected | ConnectionState::Closing => {
                if self.watches_idle()
                    && now.saturating_duration_since(self.last_received)
                        >= self.config.peer_idle_timeout()
                {
                    self.fail(BrokenReason::PeerUnresponsive);
                    return;
                }

                if let Some(deadline) = self.linger_deadline {
                    if now >= deadline {
                        warn!(
                            "linger 만료: 미확인 세그먼트 {}개 폐기",
                            self.send_buf.len()
                        );
                        self.finish_close();
                        return;
                    }
                }

                self.on_retransmit_timers(now);
                if self.state == ConnectionState::Broken {
                    return;
                }
                self.on_heartbeat(now);
            }
            ConnectionState::Closed | ConnectionState::Broken => {}
        }
    }

    /// 피어가 스트림을 닫았고 보낼 것도 없으면 피어의 침묵은 정상이다
    fn watches_idle(&self) -> bool {
        let peer_finished = self
            .recv_buf
            .as_ref()
            .is_some_and(|recv| recv.fin_received());
        !(peer_finished && self.send_buf.is_empty())
    }

    fn on_handshake_timer(&mut self, now: Instant) {
        let Some(deadline) = self.handshake_deadline else {
            return;
        };
        if now < deadline {
            return;
        }

        if self.handshake_attempts > self.config.handshake_max_retries {
            self.fail(BrokenReason::HandshakeTimeout);
            return;
        }

        if let Some(handshake) = self.handshake.clone() {
            self.outbox.push_back(handshake);
            self.stats.segments_retransmitted += 1;
        }
        self.handshake_attempts += 1;
        self.handshake_deadline = Some(now + self.config.handshake_retry_interval());
        debug!(
            "핸드쉐이크 재전송: {} (시도 {})",
            self.remote_addr, self.handshake_attempts
        );
    }

    fn on_retransmit_timers(&mut self, now: Instant) {
        let expired = self.timers.pop_expired(now);
        if expired.is_empty() {
            return;
        }

        self.stats.rto_expirations += expired.len() as u64;
        self.rtt.on_timeout();
        let highest = self.send_buf.highest_sent();

        for seq in expired {
            let retransmits = match self.send_buf.get(seq) {
                Some(entry) => entry.retransmits(),
                None => continue,
            };
            if retransmits >= self.config.max_retransmits {
                warn!(
                    "세그먼트 {} {}회 재전송 후에도 ACK 없음",
                    seq, retransmits
                );
                self.fail(BrokenReason::PeerUnresponsive);
                return;
            }

            self.cc.on_loss(LossSignal::Timeout, seq, highest);
            if let Some((segment, retransmits)) = self.send_buf.mark_retransmitted(seq, now) {
                self.timers.schedule(seq, now, self.rtt.rto());
                self.outbox.push_back(segment);
                self.stats.segments_retransmitted += 1;
                debug!(
                    "재전송: seq={} (재전송 {}회, rto {:?})",
                    seq,
                    retransmits,
                    self.rtt.rto()
                );
            }
        }
    }

    fn on_heartbeat(&mut self, now: Instant) {
        let Some(deadline) = self.next_heartbeat else {
            return;
        };
        if now < deadline {
            return;
        }

        let keepalive_due =
            now.saturating_duration_since(self.last_sent) >= self.config.peer_idle_timeout() / 4;
        let reordering = self
            .recv_buf
            .as_ref()
            .is_some_and(|recv| recv.pending_count() > 0);

        if keepalive_due || reordering {
            self.queue_ack();
        }
        self.next_heartbeat = Some(now + self.config.heartbeat_interval());
    }

    /// 다음에 [`Connection::poll_timers`]를 불러야 할 시각
    pub fn next_timeout(&self) -> Option<Instant> {
        match self.state {
            ConnectionState::RendezvousSent | ConnectionState::RendezvousWait => {
                self.handshake_deadline
            }
            ConnectionState::Connected | ConnectionState::Closing => {
                let idle = self
                    .watches_idle()
                    .then(|| self.last_received + self.config.peer_idle_timeout());
                [
                    self.timers.next_deadline(),
                    self.next_heartbeat,
                    self.linger_deadline,
                ]
                .into_iter()
                .flatten()
                .fold(idle, |earliest, t| Some(earliest.map_or(t, |e| e.min(t))))
            }
            ConnectionState::Closed | ConnectionState::Broken => None,
        }
    }

    // ─── 조회 ────────────────────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn broken_reason(&self) -> Option<&BrokenReason> {
        self.broken.as_ref()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// 다음 데이터 세그먼트의 시퀀스 번호 (송신 커서)
    pub fn next_send_seq(&self) -> SeqNo {
        self.send_buf.next_seq()
    }

    /// 연속 수신한 가장 높은 피어 시퀀스 (수신 커서)
    pub fn recv_cursor(&self) -> Option<SeqNo> {
        self.recv_buf.as_ref().map(|recv| recv.cumulative_ack())
    }

    /// 마지막으로 유효한 세그먼트를 받은 시각
    pub fn last_activity(&self) -> Instant {
        self.last_received
    }

    pub fn peer_info(&self) -> Option<&HandshakeInfo> {
        self.peer.as_ref()
    }

    /// 미확인 세그먼트가 없는지
    pub fn all_acked(&self) -> bool {
        self.send_buf.is_empty()
    }

    /// 지금 `len`바이트 세그먼트를 보낼 수 있는지
    pub fn can_write(&self, len: usize) -> bool {
        self.state == ConnectionState::Connected && self.cc.can_send(len.min(self.mtu))
    }

    /// 대기 없이 read가 결과를 낼 수 있는지 (데이터 또는 EOF)
    pub fn is_readable(&self) -> bool {
        self.recv_buf
            .as_ref()
            .is_some_and(|recv| recv.available() > 0 || recv.is_finished())
    }

    /// 통계 스냅샷
    pub fn stats(&self) -> ConnectionStats {
        let mut stats = self.stats.clone();
        stats.srtt = self.rtt.srtt();
        stats.rto = self.rtt.rto();
        stats.cwnd = self.cc.cwnd();
        stats.bytes_in_flight = self.cc.bytes_in_flight();
        stats.loss_events = self.cc.loss_events();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const A: &str = "10.0.0.1:9000";
    const B: &str = "10.0.0.2:9000";

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn test_config() -> Config {
        Config {
            mtu: 1500,
            ..Config::default()
        }
    }

    fn outbound(conn: &mut Connection, now: Instant) -> Vec<Segment> {
        std::iter::from_fn(|| conn.poll_transmit(now)).collect()
    }

    fn deliver(to: &mut Connection, from: &str, segments: &[Segment], now: Instant) {
        for segment in segments {
            to.handle_datagram(addr(from), &segment.encode(), now);
        }
    }

    /// 손실 없는 링크로 양쪽이 조용해질 때까지 교환
    fn exchange(a: &mut Connection, b: &mut Connection, now: Instant) {
        for _ in 0..1000 {
            let from_a = outbound(a, now);
            let from_b = outbound(b, now);
            if from_a.is_empty() && from_b.is_empty() {
                return;
            }
            deliver(b, A, &from_a, now);
            deliver(a, B, &from_b, now);
        }
        panic!("exchange did not settle");
    }

    fn pair(config_a: Config, config_b: Config) -> (Connection, Connection) {
        (
            Connection::new(config_a, addr(A), addr(B)),
            Connection::new(config_b, addr(B), addr(A)),
        )
    }

    fn connected_pair(config_a: Config, config_b: Config) -> (Connection, Connection, Instant) {
        let now = Instant::now();
        let (mut a, mut b) = pair(config_a, config_b);
        a.start_rendezvous(now).unwrap();
        b.start_rendezvous(now).unwrap();
        exchange(&mut a, &mut b, now);
        assert_eq!(a.state(), ConnectionState::Connected);
        assert_eq!(b.state(), ConnectionState::Connected);
        (a, b, now)
    }

    fn read_all(conn: &mut Connection) -> Vec<u8> {
        let mut out = Vec::new();
        while let ReadOutcome::Data(data) = conn.read(usize::MAX).unwrap() {
            out.extend_from_slice(&data);
        }
        out
    }

    fn pattern(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>())
    }

    #[test]
    fn test_simultaneous_rendezvous_either_order() {
        for a_first in [true, false] {
            let now = Instant::now();
            let (mut a, mut b) = pair(test_config(), test_config());
            a.start_rendezvous(now).unwrap();
            b.start_rendezvous(now).unwrap();

            let syn_a = outbound(&mut a, now);
            let syn_b = outbound(&mut b, now);
            if a_first {
                deliver(&mut b, A, &syn_a, now);
                deliver(&mut a, B, &syn_b, now);
            } else {
                deliver(&mut a, B, &syn_b, now);
                deliver(&mut b, A, &syn_a, now);
            }
            assert_eq!(a.state(), ConnectionState::Connected);
            assert_eq!(b.state(), ConnectionState::Connected);

            // SYN|ACK 응답은 서로 핑퐁하지 않음
            exchange(&mut a, &mut b, now);
            assert_eq!(a.recv_cursor(), Some(b.local_isn));
            assert_eq!(b.recv_cursor(), Some(a.local_isn));
        }
    }

    #[test]
    fn test_rendezvous_with_late_peer() {
        let now = Instant::now();
        let (mut a, mut b) = pair(test_config(), test_config());
        a.start_rendezvous(now).unwrap();

        // b는 아직 Closed: 무시
        let syn_a = outbound(&mut a, now);
        deliver(&mut b, A, &syn_a, now);
        assert_eq!(b.state(), ConnectionState::Closed);

        let later = now + Duration::from_millis(300);
        a.poll_timers(later);
        b.start_rendezvous(later).unwrap();
        exchange(&mut a, &mut b, later);

        assert_eq!(a.state(), ConnectionState::Connected);
        assert_eq!(b.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_rendezvous_wait_when_peer_handshake_lost() {
        let now = Instant::now();
        let (mut a, mut b) = pair(test_config(), test_config());
        a.start_rendezvous(now).unwrap();
        b.start_rendezvous(now).unwrap();

        let syn_a = outbound(&mut a, now);
        let _lost = outbound(&mut b, now);
        deliver(&mut b, A, &syn_a, now);
        assert_eq!(b.state(), ConnectionState::Connected);
        let _lost_reply = outbound(&mut b, now);

        // b의 데이터가 먼저 도착: a는 자기 핸드쉐이크가 확인된 것만 안다
        b.write(&mut Bytes::from_static(b"early"), now).unwrap();
        let data = outbound(&mut b, now);
        deliver(&mut a, B, &data, now);
        assert_eq!(a.state(), ConnectionState::RendezvousWait);

        // a의 핸드쉐이크 재전송 → b가 응답 → a 연결
        let t1 = now + Duration::from_millis(250);
        a.poll_timers(t1);
        exchange(&mut a, &mut b, t1);
        assert_eq!(a.state(), ConnectionState::Connected);

        // b의 데이터 재전송으로 복구
        let t2 = now + Duration::from_millis(1100);
        b.poll_timers(t2);
        exchange(&mut a, &mut b, t2);
        assert_eq!(read_all(&mut a), b"early");
    }

    #[test]
    fn test_handshake_timeout() {
        let config = test_config();
        let max_retries = config.handshake_max_retries;
        let mut now = Instant::now();
        let mut a = Connection::new(config, addr(A), addr(B));
        a.start_rendezvous(now).unwrap();

        let mut sent = outbound(&mut a, now).len() as u32;
        while let Some(deadline) = a.next_timeout() {
            now = deadline;
            a.poll_timers(now);
            sent += outbound(&mut a, now).iter().filter(|s| s.is_syn()).count() as u32;
        }

        assert_eq!(sent, max_retries + 1);
        assert_eq!(a.state(), ConnectionState::Broken);
        assert_eq!(a.broken_reason(), Some(&BrokenReason::HandshakeTimeout));
    }

    #[test]
    fn test_send_splits_into_mtu_segments() {
        let (mut a, mut b, now) = connected_pair(test_config(), test_config());
        let first = a.next_send_seq();
        let payload = pattern(5000);

        let mut data = payload.clone();
        assert_eq!(a.write(&mut data, now).unwrap(), 5000);
        assert!(data.is_empty());

        let segments: Vec<Segment> = outbound(&mut a, now)
            .into_iter()
            .filter(|s| s.is_data())
            .collect();
        let seqs: Vec<SeqNo> = segments.iter().map(|s| s.seq).collect();
        assert_eq!(
            seqs,
            vec![
                first,
                first.wrapping_add(1),
                first.wrapping_add(2),
                first.wrapping_add(3)
            ]
        );

        // 첫 세그먼트가 오기 전에는 아무것도 읽을 수 없음
        deliver(&mut b, A, &segments[1..], now);
        assert_eq!(b.read(5000).unwrap(), ReadOutcome::WouldBlock);

        deliver(&mut b, A, &segments[..1], now);
        assert_eq!(b.read(5000).unwrap(), ReadOutcome::Data(payload));
    }

    #[test]
    fn test_stream_delivered_exactly_once_in_order() {
        let (mut a, mut b, now) = connected_pair(test_config(), test_config());

        let mut expected = Vec::new();
        let mut received = Vec::new();
        for len in [1, 1499, 1500, 1501, 4096, 0, 7] {
            let chunk = pattern(len);
            expected.extend_from_slice(&chunk);
            a.write(&mut chunk.clone(), now).unwrap();
            exchange(&mut a, &mut b, now);
            received.extend(read_all(&mut b));
        }

        assert_eq!(received, expected);
        assert!(a.all_acked());
    }

    #[test]
    fn test_duplicate_segments_not_redelivered() {
        let (mut a, mut b, now) = connected_pair(test_config(), test_config());
        let payload = pattern(4000);
        a.write(&mut payload.clone(), now).unwrap();

        let segments = outbound(&mut a, now);
        deliver(&mut b, A, &segments, now);
        deliver(&mut b, A, &segments, now);

        assert_eq!(read_all(&mut b), payload.to_vec());
        assert_eq!(b.stats().duplicate_segments, segments.len() as u64);
    }

    #[test]
    fn test_out_of_order_arrival() {
        let (mut a, mut b, now) = connected_pair(test_config(), test_config());
        let payload = pattern(4500);
        a.write(&mut payload.clone(), now).unwrap();

        let segments = outbound(&mut a, now);
        assert_eq!(segments.len(), 3);
        for idx in [0, 2, 1] {
            deliver(&mut b, A, &segments[idx..idx + 1], now);
        }

        assert_eq!(read_all(&mut b), payload.to_vec());
    }

    #[test]
    fn test_fast_retransmit_on_duplicate_acks() {
        let (mut a, mut b, now) = connected_pair(test_config(), test_config());
        let payload = pattern(1500 * 5);
        a.write(&mut payload.clone(), now).unwrap();

        let segments = outbound(&mut a, now);
        let lost = segments[0].clone();

        for segment in &segments[1..] {
            deliver(&mut b, A, std::slice::from_ref(segment), now);
            let acks = outbound(&mut b, now);
            deliver(&mut a, B, &acks, now);
        }

        assert_eq!(a.stats().fast_retransmits, 1);
        let retransmitted = outbound(&mut a, now);
        assert_eq!(retransmitted.len(), 1);
        assert_eq!(retransmitted[0].seq, lost.seq);

        deliver(&mut b, A, &retransmitted, now);
        exchange(&mut a, &mut b, now);
        assert_eq!(read_all(&mut b), payload.to_vec());
        assert!(a.all_acked());
        assert!(a.stats().loss_events >= 1);
    }

    #[test]
    fn test_broken_after_max_retransmits() {
        let config = Config {
            initial_rto_ms: 200,
            max_rto_ms: 1000,
            peer_idle_timeout_ms: 3_600_000,
            ..test_config()
        };
        let (mut a, _b, mut now) = connected_pair(config.clone(), config);
        a.write(&mut Bytes::from_static(b"into the void"), now).unwrap();
        let _dropped = outbound(&mut a, now);

        let mut retransmissions = 0;
        for _ in 0..10_000 {
            let Some(deadline) = a.next_timeout() else {
                break;
            };
            now = deadline;
            a.poll_timers(now);
            retransmissions += outbound(&mut a, now).iter().filter(|s| s.is_data()).count();
        }

        assert_eq!(retransmissions, 12);
        assert_eq!(a.state(), ConnectionState::Broken);
        assert_eq!(a.broken_reason(), Some(&BrokenReason::PeerUnresponsive));
        assert!(matches!(
            a.write(&mut Bytes::from_static(b"x"), now),
            Err(Error::ConnectionBroken(BrokenReason::PeerUnresponsive))
        ));
        assert!(matches!(a.read(10), Err(Error::ConnectionBroken(_))));
    }

    #[test]
    fn test_silent_peer_breaks_connection() {
        let (mut a, _b, now) = connected_pair(test_config(), test_config());
        a.poll_timers(now + Duration::from_millis(5000));
        assert_eq!(a.broken_reason(), Some(&BrokenReason::PeerUnresponsive));
    }

    #[test]
    fn test_close_drains_and_peer_sees_eof() {
        let (mut a, mut b, now) = connected_pair(test_config(), test_config());
        a.write(&mut Bytes::from_static(b"bye"), now).unwrap();

        assert_eq!(a.close(now), CloseProgress::Draining);
        assert_eq!(a.state(), ConnectionState::Closing);
        assert!(matches!(
            a.write(&mut Bytes::from_static(b"more"), now),
            Err(Error::NotConnected { state: ConnectionState::Closing })
        ));

        exchange(&mut a, &mut b, now);
        assert_eq!(a.state(), ConnectionState::Closed);
        assert_eq!(b.read(100).unwrap(), ReadOutcome::Data(Bytes::from_static(b"bye")));
        assert_eq!(b.read(100).unwrap(), ReadOutcome::Eof);
    }

    #[test]
    fn test_close_linger_expires() {
        let (mut a, _b, now) = connected_pair(test_config(), test_config());
        a.write(&mut Bytes::from_static(b"unacked"), now).unwrap();
        a.close(now);
        let _dropped = outbound(&mut a, now);

        a.poll_timers(now + Duration::from_millis(3000));
        assert_eq!(a.state(), ConnectionState::Closed);
        assert_eq!(a.next_timeout(), None);
    }

    #[test]
    fn test_close_during_rendezvous() {
        let now = Instant::now();
        let (mut a, _b) = pair(test_config(), test_config());
        a.start_rendezvous(now).unwrap();
        assert_eq!(a.close(now), CloseProgress::Done);
        assert_eq!(a.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_checksum_storm() {
        let (mut a, _b, now) = connected_pair(test_config(), test_config());
        let max = test_config().max_consecutive_corrupt;

        let mut corrupt = Segment::data(1, Bytes::from_static(b"noise")).encode().to_vec();
        *corrupt.last_mut().unwrap() ^= 0xFF;

        for _ in 0..max - 1 {
            a.handle_datagram(addr(B), &corrupt, now);
        }
        assert_eq!(a.state(), ConnectionState::Connected);

        a.handle_datagram(addr(B), &corrupt, now);
        assert_eq!(a.broken_reason(), Some(&BrokenReason::ChecksumStorm));
        assert_eq!(a.stats().corrupt_datagrams, max as u64);
    }

    #[test]
    fn test_peer_restart_detected() {
        let (mut a, _b, now) = connected_pair(test_config(), test_config());

        let mut restarted = Connection::new(test_config(), addr(B), addr(A));
        restarted.start_rendezvous(now).unwrap();
        let syn = outbound(&mut restarted, now);
        deliver(&mut a, B, &syn, now);

        assert_eq!(a.broken_reason(), Some(&BrokenReason::PeerReset));
    }

    #[test]
    fn test_foreign_datagrams_ignored() {
        let (mut a, _b, now) = connected_pair(test_config(), test_config());
        let before = a.stats().segments_received;

        let stray = Segment::data(a.recv_cursor().unwrap().wrapping_add(1), Bytes::from_static(b"?"));
        a.handle_datagram(addr("10.0.0.3:9000"), &stray.encode(), now);

        assert_eq!(a.stats().segments_received, before);
        assert_eq!(a.read(10).unwrap(), ReadOutcome::WouldBlock);
    }

    #[test]
    fn test_operations_require_connected() {
        let mut a = Connection::new(test_config(), addr(A), addr(B));
        assert!(matches!(
            a.write(&mut Bytes::from_static(b"x"), Instant::now()),
            Err(Error::NotConnected { state: ConnectionState::Closed })
        ));
        assert!(matches!(
            a.read(10),
            Err(Error::NotConnected { state: ConnectionState::Closed })
        ));
    }

    #[test]
    fn test_receive_window_limits_sender() {
        let config_b = Config {
            recv_buffer_size: 3000,
            ..test_config()
        };
        let (mut a, mut b, now) = connected_pair(test_config(), config_b);
        let payload = pattern(6000);
        let mut data = payload.clone();

        assert_eq!(a.write(&mut data, now).unwrap(), 3000);
        exchange(&mut a, &mut b, now);
        assert_eq!(a.write(&mut data, now).unwrap(), 0);

        // 읽으면 윈도우 갱신 ACK가 나감
        let mut received = read_all(&mut b);
        exchange(&mut a, &mut b, now);
        assert_eq!(a.write(&mut data, now).unwrap(), 3000);

        exchange(&mut a, &mut b, now);
        received.extend(read_all(&mut b));
        assert_eq!(received, payload.to_vec());
    }

    #[test]
    fn test_rtt_sampled_from_acks() {
        let (mut a, mut b, now) = connected_pair(test_config(), test_config());
        a.write(&mut pattern(100), now).unwrap();
        let segments = outbound(&mut a, now);

        let later = now + Duration::from_millis(40);
        deliver(&mut b, A, &segments, later);
        let acks = outbound(&mut b, later);
        deliver(&mut a, B, &acks, later);

        assert_eq!(a.stats().srtt, Some(Duration::from_millis(40)));
        assert!(a.all_acked());
    }

    #[test]
    fn test_peer_close_keeps_buffered_data_readable() {
        let (mut a, mut b, now) = connected_pair(test_config(), test_config());
        a.write(&mut Bytes::from_static(b"final words"), now).unwrap();
        a.close(now);
        exchange(&mut a, &mut b, now);
        assert_eq!(a.state(), ConnectionState::Closed);

        // 닫힌 피어의 침묵은 끊김이 아님
        let later = now + Duration::from_millis(5000);
        b.poll_timers(later);
        assert_eq!(b.state(), ConnectionState::Connected);
        assert!(b.next_timeout().is_some_and(|t| t > later));

        assert_eq!(
            b.read(100).unwrap(),
            ReadOutcome::Data(Bytes::from_static(b"final words"))
        );
        assert_eq!(b.read(100).unwrap(), ReadOutcome::Eof);
    }

    #[test]
    fn test_buffered_data_readable_after_broken() {
        let (mut a, mut b, now) = connected_pair(test_config(), test_config());
        a.write(&mut Bytes::from_static(b"salvage"), now).unwrap();
        exchange(&mut a, &mut b, now);

        b.poll_timers(now + Duration::from_millis(5000));
        assert_eq!(b.broken_reason(), Some(&BrokenReason::PeerUnresponsive));

        assert_eq!(
            b.read(100).unwrap(),
            ReadOutcome::Data(Bytes::from_static(b"salvage"))
        );
        assert!(matches!(
            b.read(100),
            Err(Error::ConnectionBroken(BrokenReason::PeerUnresponsive))
        ));
        assert!(outbound(&mut b, now).is_empty());
    }

    #[test]
    fn test_unread_returns_data_to_stream() {
        let (mut a, mut b, now) = connected_pair(test_config(), test_config());
        let payload = pattern(3000);
        a.write(&mut payload.clone(), now).unwrap();
        exchange(&mut a, &mut b, now);

        let ReadOutcome::Data(first) = b.read(1000).unwrap() else {
            panic!("expected data");
        };
        assert_eq!(first.len(), 1000);
        b.unread(first);

        assert_eq!(read_all(&mut b), payload.to_vec());
        assert_eq!(b.stats().bytes_delivered, 3000);
    }

    #[test]
    fn test_repeated_acks_are_not_duplicate_acks() {
        let (mut a, mut b, now) = connected_pair(test_config(), test_config());
        a.write(&mut pattern(1500 * 3), now).unwrap();
        let segments = outbound(&mut a, now);

        deliver(&mut b, A, &segments[1..2], now);
        let acks = outbound(&mut b, now);
        assert_eq!(acks.len(), 1);

        // 같은 윈도우, 같은 SACK: 새 도착 정보 없음
        for _ in 0..5 {
            deliver(&mut a, B, &acks, now);
        }
        assert_eq!(a.stats().fast_retransmits, 0);
        assert!(outbound(&mut a, now).is_empty());

        // 윈도우만 커진 ACK도 마찬가지
        let widened = Segment::ack_only(acks[0].ack, acks[0].window + 1500, acks[0].sack);
        deliver(&mut a, B, &[widened], now);
        assert_eq!(a.stats().fast_retransmits, 0);
        assert_eq!(a.stats().loss_events, 0);
    }

    #[test]
    fn test_zero_length_read_consumes_nothing() {
        let (mut a, mut b, now) = connected_pair(test_config(), test_config());
        a.write(&mut Bytes::from_static(b"kept"), now).unwrap();
        a.close(now);
        exchange(&mut a, &mut b, now);

        assert_eq!(b.read(0).unwrap(), ReadOutcome::WouldBlock);
        assert_eq!(b.read(10).unwrap(), ReadOutcome::Data(Bytes::from_static(b"kept")));
        assert_eq!(b.read(0).unwrap(), ReadOutcome::Eof);
    }

    #[test]
    fn test_simultaneous_close_acks_peer_fin() {
        let (mut a, mut b, now) = connected_pair(test_config(), test_config());
        a.close(now);
        let fin_a = outbound(&mut a, now);
        deliver(&mut b, A, &fin_a, now);
        let _lost_ack = outbound(&mut b, now);

        // b의 FIN이 a의 FIN을 확인하면서 함께 도착
        b.close(now);
        let fin_b = outbound(&mut b, now);
        assert_eq!(fin_b.len(), 1);
        deliver(&mut a, B, &fin_b, now);
        assert_eq!(a.state(), ConnectionState::Closed);

        let final_ack = outbound(&mut a, now);
        assert_eq!(final_ack.len(), 1);
        assert_eq!(final_ack[0].ack, fin_b[0].seq);

        deliver(&mut b, A, &final_ack, now);
        assert_eq!(b.state(), ConnectionState::Closed);
    }
}
