//! 연결 드라이버
//!
//! 연결 하나당 tokio 태스크 하나가 [`Connection`]을 독점 소유한다.
//! 소켓 수신, 타이머 만료, 애플리케이션 명령이 모두 이 태스크에서 하나씩
//! 처리되므로 윈도우나 버퍼를 두고 경합할 일이 없다.
//!
//! 윈도우가 꽉 찬 send, 데이터가 없는 recv는 태스크 안에 대기열로 남아
//! 있다가 ACK나 데이터가 도착하면 이어서 처리된다. 호출자가 응답을
//! 기다리다 포기하면 (oneshot 수신측 drop) 대기 중인 나머지는 버려진다.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::connection::{CloseProgress, Connection, ReadOutcome};
use crate::error::BrokenReason;
use crate::state::ConnectionState;
use crate::stats::ConnectionStats;
use crate::{Config, Error, Result};

/// 최대 UDP 데이터그램
const RECV_BUFFER_LEN: usize = 65_535;

/// 내부 명령
enum DriverCmd {
    Send {
        data: Bytes,
        reply: oneshot::Sender<Result<usize>>,
    },
    Recv {
        max: usize,
        reply: oneshot::Sender<Result<Bytes>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// 외부에 공개하는 연결 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: ConnectionState,
    pub broken: Option<BrokenReason>,
}

struct PendingSend {
    data: Bytes,
    accepted: usize,
    reply: oneshot::Sender<Result<usize>>,
}

struct PendingRecv {
    max: usize,
    reply: oneshot::Sender<Result<Bytes>>,
}

/// 드라이버 태스크 내부 상태 (단일 태스크에서만 접근)
struct DriverInner {
    conn: Connection,
    socket: UdpSocket,
    remote_addr: SocketAddr,
    cmd_rx: mpsc::Receiver<DriverCmd>,
    cmd_closed: bool,

    pending_sends: VecDeque<PendingSend>,
    pending_recvs: VecDeque<PendingRecv>,

    closing: bool,
    close_waiters: Vec<oneshot::Sender<()>>,

    status_tx: watch::Sender<LinkStatus>,
    stats: Arc<RwLock<ConnectionStats>>,
}

impl DriverInner {
    async fn run(mut self) {
        let mut buf = vec![0u8; RECV_BUFFER_LEN];

        loop {
            let now = Instant::now();
            self.progress(now);
            self.flush().await;
            self.publish();

            if self.finished() {
                break;
            }

            let deadline = self.conn.next_timeout();
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        self.conn.handle_datagram(from, &buf[..len], Instant::now());
                    }
                    Err(e) => {
                        warn!("수신 에러: {}", e);
                    }
                },
                _ = sleep_until(deadline) => {
                    self.conn.poll_timers(Instant::now());
                }
                cmd = self.cmd_rx.recv(), if !self.cmd_closed => match cmd {
                    Some(cmd) => self.handle_cmd(cmd),
                    None => {
                        // 모든 핸들이 사라짐: 닫기 절차로
                        self.cmd_closed = true;
                        self.begin_close();
                    }
                },
            }
        }

        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
        debug!("드라이버 종료: {}", self.remote_addr);
    }

    fn handle_cmd(&mut self, cmd: DriverCmd) {
        match cmd {
            DriverCmd::Send { data, reply } => {
                self.pending_sends.push_back(PendingSend {
                    data,
                    accepted: 0,
                    reply,
                });
            }
            DriverCmd::Recv { max, reply } => {
                self.pending_recvs.push_back(PendingRecv { max, reply });
            }
            DriverCmd::Close { reply } => {
                self.close_waiters.push(reply);
                self.begin_close();
            }
        }
    }

    fn begin_close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        if self.conn.close(Instant::now()) == CloseProgress::Draining {
            debug!("FIN 전송, drain 시작: {}", self.remote_addr);
        }
    }

    /// 대기 중인 send/recv를 가능한 만큼 진행
    fn progress(&mut self, now: Instant) {
        while let Some(front) = self.pending_sends.front_mut() {
            if front.reply.is_closed() {
                debug!("송신 대기 취소: {}바이트 폐기", front.data.len());
                self.pending_sends.pop_front();
                continue;
            }

            match self.conn.write(&mut front.data, now) {
                Ok(admitted) => {
                    front.accepted += admitted;
                    if !front.data.is_empty() {
                        break;
                    }
                    if let Some(done) = self.pending_sends.pop_front() {
                        let _ = done.reply.send(Ok(done.accepted));
                    }
                }
                Err(e) => {
                    if let Some(failed) = self.pending_sends.pop_front() {
                        let _ = failed.reply.send(Err(e));
                    }
                }
            }
        }

        while let Some(front) = self.pending_recvs.front() {
            if front.reply.is_closed() {
                self.pending_recvs.pop_front();
                continue;
            }

            let result = match self.conn.read(front.max) {
                Ok(ReadOutcome::WouldBlock) => break,
                Ok(ReadOutcome::Data(data)) => Ok(data),
                Ok(ReadOutcome::Eof) => Ok(Bytes::new()),
                Err(e) => Err(e),
            };
            if let Some(done) = self.pending_recvs.pop_front() {
                // 호출자가 그 사이 포기했으면 읽은 데이터를 되돌림
                if let Err(Ok(data)) = done.reply.send(result) {
                    debug!("수신 취소: {}바이트 반환", data.len());
                    self.conn.unread(data);
                }
            }
        }
    }

    /// 송신 대기 세그먼트 전부 전송
    async fn flush(&mut self) {
        while let Some(segment) = self.conn.poll_transmit(Instant::now()) {
            if let Err(e) = self.socket.send_to(&segment.encode(), self.remote_addr).await {
                // 손실로 취급: 재전송이 복구
                warn!("송신 에러: {}", e);
            }
        }
    }

    fn publish(&mut self) {
        let status = LinkStatus {
            state: self.conn.state(),
            broken: self.conn.broken_reason().cloned(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        *self.stats.write() = self.conn.stats();
    }

    fn finished(&self) -> bool {
        self.closing
            && matches!(
                self.conn.state(),
                ConnectionState::Closed | ConnectionState::Broken
            )
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
        }
        None => std::future::pending().await,
    }
}

/// 드라이버 핸들 (외부에서 제어용)
pub struct Driver {
    cmd_tx: mpsc::Sender<DriverCmd>,
    status_rx: watch::Receiver<LinkStatus>,
    stats: Arc<RwLock<ConnectionStats>>,
    running: Arc<AtomicBool>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    handshake_attempts: u32,
}

impl Driver {
    /// 드라이버 생성 및 rendezvous 시작
    pub fn spawn(config: Config, socket: UdpSocket, remote_addr: SocketAddr) -> Result<Self> {
        let local_addr = socket.local_addr()?;
        let handshake_attempts = config.handshake_max_retries + 1;

        let mut conn = Connection::new(config, local_addr, remote_addr);
        conn.start_rendezvous(Instant::now())?;

        let (cmd_tx, cmd_rx) = mpsc::channel::<DriverCmd>(64);
        let (status_tx, status_rx) = watch::channel(LinkStatus {
            state: conn.state(),
            broken: None,
        });
        let stats = Arc::new(RwLock::new(conn.stats()));
        let running = Arc::new(AtomicBool::new(true));

        let inner = DriverInner {
            conn,
            socket,
            remote_addr,
            cmd_rx,
            cmd_closed: false,
            pending_sends: VecDeque::new(),
            pending_recvs: VecDeque::new(),
            closing: false,
            close_waiters: Vec::new(),
            status_tx,
            stats: stats.clone(),
        };

        let running_main = running.clone();
        tokio::spawn(async move {
            inner.run().await;
            running_main.store(false, Ordering::SeqCst);
        });

        info!("Driver started: {} -> {}", local_addr, remote_addr);

        Ok(Self {
            cmd_tx,
            status_rx,
            stats,
            running,
            local_addr,
            remote_addr,
            handshake_attempts,
        })
    }

    /// 핸드쉐이크 완료 대기
    pub async fn wait_connected(&self) -> Result<()> {
        let mut status_rx = self.status_rx.clone();
        loop {
            let status = status_rx.borrow_and_update().clone();
            match status.state {
                ConnectionState::Connected | ConnectionState::Closing => return Ok(()),
                ConnectionState::Broken => {
                    return Err(match status.broken {
                        Some(BrokenReason::HandshakeTimeout) => Error::HandshakeTimeout {
                            attempts: self.handshake_attempts,
                        },
                        Some(reason) => Error::ConnectionBroken(reason),
                        None => Error::ConnectionBroken(BrokenReason::Transport(
                            "unknown".into(),
                        )),
                    });
                }
                ConnectionState::Closed => {
                    return Err(Error::NotConnected {
                        state: ConnectionState::Closed,
                    })
                }
                ConnectionState::RendezvousSent | ConnectionState::RendezvousWait => {}
            }
            status_rx
                .changed()
                .await
                .map_err(|_| Error::ChannelError)?;
        }
    }

    /// 데이터 송신: 전부 수락되면 수락 바이트 수 반환
    pub async fn send(&self, data: Bytes) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(DriverCmd::Send { data, reply })
            .await
            .map_err(|_| Error::ChannelError)?;
        rx.await.map_err(|_| Error::ChannelError)?
    }

    /// 데이터 수신: 빈 버퍼는 스트림 끝
    pub async fn recv(&self, max: usize) -> Result<Bytes> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(DriverCmd::Recv { max, reply })
            .await
            .map_err(|_| Error::ChannelError)?;
        rx.await.map_err(|_| Error::ChannelError)?
    }

    /// 닫기: drain이 끝나면 반환
    ///
    /// 명령이 전달된 뒤에는 이 future를 버려도 drain은 계속된다.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(DriverCmd::Close { reply }).await.is_err() {
            // 이미 종료된 태스크
            return;
        }
        let _ = rx.await;
    }

    pub fn status(&self) -> LinkStatus {
        self.status_rx.borrow().clone()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}
