//! 전송 컨텍스트
//!
//! 프로세스 전역 상태 대신 명시적인 수명 객체를 쓴다:
//! [`Transport::startup`]으로 만들고 [`Transport::cleanup`]으로 한 번 정리한다.
//! 모든 연산은 핸들 테이블을 거쳐 연결 드라이버에 전달된다.

use std::future::Future;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::driver::Driver;
use crate::handle::{CloseOutcome, Handle, HandleTable};
use crate::state::ConnectionState;
use crate::stats::ConnectionStats;
use crate::{Config, Error, Result};

/// cleanup 시 열린 핸들 처리 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupMode {
    /// 열린 핸들이 있으면 실패
    Refuse,
    /// 열린 핸들을 모두 닫고 정리
    ForceClose,
}

struct TransportInner {
    config: Config,
    handles: Mutex<HandleTable<Arc<Driver>>>,
    initialized: AtomicBool,
}

/// 전송 컨텍스트 (복제해서 공유)
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    /// 전송 계층 시작
    pub fn startup(config: Config) -> Result<Self> {
        config.validate()?;
        info!("mead transport started (mtu {})", config.mtu);

        Ok(Self {
            inner: Arc::new(TransportInner {
                config,
                handles: Mutex::new(HandleTable::new()),
                initialized: AtomicBool::new(true),
            }),
        })
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.inner.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    fn lookup(&self, handle: Handle) -> Result<Arc<Driver>> {
        self.ensure_initialized()?;
        self.inner
            .handles
            .lock()
            .get(handle)
            .cloned()
            .ok_or(Error::InvalidHandle(handle))
    }

    /// rendezvous 연결
    ///
    /// 양쪽이 서로를 향해 같은 호출을 하면 둘 다 `Connected`가 된다.
    /// 핸드쉐이크 예산 안에 피어가 응답하지 않으면 `HandshakeTimeout`.
    pub async fn rendezvous(
        &self,
        remote_addr: &str,
        remote_port: u16,
        local_port: u16,
    ) -> Result<Handle> {
        self.ensure_initialized()?;

        let ip: IpAddr = remote_addr
            .trim()
            .parse()
            .map_err(|_| Error::AddressInvalid(remote_addr.to_string()))?;
        if remote_port == 0 || ip.is_unspecified() || ip.is_multicast() {
            return Err(Error::AddressInvalid(format!("{}:{}", remote_addr, remote_port)));
        }
        let remote = SocketAddr::new(ip, remote_port);

        let config = self.inner.config.clone();
        let bind_ip = match config.bind_ip {
            unspecified if unspecified.is_unspecified() && ip.is_ipv6() => {
                IpAddr::V6(Ipv6Addr::UNSPECIFIED)
            }
            bind_ip => bind_ip,
        };
        let socket = UdpSocket::bind(SocketAddr::new(bind_ip, local_port)).await?;

        let driver = Arc::new(Driver::spawn(config, socket, remote)?);
        let handle = self.inner.handles.lock().insert(driver.clone());
        debug!("핸들 {} 생성: {} 와 rendezvous 중", handle, remote);

        if let Err(e) = driver.wait_connected().await {
            warn!("rendezvous 실패 {}: {}", remote, e);
            self.inner.handles.lock().remove(handle);
            driver.close().await;
            return Err(e);
        }

        info!(
            "Rendezvous complete: {} <-> {} (handle {})",
            driver.local_addr(),
            remote,
            handle
        );
        Ok(handle)
    }

    /// 데이터 송신
    ///
    /// 모든 바이트가 송신 윈도우에 수락되면 그 수를 반환한다 (ACK는 기다리지
    /// 않음). `deadline`이 먼저 지나면 `Timeout`이고 아직 수락되지 않은
    /// 나머지는 버려진다.
    pub async fn send(
        &self,
        handle: Handle,
        data: impl Into<Bytes>,
        deadline: Option<Duration>,
    ) -> Result<usize> {
        let driver = self.lookup(handle)?;
        with_deadline(deadline, driver.send(data.into())).await
    }

    /// 데이터 수신 (최대 `max`바이트)
    ///
    /// 빈 버퍼는 피어가 스트림을 닫았다는 뜻이다. `max`가 0이면 데이터를
    /// 소비하지 않고 스트림 끝이나 `deadline`까지 기다린다.
    pub async fn receive(
        &self,
        handle: Handle,
        max: usize,
        deadline: Option<Duration>,
    ) -> Result<Bytes> {
        let driver = self.lookup(handle)?;
        with_deadline(deadline, driver.recv(max)).await
    }

    /// 핸들 닫기 (멱등)
    pub async fn close(&self, handle: Handle) -> Result<CloseOutcome> {
        self.ensure_initialized()?;

        let removed = self.inner.handles.lock().remove(handle);
        match removed {
            Some(driver) => {
                driver.close().await;
                debug!("핸들 {} 닫힘", handle);
                Ok(CloseOutcome::Closed)
            }
            None => Ok(CloseOutcome::AlreadyClosed),
        }
    }

    /// 연결 통계 스냅샷
    pub fn stats(&self, handle: Handle) -> Result<ConnectionStats> {
        Ok(self.lookup(handle)?.stats())
    }

    /// 연결 상태
    pub fn state(&self, handle: Handle) -> Result<ConnectionState> {
        Ok(self.lookup(handle)?.status().state)
    }

    /// 로컬 주소
    pub fn local_addr(&self, handle: Handle) -> Result<SocketAddr> {
        Ok(self.lookup(handle)?.local_addr())
    }

    /// 열린 핸들 수
    pub fn open_handles(&self) -> usize {
        self.inner.handles.lock().len()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// 전송 계층 정리 (한 번만)
    pub async fn cleanup(&self, mode: CleanupMode) -> Result<()> {
        let drained = {
            let mut handles = self.inner.handles.lock();
            if !self.inner.initialized.load(Ordering::SeqCst) {
                return Err(Error::NotInitialized);
            }
            if mode == CleanupMode::Refuse && !handles.is_empty() {
                return Err(Error::HandlesOpen(handles.len()));
            }
            self.inner.initialized.store(false, Ordering::SeqCst);
            handles.drain()
        };

        if !drained.is_empty() {
            warn!("cleanup: 열린 핸들 {}개 강제 종료", drained.len());
        }
        let closing: Vec<_> = drained
            .into_iter()
            .map(|(_, driver)| tokio::spawn(async move { driver.close().await }))
            .collect();
        for task in closing {
            let _ = task.await;
        }

        info!("mead transport cleaned up");
        Ok(())
    }
}

async fn with_deadline<T>(
    deadline: Option<Duration>,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some(deadline) => tokio::time::timeout(deadline, operation)
            .await
            .map_err(|_| Error::Timeout)?,
        None => operation.await,
    }
}
