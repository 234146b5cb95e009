//! mead 피어 - rendezvous 후 줄 단위 메시지 교환
//!
//! 양쪽 호스트에서 서로를 가리키도록 실행하면 연결된다.
//! 표준 입력의 각 줄을 피어에 보내고, 피어가 보낸 줄을 출력한다.
//! `quit` 줄을 받으면 연결을 닫는다.
//!
//! 사용법:
//!   cargo run --release --bin mead-peer -- --remote <IP> [OPTIONS]
//!
//! 예시:
//!   # 호스트 A (10.0.0.1)
//!   cargo run --release --bin mead-peer -- --remote 10.0.0.2
//!
//!   # 호스트 B (10.0.0.2)
//!   cargo run --release --bin mead-peer -- --remote 10.0.0.1
//!
//!   # 줄 읽기 지연 측정
//!   cargo run --release --bin mead-peer -- --remote 10.0.0.2 --bench

use std::time::Instant;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use mead::{CleanupMode, Config, Transport};

/// 기본 포트 (양쪽 동일)
const DEFAULT_PORT: u16 = 54320;

/// 피어 실행 설정
struct PeerConfig {
    remote: String,
    remote_port: u16,
    local_port: u16,
    bench: bool,
    config: Config,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            remote: String::new(),
            remote_port: DEFAULT_PORT,
            local_port: DEFAULT_PORT,
            bench: false,
            config: Config::default(),
        }
    }
}

fn parse_args() -> PeerConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = PeerConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--remote" | "-r" => {
                if i + 1 < args.len() {
                    config.remote = args[i + 1].clone();
                    i += 1;
                }
            }
            "--remote-port" => {
                if i + 1 < args.len() {
                    config.remote_port = args[i + 1].parse().expect("유효한 포트 필요");
                    i += 1;
                }
            }
            "--local-port" | "-l" => {
                if i + 1 < args.len() {
                    config.local_port = args[i + 1].parse().expect("유효한 포트 필요");
                    i += 1;
                }
            }
            "--mtu" => {
                if i + 1 < args.len() {
                    config.config.mtu = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--low-latency" => {
                let mtu = config.config.mtu;
                config.config = Config { mtu, ..Config::low_latency() };
            }
            "--bench" | "-b" => {
                config.bench = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"mead-peer - rendezvous 피어

사용법:
  cargo run --release --bin mead-peer -- --remote <IP> [OPTIONS]

옵션:
  -r, --remote <IP>        피어 IP 주소 (필수)
  --remote-port <PORT>     피어 포트 (기본: {port})
  -l, --local-port <PORT>  로컬 포트 (기본: {port})
  --mtu <BYTES>            세그먼트 최대 페이로드 (기본: {mtu})
  --low-latency            저지연 LAN 설정 사용
  -b, --bench              줄마다 읽기 지연(마이크로초) 출력
  -h, --help               이 도움말 출력
"#,
                    port = DEFAULT_PORT,
                    mtu = mead::DEFAULT_MTU,
                );
                std::process::exit(0);
            }
            other => {
                warn!("알 수 없는 옵션 무시: {}", other);
            }
        }
        i += 1;
    }

    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정 (RUST_LOG 우선)
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let peer = parse_args();
    if peer.remote.is_empty() {
        return Err("--remote <IP> 필요 (--help 참고)".into());
    }

    info!("mead peer starting...");
    info!("Remote: {}:{}", peer.remote, peer.remote_port);
    info!("Local port: {}", peer.local_port);

    let transport = Transport::startup(peer.config)?;
    let handle = transport
        .rendezvous(&peer.remote, peer.remote_port, peer.local_port)
        .await?;
    info!("Connected (handle {})", handle);

    // 수신 태스크: 피어가 닫을 때까지 출력
    let receiver = {
        let transport = transport.clone();
        tokio::spawn(async move {
            loop {
                match transport.receive(handle, 4096, None).await {
                    Ok(data) if data.is_empty() => {
                        info!("Peer closed the stream");
                        break;
                    }
                    Ok(data) => print!("{}", String::from_utf8_lossy(&data)),
                    Err(e) => {
                        warn!("수신 종료: {}", e);
                        break;
                    }
                }
            }
        })
    };

    // 표준 입력 → 피어
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let start = Instant::now();
        let Some(line) = lines.next_line().await? else {
            break;
        };
        if peer.bench {
            println!(
                "Elapsed microseconds: {:.3} | Input: {}",
                start.elapsed().as_secs_f64() * 1e6,
                line
            );
        }
        if line == "quit" {
            break;
        }

        transport.send(handle, format!("{}\n", line), None).await?;
    }

    let stats = transport.stats(handle)?;
    transport.close(handle).await?;
    let _ = receiver.await;
    transport.cleanup(CleanupMode::ForceClose).await?;

    info!("{}", stats.summary());
    Ok(())
}
