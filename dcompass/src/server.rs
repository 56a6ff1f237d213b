//! The server fabric (C7): four independent listeners (UDPv4, UDPv6,
//! TCPv4, TCPv6), each spawning one handler task per request.

use droute::{AddressFamily, Pipeline};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;

/// A cheap "wait group": clone `tracker` into every spawned handler
/// task and drop the clone when it finishes. Once every clone
/// (including the original held by `serve`) has dropped, `drained`
/// resolves.
#[derive(Clone)]
struct InFlight(mpsc::Sender<()>);

impl InFlight {
    fn new() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self(tx), rx)
    }
}

async fn wait_drained(mut rx: mpsc::Receiver<()>) {
    while rx.recv().await.is_some() {}
}

const MAX_UDP_MESSAGE: usize = 4096;
const TCP_BUF_SIZE: usize = 8192;

fn reuseaddr_socket(domain: Domain, ty: Type, addr: SocketAddr) -> std::io::Result<Socket> {
    let socket = Socket::new(domain, ty, Some(Protocol::from(if ty == Type::STREAM { 6 } else { 17 })))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

/// Run the four listeners until `shutdown` resolves, then return once
/// every in-flight handler this function spawned has completed.
pub async fn serve(pipeline: Arc<Pipeline>, port: u16, shutdown: impl std::future::Future<Output = ()>) -> anyhow::Result<()> {
    let udp4 = bind_udp(SocketAddr::new("0.0.0.0".parse()?, port))?;
    let udp6 = bind_udp(SocketAddr::new("::".parse()?, port))?;
    let tcp4 = bind_tcp(SocketAddr::new("0.0.0.0".parse()?, port))?;
    let tcp6 = bind_tcp(SocketAddr::new("::".parse()?, port))?;

    let (tracker, rx) = InFlight::new();

    let udp4_task = spawn_udp_listener(udp4, AddressFamily::V4, pipeline.clone(), tracker.clone());
    let udp6_task = spawn_udp_listener(udp6, AddressFamily::V6, pipeline.clone(), tracker.clone());
    let tcp4_task = spawn_tcp_listener(tcp4, AddressFamily::V4, pipeline.clone(), tracker.clone());
    let tcp6_task = spawn_tcp_listener(tcp6, AddressFamily::V6, pipeline.clone(), tracker.clone());

    shutdown.await;
    log::info!("shutdown requested, no longer accepting new connections");
    udp4_task.abort();
    udp6_task.abort();
    tcp4_task.abort();
    tcp6_task.abort();
    drop(tracker);

    wait_drained(rx).await;
    Ok(())
}

fn bind_udp(addr: SocketAddr) -> anyhow::Result<UdpSocket> {
    let socket = reuseaddr_socket(Domain::for_address(addr), Type::DGRAM, addr)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

fn bind_tcp(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let socket = reuseaddr_socket(Domain::for_address(addr), Type::STREAM, addr)?;
    socket.listen(1024)?;
    Ok(TcpListener::from_std(socket.into())?)
}

fn spawn_udp_listener(
    socket: UdpSocket,
    family: AddressFamily,
    pipeline: Arc<Pipeline>,
    tracker: InFlight,
) -> tokio::task::JoinHandle<()> {
    let socket = Arc::new(socket);
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_UDP_MESSAGE];
        loop {
            let (n, src) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("udp recv error: {e}");
                    continue;
                }
            };
            let query = buf[..n].to_vec();
            let socket = socket.clone();
            let pipeline = pipeline.clone();
            let guard = tracker.clone();
            tokio::spawn(async move {
                let _guard = guard;
                if let Some(reply) = pipeline.handle(src.ip(), family, &query).await {
                    if let Err(e) = socket.send_to(&reply, src).await {
                        log::warn!("udp send error to {src}: {e}");
                    }
                }
            });
        }
    })
}

fn spawn_tcp_listener(
    listener: TcpListener,
    family: AddressFamily,
    pipeline: Arc<Pipeline>,
    tracker: InFlight,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (stream, src) = match listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("tcp accept error: {e}");
                    continue;
                }
            };
            let pipeline = pipeline.clone();
            let guard = tracker.clone();
            tokio::spawn(async move {
                let _guard = guard;
                if let Err(e) = handle_tcp_connection(stream, src, family, &pipeline).await {
                    log::debug!("tcp connection with {src} ended: {e}");
                }
            });
        }
    })
}

async fn handle_tcp_connection(
    mut stream: TcpStream,
    src: SocketAddr,
    family: AddressFamily,
    pipeline: &Pipeline,
) -> anyhow::Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return Ok(());
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut query = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let chunk_end = (filled + TCP_BUF_SIZE).min(len);
            let n = stream.read(&mut query[filled..chunk_end]).await?;
            if n == 0 {
                return Ok(());
            }
            filled += n;
        }

        if let Some(reply) = pipeline.handle(src.ip(), family, &query).await {
            let reply_len = u16::try_from(reply.len()).unwrap_or(u16::MAX);
            stream.write_all(&reply_len.to_be_bytes()).await?;
            stream.write_all(&reply[..reply_len as usize]).await?;
        }
    }
}
