//! TCP echo server. Sessions that stay silent for too long are told off
//! and closed.

use std::time::Duration;

use ioq::net::IpAddressPort;
use ioq::{logging, net, Fd, IoQueue};

const SESSION_TIMEOUT: Duration = Duration::from_secs(5);

async fn send_all(io: &IoQueue, socket: &Fd, mut data: &[u8]) -> Result<(), ()> {
    while !data.is_empty() {
        match io.send(socket.raw(), data).await.into_result() {
            Ok(0) => return Err(()),
            Ok(n) => data = &data[n as usize..],
            Err(e) => {
                log::error!("send: {e}");
                return Err(());
            }
        }
    }
    Ok(())
}

async fn session(io: IoQueue, socket: Fd) {
    loop {
        let mut buf = [0u8; 2048];
        let res = io
            .with_timeout(SESSION_TIMEOUT, io.recv(socket.raw(), &mut buf))
            .await;
        let received = match res.into_result() {
            Ok(0) => break,
            Ok(n) => n as usize,
            Err(e) if e.raw_os_error() == Some(libc::ECANCELED) => {
                let _ = send_all(&io, &socket, b"Session timed out. Bye!\n").await;
                break;
            }
            Err(e) => {
                log::error!("receive: {e}");
                break;
            }
        };
        if send_all(&io, &socket, &buf[..received]).await.is_err() {
            break;
        }
    }
    io.shutdown(socket.raw(), libc::SHUT_RDWR).await;
    io.close(socket.release()).await;
}

async fn serve(io: IoQueue, listener: Fd) {
    loop {
        match io.accept(listener.raw()).await.into_result() {
            Ok(fd) => {
                io.spawn(session(io.clone(), Fd::new(fd as i32)));
            }
            Err(e) => log::error!("accept: {e}"),
        }
    }
}

fn main() {
    logging::init();
    let addr = std::env::args().nth(1).unwrap_or_else(|| "0.0.0.0:4242".into());
    let addr = IpAddressPort::parse(&addr)
        .unwrap_or_else(|| logging::fatal(format_args!("invalid listen address '{addr}'")));
    let listener = net::create_tcp_listen_socket(&addr, libc::SOMAXCONN)
        .unwrap_or_else(|e| logging::fatal(format_args!("creating listen socket: {e}")));

    let io = IoQueue::new();
    io.spawn(serve(io.clone(), listener));
    log::info!("echo server listening on {addr}");
    io.run();
}
