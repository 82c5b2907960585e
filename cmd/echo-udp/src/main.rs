//! UDP echo server: every datagram goes straight back to its sender.

use ioq::net::{IpAddressPort, SocketType};
use ioq::{logging, net, Fd, IoQueue};

async fn serve(io: IoQueue, socket: Fd) {
    loop {
        let mut buf = [0u8; 2048];
        let (res, from) = io.recvfrom(socket.raw(), &mut buf, 0).await;
        let received = match res.into_result() {
            Ok(n) => n as usize,
            Err(e) => {
                log::error!("recvmsg: {e}");
                continue;
            }
        };
        let Some(from) = from else { continue };
        let res = io.sendto(socket.raw(), &buf[..received], 0, from).await;
        if !res.is_ok() {
            log::error!("sendmsg: {}", res.error());
        }
    }
}

fn main() {
    logging::init();
    let addr = std::env::args().nth(1).unwrap_or_else(|| "0.0.0.0:4242".into());
    let addr = IpAddressPort::parse(&addr)
        .unwrap_or_else(|| logging::fatal(format_args!("invalid listen address '{addr}'")));
    let socket = net::create_socket_bound(SocketType::Udp, &addr, false)
        .unwrap_or_else(|e| logging::fatal(format_args!("creating socket: {e}")));

    let io = IoQueue::new();
    io.spawn(serve(io.clone(), socket));
    log::info!("udp echo listening on {addr}");
    io.run();
}
