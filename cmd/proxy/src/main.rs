//! TCP proxy: bytes flow both ways between a client and an upstream
//! until either side closes, after which both sides are shut down.

use std::rc::Rc;
use std::time::Duration;

use ioq::net::{IpAddressPort, SocketType};
use ioq::{logging, net, Fd, IoQueue, WaitAll};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(2000);

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

async fn pump(io: IoQueue, from: Rc<Fd>, to: Rc<Fd>) {
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        let received = match io.recv(from.raw(), &mut buf).await.into_result() {
            Ok(0) => {
                log::info!("connection closed");
                break;
            }
            Ok(n) => n as usize,
            Err(e) => {
                log::error!("receive: {e}");
                break;
            }
        };
        if send_all(&io, &to, &buf[..received]).await.is_err() {
            break;
        }
    }
    // Shut both ends down so the opposite pump observes the closure too.
    io.shutdown(from.raw(), libc::SHUT_RDWR).await;
    io.shutdown(to.raw(), libc::SHUT_RDWR).await;
}

async fn handle_client(io: IoQueue, client: Fd, upstream_addr: IpAddressPort) {
    let upstream = match net::create_socket(SocketType::Tcp) {
        Ok(fd) => fd,
        Err(e) => {
            log::error!("creating upstream socket: {e}");
            io.close(client.release()).await;
            return;
        }
    };
    let sa = upstream_addr.to_sockaddr();
    let res = io
        .with_timeout(CONNECT_TIMEOUT, io.connect(upstream.raw(), &sa))
        .await;
    if let Err(e) = res.into_result() {
        // There is no good way to tell the client why; just hang up.
        if e.raw_os_error() == Some(libc::ECANCELED) {
            log::error!("connect timed out after {CONNECT_TIMEOUT:?}");
        } else {
            log::error!("connect: {e}");
        }
        io.close(client.release()).await;
        io.close(upstream.release()).await;
        return;
    }
    log::info!("connected to upstream at {upstream_addr}");

    let client = Rc::new(client);
    let upstream = Rc::new(upstream);
    let wait = WaitAll::new();
    wait.add(&io, pump(io.clone(), Rc::clone(&client), Rc::clone(&upstream)));
    wait.add(&io, pump(io.clone(), Rc::clone(&upstream), Rc::clone(&client)));
    wait.await;

    if let Ok(fd) = Rc::try_unwrap(client) {
        io.close(fd.release()).await;
    }
    if let Ok(fd) = Rc::try_unwrap(upstream) {
        io.close(fd.release()).await;
    }
    log::info!("done handling client");
}

async fn serve(io: IoQueue, listener: Fd, upstream_addr: IpAddressPort) {
    loop {
        match io.accept(listener.raw()).await.into_result() {
            Ok(fd) => {
                log::info!("got connection");
                io.spawn(handle_client(io.clone(), Fd::new(fd as i32), upstream_addr));
            }
            Err(e) => log::error!("accept: {e}"),
        }
    }
}

fn main() {
    logging::init();
    let mut args = std::env::args().skip(1);
    let listen = args.next().unwrap_or_else(|| "127.0.0.1:4242".into());
    let upstream = args.next().unwrap_or_else(|| "127.0.0.1:4243".into());
    let listen = IpAddressPort::parse(&listen)
        .unwrap_or_else(|| logging::fatal(format_args!("invalid listen address '{listen}'")));
    let upstream = IpAddressPort::parse(&upstream)
        .unwrap_or_else(|| logging::fatal(format_args!("invalid upstream address '{upstream}'")));

    let listener = net::create_tcp_listen_socket(&listen, libc::SOMAXCONN)
        .unwrap_or_else(|e| logging::fatal(format_args!("creating listen socket: {e}")));

    let io = IoQueue::new();
    io.spawn(serve(io.clone(), listener, upstream));
    log::info!("proxying {listen} -> {upstream}");
    io.run();
}
