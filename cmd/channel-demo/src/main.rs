//! Channel walkthrough: two loop-side receivers fed by the loop itself
//! and by a worker thread, plus an event listener tick counter.

use std::sync::Arc;
use std::time::Duration;

use ioq::threadpool::default_pool;
use ioq::{logging, Channel, EventListener, IoQueue};

fn receiver(id: &'static str, io: &IoQueue, channel: &Arc<Channel<String>>) {
    let io2 = io.clone();
    let channel = Arc::clone(channel);
    io.spawn(async move {
        loop {
            let msg = channel.receive(&io2).await;
            log::info!("[{id}] message: {msg}");
        }
    });
}

fn main() {
    logging::init();
    let io = IoQueue::new();
    let channel = Arc::new(Channel::new());

    receiver("1", &io, &channel);
    receiver("2", &io, &channel);

    let ticks = EventListener::new(&io, |n: u64| log::info!("[listener] tick {n}"));

    // A worker thread producing in bursts.
    let from_pool = Arc::clone(&channel);
    default_pool().push(move || {
        let mut tick = 0u64;
        loop {
            for _ in 0..3 {
                from_pool.send("Whattup".into());
            }
            tick += 1;
            ticks.emit(tick);
            std::thread::sleep(Duration::from_millis(1000));
        }
    });

    // And the loop producing at its own pace.
    let io2 = io.clone();
    let from_loop = Arc::clone(&channel);
    io.spawn(async move {
        loop {
            from_loop.send("Hello!".into());
            io2.timeout(Duration::from_millis(1000)).await;
        }
    });

    io.run();
}
