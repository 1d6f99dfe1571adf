//! Ping-pong between two fibers over a socket pair
//!
//! Each side does blocking-style reads: on `WouldBlock` it registers for
//! `Read` with the IoManager and yields until the reactor resumes it.
//!
//! # Environment Variables
//!
//! - `PING_ROUNDS=N` - Round trips to run (default 10000)
//! - `PING_WORKERS=N` - Worker threads (default 2)
//! - `WEFT_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)

use weft::{env_get, kdebug, kerror, kinfo, Event, Fiber, IoManager};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::mpsc;
use std::time::Instant;

/// Read at least one byte, parking the fiber while the socket is empty
fn read_some(stream: &mut UnixStream, buf: &mut [u8]) -> std::io::Result<usize> {
    let iom = IoManager::current()
        .ok_or_else(|| std::io::Error::other("not running on an io manager"))?;
    loop {
        match stream.read(buf) {
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                iom.add_event(stream.as_raw_fd(), Event::Read)
                    .map_err(std::io::Error::other)?;
                Fiber::yield_to_hold();
            }
            other => return other,
        }
    }
}

fn side(mut stream: UnixStream, rounds: usize, serve: bool) -> std::io::Result<usize> {
    let (send, expect): (&[u8], &[u8]) = if serve { (b"pong", b"ping") } else { (b"ping", b"pong") };
    let mut buf = [0u8; 4];
    for round in 0..rounds {
        if !serve {
            stream.write_all(send)?;
        }
        let mut got = 0;
        while got < buf.len() {
            let n = read_some(&mut stream, &mut buf[got..])?;
            if n == 0 {
                return Ok(round);
            }
            got += n;
        }
        if buf != expect {
            return Err(std::io::Error::new(ErrorKind::InvalidData, "unexpected message"));
        }
        if serve {
            stream.write_all(send)?;
        }
        kdebug!("[{}] round {}", if serve { "pong" } else { "ping" }, round);
    }
    Ok(rounds)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== weft Pipe Ping ===\n");

    let rounds: usize = env_get("PING_ROUNDS", 10_000);
    let workers: usize = env_get("PING_WORKERS", 2);

    let iom = IoManager::new(workers, false, "pipe-ping")?;
    let (a, b) = UnixStream::pair()?;
    a.set_nonblocking(true)?;
    b.set_nonblocking(true)?;

    let (tx, rx) = mpsc::channel();
    let start = Instant::now();
    for (stream, serve) in [(a, false), (b, true)] {
        let tx = tx.clone();
        iom.schedule_fn(move || {
            let result = side(stream, rounds, serve);
            let _ = tx.send((serve, result));
        });
    }
    drop(tx);

    for (serve, result) in rx {
        let name = if serve { "pong" } else { "ping" };
        match result {
            Ok(n) => kinfo!("[{}] finished {} rounds", name, n),
            Err(e) => kerror!("[{}] failed: {}", name, e),
        }
    }
    let elapsed = start.elapsed();

    iom.stop();
    println!(
        "{} round trips in {:?} ({:.0} ns/round trip)",
        rounds,
        elapsed,
        elapsed.as_nanos() as f64 / rounds.max(1) as f64
    );
    println!("\n=== Example Complete ===");
    Ok(())
}

