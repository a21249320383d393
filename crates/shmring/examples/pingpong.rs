//! Duplex ping-pong over one bidirectional channel.
//!
//! Two threads stand in for the sidecar and host processes; run with
//! `cargo run --example pingpong`.

use shmring::Channel;
use std::thread;

const ROUNDS: u32 = 1_000;

fn main() -> shmring::Result<()> {
    let name = format!("/shmring-pingpong-{}", std::process::id());

    let mut sidecar = Channel::create(&name, 0xBEEF, 4096, 4096)?;
    let host = thread::spawn({
        let name = name.clone();
        move || -> shmring::Result<u32> {
            let mut host = Channel::open(&name)?;
            let mut echoed = 0;
            loop {
                let msg = match host.recv() {
                    Ok(msg) => msg,
                    Err(shmring::Error::Closed) => return Ok(echoed),
                    Err(e) => return Err(e),
                };
                host.send(&msg)?;
                echoed += 1;
            }
        }
    });

    for i in 0..ROUNDS {
        let ping = format!("ping {i}");
        sidecar.send(ping.as_bytes())?;
        let pong = sidecar.recv()?;
        assert_eq!(pong, ping.as_bytes());
    }
    println!(
        "{} round trips over {:?} (peer pid {})",
        ROUNDS,
        sidecar.name(),
        sidecar.peer_pid()
    );

    sidecar.close();
    let echoed = host.join().expect("host thread panicked")?;
    println!("host echoed {echoed} messages");
    Ok(())
}
