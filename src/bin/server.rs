use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;

use datalink::link::frame::Deframer;
use datalink::{Config, DataLink, Event};

/// Accept-side demo peer. A TCP socket stands in for the physical byte
/// pipe; the deframer re-chunks the stream into frames for `rx`.
fn main() {
    env_logger::init();

    let listener = TcpListener::bind("127.0.0.1:9090").unwrap();
    println!(">>> Waiting for a byte pipe on 127.0.0.1:9090...");
    let (socket, addr) = listener.accept().unwrap();
    println!(">>> Byte pipe up from {}", addr);

    let link = Arc::new(DataLink::new(Config::default()));

    let tx_socket = socket.try_clone().unwrap();
    link.set_tx(move |frame| {
        let _ = (&tx_socket).write_all(frame);
    })
    .unwrap();

    {
        let link = link.clone();
        let mut socket = socket;
        thread::spawn(move || {
            let mut deframer = Deframer::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = match socket.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                for frame in deframer.push(&buf[..n]) {
                    link.rx(&frame);
                }
            }
        });
    }

    let events = link.take_events().unwrap();
    for event in events {
        match event {
            Event::ConnectionRequest { remote_seq } => {
                println!(">>> Connection requested, accepting");
                link.accept(remote_seq);
            }
            Event::DataReceived { seq, bytes } => {
                println!(
                    ">>> Read seq={}: {:?}",
                    seq,
                    String::from_utf8_lossy(&bytes)
                );
            }
            Event::Disconnected { reason } => {
                println!(">>> Disconnected ({:?})", reason);
                break;
            }
            _ => {}
        }
    }
}
