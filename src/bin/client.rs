use std::io::{self, BufRead, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;

use datalink::link::frame::Deframer;
use datalink::{Config, DataLink, Event};

/// Connect-side demo peer: opens the byte pipe, brings the link up, and
/// ships every stdin line as one frame.
fn main() {
    env_logger::init();

    let socket = TcpStream::connect("127.0.0.1:9090").unwrap();
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
    thread::spawn(move || {
        for event in events {
            match event {
                Event::AckReceived { seq, rtt } => {
                    println!("<<< ack seq={} after {}ms", seq, rtt.as_millis());
                }
                Event::TransmissionFailed { seq, retries } => {
                    println!("<<< seq={} failed after {} retries", seq, retries);
                }
                Event::Disconnected { reason } => {
                    println!("<<< disconnected ({:?})", reason);
                    break;
                }
                _ => {}
            }
        }
    });

    link.connect().unwrap();
    println!(">>> Link connected; type lines to send, empty line to quit");

    for line in io::stdin().lock().lines() {
        let line = line.unwrap();
        if line.is_empty() {
            break;
        }
        link.send(line.as_bytes()).unwrap();
    }

    link.disconnect().unwrap();
}
