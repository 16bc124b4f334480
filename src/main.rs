use std::sync::Arc;
use std::thread;
use std::time::Duration;

use datalink::{Config, DataLink, Event};
use rand::Rng;

/// Loopback demo: two link peers in one process, joined by a channel that
/// randomly drops and corrupts frames. The delivered stream stays intact and
/// in order; the counters at the end show what the channel did on the way.
fn main() {
    env_logger::init();

    let config = Config {
        ack_timeout: Duration::from_millis(300),
        connect_timeout: Duration::from_millis(2000),
        // Short liveness so a half-open handshake (lost CONN_ACK) clears
        // itself within a few seconds.
        heartbeat_interval: Duration::from_millis(1000),
        ..Config::default()
    };

    let a = Arc::new(DataLink::new(config.clone()));
    let b = Arc::new(DataLink::new(config));

    // Forward path is rough, return path only drops.
    wire(&a, &b, 0.10, 0.05);
    wire(&b, &a, 0.05, 0.0);

    let b_events = b.take_events().unwrap();
    {
        let b = b.clone();
        thread::spawn(move || {
            for event in b_events {
                match event {
                    Event::ConnectionRequest { remote_seq } => {
                        b.accept(remote_seq);
                    }
                    Event::DataReceived { seq, bytes } => {
                        println!("b: seq={} {:?}", seq, String::from_utf8_lossy(&bytes));
                    }
                    Event::Disconnected { reason } => {
                        println!("b: disconnected ({:?})", reason);
                        break;
                    }
                    _ => {}
                }
            }
        });
    }

    let a_events = a.take_events().unwrap();
    thread::spawn(move || {
        for event in a_events {
            match event {
                Event::AckReceived { seq, rtt } => {
                    println!("a: ack seq={} after {}ms", seq, rtt.as_millis());
                }
                Event::TransmissionFailed { seq, retries } => {
                    println!("a: seq={} failed after {} retries", seq, retries);
                }
                Event::Disconnected { reason } => {
                    println!("a: disconnected ({:?})", reason);
                    break;
                }
                _ => {}
            }
        }
    });

    while a.connect().is_err() {
        println!("a: connect timed out (handshake frame lost), retrying");
    }
    println!("a: connected");

    for i in 0..10 {
        let msg = format!("mensaje {}", i);
        a.send(msg.as_bytes()).unwrap();
    }

    // Let the retransmission machinery finish before tearing down.
    thread::sleep(Duration::from_secs(3));

    let stats = a.stats();
    println!(
        "a: sent={} retransmits={} failed={} spurious_acks={}",
        stats.frames_sent, stats.retransmits, stats.frames_failed, stats.spurious_acks
    );
    let stats = b.stats();
    println!(
        "b: received={} crc_errors={} duplicates={}",
        stats.frames_received, stats.crc_errors, stats.duplicates_dropped
    );

    a.disconnect().unwrap();
    thread::sleep(Duration::from_millis(300));
}

/// Connects `from`'s transmit hook to `to`'s receive upcall through a lossy,
/// corrupting pipe.
fn wire(from: &Arc<DataLink>, to: &Arc<DataLink>, loss: f64, corruption: f64) {
    let to = to.clone();
    from.set_tx(move |frame| {
        let mut rng = rand::thread_rng();
        if rng.gen_bool(loss) {
            return;
        }
        if rng.gen_bool(corruption) {
            let mut copy = frame.to_vec();
            // Damage the interior, leaving the delimiters alone.
            let i = rng.gen_range(1..copy.len() - 1);
            copy[i] ^= 0x55;
            to.rx(&copy);
        } else {
            to.rx(frame);
        }
    })
    .unwrap();
}
