//! End to end over loopback UDP: the sender plays four radios against a
//! base station running `PacketTxRx` on the socket link.

mod common;

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use common::{init_test_tracing, wait_until};
use mimo_txrx::config::{SenderConfig, SocketConfig, TxRxConfig};
use mimo_txrx::event::EventType;
use mimo_txrx::link::SocketLink;
use mimo_txrx::runtime::PacketTxRx;
use mimo_txrx::sender::Sender;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Port bases unlikely to collide with a parallel run of the suite.
fn port_bases() -> (u16, u16) {
    let base = 30_000 + (std::process::id() % 1000) as u16 * 16;
    (base, base + 8)
}

#[test]
fn sender_frames_reach_the_base_station() {
    init_test_tracing();
    let (station_port, radio_port) = port_bases();
    let config = TxRxConfig {
        radio_count: 4,
        channel_count: 1,
        symbols_per_frame: 4,
        samples_per_symbol: 64,
        buffer_frame_count: 40,
        worker_threads: 2,
        core_offset: None,
        socket: SocketConfig {
            local_addr: LOCALHOST,
            local_base_port: station_port,
            remote_addr: LOCALHOST,
            remote_base_port: radio_port,
            recv_buffer_size: None,
        },
        ..TxRxConfig::default()
    };

    let station_link = SocketLink::new(&config).unwrap();
    let (txrx, mut queues) = PacketTxRx::start(&config, Arc::new(station_link)).unwrap();

    let mut radio_config = config.clone();
    radio_config.socket = config.socket.mirrored();
    let radio_link = SocketLink::new(&radio_config).unwrap();
    let frames = 20;
    let settings = SenderConfig {
        threads: 2,
        core_offset: None,
        frame_delay_us: 1000,
        max_frames: Some(frames),
        iq_file: None,
    };
    let sender = Sender::new(config.clone(), settings, Arc::new(radio_link)).unwrap();
    let radios = std::thread::spawn(move || sender.run());

    let expected = 4 * 4 * frames as usize;
    let mut seen = HashSet::new();
    let mut events = Vec::new();
    let complete = wait_until(Duration::from_secs(10), || {
        events.clear();
        queues.messages.dequeue_bulk(&mut events, 64);
        for event in &events {
            assert_eq!(event.event_type, EventType::PacketReceived);
            let slot = queues.take_rx(event.tag).unwrap();
            let header = slot.packet().unwrap().header();
            seen.insert((header.frame_id, header.symbol_id, header.antenna_id));
            slot.release();
        }
        seen.len() == expected
    });

    let report = radios.join().unwrap().unwrap();
    assert_eq!(report.packets, expected as u64);
    assert!(complete, "received {} of {expected} packets", seen.len());
    for frame in 0..frames as i32 {
        for symbol in 0..4 {
            for antenna in 0..4 {
                assert!(seen.contains(&(frame, symbol, antenna)));
            }
        }
    }
    txrx.shutdown().unwrap();
}
