// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Announcer to scanner over loopback UDP.

use std::net::{Ipv4Addr, UdpSocket};
use std::time::Duration;
use termbuddy::discovery::{Announcer, AnnouncerConfig, Scanner, ScannerConfig};

const WAIT: Duration = Duration::from_secs(5);

fn free_udp_port() -> u16 {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    socket.local_addr().unwrap().port()
}

fn announcer_config(port: u16, tcp_port: u16) -> AnnouncerConfig {
    AnnouncerConfig {
        host_name: "Ann".into(),
        room_name: "Ann's Room".into(),
        tcp_port,
        discovery_port: port,
        interval: Duration::from_millis(50),
        targets: Some(vec![Ipv4Addr::LOCALHOST]),
    }
}

fn scanner_config(port: u16) -> ScannerConfig {
    ScannerConfig {
        bind_address: Ipv4Addr::LOCALHOST,
        port,
        prune_interval: Duration::from_millis(50),
        stale_after: Duration::from_millis(300),
    }
}

#[tokio::test]
async fn test_room_appears_then_goes_stale() {
    let port = free_udp_port();
    let scanner = Scanner::start(scanner_config(port)).await.unwrap();
    let mut updates = scanner.subscribe();

    let announcer = Announcer::start(announcer_config(port, 40123)).await.unwrap();
    assert_eq!(announcer.targets(), &[Ipv4Addr::LOCALHOST]);

    let rooms = tokio::time::timeout(WAIT, updates.wait_for(|rooms| !rooms.is_empty()))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0].host_name, "Ann");
    assert_eq!(rooms[0].room_name, "Ann's Room");
    assert_eq!(rooms[0].tcp_port, 40123);
    assert_eq!(rooms[0].addr().to_string(), "127.0.0.1:40123");

    // Repeated announcements refresh the entry without duplicating it.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(scanner.rooms().len(), 1);

    announcer.stop().await;
    tokio::time::timeout(WAIT, updates.wait_for(|rooms| rooms.is_empty()))
        .await
        .unwrap()
        .unwrap();
    assert!(scanner.rooms().is_empty());

    scanner.stop().await;
}

#[tokio::test]
async fn test_two_rooms_on_one_address() {
    let port = free_udp_port();
    let scanner = Scanner::start(scanner_config(port)).await.unwrap();
    let mut updates = scanner.subscribe();

    let first = Announcer::start(announcer_config(port, 40001)).await.unwrap();
    let second = Announcer::start(announcer_config(port, 40002)).await.unwrap();

    let rooms = tokio::time::timeout(WAIT, updates.wait_for(|rooms| rooms.len() == 2))
        .await
        .unwrap()
        .unwrap()
        .clone();
    let mut ports: Vec<u16> = rooms.iter().map(|r| r.tcp_port).collect();
    ports.sort_unstable();
    assert_eq!(ports, vec![40001, 40002]);

    first.stop().await;
    second.stop().await;
    scanner.stop().await;
}

#[tokio::test]
async fn test_garbage_datagrams_ignored() {
    let port = free_udp_port();
    let scanner = Scanner::start(scanner_config(port)).await.unwrap();

    let sender = tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    for payload in [
        &b"not json"[..],
        br#"{"type":"other","version":1,"hostName":"X","roomName":"Y","tcpPort":1,"sentAt":0}"#,
        br#"{"type":"termbuddy_discovery","version":2,"hostName":"X","roomName":"Y","tcpPort":1,"sentAt":0}"#,
    ] {
        sender.send_to(payload, (Ipv4Addr::LOCALHOST, port)).await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(scanner.rooms().is_empty());

    scanner.stop().await;
}
