mod common;

use muddle_kademlia::{now, Error, PeerInfo, TrackerConfig};

use common::{address, port, settle, test_config, uri, Network};

#[test]
fn test_disconnect_duplicates() {
    let network = Network::new();
    let a = network.add_node(1, test_config());
    let b = network.add_node(2, test_config());
    assert!(a.address < b.address);

    network.connect(&a.address, &b.address);
    network.connect(&b.address, &a.address);

    // The higher address keeps its outgoing leg.
    b.tracker.disconnect_duplicates();
    assert!(network.has_connection(&a.address, &b.address));
    assert!(network.has_connection(&b.address, &a.address));

    a.tracker.disconnect_duplicates();
    assert!(!network.has_connection(&a.address, &b.address));
    assert!(network.has_connection(&b.address, &a.address));

    b.tracker.disconnect_duplicates();
    assert!(network.has_connection(&b.address, &a.address));
}

#[test]
fn test_pull_discovers_peers() {
    smol::block_on(async {
        let network = Network::new();
        let config = TrackerConfig {
            pull_peers: true,
            ..test_config()
        };
        let a = network.add_node(1, config);
        let b = network.add_node(2, test_config());
        let c = network.add_node(3, test_config());

        b.tracker
            .table()
            .report_existence(&PeerInfo::with_uri(c.address, c.uri.clone()), &b.address);
        network.connect(&a.address, &b.address);

        a.tracker.start().await.unwrap();
        settle().await;

        assert_eq!(a.tracker.table().get_uri(&c.address), Some(c.uri.clone()));
        let details = a.tracker.table().get_peer_details(&c.address).unwrap();
        assert_eq!(details.last_reporter, Some(b.address));

        let pool = a.tracker.connection_priority();
        let entry = pool.get(&c.address).unwrap();
        assert!(!entry.persistent);
        assert!(entry.desired_expiry.is_some_and(|t| t > now()));

        assert_eq!(a.tracker.status().pulls_in_flight, 0);
        a.tracker.stop().await;
    });
}

#[test]
fn test_failed_pull_reports_failure() {
    smol::block_on(async {
        let network = Network::new();
        let config = TrackerConfig {
            pull_peers: true,
            ..test_config()
        };
        let a = network.add_node(1, config);
        let b = network.add_node(2, test_config());

        a.tracker
            .table()
            .report_existence(&PeerInfo::with_uri(b.address, b.uri.clone()), &a.address);
        network.connect(&a.address, &b.address);
        network.set_responsive(&b.address, false);

        a.tracker.start().await.unwrap();
        settle().await;

        let details = a.tracker.table().get_peer_details(&b.address).unwrap();
        assert_eq!(details.failed_attempts, 1);
        a.tracker.stop().await;
    });
}

#[test]
fn test_failed_resolution_reports_failure() {
    smol::block_on(async {
        let network = Network::new();
        let config = TrackerConfig {
            register_connections: true,
            ..test_config()
        };
        let a = network.add_node(1, config);
        let b = network.add_node(2, test_config());

        a.tracker
            .table()
            .report_existence(&PeerInfo::with_uri(b.address, b.uri.clone()), &a.address);
        network.connect(&b.address, &a.address);
        network.set_responsive(&b.address, false);

        a.tracker.start().await.unwrap();
        settle().await;

        let details = a.tracker.table().get_peer_details(&b.address).unwrap();
        assert_eq!(details.failed_attempts, 1);
        assert!(!a.tracker.connection_priority().contains_key(&b.address));
        a.tracker.stop().await;
    });
}

#[test]
fn test_resolve_connections() {
    smol::block_on(async {
        let network = Network::new();
        let config = TrackerConfig {
            register_connections: true,
            ..test_config()
        };
        let a = network.add_node(1, config);
        let b = network.add_node(2, test_config());
        let c = network.add_node(3, test_config());
        b.tracker.set_muddle_ports(vec![port(2)]);

        network.connect(&b.address, &a.address);
        network.connect(&a.address, &c.address);

        a.tracker.start().await.unwrap();
        settle().await;

        // Outgoing: the dialed endpoint is used as is.
        let details = a.tracker.table().get_peer_details(&c.address).unwrap();
        assert_eq!(details.uri, Some(uri(3)));
        assert!(details.verified);

        // Incoming: the peer is asked for the port it listens on.
        assert_eq!(a.tracker.table().get_uri(&b.address), Some(uri(2)));

        let pool = a.tracker.connection_priority();
        assert!(pool.get(&b.address).unwrap().is_incoming);
        assert!(!pool.get(&b.address).unwrap().persistent);
        assert!(pool.get(&c.address).unwrap().persistent);
        a.tracker.stop().await;
    });
}

#[test]
fn test_connect_to_desired_peers() {
    smol::block_on(async {
        let network = Network::new();
        let config = TrackerConfig {
            allow_desired_connections: true,
            allow_connection_expiry: true,
            ..test_config()
        };
        let a = network.add_node(1, config);
        let c = network.add_node(3, test_config());
        let d = network.add_node(4, test_config());

        a.tracker
            .add_desired_peer_with_hint(&PeerInfo::with_uri(c.address, c.uri.clone()), None);
        a.tracker
            .add_desired_peer_with_hint(&PeerInfo::with_uri(d.address, d.uri.clone()), Some(now() - 1));

        a.tracker.start().await.unwrap();
        settle().await;

        assert!(network.has_connection(&a.address, &c.address));
        assert!(!network.has_connection(&a.address, &d.address));

        let status = a.tracker.status();
        assert!(status.desired_peers.contains(&c.address));
        assert!(!status.desired_peers.contains(&d.address));
        assert!(status.keep_connections.contains(&c.address));
        a.tracker.stop().await;
    });
}

#[test]
fn test_connect_to_desired_uri() {
    smol::block_on(async {
        let network = Network::new();
        let config = TrackerConfig {
            allow_desired_connections: true,
            register_connections: true,
            ..test_config()
        };
        let a = network.add_node(1, config);
        let c = network.add_node(3, test_config());

        a.tracker.add_desired_uri(&c.uri, None);
        a.tracker.start().await.unwrap();
        settle().await;
        assert!(network.has_connection(&a.address, &c.address));

        // Once the connection is resolved the uri becomes a desired address.
        a.tracker.periodically();
        assert!(a.tracker.table().desired_uris().is_empty());
        assert!(a.tracker.table().is_desired(&c.address));
        a.tracker.stop().await;
    });
}

#[test]
fn test_find_desired_peer_through_pull() {
    smol::block_on(async {
        let network = Network::new();
        let config = TrackerConfig {
            allow_desired_connections: true,
            pull_peers: true,
            ..test_config()
        };
        let a = network.add_node(1, config);
        let b = network.add_node(2, test_config());
        let c = network.add_node(3, test_config());

        b.tracker
            .table()
            .report_existence(&PeerInfo::with_uri(c.address, c.uri.clone()), &b.address);
        network.connect(&a.address, &b.address);
        a.tracker.add_desired_peer(&c.address, None);

        a.tracker.start().await.unwrap();
        settle().await;
        assert!(!network.has_connection(&a.address, &c.address));

        a.tracker.periodically();
        assert!(network.has_connection(&a.address, &c.address));
        a.tracker.stop().await;
    });
}

#[test]
fn test_connect_to_nearest() {
    smol::block_on(async {
        let network = Network::new();
        let config = TrackerConfig {
            connect_to_nearest: true,
            max_kademlia_connections: 3,
            ..test_config()
        };
        let a = network.add_node(1, config);
        for seed in 10..15 {
            let node = network.add_node(seed, test_config());
            a.tracker
                .table()
                .report_existence(&PeerInfo::with_uri(node.address, node.uri), &a.address);
        }

        a.tracker.start().await.unwrap();
        settle().await;

        assert_eq!(network.outgoing(&a.address).len(), 3);
        let status = a.tracker.status();
        assert_eq!(status.kademlia_connections.len(), 3);
        assert_eq!(status.kademlia_connections, network.outgoing(&a.address));

        // Connections are stable across ticks.
        a.tracker.periodically();
        assert_eq!(a.tracker.status().kademlia_connections, network.outgoing(&a.address));
        a.tracker.stop().await;
    });
}

#[test]
fn test_long_range_connectivity() {
    smol::block_on(async {
        let network = Network::new();
        let config = TrackerConfig {
            long_range_connectivity: true,
            max_longrange_connections: 1,
            ..test_config()
        };
        let a = network.add_node(1, config);
        for seed in 10..15 {
            let node = network.add_node(seed, test_config());
            a.tracker
                .table()
                .report_existence(&PeerInfo::with_uri(node.address, node.uri), &a.address);
        }

        a.tracker.start().await.unwrap();
        settle().await;

        assert_eq!(network.outgoing(&a.address).len(), 1);
        assert_eq!(a.tracker.longrange_priority().len(), 5);
        assert_eq!(a.tracker.status().longrange_connections, network.outgoing(&a.address));
        a.tracker.stop().await;
    });
}

#[test]
fn test_trim_peer_list() {
    smol::block_on(async {
        let network = Network::new();
        let config = TrackerConfig {
            trim_peer_list: true,
            ..test_config()
        };
        let a = network.add_node(1, config);
        let d = network.add_node(4, test_config());
        let e = network.add_node(5, test_config());

        network.connect(&a.address, &d.address);
        network.connect(&a.address, &e.address);
        network.connect(&d.address, &a.address);
        a.tracker.add_desired_peer(&e.address, None);

        a.tracker.start().await.unwrap();
        settle().await;

        assert!(!network.has_connection(&a.address, &d.address));
        assert!(network.has_connection(&a.address, &e.address));
        // Incoming connections are left alone.
        assert!(network.has_connection(&d.address, &a.address));
        a.tracker.stop().await;
    });
}

#[test]
fn test_disconnect_from_self() {
    smol::block_on(async {
        let network = Network::new();
        let config = TrackerConfig {
            disconnect_from_self: true,
            ..test_config()
        };
        let a = network.add_node(1, config);
        network.connect(&a.address, &a.address);

        a.tracker.start().await.unwrap();
        settle().await;

        assert!(!network.has_connection(&a.address, &a.address));
        a.tracker.stop().await;
    });
}

#[test]
fn test_directly_connected_peers() {
    smol::block_on(async {
        let network = Network::new();
        let a = network.add_node(1, test_config());
        let b = network.add_node(2, test_config());
        let c = network.add_node(3, test_config());
        network.connect(&a.address, &b.address);
        network.connect(&c.address, &a.address);

        a.tracker.start().await.unwrap();
        settle().await;

        let direct = a.tracker.directly_connected_peers();
        assert_eq!(direct.len(), 2);
        assert!(direct.contains(&b.address) && direct.contains(&c.address));
        a.tracker.stop().await;
    });
}

#[test]
fn test_behaviour_feedback() {
    smol::block_on(async {
        let network = Network::new();
        let config = TrackerConfig {
            connect_to_nearest: true,
            trim_peer_list: true,
            ..test_config()
        };
        let a = network.add_node(1, config);
        let b = network.add_node(2, test_config());
        a.tracker
            .table()
            .report_existence(&PeerInfo::with_uri(b.address, b.uri.clone()), &a.address);

        a.tracker.start().await.unwrap();
        settle().await;
        assert!(network.has_connection(&a.address, &b.address));

        a.tracker.report_behaviour(&b.address, 2.0);
        assert_eq!(a.tracker.connection_priority()[&b.address].connection_value, 2.0);

        a.tracker.schedule_disconnect(&b.address);
        let entry = a.tracker.connection_priority()[&b.address].clone();
        assert!(!entry.persistent);
        assert_eq!(entry.connection_value, 0.0);
        assert!(entry.desired_expiry.is_some_and(|t| t < now()));

        // The next tick no longer keeps the link.
        a.tracker.periodically();
        assert!(!network.has_connection(&a.address, &b.address));
        assert_eq!(a.tracker.connection_priority()[&b.address].priority, 0.0);
        a.tracker.stop().await;
    });
}

#[test]
fn test_stop_and_restart() {
    smol::block_on(async {
        let network = Network::new();
        let config = TrackerConfig {
            allow_desired_connections: true,
            ..test_config()
        };
        let a = network.add_node(1, config);
        let c = network.add_node(3, test_config());

        a.tracker.start().await.unwrap();
        settle().await;
        a.tracker.add_desired_peer(&address(9), None);
        a.tracker.track(address(9));

        a.tracker.stop().await;
        a.tracker.stop().await;
        let status = a.tracker.status();
        assert!(!status.is_running);
        assert!(status.desired_peers.is_empty());
        assert_eq!(status.queued_pulls, 0);

        // Ticks are no-ops while stopped.
        a.tracker
            .add_desired_peer_with_hint(&PeerInfo::with_uri(c.address, c.uri.clone()), None);
        a.tracker.periodically();
        assert!(!network.has_connection(&a.address, &c.address));

        a.tracker.start().await.unwrap();
        settle().await;
        assert!(network.has_connection(&a.address, &c.address));
        a.tracker.stop().await;
    });
}

#[test]
fn test_invalid_config() {
    let network = Network::new();
    let config = TrackerConfig {
        kademlia_bucket_size: 0,
        ..test_config()
    };
    assert!(matches!(
        network.try_add_node(1, config),
        Err(Error::Config(_))
    ));
}
