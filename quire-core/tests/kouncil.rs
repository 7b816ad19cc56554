mod common;

use common::{wait_for, Cluster};
use quire_core::{Block, Overlay, Peer, ReplicationConfig, StoreMode};
use std::collections::HashSet;
use std::time::Duration;

fn replication() -> ReplicationConfig {
    ReplicationConfig::new(1, 1).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_address_book_converges() {
    let cluster = Cluster::start(3, replication()).await;
    cluster.wait_fully_connected().await;

    let mut stored = Vec::new();
    for (index, node) in cluster.nodes.iter().enumerate() {
        let block = Block::immutable(format!("block of n{}", index));
        node.local().store_block(&block, StoreMode::Insert).await.unwrap();
        stored.push((cluster.id(index), block.address()));
    }

    for observer in 0..cluster.nodes.len() {
        let kouncil = cluster.kouncil(observer).clone();
        let stored = stored.clone();
        wait_for(&format!("n{} address book", observer), || {
            let kouncil = kouncil.clone();
            let stored = stored.clone();
            async move {
                for (holder, address) in &stored {
                    if !kouncil.holders(address).await.contains(holder) {
                        return false;
                    }
                }
                true
            }
        })
        .await;
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disconnect_purges_and_reconnect_restores_holdings() {
    let cluster = Cluster::start(2, replication()).await;
    cluster.wait_fully_connected().await;

    let block = Block::immutable("held by n1");
    let address = block.address();
    let holder = cluster.id(1);
    cluster.nodes[1]
        .local()
        .store_block(&block, StoreMode::Insert)
        .await
        .unwrap();

    let observer = cluster.kouncil(0).clone();
    wait_for("n0 to learn n1 holds the block", || {
        let observer = observer.clone();
        async move { observer.holders(&address).await.contains(&holder) }
    })
    .await;

    cluster.offline(1).await;
    wait_for("n0 to forget n1 holdings", || {
        let observer = observer.clone();
        async move {
            !observer.connected_peers().await.contains(&holder)
                && !observer.holders(&address).await.contains(&holder)
        }
    })
    .await;

    cluster.online(1).await;
    wait_for("n0 to relearn n1 holdings", || {
        let observer = observer.clone();
        async move { observer.holders(&address).await.contains(&holder) }
    })
    .await;

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_allocate_picks_distinct_peers() {
    let cluster = Cluster::start(4, replication()).await;
    cluster.wait_fully_connected().await;

    let kouncil = cluster.kouncil(0);
    let address = Block::immutable("to place").address();
    for _ in 0..20 {
        let picked = kouncil.allocate(&address, 3).await.unwrap();
        let ids: HashSet<_> = picked.iter().filter_map(|member| member.id()).collect();
        assert_eq!(picked.len(), 3);
        assert_eq!(ids.len(), 3);
    }

    let everyone = kouncil.allocate(&address, 10).await.unwrap();
    assert_eq!(everyone.len(), 4);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lookup_finds_remote_holder_and_misses_quickly() {
    let cluster = Cluster::start(2, replication()).await;
    cluster.wait_fully_connected().await;

    let block = Block::immutable("remote data");
    let address = block.address();
    let holder = cluster.id(1);
    cluster.nodes[1]
        .local()
        .store_block(&block, StoreMode::Insert)
        .await
        .unwrap();

    let kouncil = cluster.kouncil(0).clone();
    wait_for("n0 lookup to return n1", || {
        let kouncil = kouncil.clone();
        async move {
            let found = kouncil.lookup(&address, 2).await.unwrap();
            found.len() == 1 && found[0].id() == Some(holder)
        }
    })
    .await;

    let found = kouncil.lookup(&address, 2).await.unwrap();
    assert_eq!(found[0].fetch(&address).await.unwrap(), block);

    // Nobody has it: the fallback asks n1 and comes back empty.
    let unknown = Block::immutable("nowhere").address();
    let missing = tokio::time::timeout(Duration::from_secs(5), kouncil.lookup(&unknown, 2))
        .await
        .expect("lookup of an unknown block hung")
        .unwrap();
    assert!(missing.is_empty());

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_removal_leaves_address_book() {
    let cluster = Cluster::start(2, replication()).await;
    cluster.wait_fully_connected().await;

    let block = Block::immutable("short lived");
    let address = block.address();
    let local = cluster.nodes[0].local();
    local.store_block(&block, StoreMode::Insert).await.unwrap();

    let kouncil = cluster.kouncil(0).clone();
    let me = cluster.id(0);
    wait_for("local entry", || {
        let kouncil = kouncil.clone();
        async move { kouncil.holders(&address).await.contains(&me) }
    })
    .await;

    local.remove_block(&address).await.unwrap();
    wait_for("local entry removal", || {
        let kouncil = kouncil.clone();
        async move { !kouncil.holders(&address).await.contains(&me) }
    })
    .await;

    let stats = kouncil.stats().await;
    assert_eq!(stats.id, me);
    assert_eq!(stats.peers.len(), 1);
    assert!(stats.peers[0].connected);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_peers_learned_through_gossip_connect_directly() {
    // n1 and n2 are only seeded with n0; they find each other through
    // the tables exchanged on connect.
    let cluster = Cluster::start(3, replication()).await;

    let second = cluster.kouncil(1).clone();
    let third = cluster.id(2);
    wait_for("n1 to connect to n2", || {
        let second = second.clone();
        async move { second.connected_peers().await.contains(&third) }
    })
    .await;

    cluster.wait_fully_connected().await;
    for index in 0..3 {
        let infos = cluster.kouncil(index).infos().await;
        for other in 0..3 {
            assert!(infos.contains_key(&cluster.id(other)));
        }
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lookup_after_holder_leaves_returns_empty() {
    let cluster = Cluster::start(3, replication()).await;
    cluster.wait_fully_connected().await;

    let block = Block::immutable("only on n1");
    let address = block.address();
    let holder = cluster.id(1);
    cluster.nodes[1]
        .local()
        .store_block(&block, StoreMode::Insert)
        .await
        .unwrap();

    for observer in [0, 2] {
        let kouncil = cluster.kouncil(observer).clone();
        wait_for(&format!("n{} to learn the holder", observer), || {
            let kouncil = kouncil.clone();
            async move { kouncil.holders(&address).await.contains(&holder) }
        })
        .await;
    }

    cluster.offline(1).await;
    for observer in [0, 2] {
        let kouncil = cluster.kouncil(observer).clone();
        wait_for(&format!("n{} to forget the holder", observer), || {
            let kouncil = kouncil.clone();
            async move { kouncil.holders(&address).await.is_empty() }
        })
        .await;
    }

    // The address book is empty, so n0 asks n2, which knows nothing either.
    let kouncil = cluster.kouncil(0).clone();
    let found = tokio::time::timeout(Duration::from_secs(5), kouncil.lookup(&address, 1))
        .await
        .expect("lookup after the holder left hung")
        .unwrap();
    assert!(found.is_empty());

    cluster.shutdown().await;
}
