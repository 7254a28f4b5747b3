// Multi-node behavior over real TCP: peer forwarding, fallback to local
// retrieval, redirect loop prevention, and watch-driven ring rebuilds.
// "Nodes" share one process and one in-memory registry; servers bind
// ephemeral localhost ports.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use distcache::discovery::{MemoryRegistry, ServiceRegistry};
use distcache::peers::{Fetcher, PeerPicker};
use distcache::rpc::{read_frame, write_frame, Client, GetRequest, GetResponse, Server, Status};
use distcache::{destroy_group, new_group, ByteView, CacheError, RetrieverFn};

/// Polls `cond` until it holds or the ring-convergence SLO (5s) elapses.
async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// A scripted peer speaking the wire protocol: answers every request with
/// `response` and records what it saw.
async fn spawn_scripted_peer(
    response: GetResponse,
) -> (SocketAddr, Arc<AtomicUsize>, Arc<Mutex<Vec<GetRequest>>>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(Mutex::new(Vec::new()));
    let (conn_counter, request_log) = (connections.clone(), requests.clone());
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            conn_counter.fetch_add(1, Ordering::SeqCst);
            let response = response.clone();
            let request_log = request_log.clone();
            tokio::spawn(async move {
                while let Ok(Some(request)) = read_frame::<_, GetRequest>(&mut stream).await {
                    request_log.lock().unwrap().push(request);
                    if write_frame(&mut stream, &response).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    (addr, connections, requests)
}

/// Finds a key the given server maps to `owner`.
fn key_owned_by(server: &Server, owner: &str) -> String {
    for i in 0..10_000 {
        let key = format!("key-{i}");
        if server.owner_of(&key).as_deref() == Some(owner) {
            return key;
        }
    }
    panic!("no key maps to {owner}");
}

#[tokio::test]
async fn forwarded_get_is_served_by_owner_not_local_retriever() {
    let registry = MemoryRegistry::new();
    let n1 = Server::new("svc-fwd", registry.clone());
    let n1_addr = n1.start("127.0.0.1:0").await.unwrap().to_string();

    // the owner peer answers with "X" over the wire
    let (peer_addr, _connections, requests) = spawn_scripted_peer(GetResponse::ok(b"X".to_vec())).await;
    registry
        .register("svc-fwd", &peer_addr.to_string())
        .await
        .unwrap();
    assert!(wait_for(|| n1.peers().len() == 2).await, "ring should converge");

    let local_calls = Arc::new(AtomicUsize::new(0));
    let calls = local_calls.clone();
    let group = new_group(
        "cluster-fwd",
        "lru",
        1024,
        Arc::new(RetrieverFn(move |_key: &str| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(b"LOCAL".to_vec())
        })),
    )
    .unwrap();
    group.register_server(Arc::new(n1.clone())).unwrap();

    let key = key_owned_by(&n1, &peer_addr.to_string());
    assert!(n1.pick(&key).is_some(), "owner must be remote");

    // served by the peer: local retriever never runs
    assert_eq!(group.get(&key).await.unwrap(), ByteView::new(b"X"));
    assert_eq!(local_calls.load(Ordering::SeqCst), 0);

    let seen = requests.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].group, "cluster-fwd");
    assert_eq!(seen[0].key, key);
    assert!(seen[0].redirected, "peer fetches must carry the redirect mark");

    destroy_group("cluster-fwd").await;
}

#[tokio::test]
async fn peer_failure_falls_back_to_local_retrieval() {
    let registry = MemoryRegistry::new();
    let n1 = Server::new("svc-fallback", registry.clone());
    n1.start("127.0.0.1:0").await.unwrap();

    // the owner is alive but failing
    let (peer_addr, connections, _requests) =
        spawn_scripted_peer(GetResponse::error(Status::Internal, "wedged")).await;
    registry
        .register("svc-fallback", &peer_addr.to_string())
        .await
        .unwrap();
    assert!(wait_for(|| n1.peers().len() == 2).await);

    let local_calls = Arc::new(AtomicUsize::new(0));
    let calls = local_calls.clone();
    let group = new_group(
        "cluster-fallback",
        "lru",
        1024,
        Arc::new(RetrieverFn(move |_key: &str| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(b"LOCAL".to_vec())
        })),
    )
    .unwrap();
    group.register_server(Arc::new(n1.clone())).unwrap();

    let key = key_owned_by(&n1, &peer_addr.to_string());
    assert_eq!(group.get(&key).await.unwrap(), ByteView::new(b"LOCAL"));
    assert_eq!(local_calls.load(Ordering::SeqCst), 1);
    assert!(connections.load(Ordering::SeqCst) >= 1, "peer must have been tried");

    destroy_group("cluster-fallback").await;
}

#[tokio::test]
async fn direct_rpc_roundtrip_against_live_server() {
    let registry = MemoryRegistry::new();
    let n2 = Server::new("svc-direct", registry.clone());
    let n2_addr = n2.start("127.0.0.1:0").await.unwrap().to_string();

    let group = new_group(
        "cluster-direct",
        "lru",
        1024,
        Arc::new(RetrieverFn(|key: &str| {
            if key == "present" {
                Ok(b"payload".to_vec())
            } else {
                Err(CacheError::NotFound(key.to_string()))
            }
        })),
    )
    .unwrap();

    let client = Client::new(format!("svc-direct/{n2_addr}"), registry.clone());
    assert_eq!(
        client.fetch("cluster-direct", "present").await.unwrap(),
        b"payload".to_vec()
    );
    // the serving node populated its cache
    assert!(group.cache().get("present").is_some());

    assert_eq!(
        client.fetch("cluster-direct", "absent").await.unwrap_err(),
        CacheError::NotFound("absent".into())
    );
    assert!(matches!(
        client.fetch("no-such-group", "k").await.unwrap_err(),
        CacheError::NotFound(_)
    ));

    n2.stop().await;
    destroy_group("cluster-direct").await;
}

#[tokio::test]
async fn redirected_requests_are_answered_locally() {
    let registry = MemoryRegistry::new();
    let n2 = Server::new("svc-loop", registry.clone());
    let n2_addr = n2.start("127.0.0.1:0").await.unwrap().to_string();

    // a peer that must never be contacted
    let (silent_addr, connections, _requests) =
        spawn_scripted_peer(GetResponse::ok(b"WRONG".to_vec())).await;

    let group = new_group(
        "cluster-loop",
        "lru",
        1024,
        Arc::new(RetrieverFn(|_key: &str| Ok(b"OWNED".to_vec()))),
    )
    .unwrap();
    group.register_server(Arc::new(n2.clone())).unwrap();

    // skew n2's ring view so it believes the silent peer owns the key
    n2.set_peers(&[n2_addr.clone(), silent_addr.to_string()]);
    let key = key_owned_by(&n2, &silent_addr.to_string());

    // a redirected fetch must be answered from n2's local path, even though
    // n2's own ring disagrees about ownership
    let client = Client::new(format!("svc-loop/{n2_addr}"), registry.clone());
    assert_eq!(
        client.fetch("cluster-loop", &key).await.unwrap(),
        b"OWNED".to_vec()
    );
    assert_eq!(connections.load(Ordering::SeqCst), 0, "no onward forwarding");

    destroy_group("cluster-loop").await;
}

#[tokio::test]
async fn ring_rebuilds_on_join_and_leave() {
    let registry = MemoryRegistry::new();
    let n1 = Server::new("svc-members", registry.clone());
    let n1_addr = n1.start("127.0.0.1:0").await.unwrap().to_string();
    assert_eq!(n1.peers(), vec![n1_addr.clone()]);

    // single node: everything is local
    assert_eq!(n1.owner_of("x").unwrap(), n1_addr);
    assert!(n1.pick("x").is_none());

    let n2 = Server::new("svc-members", registry.clone());
    let n2_addr = n2.start("127.0.0.1:0").await.unwrap().to_string();
    assert!(
        wait_for(|| n1.peers().len() == 2 && n2.peers().len() == 2).await,
        "both nodes should converge on the joined membership"
    );
    assert!(n1.peers().contains(&n2_addr));

    // identical membership lists produce identical rings on both nodes
    for i in 0..50 {
        let key = format!("key-{i}");
        assert_eq!(n1.owner_of(&key), n2.owner_of(&key));
    }

    n2.stop().await;
    assert!(
        wait_for(|| n1.peers().len() == 1).await,
        "departure should converge"
    );
    assert_eq!(n1.owner_of("x").unwrap(), n1_addr);

    n1.stop().await;
}
