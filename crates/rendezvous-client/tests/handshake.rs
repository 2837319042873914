//! Two client peers completing a handshake through a live gateway.

use std::net::SocketAddr;
use std::time::Duration;

use rendezvous_client::{parse_gateway_url, ClientError, Peer, PeerOutcome, StaticEngine};
use rendezvous_common::{ErrorCode, Role, SessionId, SessionState};
use rendezvous_gateway::{web, Gateway, GatewayConfig};
use tokio::net::TcpListener;
use url::Url;

async fn start_gateway() -> (SocketAddr, Gateway) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let gateway = Gateway::new(GatewayConfig::default());
    tokio::spawn(web::serve(listener, gateway.clone(), std::future::pending()));
    (addr, gateway)
}

fn url(addr: SocketAddr) -> Url {
    parse_gateway_url(&format!("ws://{}/ws", addr)).unwrap()
}

async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("completed in time")
}

#[tokio::test]
async fn test_peers_exchange_descriptors() {
    let (addr, gateway) = start_gateway().await;
    let url = url(addr);

    let (engine, events) = StaticEngine::new("O1", Vec::new());
    let mut initiator = within(Peer::offer(&url, engine, events)).await.unwrap();
    assert_eq!(initiator.role(), Role::Initiator);
    let session_id = initiator.session_id();

    let (engine, events) = StaticEngine::new("A1", vec!["r1".into(), "r2".into()]);
    let mut responder = within(Peer::answer(&url, engine, events, session_id))
        .await
        .unwrap();
    assert_eq!(responder.role(), Role::Responder);

    assert_eq!(within(responder.run()).await.unwrap(), PeerOutcome::Connected);
    assert_eq!(responder.engine().remote_descriptor(), Some("O1"));

    assert_eq!(within(initiator.run()).await.unwrap(), PeerOutcome::Connected);
    assert_eq!(initiator.engine().remote_descriptor(), Some("A1"));

    let session = gateway.registry().get_session(&session_id).await.unwrap();
    assert_eq!(session.lock().await.state(), SessionState::Connected);
    drop(session);

    let engine = within(initiator.hang_up()).await;
    assert!(engine.is_closed());
    assert_eq!(within(responder.run()).await.unwrap(), PeerOutcome::PeerLeft);
}

#[tokio::test]
async fn test_joining_unknown_session_is_rejected() {
    let (addr, _gateway) = start_gateway().await;

    let (engine, events) = StaticEngine::new("A1", Vec::new());
    let err = within(Peer::answer(&url(addr), engine, events, SessionId::new()))
        .await
        .err()
        .expect("join rejected");
    assert!(matches!(
        err,
        ClientError::Rejected {
            code: ErrorCode::SessionNotJoinable,
            ..
        }
    ));
}
