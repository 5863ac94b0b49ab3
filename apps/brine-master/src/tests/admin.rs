//! Key administration over the local channel.

use std::time::Duration;

use brine_crypto::Keypair;
use brine_storage::{MinionId, Target};
use brine_transport::secure::open_publish;
use brine_transport::{AdminReply, AdminRequest, ClientTransport, KeyAction, Request, Response};
use brine_transport_memory::MemoryHub;
use futures::StreamExt;

use super::common::*;
use crate::handlers::admin::MASTER_PUB;

fn admin(token: &str, action: KeyAction) -> Request {
    Request::Admin(AdminRequest {
        token: token.into(),
        action,
    })
}

#[tokio::test]
async fn refused_outside_the_local_channel() {
    let (_dir, server) = memory_server("").await;
    let reply = remote(&server, admin(ROOT_TOKEN, KeyAction::List)).await;
    assert!(matches!(reply, Response::Error { .. }));
}

#[tokio::test]
async fn refused_with_a_bad_token() {
    let (_dir, server) = memory_server("").await;
    let reply = local(&server, admin("guess", KeyAction::List)).await;
    let Response::Error { message } = reply else {
        panic!("expected an error");
    };
    assert_eq!(message, "invalid token");
}

#[tokio::test]
async fn accept_then_list() {
    let (_dir, server) = memory_server("").await;
    remote(&server, auth_request("web1", &Keypair::generate())).await;
    remote(&server, auth_request("web2", &Keypair::generate())).await;
    remote(&server, auth_request("db1", &Keypair::generate())).await;

    let reply = local(
        &server,
        admin(
            ROOT_TOKEN,
            KeyAction::Accept {
                pattern: "web*".into(),
                include_rejected: false,
            },
        ),
    )
    .await;
    let Response::Admin(AdminReply::Changed { ids }) = reply else {
        panic!("expected changed ids, got {reply:?}");
    };
    assert_eq!(ids, vec![MinionId::from("web1"), MinionId::from("web2")]);

    let Response::Admin(AdminReply::Keys(listing)) =
        local(&server, admin(ROOT_TOKEN, KeyAction::List)).await
    else {
        panic!("expected a listing");
    };
    assert_eq!(listing.accepted.len(), 2);
    assert_eq!(listing.pending, vec![MinionId::from("db1")]);
}

#[tokio::test]
async fn deleting_an_accepted_key_rotates_the_session() {
    let hub = MemoryHub::new();
    let (_dir, server) = memory_server_on(&hub, "master", "").await;
    let (shutdown, _handles) = serve(&server).await;
    accepted_minion(&server, "web1").await;
    accepted_minion(&server, "web2").await;
    let old = server.sessions.current();
    let before = old.version;
    let conn = hub.client().connect("master").await.unwrap();
    let mut frames = conn.subscribe().await.unwrap();

    let reply = local(
        &server,
        admin(
            ROOT_TOKEN,
            KeyAction::Delete {
                pattern: "web1".into(),
            },
        ),
    )
    .await;
    assert!(matches!(reply, Response::Admin(AdminReply::Changed { .. })));
    assert_eq!(server.sessions.current().version, before + 1);

    // the deleted minion's copy of the old key no longer reads publishes
    let reply = local(
        &server,
        Request::Publish(publish_request(Target::glob("web2"), "test.ping")),
    )
    .await;
    assert!(matches!(reply, Response::Published(_)));
    let frame = tokio::time::timeout(Duration::from_secs(2), frames.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame.session_version, before + 1);
    assert!(open_publish(&old.key, &frame).is_err());
    assert!(open_publish(&server.sessions.current().key, &frame).is_ok());

    // nothing left to delete
    let reply = local(
        &server,
        admin(
            ROOT_TOKEN,
            KeyAction::Delete {
                pattern: "web1".into(),
            },
        ),
    )
    .await;
    assert!(matches!(reply, Response::Error { .. }));
    let _ = shutdown.send(true);
}

#[tokio::test]
async fn finger_includes_the_master_key() {
    let (_dir, server) = memory_server("").await;
    accepted_minion(&server, "web1").await;

    let Response::Admin(AdminReply::Fingers { fingers }) = local(
        &server,
        admin(
            ROOT_TOKEN,
            KeyAction::Finger {
                pattern: "*".into(),
            },
        ),
    )
    .await
    else {
        panic!("expected fingerprints");
    };
    assert!(fingers.contains_key("web1"));
    assert_eq!(fingers[MASTER_PUB], server.identity.fingerprint());

    let Response::Admin(AdminReply::Fingers { fingers }) = local(
        &server,
        admin(
            ROOT_TOKEN,
            KeyAction::Finger {
                pattern: "web*".into(),
            },
        ),
    )
    .await
    else {
        panic!("expected fingerprints");
    };
    assert!(!fingers.contains_key(MASTER_PUB));
}
