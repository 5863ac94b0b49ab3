//! Sealed requests from authenticated minions and syndics.

use brine_crypto::generate_session_key;
use brine_storage::{DataCache, Jid, MinionId, Target};
use brine_transport::secure::seal;
use brine_transport::{MinionReply, MinionRequest, Request, Response};
use chrono::Utc;
use serde_json::json;

use super::common::*;
use crate::backend::StoreBackend;
use crate::handlers::minion::PILLAR_BANK;
use crate::maintenance::Maintenance;

async fn published_jid(server: &crate::server::MasterServer, target: &str) -> Jid {
    match local(
        server,
        Request::Publish(publish_request(Target::glob(target), "test.ping")),
    )
    .await
    {
        Response::Published(reply) => reply.jid,
        other => panic!("expected a publish reply, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_minion_is_told_to_reauthenticate() {
    let (_dir, server) = memory_server("").await;
    let session = server.sessions.current();
    let msg = seal(
        &session.key,
        session.version,
        &MinionId::from("stranger"),
        &MinionRequest::Grains { grains: json!({}) },
    )
    .unwrap();
    assert!(matches!(
        remote(&server, Request::Secure(msg)).await,
        Response::Reauth
    ));
}

#[tokio::test]
async fn stale_session_is_told_to_reauthenticate() {
    let (_dir, server) = memory_server("").await;
    accepted_minion(&server, "web1").await;
    let old = server.sessions.current();
    server.sessions.rotate();

    let msg = seal(
        &old.key,
        old.version,
        &MinionId::from("web1"),
        &MinionRequest::Grains { grains: json!({}) },
    )
    .unwrap();
    assert!(matches!(
        remote(&server, Request::Secure(msg)).await,
        Response::Reauth
    ));
}

#[tokio::test]
async fn wrong_key_is_an_error() {
    let (_dir, server) = memory_server("").await;
    accepted_minion(&server, "web1").await;
    let version = server.sessions.current().version;
    let msg = seal(
        &generate_session_key(),
        version,
        &MinionId::from("web1"),
        &MinionRequest::Grains { grains: json!({}) },
    )
    .unwrap();
    assert!(matches!(
        remote(&server, Request::Secure(msg)).await,
        Response::Error { .. }
    ));
}

#[tokio::test]
async fn returns_are_cached_and_relayed() {
    let (_dir, server) = memory_server("").await;
    accepted_minion(&server, "web1").await;
    accepted_minion(&server, "web2").await;
    let mut relayed = server.returns.subscribe();
    let jid = published_jid(&server, "web*").await;

    let ret = job_return(&jid, "web1", json!(true));
    let reply = sealed(&server, "web1", &MinionRequest::Return(ret.clone())).await;
    assert!(matches!(reply, MinionReply::Ack));
    assert_eq!(relayed.recv().await.unwrap(), ret);

    // a minion can only answer for itself
    let forged = job_return(&jid, "web2", json!(false));
    let reply = sealed(&server, "web1", &MinionRequest::Return(forged)).await;
    assert!(matches!(reply, MinionReply::Error { .. }));

    let returns = server.jobs.get_returns(&jid).await.unwrap();
    assert_eq!(returns, vec![ret]);
}

#[tokio::test]
async fn syndic_reports_are_recorded() {
    let (_dir, server) = memory_server("order_masters: true\n").await;
    accepted_syndic(&server, "syndic1").await;
    let jid = published_jid(&server, "far*").await;

    let reply = sealed(
        &server,
        "syndic1",
        &MinionRequest::SyndicMinions {
            jid: jid.clone(),
            minions: vec![MinionId::from("far1"), MinionId::from("far2")],
        },
    )
    .await;
    assert!(matches!(reply, MinionReply::Ack));
    assert_eq!(server.jobs.expected_minions(&jid).await.unwrap().len(), 2);

    let returns = vec![
        job_return(&jid, "far1", json!(true)),
        job_return(&jid, "far2", json!(true)),
    ];
    let reply = sealed(&server, "syndic1", &MinionRequest::SyndicReturn { returns }).await;
    assert!(matches!(reply, MinionReply::Ack));
    assert_eq!(server.jobs.get_returns(&jid).await.unwrap().len(), 2);
}

#[tokio::test]
async fn plain_minions_cannot_relay() {
    let (_dir, server) = memory_server("order_masters: true\n").await;
    accepted_minion(&server, "web1").await;
    let jid = published_jid(&server, "far*").await;

    let reply = sealed(
        &server,
        "web1",
        &MinionRequest::SyndicMinions {
            jid: jid.clone(),
            minions: vec![MinionId::from("far1")],
        },
    )
    .await;
    assert!(matches!(reply, MinionReply::Error { .. }));
    let returns = vec![job_return(&jid, "far1", json!(true))];
    let reply = sealed(&server, "web1", &MinionRequest::SyndicReturn { returns }).await;
    assert!(matches!(reply, MinionReply::Error { .. }));
    assert!(server.jobs.get_returns(&jid).await.unwrap().is_empty());
}

#[tokio::test]
async fn syndic_flag_needs_order_masters() {
    let (_dir, server) = memory_server("").await;
    accepted_syndic(&server, "syndic1").await;
    assert!(!server.syndics.contains(&MinionId::from("syndic1")));

    let (_dir, server) = memory_server("order_masters: true\n").await;
    let keypair = accepted_syndic(&server, "syndic1").await;
    assert!(server.syndics.contains(&MinionId::from("syndic1")));
    // authenticating again as a plain minion drops the flag
    remote(&server, auth_request("syndic1", &keypair)).await;
    assert!(!server.syndics.contains(&MinionId::from("syndic1")));
}

#[tokio::test]
async fn pillar_is_compiled_with_grains_and_cached() {
    let (dir, server) = memory_server("").await;
    let pillar = dir.path().join("srv/pillar");
    write_file(
        &pillar,
        "top.sls",
        "base:\n  '*':\n    - common\n  'G@os:Debian':\n    - match: compound\n    - debian\n",
    );
    write_file(&pillar, "common.sls", "role: generic\nusers:\n  - root\n");
    write_file(&pillar, "debian.sls", "role: debian\npkg: apt\n");
    accepted_minion(&server, "web1").await;
    sealed(
        &server,
        "web1",
        &MinionRequest::Grains {
            grains: json!({"os": "Debian"}),
        },
    )
    .await;

    let MinionReply::Pillar { data } =
        sealed(&server, "web1", &MinionRequest::Pillar { saltenv: None }).await
    else {
        panic!("expected pillar data");
    };
    assert_eq!(data["role"], "debian");
    assert_eq!(data["pkg"], "apt");
    assert_eq!(data["users"], json!(["root"]));
    assert!(data.get("_errors").is_none());

    let cached = server.store.fetch(PILLAR_BANK, "web1").await.unwrap();
    assert_eq!(cached, Some(data));
}

#[tokio::test]
async fn files_are_listed_and_fetched() {
    let (dir, server) = memory_server("").await;
    write_file(&dir.path().join("srv/salt"), "web/nginx.conf", "worker 4;\n");
    accepted_minion(&server, "web1").await;

    let MinionReply::FileList { files } = sealed(
        &server,
        "web1",
        &MinionRequest::FileList {
            saltenv: "base".into(),
        },
    )
    .await
    else {
        panic!("expected a file list");
    };
    assert_eq!(files, vec!["web/nginx.conf"]);

    let MinionReply::File { data, hash } = sealed(
        &server,
        "web1",
        &MinionRequest::FileFetch {
            saltenv: "base".into(),
            path: "web/nginx.conf".into(),
        },
    )
    .await
    else {
        panic!("expected file contents");
    };
    assert_eq!(data, b"worker 4;\n");
    assert_eq!(hash, server.config.hash_type.digest_hex(b"worker 4;\n"));

    let reply = sealed(
        &server,
        "web1",
        &MinionRequest::FileFetch {
            saltenv: "base".into(),
            path: "../etc/passwd".into(),
        },
    )
    .await;
    assert!(matches!(reply, MinionReply::Error { .. }));
}

#[tokio::test]
async fn old_jobs_are_purged_by_maintenance() {
    let (_dir, server) = memory_server("keep_jobs_seconds: 3600\n").await;
    accepted_minion(&server, "web1").await;
    let old = published_jid(&server, "web1").await;
    let fresh = published_jid(&server, "web1").await;

    let StoreBackend::Memory(mem) = &server.store else {
        panic!("expected the memory store");
    };
    mem.set_reserved_at(&old, Utc::now() - chrono::Duration::hours(2))
        .unwrap();

    let report = Maintenance::new(server.clone()).run_once().await.unwrap();
    assert_eq!(report.purged_jobs, 1);
    assert!(server.jobs.get_job(&old).await.is_err());
    assert!(server.jobs.get_job(&fresh).await.is_ok());
}
