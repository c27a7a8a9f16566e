//! Tests for the credential gate, approvals and handover tokens.

mod common;

use std::time::Duration;

use common::{test_config, two_screens, Harness};
use deskbridge_core::protocol::{AuthVerdict, InputEvent, Message, MouseButton};
use deskbridge_core::session::CloseReason;
use deskbridge_core::transport::{InvitationMetadata, MediaStream};
use deskbridge_core::{ConnectOptions, Error, LocalMedia, SessionNotice};

const SECRET: &str = "654321";

fn desktop() -> LocalMedia {
    LocalMedia {
        stream: Some(MediaStream::new("desktop").from_source("screen:1")),
        sources: two_screens(),
        active_source: Some("screen:1".to_string()),
    }
}

fn click() -> Message {
    Message::MouseDown {
        button: MouseButton::Left,
        x: 0.25,
        y: 0.5,
    }
}

fn approvals(notices: &[SessionNotice]) -> usize {
    notices
        .iter()
        .filter(|n| matches!(n, SessionNotice::ApprovalRequired { .. }))
        .count()
}

/// Input is dropped until the credential is accepted.
#[tokio::test]
async fn test_input_gated_on_authentication() {
    let h = Harness::start(test_config(), Some(SECRET));
    let host = h.host().await;

    let conduit = host.incoming_conduit("200000002", None);
    conduit.open();
    conduit.deliver(&click());
    h.settle().await;
    assert!(h.input.commands().is_empty());

    conduit.deliver(&Message::Auth {
        credential: "000000".to_string(),
    });
    conduit.deliver(&click());
    let sessions = h.settle().await;
    assert!(!sessions[0].is_authenticated);
    assert!(h.input.commands().is_empty());
    assert_eq!(
        conduit.sent(),
        vec![Message::AuthStatus {
            status: AuthVerdict::Fail
        }]
    );

    conduit.deliver(&Message::Auth {
        credential: SECRET.to_string(),
    });
    conduit.deliver(&click());
    let sessions = h.settle().await;
    assert!(sessions[0].is_authenticated);
    assert_eq!(h.input.commands().len(), 1);
    assert_eq!(
        conduit.sent().last(),
        Some(&Message::AuthStatus {
            status: AuthVerdict::Ok
        })
    );
}

/// The legacy `password` field is accepted, and so is the unattended secret.
#[tokio::test]
async fn test_unattended_secret_and_legacy_field() {
    let h = Harness::start(test_config(), Some(SECRET));
    h.handle
        .set_unattended_secret(Some("always-on".to_string()))
        .await
        .unwrap();
    let host = h.host().await;

    let conduit = host.incoming_conduit("200000002", None);
    conduit.open();
    conduit.deliver_raw(br#"{"type":"AUTH","password":"always-on"}"#);

    let sessions = h.settle().await;
    assert!(sessions[0].is_authenticated);
}

/// Repeated failures lock the caller out for a while.
#[tokio::test(start_paused = true)]
async fn test_lockout_after_repeated_failures() {
    let mut config = test_config();
    config.security.max_auth_attempts = 2;
    config.security.auth_lockout = Duration::from_secs(30);
    let h = Harness::start(config, Some(SECRET));
    let host = h.host().await;

    let conduit = host.incoming_conduit("200000002", None);
    conduit.open();
    for guess in ["111111", "222222", SECRET] {
        conduit.deliver(&Message::Auth {
            credential: guess.to_string(),
        });
    }
    let sessions = h.settle().await;
    assert!(!sessions[0].is_authenticated);
    assert_eq!(conduit.sent().len(), 3);

    tokio::time::sleep(Duration::from_secs(31)).await;
    conduit.deliver(&Message::Auth {
        credential: SECRET.to_string(),
    });
    let sessions = h.settle().await;
    assert!(sessions[0].is_authenticated);
}

/// Reconnecting from a fresh scoped endpoint does not reset the lockout.
#[tokio::test(start_paused = true)]
async fn test_lockout_survives_reconnect() {
    let mut config = test_config();
    config.security.max_auth_attempts = 2;
    config.security.auth_lockout = Duration::from_secs(30);
    let h = Harness::start(config, Some(SECRET));
    let host = h.host().await;

    let first = host.incoming_conduit("a1b2c3d4-1700000000001", None);
    first.open();
    for guess in ["111111", "222222"] {
        first.deliver(&Message::Auth {
            credential: guess.to_string(),
        });
    }
    h.settle().await;
    first.hang_up();
    assert!(h.settle().await.is_empty());

    let second = host.incoming_conduit("a1b2c3d4-1700000000002", None);
    second.open();
    second.deliver(&Message::Auth {
        credential: SECRET.to_string(),
    });
    let sessions = h.settle().await;
    assert_eq!(sessions.len(), 1);
    assert!(!sessions[0].is_authenticated);
    assert_eq!(
        second.sent(),
        vec![Message::AuthStatus {
            status: AuthVerdict::Fail
        }]
    );

    tokio::time::sleep(Duration::from_secs(31)).await;
    second.deliver(&Message::Auth {
        credential: SECRET.to_string(),
    });
    assert!(h.settle().await[0].is_authenticated);
}

/// Media and conduit from one remote prompt the user once.
#[tokio::test]
async fn test_approval_prompted_once() {
    let mut h = Harness::start(test_config(), Some(SECRET));
    let host = h.host().await;

    host.incoming_media("200000002", None);
    host.incoming_conduit("200000002", None).open();
    let sessions = h.settle().await;

    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].awaiting_approval);
    assert_eq!(approvals(&h.drain()), 1);
}

/// Approval answers the held invitation and unlocks input with the active
/// source's bounds.
#[tokio::test]
async fn test_approve_answers_pending_media() {
    let h = Harness::start(test_config(), Some(SECRET));
    h.handle.set_local_media(desktop()).await.unwrap();
    let host = h.host().await;

    let media = host.incoming_media("200000002", None);
    let conduit = host.incoming_conduit("200000002", None);
    conduit.open();
    let id = h.settle().await[0].id;
    assert!(media.answered().is_none());

    h.handle.approve(id).await.unwrap();
    assert_eq!(media.answered().unwrap().id, "desktop");
    let sent = conduit.sent();
    assert_eq!(
        sent[0],
        Message::AuthStatus {
            status: AuthVerdict::Ok
        }
    );
    assert!(matches!(&sent[1], Message::SourcesList { active_source_id, .. }
        if active_source_id.as_deref() == Some("screen:1")));

    conduit.deliver(&click());
    h.settle().await;
    let commands = h.input.commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].source_bounds.unwrap().x, 1920);

    // Approving twice is harmless.
    h.handle.approve(id).await.unwrap();
    assert_eq!(conduit.sent().len(), sent.len());
}

/// Rejection tells the client and closes the session.
#[tokio::test]
async fn test_reject_incoming() {
    let mut h = Harness::start(test_config(), Some(SECRET));
    let host = h.host().await;

    let media = host.incoming_media("200000002", None);
    let conduit = host.incoming_conduit("200000002", None);
    conduit.open();
    let id = h.settle().await[0].id;

    h.handle.reject(id).await.unwrap();
    assert_eq!(conduit.sent(), vec![Message::CallRejected]);
    assert!(media.is_closed());
    assert!(conduit.is_closed());

    let closed = h
        .wait_for(|n| matches!(n, SessionNotice::SessionClosed { .. }))
        .await;
    assert!(matches!(
        closed,
        SessionNotice::SessionClosed { reason: CloseReason::Rejected, .. }
    ));
}

/// Approve and reject only apply to incoming sessions.
#[tokio::test]
async fn test_approve_outgoing_is_refused() {
    let h = Harness::start(test_config(), None);
    let (id, _) = h.dial("200000002", ConnectOptions::default()).await;

    assert!(matches!(
        h.handle.approve(id).await,
        Err(Error::WrongDirection { .. })
    ));
    assert!(matches!(
        h.handle.reject(id).await,
        Err(Error::WrongDirection { .. })
    ));
}

/// A failed credential can be retried, and a remembered one is reused.
#[tokio::test]
async fn test_client_retry_and_remembered_credential() {
    let mut h = Harness::start(test_config(), None);
    let (id, endpoint) = h.dial("200000002", ConnectOptions::default()).await;
    let conduit = endpoint.conduit();
    conduit.open();
    h.wait_for(|n| matches!(n, SessionNotice::CredentialRequired { .. }))
        .await;

    h.handle.submit_credential(id, "111111", false).await.unwrap();
    conduit.deliver(&Message::AuthStatus {
        status: AuthVerdict::Fail,
    });
    h.wait_for(|n| matches!(n, SessionNotice::AuthenticationFailed { .. }))
        .await;
    let snapshot = h.snapshot(id).await.unwrap();
    assert!(!snapshot.is_authenticated);
    assert!(snapshot.auth_error.is_some());

    h.handle.submit_credential(id, SECRET, true).await.unwrap();
    conduit.deliver(&Message::AuthStatus {
        status: AuthVerdict::Ok,
    });
    let snapshot = h.snapshot(id).await.unwrap();
    assert!(snapshot.is_authenticated);
    assert!(snapshot.auth_error.is_none());
    assert_eq!(
        conduit.sent(),
        vec![
            Message::Auth {
                credential: "111111".to_string()
            },
            Message::Auth {
                credential: SECRET.to_string()
            },
        ]
    );

    h.handle.close(id).await.unwrap();
    let (_, endpoint) = h.dial("200000002", ConnectOptions::default()).await;
    let conduit = endpoint.conduit();
    conduit.open();
    h.settle().await;
    assert_eq!(
        conduit.sent(),
        vec![Message::Auth {
            credential: SECRET.to_string()
        }]
    );
}

/// Sets up an approved session and records a handover token through it.
async fn host_with_token(h: &Harness, token: &str) -> std::sync::Arc<common::EndpointRecord> {
    h.handle.set_local_media(desktop()).await.unwrap();
    let host = h.host().await;
    let conduit = host.incoming_conduit("200000002", None);
    conduit.open();
    let id = h.settle().await[0].id;
    h.handle.approve(id).await.unwrap();
    conduit.deliver(&Message::HandoverPreparation {
        token: token.to_string(),
    });
    h.settle().await;
    host
}

/// Handover with the media invitation arriving first.
#[tokio::test]
async fn test_handover_media_first() {
    let mut h = Harness::start(test_config(), Some(SECRET));
    let host = host_with_token(&h, "tok-a").await;
    h.drain();

    let media = host.incoming_media("200000002-w", Some(InvitationMetadata::handover("tok-a")));
    h.settle().await;
    assert_eq!(media.answered().unwrap().id, "desktop");

    let conduit = host.incoming_conduit("200000002-w", Some(InvitationMetadata::handover("tok-a")));
    conduit.open();
    let sessions = h.settle().await;
    let session = sessions
        .iter()
        .find(|s| s.remote_identifier == "200000002-w")
        .unwrap();
    assert!(session.is_authenticated);
    assert!(session.has_media);
    assert!(conduit.sent().contains(&Message::AuthStatus {
        status: AuthVerdict::Ok
    }));
    assert_eq!(approvals(&h.drain()), 0);
}

/// Handover with the data conduit arriving first.
#[tokio::test]
async fn test_handover_conduit_first() {
    let mut h = Harness::start(test_config(), Some(SECRET));
    let host = host_with_token(&h, "tok-b").await;
    h.drain();

    let conduit = host.incoming_conduit("200000002-w", Some(InvitationMetadata::handover("tok-b")));
    conduit.open();
    h.settle().await;
    let media = host.incoming_media("200000002-w", Some(InvitationMetadata::handover("tok-b")));
    h.settle().await;

    assert_eq!(media.answered().unwrap().id, "desktop");
    assert_eq!(approvals(&h.drain()), 0);
}

/// An unknown token falls back to the approval prompt, exactly once.
#[tokio::test]
async fn test_unknown_token_prompts_once() {
    let mut h = Harness::start(test_config(), Some(SECRET));
    let host = host_with_token(&h, "tok-c").await;
    h.drain();

    let media = host.incoming_media("300000003", Some(InvitationMetadata::handover("forged")));
    host.incoming_conduit("300000003", Some(InvitationMetadata::handover("forged")))
        .open();
    h.settle().await;

    assert!(media.answered().is_none());
    assert_eq!(approvals(&h.drain()), 1);
}

/// A token stops validating once its grace period is over.
#[tokio::test(start_paused = true)]
async fn test_token_expires_after_grace() {
    let mut config = test_config();
    config.session.handover_grace = Duration::from_secs(2);
    let mut h = Harness::start(config, Some(SECRET));
    let host = host_with_token(&h, "tok-d").await;

    host.incoming_media("200000002-w", Some(InvitationMetadata::handover("tok-d")));
    h.settle().await;
    h.drain();

    tokio::time::sleep(Duration::from_secs(3)).await;
    host.incoming_media("400000004", Some(InvitationMetadata::handover("tok-d")));
    h.settle().await;
    assert_eq!(approvals(&h.drain()), 1);
}

/// A token announced before authentication is ignored.
#[tokio::test]
async fn test_handover_requires_authenticated_announcer() {
    let mut h = Harness::start(test_config(), Some(SECRET));
    let host = h.host().await;

    let conduit = host.incoming_conduit("200000002", None);
    conduit.open();
    conduit.deliver(&Message::HandoverPreparation {
        token: "sneaky".to_string(),
    });
    h.settle().await;
    h.drain();

    host.incoming_media("300000003", Some(InvitationMetadata::handover("sneaky")));
    h.settle().await;
    assert_eq!(approvals(&h.drain()), 1);
}

/// The client side of a handover: announce a token, reconnect with it and
/// skip the credential exchange.
#[tokio::test]
async fn test_client_handover() {
    let h = Harness::start(test_config(), None);
    let (old, conduit) = h.authenticated_client("200000002").await;

    let token = h.handle.prepare_handover(old).await.unwrap();
    assert!(conduit.sent().contains(&Message::HandoverPreparation {
        token: token.clone()
    }));
    h.handle.close(old).await.unwrap();

    let (id, endpoint) = h
        .dial("200000002", ConnectOptions::with_handover(token.clone()))
        .await;
    let media = endpoint.media();
    assert_eq!(
        media.metadata.as_ref().unwrap().handover_token.as_deref(),
        Some(token.as_str())
    );

    let conduit = endpoint.conduit();
    conduit.open();
    h.settle().await;
    assert_eq!(
        conduit.sent(),
        vec![Message::HandoverValidation {
            token: token.clone()
        }]
    );

    media.stream("host-desktop");
    assert!(h.snapshot(id).await.unwrap().is_authenticated);
}

/// Remote input is only sent by authenticated clients.
#[tokio::test]
async fn test_send_input_requires_authentication() {
    let h = Harness::start(test_config(), None);
    let (id, endpoint) = h.dial("200000002", ConnectOptions::default()).await;
    endpoint.conduit().open();
    h.settle().await;

    let event = InputEvent::KeyDown {
        key: "a".to_string(),
    };
    assert!(matches!(
        h.handle.send_input(id, event.clone()).await,
        Err(Error::SessionNotReady { .. })
    ));

    endpoint.conduit().deliver(&Message::AuthStatus {
        status: AuthVerdict::Ok,
    });
    h.handle.send_input(id, event).await.unwrap();
    assert!(endpoint.conduit().sent().contains(&Message::KeyDown {
        key: "a".to_string()
    }));
}
