//! Coordinator scenario tests
//!
//! Run with: cargo test --test coordinator_test

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use montane::clock::{MessageIdGenerator, SystemClock};
use montane::connection::{ConnectionClass, ConnectionState};
use montane::coordinator::Coordinator;
use montane::datacenter::Datacenter;
use montane::delegate::{Delegate, NullDelegate};
use montane::request::{RequestFlags, CURRENT_DATACENTER};
use montane::wire::{RpcResultBody, ServerMessage};

fn coordinator_with_dcs(ids: &[i32]) -> Coordinator {
    let mut c = Coordinator::new(Arc::new(NullDelegate), MessageIdGenerator::new(Box::new(SystemClock::new())), ids[0]);
    for &id in ids {
        let mut dc = Datacenter::new(id, vec![], false);
        dc.permanent_auth_key_id = Some(1);
        c.add_datacenter(dc);
    }
    c
}

// =============================================================================
// MIGRATION
// =============================================================================

#[test]
fn migration_redirects_current_datacenter() {
    let mut c = coordinator_with_dcs(&[2, 5]);
    c.set_user_id(42);

    let token = c.send_request(vec![9], RequestFlags::empty(), CURRENT_DATACENTER, ConnectionClass::Generic, Box::new(|_| {}));
    c.scheduler_pass(1_000, 1_000_000);
    let msg_id = c.registry().running.iter().find(|r| r.token == token).unwrap().message_id;

    c.handle_server_message(2, ConnectionClass::Generic, msg_id, ServerMessage::RpcResult {
        req_msg_id: msg_id,
        body: RpcResultBody::Error { code: 303, message: "USER_MIGRATE_5".into() },
    });

    // the move has started but the dc switch waits on the export/import
    // round trip, not the 303 itself.
    assert_eq!(c.current_datacenter_id, 2);
    assert!(c.registry().queue.iter().any(|r| r.token == token), "migrated request must be redispatched, not dropped");

    let export_msg_id = c.registry().running.iter().find(|r| r.raw_payload == b"auth.exportAuthorization").unwrap().message_id;
    c.handle_server_message(2, ConnectionClass::Generic, export_msg_id, ServerMessage::RpcResult {
        req_msg_id: export_msg_id,
        body: RpcResultBody::Ok(vec![1, 2, 3]),
    });
    let mut rx = c.take_task_receiver();
    while let Ok(task) = rx.try_recv() {
        task(&mut c);
    }

    let import_msg_id = c.registry().running.iter().find(|r| r.raw_payload == vec![1, 2, 3]).unwrap().message_id;
    c.handle_server_message(5, ConnectionClass::Generic, import_msg_id, ServerMessage::RpcResult {
        req_msg_id: import_msg_id,
        body: RpcResultBody::Ok(vec![]),
    });
    while let Ok(task) = rx.try_recv() {
        task(&mut c);
    }

    assert_eq!(c.current_datacenter_id, 5);
}

// =============================================================================
// BAD SALT
// =============================================================================

#[test]
fn bad_server_salt_marks_request_for_resend_without_failing_it() {
    let mut c = coordinator_with_dcs(&[2]);
    let fired = Arc::new(AtomicBool::new(false));
    let fired2 = fired.clone();
    let token = c.send_request(vec![1], RequestFlags::empty(), 2, ConnectionClass::Generic, Box::new(move |_| {
        fired2.store(true, Ordering::SeqCst);
    }));
    c.scheduler_pass(0, 0);
    let msg_id = c.registry().running.iter().find(|r| r.token == token).unwrap().message_id;

    c.handle_server_message(2, ConnectionClass::Generic, msg_id, ServerMessage::BadServerSalt {
        bad_msg_id: msg_id,
        bad_msg_seqno: 0,
        error_code: 48,
        new_server_salt: 777,
        new_server_salt_valid_since: 0,
    });

    assert!(!fired.load(Ordering::SeqCst), "bad salt must not complete the request");
    let r = c.registry().running.iter().find(|r| r.token == token).unwrap();
    assert!(r.failed_by_salt, "request must be flagged to resend with the new salt");
}

// =============================================================================
// FLOOD WAIT
// =============================================================================

#[test]
fn flood_wait_defers_retry_and_does_not_complete() {
    let mut c = coordinator_with_dcs(&[2]);
    let token = c.send_request(vec![], RequestFlags::empty(), 2, ConnectionClass::Generic, Box::new(|result| {
        panic!("flood wait must not complete the request, got {:?}", result);
    }));
    c.scheduler_pass(0, 0);
    let msg_id = c.registry().running.iter().find(|r| r.token == token).unwrap().message_id;

    c.handle_server_message(2, ConnectionClass::Generic, msg_id, ServerMessage::RpcResult {
        req_msg_id: msg_id,
        body: RpcResultBody::Error { code: 420, message: "FLOOD_WAIT_30".into() },
    });

    let r = c.registry().running.iter().find(|r| r.token == token).unwrap();
    assert_eq!(r.failed_by_flood_wait, 30);
    assert!(!r.completed);
}

// =============================================================================
// CANCEL DURING IN-FLIGHT
// =============================================================================

#[test]
fn cancelling_an_in_flight_request_suppresses_its_completion() {
    let mut c = coordinator_with_dcs(&[2]);
    let fired = Arc::new(AtomicBool::new(false));
    let fired2 = fired.clone();
    let token = c.send_request(vec![], RequestFlags::empty(), 2, ConnectionClass::Generic, Box::new(move |_| {
        fired2.store(true, Ordering::SeqCst);
    }));
    c.scheduler_pass(0, 0);

    let drop_answer = c.cancel_request(token, true);
    assert!(drop_answer.is_some(), "cancelling a running request must emit an rpc_drop_answer");

    let msg_id = c.registry().running.iter().find(|r| r.token == token).unwrap().message_id;
    c.handle_server_message(2, ConnectionClass::Generic, msg_id, ServerMessage::RpcResult {
        req_msg_id: msg_id,
        body: RpcResultBody::Ok(vec![1, 2, 3]),
    });

    assert!(!fired.load(Ordering::SeqCst), "a late response to a cancelled request must not fire its callback");
}

// =============================================================================
// PING-BASED TIME SYNC
// =============================================================================

#[test]
fn pong_round_trip_updates_ping_time_without_crashing() {
    let mut c = coordinator_with_dcs(&[2]);
    c.current_datacenter_id = 2;
    let (dc_id, ping) = c.maybe_send_generic_ping(0).expect("first ping must fire immediately");
    assert_eq!(dc_id, 2);

    let ping_id = i64::from_le_bytes(ping.body.try_into().unwrap());
    c.handle_server_message(2, ConnectionClass::Generic, ping.msg_id, ServerMessage::Pong { msg_id: ping.msg_id, ping_id });

    // A second ping within the interval should not fire again.
    assert!(c.maybe_send_generic_ping(1).is_none());
}

#[test]
fn proxy_probe_pong_is_distinguished_by_high_ping_id() {
    let mut c = coordinator_with_dcs(&[2]);
    let ping_id = c.check_proxy(Box::new(|_| {}));
    assert!(ping_id >= 2_000_000, "proxy probe ping ids must use the reserved range");
    // Handling the pong must not panic and must not touch the generic
    // ping's round-trip tracking.
    c.handle_server_message(2, ConnectionClass::Proxy, 0, ServerMessage::Pong { msg_id: 0, ping_id });
}

// =============================================================================
// SESSION-RESET IDEMPOTENCY
// =============================================================================

#[test]
fn new_session_created_is_idempotent_per_unique_id() {
    let calls = Arc::new(AtomicI32::new(0));

    struct CountingDelegate(Arc<AtomicI32>);
    impl Delegate for CountingDelegate {
        fn on_session_created(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn on_connection_state_changed(&self, _state: ConnectionState) {}
    }

    let mut c = Coordinator::new(Arc::new(CountingDelegate(calls.clone())), MessageIdGenerator::new(Box::new(SystemClock::new())), 2);
    let mut dc = Datacenter::new(2, vec![], false);
    dc.permanent_auth_key_id = Some(1);
    c.add_datacenter(dc);

    for _ in 0..3 {
        c.handle_server_message(2, ConnectionClass::Generic, 0, ServerMessage::NewSessionCreated {
            unique_id: 555,
            first_msg_id: 0,
            server_salt: 1,
        });
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1, "repeated new_session_created for the same unique_id must fire the callback once");
}
