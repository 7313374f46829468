//! Integration tests for the pipelined request engine
//!
//! These tests drive the pipeline through a session on the in-memory store:
//! - Bounded queue under a stalled round trip
//! - Sync points and queued callbacks
//! - Fire-and-forget failure accounting

mod common;

use common::builders::{float, var, ConfigBuilder};
use common::mock_helpers::open_session;
use common::{test_timeout, wait_until};
use serial_test::serial;
use smax_client::config::QueueFullPolicy;
use smax_client::{Decode, SmaxError};
use std::sync::{Arc, Mutex};

#[test]
#[serial]
fn test_bounded_queue_then_flush_resolves_everything() {
    let config = ConfigBuilder::new()
        .max_queued(50)
        .max_batch_len(10)
        .queue_full_policy(QueueFullPolicy::Block)
        .build();
    let (transport, session) = open_session(config);
    let vars: Vec<_> = (0..100).map(|i| var(&format!("sensors:s{}", i))).collect();
    for (i, v) in vars.iter().enumerate() {
        transport.share_remote("sensor", v, float(i as f64));
    }

    // Stall the first round trip so nothing completes
    transport.pause();
    let mut handles = Vec::new();
    for v in &vars[..50] {
        handles.push(session.try_queue_pull(v).unwrap());
    }
    wait_until("first batch in flight", || transport.blocked_calls() == 1);
    assert_eq!(session.outstanding(), 50);

    let err = session.try_queue_pull(&vars[50]).unwrap_err();
    assert!(matches!(err, SmaxError::QueueFull { limit: 50 }));
    assert!(err.is_retryable());

    transport.resume();
    for v in &vars[50..] {
        handles.push(session.queue_pull(v).unwrap());
    }
    session.flush(test_timeout()).unwrap();

    assert_eq!(handles.len(), 100);
    for (i, handle) in handles.iter().enumerate() {
        let value = handle.try_result().expect("resolved after flush").unwrap();
        assert_eq!(value.var, vars[i]);
        assert_eq!(f64::decode(&value).unwrap(), i as f64);
    }

    let stats = session.stats();
    assert_eq!(stats.submitted, 100);
    assert_eq!(stats.completed, 100);
    assert!(stats.max_batch <= 10);
}

#[test]
#[serial]
fn test_sync_point_collects_failures_up_to_its_watermark() {
    let (transport, session) = open_session(ConfigBuilder::new().build());
    let present = var("weather:temp");
    let missing = var("weather:humidity");
    transport.share_remote("sensor", &present, float(1.0));

    transport.pause();
    let first = session.queue_pull(&present).unwrap();
    let second = session.queue_pull(&missing).unwrap();
    let sync = session.create_sync_point();
    assert_eq!(Some(sync.watermark()), second.id());

    // Submissions after the sync point do not hold it back
    let later = session.queue_pull(&missing).unwrap();
    assert!(!sync.is_complete());
    transport.resume();

    let failures = sync.wait(test_timeout()).unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].var, missing);
    assert_eq!(Some(failures[0].id), second.id());
    assert!(matches!(failures[0].error, SmaxError::NotFound(_)));

    assert!(first.wait(test_timeout()).is_ok());
    assert!(matches!(
        later.wait(test_timeout()),
        Err(SmaxError::NotFound(_))
    ));
    sync.destroy();
}

#[test]
#[serial]
fn test_queued_callback_runs_after_earlier_requests() {
    let (transport, session) = open_session(ConfigBuilder::new().build());
    let v = var("power:load");
    let log = Arc::new(Mutex::new(Vec::new()));

    transport.pause();
    for i in 0..3 {
        let log = log.clone();
        session
            .queue_share_with(&v, float(i as f64), move |r| {
                assert!(r.is_ok());
                log.lock().unwrap().push(format!("share {}", i));
            })
            .unwrap();
    }
    {
        let log = log.clone();
        session.queue_callback(move || log.lock().unwrap().push("barrier".to_string()));
    }
    transport.resume();
    session.flush(test_timeout()).unwrap();
    wait_until("barrier ran", || log.lock().unwrap().len() == 4);

    assert_eq!(
        *log.lock().unwrap(),
        vec!["share 0", "share 1", "share 2", "barrier"]
    );
    assert_eq!(transport.get(&v).unwrap().bytes, b"2".to_vec());
}

#[test]
#[serial]
fn test_fire_and_forget_failure_is_counted() {
    let (transport, session) = open_session(ConfigBuilder::new().build());
    transport.fail_next(SmaxError::Transport("injected".to_string()));

    session.queue_share(&var("a:b"), float(1.0)).unwrap();
    session.flush(test_timeout()).unwrap();

    let stats = session.stats();
    assert_eq!(stats.failed, 1);
    assert!(stats.last_error.unwrap().contains("injected"));
}

#[test]
#[serial]
fn test_unpipelined_session_uses_single_round_trips() {
    let config = ConfigBuilder::new().pipeline_enabled(false).build();
    let (transport, session) = open_session(config);
    let v = var("a:b");

    let share = session.queue_share(&v, float(3.0)).unwrap();
    assert!(share.is_done());
    let pull = session.queue_pull(&v).unwrap();
    assert_eq!(f64::decode(&pull.wait(test_timeout()).unwrap()).unwrap(), 3.0);
    assert_eq!(transport.execute_calls(), 2);
    assert_eq!(session.stats().submitted, 0);
}
