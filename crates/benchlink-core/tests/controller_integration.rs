//! Integration tests for the controller against a scripted loopback device.

mod common;

use std::sync::Arc;
use std::time::Duration;

use benchlink_core::controller::{CommandStatus, Controller};
use benchlink_core::event::{
    Controls, DeviceEvent, TelemetrySample, TITLE_ALREADY_STARTED, TITLE_DEVICE_ERROR,
    TITLE_ID_ERROR, TITLE_NOT_RUNNING, TITLE_TEST_ENDED, TITLE_TEST_STOPPED,
};
use benchlink_core::session::{Connection, SessionState};
use benchlink_core::sink::Sink;
use benchlink_core::state::TestPhase;

use common::{
    collect_until, connect_and_identify, drain, fast_config, start_running, wait_for, MockDevice,
    RecordingSink,
};

#[tokio::test]
async fn connect_sends_discovery_and_enables_start() {
    let mut device = MockDevice::bind().await;
    let controller = Controller::new(fast_config());
    let mut events = controller.subscribe();

    let connection = controller
        .connect("127.0.0.1", device.port())
        .await
        .unwrap();
    assert!(matches!(connection, Connection::Established(_)));
    assert_eq!(device.expect_command().await, "ID;");
    assert_eq!(controller.phase().await, TestPhase::Idle);
    assert!(!controller.controls().await.start);

    device.send("ID;MODEL=X1;SERIAL=99;").await;
    let identified = wait_for(&mut events, |e| matches!(e, DeviceEvent::Identified { .. })).await;
    assert_eq!(
        identified,
        DeviceEvent::Identified {
            model: "X1".into(),
            serial: "99".into()
        }
    );
    wait_for(&mut events, |e| *e == DeviceEvent::BufferClear).await;
    assert!(controller.controls().await.start);

    controller.shutdown().await;
}

#[tokio::test]
async fn second_connect_is_a_no_op() {
    let mut device = MockDevice::bind().await;
    let controller = Controller::new(fast_config());

    controller
        .connect("127.0.0.1", device.port())
        .await
        .unwrap();
    assert_eq!(device.expect_command().await, "ID;");

    let again = controller
        .connect("127.0.0.1", device.port())
        .await
        .unwrap();
    assert!(matches!(again, Connection::AlreadyConnected(_)));
    device.expect_silence(Duration::from_millis(200)).await;

    controller.shutdown().await;
}

#[tokio::test]
async fn incomplete_identification_is_reported() {
    let mut device = MockDevice::bind().await;
    let controller = Controller::new(fast_config());
    let mut events = controller.subscribe();

    controller
        .connect("127.0.0.1", device.port())
        .await
        .unwrap();
    device.expect_command().await;
    device.send("ID;MODEL=X1;").await;

    let notice = wait_for(&mut events, |e| e.is_notice(TITLE_ID_ERROR)).await;
    assert_eq!(
        notice,
        DeviceEvent::notice(TITLE_ID_ERROR, "ID message missing SERIAL")
    );
    assert!(!controller.controls().await.start);

    controller.shutdown().await;
}

#[tokio::test]
async fn full_test_cycle() {
    let mut device = MockDevice::bind().await;
    let controller = Controller::new(fast_config());
    let mut events = controller.subscribe();
    connect_and_identify(&controller, &mut device, &mut events).await;

    assert_eq!(
        controller.start_test(2).await.unwrap(),
        CommandStatus::Dispatched
    );
    assert_eq!(
        device.expect_command().await,
        "TEST;CMD=START;DURATION=2;RATE=100;"
    );
    assert_eq!(controller.phase().await, TestPhase::Starting);

    device.send("TEST;RESULT=STARTED;").await;
    device.send("STATUS;TIME=0;MV=0;MA=0;").await;
    device.send("STATUS;TIME=1000;MV=42;MA=7;").await;
    device.send("STATUS;STATE=IDLE;").await;

    let seen = collect_until(&mut events, |e| e.is_notice(TITLE_TEST_ENDED)).await;
    let samples: Vec<_> = seen
        .iter()
        .filter_map(|e| match e {
            DeviceEvent::Sample(sample) => Some(*sample),
            _ => None,
        })
        .collect();
    assert_eq!(
        samples,
        vec![TelemetrySample {
            time_secs: 1.0,
            millivolts: 42,
            milliamps: 7
        }]
    );
    assert!(seen.contains(&DeviceEvent::TestStateChanged {
        phase: TestPhase::Running
    }));

    assert_eq!(controller.phase().await, TestPhase::Idle);
    assert_eq!(
        controller.controls().await,
        Controls {
            connect: true,
            start: true,
            stop: false,
            save: true
        }
    );
    assert_eq!(controller.session_state().await, SessionState::Connected);

    controller.shutdown().await;
}

#[tokio::test]
async fn double_start_sends_one_command() {
    let mut device = MockDevice::bind().await;
    let controller = Controller::new(fast_config());
    let mut events = controller.subscribe();
    connect_and_identify(&controller, &mut device, &mut events).await;
    drain(&mut events);

    let (first, second) = tokio::join!(controller.start_test(5), controller.start_test(5));
    let mut statuses = vec![first.unwrap(), second.unwrap()];
    statuses.sort_by_key(|s| *s == CommandStatus::Ignored);
    assert_eq!(
        statuses,
        vec![CommandStatus::Dispatched, CommandStatus::Ignored]
    );

    assert!(device.expect_command().await.starts_with("TEST;CMD=START;"));
    device.expect_silence(Duration::from_millis(200)).await;

    let notices: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|e| e.is_notice(TITLE_ALREADY_STARTED))
        .collect();
    assert_eq!(notices.len(), 1);

    controller.shutdown().await;
}

#[tokio::test]
async fn start_while_running_is_refused() {
    let mut device = MockDevice::bind().await;
    let controller = Controller::new(fast_config());
    let mut events = controller.subscribe();
    connect_and_identify(&controller, &mut device, &mut events).await;
    start_running(&controller, &mut device, &mut events, 10).await;

    assert_eq!(
        controller.start_test(10).await.unwrap(),
        CommandStatus::Ignored
    );
    wait_for(&mut events, |e| e.is_notice(TITLE_ALREADY_STARTED)).await;
    device.expect_silence(Duration::from_millis(200)).await;
    assert_eq!(controller.phase().await, TestPhase::Running);

    controller.shutdown().await;
}

#[tokio::test]
async fn stop_cycle() {
    let mut device = MockDevice::bind().await;
    let controller = Controller::new(fast_config());
    let mut events = controller.subscribe();
    connect_and_identify(&controller, &mut device, &mut events).await;
    start_running(&controller, &mut device, &mut events, 30).await;

    assert_eq!(
        controller.stop_test().await.unwrap(),
        CommandStatus::Dispatched
    );
    assert_eq!(device.expect_command().await, "TEST;CMD=STOP;");
    assert_eq!(controller.phase().await, TestPhase::Stopping);

    device.send("TEST;RESULT=STOPPED;").await;
    wait_for(&mut events, |e| e.is_notice(TITLE_TEST_STOPPED)).await;
    wait_for(&mut events, |e| {
        *e == DeviceEvent::TestStateChanged {
            phase: TestPhase::Idle,
        }
    })
    .await;

    // A new test can start right away.
    assert_eq!(
        controller.start_test(1).await.unwrap(),
        CommandStatus::Dispatched
    );
    assert!(device.expect_command().await.starts_with("TEST;CMD=START;"));

    controller.shutdown().await;
}

#[tokio::test]
async fn stop_without_test_is_refused() {
    let mut device = MockDevice::bind().await;
    let controller = Controller::new(fast_config());
    let mut events = controller.subscribe();
    connect_and_identify(&controller, &mut device, &mut events).await;

    assert_eq!(
        controller.stop_test().await.unwrap(),
        CommandStatus::Ignored
    );
    wait_for(&mut events, |e| e.is_notice(TITLE_NOT_RUNNING)).await;
    device.expect_silence(Duration::from_millis(200)).await;

    controller.shutdown().await;
}

#[tokio::test]
async fn device_error_keeps_phase() {
    let mut device = MockDevice::bind().await;
    let controller = Controller::new(fast_config());
    let mut events = controller.subscribe();
    connect_and_identify(&controller, &mut device, &mut events).await;
    start_running(&controller, &mut device, &mut events, 10).await;

    device
        .send("TEST;RESULT=error;MSG=Test already running;")
        .await;
    let notice = wait_for(&mut events, |e| e.is_notice(TITLE_DEVICE_ERROR)).await;
    assert_eq!(
        notice,
        DeviceEvent::notice(
            TITLE_DEVICE_ERROR,
            "Error: error reason: Test already running"
        )
    );
    assert_eq!(controller.phase().await, TestPhase::Running);

    controller.shutdown().await;
}

#[tokio::test]
async fn idle_resets_from_starting() {
    let mut device = MockDevice::bind().await;
    let controller = Controller::new(fast_config());
    let mut events = controller.subscribe();
    connect_and_identify(&controller, &mut device, &mut events).await;

    controller.start_test(3).await.unwrap();
    device.expect_command().await;
    device.send("STATUS;STATE=IDLE;").await;
    wait_for(&mut events, |e| e.is_notice(TITLE_TEST_ENDED)).await;
    wait_for(&mut events, |e| {
        *e == DeviceEvent::TestStateChanged {
            phase: TestPhase::Idle,
        }
    })
    .await;
    assert!(controller.test_session().await.is_none());

    controller.shutdown().await;
}

#[tokio::test]
async fn sink_receives_events() {
    let mut device = MockDevice::bind().await;
    let controller = Controller::new(fast_config());
    let recorder = Arc::new(RecordingSink::default());
    let sink: Arc<dyn Sink> = recorder.clone();
    let handle = controller.attach_sink(Arc::downgrade(&sink));
    let mut events = controller.subscribe();

    connect_and_identify(&controller, &mut device, &mut events).await;
    start_running(&controller, &mut device, &mut events, 10).await;
    device.send("STATUS;TIME=2500;MV=12;MA=3;").await;

    recorder.wait_for(|call| call == "sample 2.5 12 3").await;
    let calls = recorder.calls();
    assert!(calls.contains(&"identified X1 99".to_string()));
    assert!(calls.contains(&"phase running".to_string()));
    assert!(calls.contains(&"buffer_clear".to_string()));

    handle.stop().await;
    controller.shutdown().await;
}

#[tokio::test]
async fn dropped_sink_detaches() {
    let controller = Controller::new(fast_config());
    let sink: Arc<dyn Sink> = Arc::new(RecordingSink::default());
    let handle = controller.attach_sink(Arc::downgrade(&sink));
    drop(sink);

    controller.inject(b"HELLO;").await;
    for _ in 0..100 {
        if !handle.is_running() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!handle.is_running());
}

/// Spends a millisecond on every notice.
#[derive(Default)]
struct SlowSink {
    notices: std::sync::Mutex<usize>,
}

impl Sink for SlowSink {
    fn on_notice(&self, _title: &str, _message: &str) {
        std::thread::sleep(Duration::from_millis(1));
        *self.notices.lock().unwrap() += 1;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_sink_misses_no_events() {
    let controller = Controller::new(fast_config());
    let slow = Arc::new(SlowSink::default());
    let sink: Arc<dyn Sink> = slow.clone();
    let handle = controller.attach_sink(Arc::downgrade(&sink));

    // Four times the broadcast capacity.
    let published = controller.config().event_capacity * 4;
    for _ in 0..published {
        controller.inject(b"STATUS;STATE=BUSY;").await;
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while *slow.notices.lock().unwrap() < published && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(*slow.notices.lock().unwrap(), published);

    handle.stop().await;
}

#[tokio::test]
async fn disconnect_resets_state() {
    let mut device = MockDevice::bind().await;
    let controller = Controller::new(fast_config());
    let mut events = controller.subscribe();
    connect_and_identify(&controller, &mut device, &mut events).await;
    start_running(&controller, &mut device, &mut events, 10).await;

    assert!(controller.disconnect().await);
    assert_eq!(controller.phase().await, TestPhase::Disconnected);
    assert_eq!(controller.controls().await, Controls::default());
    assert_eq!(controller.session_state().await, SessionState::Closed);

    let err = controller.start_test(5).await.unwrap_err();
    assert!(err.is_not_connected());

    // Caller-initiated disconnects are not reported as losses.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!drain(&mut events)
        .iter()
        .any(|e| matches!(e, DeviceEvent::ConnectionLost { .. })));
}
