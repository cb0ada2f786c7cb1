// MIT License - Copyright (c) 2026 Peter Wright
// BlueBOLT CV2 client
//
// End-to-end tests against an in-process fake CV2 card on 127.0.0.1.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use bluebolt_cv2::xml::XmlElement;
use bluebolt_cv2::{
    BlueBoltDevice, BlueBoltError, DeviceConfig, DeviceErrorCode, DeviceEvent, DeviceModel,
    DeviceMonitor, OutletCommand, SensorField,
};

const MAC: &str = "1065a31b2c3d";
const DEVICE_ID: &str = "77";

// ---------------------------------------------------------------------------
// Fake CV2 card
// ---------------------------------------------------------------------------

struct FakeState {
    class: &'static str,
    ups: bool,
    outlets: Mutex<Vec<bool>>,
    /// Drop every request without answering
    silent: AtomicBool,
    /// Delay before answering a status request, in ms
    status_delay_ms: AtomicU64,
    /// Send an unrelated ack ahead of each status response
    noise: AtomicBool,
    /// Send every status response twice
    duplicate: AtomicBool,
    /// Answer status requests with a code-less error that echoes the MAC
    expire_session: AtomicBool,
    /// Requests received, answered or not
    received: AtomicUsize,
    /// Status responses built so far; feeds the reported voltage
    status_seq: AtomicU64,
}

struct FakeCard {
    port: u16,
    state: Arc<FakeState>,
    handle: JoinHandle<()>,
}

impl FakeCard {
    async fn start(class: &'static str, switches: usize, ups: bool) -> Self {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let port = socket.local_addr().unwrap().port();
        let state = Arc::new(FakeState {
            class,
            ups,
            outlets: Mutex::new(vec![false; switches]),
            silent: AtomicBool::new(false),
            status_delay_ms: AtomicU64::new(0),
            noise: AtomicBool::new(false),
            duplicate: AtomicBool::new(false),
            expire_session: AtomicBool::new(false),
            received: AtomicUsize::new(0),
            status_seq: AtomicU64::new(0),
        });

        let task_state = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                // ICMP errors from replies to closed client ports show up here
                let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                    continue;
                };
                task_state.received.fetch_add(1, Ordering::SeqCst);
                if task_state.silent.load(Ordering::SeqCst) {
                    continue;
                }
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                let Some((reply, is_status)) = task_state.respond(&request).await else {
                    continue;
                };

                let socket = Arc::clone(&socket);
                let delay = if is_status {
                    task_state.status_delay_ms.load(Ordering::SeqCst)
                } else {
                    0
                };
                let noise = is_status && task_state.noise.load(Ordering::SeqCst);
                let copies = if is_status && task_state.duplicate.load(Ordering::SeqCst) {
                    2
                } else {
                    1
                };
                tokio::spawn(async move {
                    if delay > 0 {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                    if noise {
                        let unrelated = format!(
                            r#"<device class="x" id="{DEVICE_ID}"><ack xid="set_outlet_99"/></device>"#
                        );
                        let _ = socket.send_to(unrelated.as_bytes(), peer).await;
                    }
                    for _ in 0..copies {
                        let _ = socket.send_to(reply.as_bytes(), peer).await;
                    }
                });
            }
        });

        Self {
            port,
            state,
            handle,
        }
    }

    fn config(&self) -> DeviceConfig {
        self.config_with(MAC)
    }

    fn config_with(&self, mac: &str) -> DeviceConfig {
        DeviceConfig::builder()
            .host("127.0.0.1")
            .port(self.port)
            .mac(mac)
            .timeout(Duration::from_millis(150))
            .retries(1)
            .scan_interval(Duration::from_millis(50))
            .build()
            .unwrap()
    }

    fn received(&self) -> usize {
        self.state.received.load(Ordering::SeqCst)
    }
}

impl Drop for FakeCard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl FakeState {
    /// Build the reply for one request. The flag marks status responses.
    async fn respond(&self, request: &str) -> Option<(String, bool)> {
        let doc = XmlElement::parse(request).ok()?;
        let class = doc.attr("class")?.to_string();
        let id = doc.attr("id")?.to_string();

        if doc.find("sendfamily").is_some() {
            if class != "cv2" || id != MAC {
                return Some((
                    format!(r#"<device class="cv2" id="{id}"><error code="auth">bad token {id}</error></device>"#),
                    false,
                ));
            }
            return Some((
                format!(
                    r#"<device class="cv2" id="{MAC}"><kids class="{}"><k>{DEVICE_ID}</k></kids></device>"#,
                    self.class
                ),
                false,
            ));
        }

        if class != self.class || id != DEVICE_ID {
            return Some((
                format!(r#"<device class="{class}" id="{id}"><error code="nodevice"/></device>"#),
                false,
            ));
        }

        if doc.find("sendinfo").is_some() {
            return Some((
                format!(r#"<device class="{class}" id="{id}"><fwver>2.1.0</fwver></device>"#),
                false,
            ));
        }

        if doc.find("sendstatus").is_some() {
            if self.expire_session.load(Ordering::SeqCst) {
                return Some((
                    format!(r#"<device class="{class}" id="{id}"><error>session expired for {MAC}</error></device>"#),
                    false,
                ));
            }
            let seq = self.status_seq.fetch_add(1, Ordering::SeqCst) + 1;
            let mut body = format!(
                "<voltage>{}</voltage><amperage>1.5</amperage><wattage>180</wattage>\
                 <pwrva>190</pwrva><pwrfact>0.95</pwrfact><temperature>28</temperature>",
                100 + seq
            );
            if self.ups {
                body.push_str(
                    "<voltageout>120</voltageout><battlevel>0.87</battlevel>\
                     <loadlevel>35</loadlevel><pwrcond>1</pwrcond>",
                );
            }
            for (i, on) in self.outlets.lock().await.iter().enumerate() {
                body.push_str(&format!(
                    r#"<outlet id="{}">{}</outlet>"#,
                    i + 1,
                    if *on { 1 } else { 0 }
                ));
            }
            return Some((
                format!(r#"<device class="{class}" id="{id}">{body}</device>"#),
                true,
            ));
        }

        let command = doc.find("command")?;
        let outlet = command.find("outlet")?;
        let index: usize = outlet.attr("id")?.parse().ok()?;
        let xid = command.attr("xid")?.to_string();
        let mut outlets = self.outlets.lock().await;
        if index == 0 || index > outlets.len() {
            return Some((
                format!(r#"<device class="{class}" id="{id}"><error code="badcmd"/></device>"#),
                false,
            ));
        }
        outlets[index - 1] = outlet.text.trim() == "1";
        Some((
            format!(r#"<device class="{class}" id="{id}"><ack xid="{xid}"/></device>"#),
            false,
        ))
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_m4315_status_and_outlet_cycle() {
    let card = FakeCard::start("km4315", 8, false).await;
    let device = BlueBoltDevice::connect(card.config()).await.unwrap();

    assert_eq!(device.model(), DeviceModel::M4315Pro);
    assert_eq!(device.info().manufacturer(), "Panamax");
    assert_eq!(device.info().firmware.as_deref(), Some("2.1.0"));

    let status = device.fetch_status().await.unwrap();
    assert_eq!(status.sensor_count(), 4);
    assert_eq!(status.outlet_count(), 8);
    assert_eq!(status.outlet(3), Some(false));
    // Fields outside the model's set are ignored
    assert_eq!(status.sensor(SensorField::ApparentPower), None);

    device.set_outlet(OutletCommand::on(3)).await.unwrap();

    let status = device.fetch_status().await.unwrap();
    assert_eq!(status.outlet(3), Some(true));
    assert_eq!(status.outlets().filter(|(_, on)| *on).count(), 1);

    device.set_outlet(OutletCommand::off(3)).await.unwrap();
    let status = device.fetch_status().await.unwrap();
    assert_eq!(status.outlet(3), Some(false));

    device.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_every_model_yields_its_sensor_set() {
    let cases = [
        ("km4315", 8, false, DeviceModel::M4315Pro),
        ("km4320", 8, false, DeviceModel::M4320Pro),
        ("kmb1500", 4, true, DeviceModel::Mb1500),
        ("kf1500", 4, true, DeviceModel::F1500Ups),
        ("kf1500e", 4, true, DeviceModel::F1500UpsE),
    ];

    for (class, switches, ups, model) in cases {
        let card = FakeCard::start(class, switches, ups).await;
        let device = BlueBoltDevice::connect(card.config()).await.unwrap();
        assert_eq!(device.model(), model, "class {class}");

        let status = device.fetch_status().await.unwrap();
        let expected = if ups { 6 } else { 4 };
        assert_eq!(status.sensor_count(), expected, "class {class}");
        assert_eq!(status.outlet_count(), switches, "class {class}");
        for field in model.sensors().fields() {
            assert!(status.sensor(field).is_some(), "class {class} missing {field}");
        }

        if ups {
            let battery = status.sensor(SensorField::BatteryLevel).unwrap();
            assert!((battery - 87.0).abs() < 1e-9);
            assert_eq!(status.power_condition, Some(1));
        } else {
            assert_eq!(status.sensor(SensorField::BatteryLevel), None);
        }
    }
}

#[tokio::test]
async fn test_out_of_range_outlet_sends_nothing() {
    let card = FakeCard::start("km4315", 8, false).await;
    let device = BlueBoltDevice::connect(card.config()).await.unwrap();
    let sent = device.transport_stats().datagrams_sent;
    let received = card.received();

    let err = device.set_outlet(OutletCommand::on(0)).await.unwrap_err();
    assert!(matches!(err, BlueBoltError::InvalidOutlet { index: 0, max: 8 }));
    let err = device.set_outlet(OutletCommand::on(9)).await.unwrap_err();
    assert_eq!(err.to_string(), "Invalid outlet index: 9 (must be 1-8)");

    assert_eq!(device.transport_stats().datagrams_sent, sent);
    assert_eq!(card.received(), received);
}

#[tokio::test]
async fn test_bank_model_rejects_fifth_bank() {
    let card = FakeCard::start("kf1500", 4, true).await;
    let device = BlueBoltDevice::connect(card.config()).await.unwrap();

    let err = device.set_outlet(OutletCommand::on(5)).await.unwrap_err();
    assert!(matches!(err, BlueBoltError::InvalidOutlet { index: 5, max: 4 }));
    device.set_outlet(OutletCommand::on(4)).await.unwrap();
}

#[tokio::test]
async fn test_timeout_after_retry_budget() {
    let card = FakeCard::start("km4315", 8, false).await;
    let device = BlueBoltDevice::connect(card.config()).await.unwrap();
    card.state.silent.store(true, Ordering::SeqCst);
    let received = card.received();

    let err = device.fetch_status().await.unwrap_err();
    match err {
        BlueBoltError::Timeout { ref command, attempts } => {
            assert_eq!(command, "sendstatus");
            assert_eq!(attempts, 2);
        }
        ref other => panic!("expected timeout, got {other:?}"),
    }
    assert!(err.is_transient());
    assert_eq!(card.received() - received, 2);
    assert_eq!(device.transport_stats().timeouts, 1);
}

#[tokio::test]
async fn test_duplicate_response_is_drained() {
    let card = FakeCard::start("km4315", 8, false).await;
    let device = BlueBoltDevice::connect(card.config()).await.unwrap();
    card.state.duplicate.store(true, Ordering::SeqCst);

    let first = device.fetch_status().await.unwrap();
    assert_eq!(first.sensor(SensorField::Voltage), Some(101.0));
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The second copy of the first answer is queued and must not be read
    let second = device.fetch_status().await.unwrap();
    assert_eq!(second.sensor(SensorField::Voltage), Some(102.0));
    assert_eq!(device.transport_stats().discarded, 1);
}

#[tokio::test]
async fn test_slow_card_on_two_polls_in_a_row() {
    let card = FakeCard::start("km4315", 8, false).await;
    let device = BlueBoltDevice::connect(card.config()).await.unwrap();

    // Both attempts (2 x 150ms) give up before the 400ms answers arrive
    card.state.status_delay_ms.store(400, Ordering::SeqCst);
    for _ in 0..2 {
        assert!(matches!(
            device.fetch_status().await,
            Err(BlueBoltError::Timeout { .. })
        ));
    }

    // Answers to the first poll arrive during the second; none may be read
    card.state.status_delay_ms.store(0, Ordering::SeqCst);
    let status = device.fetch_status().await.unwrap();
    let seq = card.state.status_seq.load(Ordering::SeqCst);
    assert_eq!(seq, 5);
    assert_eq!(status.sensor(SensorField::Voltage), Some(105.0));

    // Later answers to the second poll still never surface
    tokio::time::sleep(Duration::from_millis(400)).await;
    let status = device.fetch_status().await.unwrap();
    assert_eq!(status.sensor(SensorField::Voltage), Some(106.0));

    let stats = device.transport_stats();
    assert_eq!(stats.timeouts, 2);
    assert_eq!(stats.discarded, 0);
}

#[tokio::test]
async fn test_unrelated_datagram_is_skipped() {
    let card = FakeCard::start("km4320", 8, false).await;
    let device = BlueBoltDevice::connect(card.config()).await.unwrap();
    card.state.noise.store(true, Ordering::SeqCst);

    let status = device.fetch_status().await.unwrap();
    assert_eq!(status.outlet_count(), 8);
    assert_eq!(device.transport_stats().discarded, 1);
    assert_eq!(device.transport_stats().timeouts, 0);
}

#[tokio::test]
async fn test_rejected_token_is_redacted() {
    let card = FakeCard::start("km4315", 8, false).await;
    let config = card.config_with("10:65:A3:AA:BB:CC");

    let err = match BlueBoltDevice::connect(config).await {
        Ok(_) => panic!("connect should fail with a wrong token"),
        Err(e) => e,
    };
    match &err {
        BlueBoltError::Auth { host, token } => {
            assert_eq!(host, "127.0.0.1");
            assert_eq!(token, "1065a3XXXXXX");
        }
        other => panic!("expected auth error, got {other:?}"),
    }
    assert!(err.is_fatal());

    let message = format!("{err} {err:?}").to_lowercase();
    assert!(!message.contains("aabbcc"));
    // Sent once; auth failures are not retried
    assert_eq!(card.received(), 1);
}

#[tokio::test]
async fn test_device_error_text_is_redacted() {
    let card = FakeCard::start("km4315", 8, false).await;
    let device = BlueBoltDevice::connect(card.config()).await.unwrap();
    card.state.expire_session.store(true, Ordering::SeqCst);

    let err = device.fetch_status().await.unwrap_err();
    match &err {
        BlueBoltError::Device(DeviceErrorCode::Other(text)) => {
            assert_eq!(text, "session expired for 1065a3XXXXXX");
        }
        other => panic!("expected device error, got {other:?}"),
    }
    assert!(err.is_transient());
    let message = format!("{err} {err:?}");
    assert!(!message.contains("1b2c3d"));

    let monitor = DeviceMonitor::new(device);
    let mut events = monitor.subscribe();
    assert!(monitor.refresh().await.unwrap().is_none());
    match events.try_recv() {
        Ok(DeviceEvent::Unavailable { reason }) => {
            assert!(reason.contains("1065a3XXXXXX"));
            assert!(!reason.contains("1b2c3d"));
        }
        other => panic!("expected Unavailable, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unsupported_device() {
    let card = FakeCard::start("km9999", 8, false).await;

    let err = match BlueBoltDevice::connect(card.config()).await {
        Ok(_) => panic!("connect should fail for an unknown class"),
        Err(e) => e,
    };
    assert!(matches!(err, BlueBoltError::UnsupportedDevice { ref identifier } if identifier == "km9999"));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_connect_times_out_without_card() {
    let card = FakeCard::start("km4315", 8, false).await;
    card.state.silent.store(true, Ordering::SeqCst);

    let err = match BlueBoltDevice::connect(card.config()).await {
        Ok(_) => panic!("connect should time out"),
        Err(e) => e,
    };
    assert!(matches!(err, BlueBoltError::Timeout { attempts: 2, .. }));
}

#[tokio::test]
async fn test_consecutive_polls_keep_outlet_count() {
    let card = FakeCard::start("kmb1500", 4, true).await;
    let device = BlueBoltDevice::connect(card.config()).await.unwrap();

    let first = device.fetch_status().await.unwrap();
    for _ in 0..3 {
        let next = device.fetch_status().await.unwrap();
        assert!(first.same_layout(&next));
        assert_eq!(next.outlet_count(), 4);
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_monitor_availability_transitions() {
    let card = FakeCard::start("km4315", 8, false).await;
    let monitor = DeviceMonitor::new(BlueBoltDevice::connect(card.config()).await.unwrap());
    let mut events = monitor.subscribe();

    assert!(monitor.reading().await.is_none());
    assert!(monitor.refresh().await.unwrap().is_some());
    assert!(monitor.is_available().await);
    assert!(matches!(events.try_recv(), Ok(DeviceEvent::Available)));
    assert!(matches!(events.try_recv(), Ok(DeviceEvent::StatusUpdated(_))));

    card.state.silent.store(true, Ordering::SeqCst);
    assert!(monitor.refresh().await.unwrap().is_none());
    assert!(!monitor.is_available().await);
    assert!(monitor.reading().await.is_none());
    assert!(matches!(events.try_recv(), Ok(DeviceEvent::Unavailable { .. })));

    // Still down: no second Unavailable
    assert!(monitor.refresh().await.unwrap().is_none());
    assert!(events.try_recv().is_err());

    card.state.silent.store(false, Ordering::SeqCst);
    assert!(monitor.refresh().await.unwrap().is_some());
    assert!(matches!(events.try_recv(), Ok(DeviceEvent::Available)));
    assert!(matches!(events.try_recv(), Ok(DeviceEvent::StatusUpdated(_))));
    assert_eq!(monitor.reading().await.map(|r| r.outlet_count()), Some(8));
}

#[tokio::test]
async fn test_monitor_set_outlet_repolls() {
    let card = FakeCard::start("km4315", 8, false).await;
    let monitor = DeviceMonitor::new(BlueBoltDevice::connect(card.config()).await.unwrap());
    monitor.refresh().await.unwrap();
    let mut events = monitor.subscribe();

    monitor.set_outlet(OutletCommand::on(3)).await.unwrap();
    assert_eq!(monitor.reading().await.and_then(|r| r.outlet(3)), Some(true));

    assert!(matches!(
        events.try_recv(),
        Ok(DeviceEvent::OutletCommandSent { index: 3, on: true })
    ));
    assert!(matches!(
        events.try_recv(),
        Ok(DeviceEvent::OutletChanged { index: 3, on: true })
    ));
    assert!(matches!(events.try_recv(), Ok(DeviceEvent::StatusUpdated(_))));
}

#[tokio::test]
async fn test_concurrent_refreshes_apply_in_poll_order() {
    let card = FakeCard::start("km4315", 8, false).await;
    let monitor = DeviceMonitor::new(BlueBoltDevice::connect(card.config()).await.unwrap());
    let mut events = monitor.subscribe();
    card.state.status_delay_ms.store(20, Ordering::SeqCst);

    let (a, b, c) = tokio::join!(monitor.refresh(), monitor.refresh(), monitor.refresh());
    for result in [a, b, c] {
        assert!(result.unwrap().is_some());
    }

    let seq = card.state.status_seq.load(Ordering::SeqCst);
    assert_eq!(seq, 3);
    let latest = monitor.reading().await.and_then(|r| r.sensor(SensorField::Voltage));
    assert_eq!(latest, Some(100.0 + seq as f64));

    let mut voltages = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let DeviceEvent::StatusUpdated(reading) = event {
            voltages.extend(reading.sensor(SensorField::Voltage));
        }
    }
    assert_eq!(voltages, vec![101.0, 102.0, 103.0]);
}

#[tokio::test]
async fn test_monitor_run_until_shutdown() {
    let card = FakeCard::start("kf1500e", 4, true).await;
    let monitor = Arc::new(DeviceMonitor::new(
        BlueBoltDevice::connect(card.config()).await.unwrap(),
    ));
    let mut events = monitor.subscribe();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runner = Arc::clone(&monitor);
    let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

    let mut updates = 0;
    while updates < 2 {
        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Ok(DeviceEvent::StatusUpdated(reading))) => {
                assert_eq!(reading.model, DeviceModel::F1500UpsE);
                updates += 1;
            }
            Ok(Ok(_)) => {}
            other => panic!("no status update: {other:?}"),
        }
    }

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    loop {
        match events.recv().await {
            Ok(DeviceEvent::Stopped { model, reason }) => {
                assert_eq!(model, DeviceModel::F1500UpsE);
                assert_eq!(reason, "shutdown");
                break;
            }
            Ok(_) => {}
            Err(e) => panic!("channel ended before Stopped: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[tokio::test]
async fn test_debug_logs_never_contain_token_secret() {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(logs.clone())
        .finish();
    // Current-thread test runtime, so the fake card and client log here too
    let _guard = tracing::subscriber::set_default(subscriber);

    let card = FakeCard::start("km4315", 8, false).await;
    let monitor = DeviceMonitor::new(BlueBoltDevice::connect(card.config()).await.unwrap());
    monitor.refresh().await.unwrap();
    monitor.set_outlet(OutletCommand::on(2)).await.unwrap();

    card.state.expire_session.store(true, Ordering::SeqCst);
    assert!(monitor.refresh().await.unwrap().is_none());

    let err = match BlueBoltDevice::connect(card.config_with("10:65:A3:AA:BB:CC")).await {
        Ok(_) => panic!("connect should fail with a wrong token"),
        Err(e) => e,
    };
    tracing::error!("Connect failed: {err}");

    let output = logs.contents();
    assert!(output.contains("Connecting to BlueBOLT CV2"));
    assert!(output.contains("Sent to"));
    assert!(output.contains("Received from"));
    assert!(output.contains("1065a3XXXXXX"));

    let lower = output.to_lowercase();
    assert!(!lower.contains("1b2c3d"), "secret leaked:\n{output}");
    assert!(!lower.contains("aabbcc"), "secret leaked:\n{output}");
}
