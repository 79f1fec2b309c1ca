mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{basic_info_payload, bms_reply, inverter_reply, AsyncMockLink, Behavior, MockLink};
use solarlink_core::device::{AsyncBmsDevice, AsyncInverterDevice};
use solarlink_core::protocol::{
    AsyncSession, BmsFraming, BmsRegister, Command, FramingStrategy, InverterFraming,
    InverterQuery, RetryPolicy, SessionConfig, SessionDisposed,
};
use solarlink_core::response::DeviceMode;
use tokio::time::Instant;

fn config(poll_ms: u64) -> SessionConfig {
    SessionConfig {
        name: "async".to_string(),
        min_poll_interval: Duration::from_millis(poll_ms),
        acquire_timeout: Duration::from_secs(30),
        read_timeout: Duration::from_millis(100),
        receive_timeout: Duration::from_millis(400),
        wake_timeout: Duration::from_millis(200),
        attempts: 3,
    }
}

#[tokio::test(start_paused = true)]
async fn test_requests_are_spaced_by_poll_interval() {
    let link = MockLink::bms().fallback(Behavior::Reply(bms_reply(0x04, &[0x0E, 0x2E])));
    let session = AsyncSession::new(AsyncMockLink(link.clone()), BmsFraming, config(500));
    let cells: Command = BmsRegister::CellVoltages.into();

    let start = Instant::now();
    for _ in 0..4 {
        assert!(session.request(&cells).await.unwrap().success);
    }

    assert!(start.elapsed() >= Duration::from_millis(1500));
    assert_eq!(link.state().frames.len(), 4);
    assert_eq!(session.counters().await.tx_frames, 4);
}

#[tokio::test(start_paused = true)]
async fn test_spawned_callers_are_served_in_order() {
    let queries = [
        (InverterQuery::ProtocolId, "PI30"),
        (InverterQuery::SerialNumber, "92932004102453"),
        (InverterQuery::FirmwareVersion, "VERFW:00072.70"),
        (InverterQuery::DeviceMode, "B"),
    ];
    let link = MockLink::inverter(false).script(
        queries
            .iter()
            .map(|(_, text)| Behavior::Reply(inverter_reply(text))),
    );
    let session = Arc::new(AsyncSession::new(
        AsyncMockLink(link.clone()),
        InverterFraming::new(false),
        config(100),
    ));

    let mut handles = Vec::new();
    for (query, _) in queries {
        let session = Arc::clone(&session);
        handles.push(tokio::spawn(async move {
            session.request(&Command::from(query)).await
        }));
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    for handle in handles {
        assert!(handle.await.unwrap().unwrap().success);
    }

    let framing = InverterFraming::new(false);
    let sent: Vec<Vec<u8>> = link.state().frames.iter().map(|f| f.bytes.clone()).collect();
    let expected: Vec<Vec<u8>> = queries
        .iter()
        .map(|(query, _)| framing.encode(&Command::from(*query)))
        .collect();
    assert_eq!(sent, expected);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_replies_stop_after_attempt_budget() {
    let link = MockLink::bms().fallback(Behavior::Reply(bms_reply(0x04, &[0x0E, 0x2E])));
    let session = AsyncSession::new(AsyncMockLink(link.clone()), BmsFraming, config(10))
        .with_retry_policy(RetryPolicy::new(4).with_validator(|_, _| false));

    let exchange = session
        .request(&BmsRegister::CellVoltages.into())
        .await
        .unwrap();
    assert!(!exchange.success);
    assert_eq!(link.state().frames.len(), 4);
    assert_eq!(session.counters().await.retries, 3);
}

#[tokio::test(start_paused = true)]
async fn test_silent_device_recovers_between_attempts() {
    let link = MockLink::bms().script([
        Behavior::Silent,
        Behavior::Silent,
        Behavior::Reply(bms_reply(0x04, &[0x0E, 0x2E])),
    ]);
    let session = AsyncSession::new(AsyncMockLink(link.clone()), BmsFraming, config(10));

    let exchange = session
        .execute(&BmsRegister::CellVoltages.into())
        .await
        .unwrap();
    assert_eq!(exchange.payload, Some(vec![0x0E, 0x2E]));

    let state = link.state();
    assert_eq!(state.requests(&BmsFraming.wake_frame()).len(), 2);
    assert_eq!(state.opens, 2);
    drop(state);
    assert_eq!(session.counters().await.recoveries, 1);
}

#[tokio::test(start_paused = true)]
async fn test_async_bms_device() {
    let link = MockLink::bms().script([
        Behavior::Reply(bms_reply(0x03, &basic_info_payload())),
        Behavior::Reply(bms_reply(0x05, b"JBD-SP04S034")),
        Behavior::Reply(bms_reply(0xE1, &[])),
    ]);
    let bms = AsyncBmsDevice::new(AsyncMockLink(link.clone()), config(10));

    let info = bms.basic_info().await.unwrap().expect("basic info");
    assert_eq!(info.cell_count, 4);
    assert_eq!(info.state_of_charge, 50);
    assert_eq!(
        bms.hardware_version().await.unwrap().as_deref(),
        Some("JBD-SP04S034")
    );
    assert!(bms.set_mos(true, false).await.unwrap());

    bms.dispose().await;
    assert_eq!(bms.basic_info().await, Err(SessionDisposed));
}

#[tokio::test(start_paused = true)]
async fn test_async_inverter_device() {
    let link = MockLink::inverter(false).script([
        Behavior::Reply(inverter_reply("L")),
        Behavior::Reply(inverter_reply(
            "000000000000000000000000000000000100000000000000",
        )),
    ]);
    let inverter = AsyncInverterDevice::new(AsyncMockLink(link), false, config(10));

    assert_eq!(inverter.device_mode().await.unwrap(), Some(DeviceMode::Line));
    let warnings = inverter.warning_status().await.unwrap().expect("warnings");
    assert_eq!(warnings.active(), vec![33]);
}

#[tokio::test(start_paused = true)]
async fn test_async_replies_assembled_from_partial_reads() {
    let link = MockLink::bms().with_read_chunk(1).script([
        Behavior::Reply(bms_reply(0xE1, &[])),
        Behavior::Reply(bms_reply(0x04, &[0x0E, 0x2E, 0x0E, 0x42])),
    ]);
    let bms = AsyncBmsDevice::new(AsyncMockLink(link.clone()), config(10));

    assert!(bms.set_mos(false, false).await.unwrap());
    let cells = bms.cell_voltages().await.unwrap().expect("cells");
    assert_eq!(cells.millivolts, vec![3630, 3650]);

    let state = link.state();
    assert_eq!(state.frames.len(), 2);
    assert_eq!(state.read_sizes.len(), 7 + 11);
}

#[tokio::test(start_paused = true)]
async fn test_async_terminated_reply_across_reads() {
    let link = MockLink::inverter(true)
        .with_page_size(8)
        .with_read_chunk(3)
        .fallback(Behavior::Reply(inverter_reply("PI30")));
    let inverter = AsyncInverterDevice::new(AsyncMockLink(link.clone()), true, config(10));

    assert_eq!(
        inverter.protocol_id().await.unwrap().as_deref(),
        Some("PI30")
    );
    assert_eq!(link.state().frames.len(), 1);
}
