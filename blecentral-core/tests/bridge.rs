mod common;

use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use blecentral_core::dispatch::serve;
use blecentral_core::{DeviceAddress, Dispatcher, LinkState, RadioEvent};
use blecentral_proto::gatt::actions;
use blecentral_proto::uuids::from_u16;
use blecentral_proto::{Request, Response};

use common::*;

fn request(id: u64, cmd: &str, args: serde_json::Value) -> Request {
    Request { id, ..Request::with_args(cmd, args) }
}

fn line(request: &Request) -> Vec<u8> {
    let mut line = serde_json::to_vec(request).unwrap();
    line.push(b'\n');
    line
}

fn parse_output(output: Vec<u8>) -> Vec<Response> {
    String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

fn finals(responses: &[Response], id: u64) -> Vec<&Response> {
    responses.iter().filter(|r| r.id == id && !r.keep).collect()
}

#[tokio::test(start_paused = true)]
async fn unrecognized_command_is_reported_not_fatal() {
    let (_radio, central) = start();
    let dispatcher = Dispatcher::new(central);
    let (tx, mut rx) = mpsc::unbounded_channel();

    dispatcher.execute(request(4, "selfDestruct", json!([])), tx.clone()).await;
    let response = rx.recv().await.unwrap();
    assert_eq!(response.id, 4);
    assert!(!response.ok);
    assert_eq!(response.code.as_deref(), Some("unrecognized_command"));

    // Still serving afterwards
    dispatcher.execute(request(5, actions::ENABLE, json!([])), tx).await;
    assert_eq!(rx.recv().await.unwrap(), Response::done().with_id(5));
}

#[tokio::test(start_paused = true)]
async fn bad_arguments_are_rejected_before_reaching_the_radio() {
    let (radio, central) = start();
    let dispatcher = Dispatcher::new(central);
    let (tx, mut rx) = mpsc::unbounded_channel();

    dispatcher
        .execute(request(1, actions::WRITE, json!([ADDR_A, "not-a-uuid", "2a39", [1]])), tx)
        .await;
    let response = rx.recv().await.unwrap();
    assert_eq!(response.code.as_deref(), Some("invalid_arguments"));
    assert!(radio.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn connect_returns_catalogue_json() {
    let (radio, central) = start();
    let dispatcher = Dispatcher::new(central);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let task = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.execute(request(9, actions::CONNECT, json!([ADDR_A])), tx).await }
    });
    radio.wait_for(|c| matches!(c, Call::Connect(_))).await;
    radio.link(ADDR_A, LinkState::Connected);
    radio.wait_for(|c| matches!(c, Call::DiscoverServices(_))).await;
    radio.services_discovered(ADDR_A, heart_rate());
    task.await.unwrap();

    let response = rx.recv().await.unwrap();
    assert!(response.ok && !response.keep);
    let data = response.data.unwrap();
    assert_eq!(data["id"], ADDR_A);
    assert_eq!(data["services"], json!(["180d"]));
    assert_eq!(data["characteristics"][0]["properties"], json!(["Notify"]));
}

#[tokio::test(start_paused = true)]
async fn notifications_are_standing_responses() {
    let (radio, central) = start();
    connect_ready(&radio, &central, ADDR_A, heart_rate()).await;
    let dispatcher = Dispatcher::new(central);
    let (tx, mut rx) = mpsc::unbounded_channel();

    tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move {
            dispatcher
                .execute(request(2, actions::START_NOTIFICATION, json!([ADDR_A, "180d", "2a37"])), tx)
                .await
        }
    });
    radio.wait_for(|c| matches!(c, Call::NotifyEnable { .. })).await;
    radio.emit(RadioEvent::DescriptorWriteComplete {
        address: DeviceAddress::new(ADDR_A),
        handle: 0x10,
        descriptor: from_u16(0x2902),
        status: 0,
    });

    let ack = rx.recv().await.unwrap();
    assert!(ack.ok && ack.keep && ack.data.is_none());

    radio.emit(RadioEvent::CharacteristicChanged {
        address: DeviceAddress::new(ADDR_A),
        handle: 0x10,
        value: vec![1, 2, 3],
    });
    let delivery = rx.recv().await.unwrap();
    assert!(delivery.keep);
    assert_eq!(delivery.data.unwrap()["data"], "AQID");

    // Link drop ends the stream with a final response
    radio.link(ADDR_A, LinkState::Disconnected);
    let last = rx.recv().await.unwrap();
    assert_eq!(last, Response::done().with_id(2));
}

#[tokio::test(start_paused = true)]
async fn peripheral_info_reports_state() {
    let (radio, central) = start();
    let dispatcher = Dispatcher::new(central.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();

    dispatcher.execute(request(1, actions::PERIPHERAL_INFO, json!([ADDR_A])), tx.clone()).await;
    assert_eq!(rx.recv().await.unwrap().data, Some(serde_json::Value::Null));

    connect_ready(&radio, &central, ADDR_A, heart_rate()).await;
    dispatcher.execute(request(2, actions::PERIPHERAL_INFO, json!([ADDR_A])), tx).await;
    let data = rx.recv().await.unwrap().data.unwrap();
    assert_eq!(data["id"], ADDR_A);
    assert_eq!(data["state"], "Ready");
    assert_eq!(data["reconnectAttempts"], 0);
}

#[tokio::test(start_paused = true)]
async fn bridge_finishes_every_request_when_input_closes() {
    let (radio, central) = start();
    connect_ready(&radio, &central, ADDR_A, heart_rate()).await;
    connect_ready(&radio, &central, ADDR_B, heart_rate()).await;

    let (mut host, bridge_side) = tokio::io::duplex(4096);
    let served = tokio::spawn({
        let central = central.clone();
        async move { serve(central, BufReader::new(bridge_side), Vec::new(), Duration::from_secs(30)).await }
    });

    host.write_all(&line(&request(1, actions::START_SCAN, json!([])))).await.unwrap();
    host.write_all(&line(&request(2, actions::START_NOTIFICATION, json!([ADDR_A, "180d", "2a37"]))))
        .await
        .unwrap();
    radio.wait_for(|c| matches!(c, Call::ScanStart(_))).await;
    radio.wait_for(|c| matches!(c, Call::NotifyEnable { .. })).await;
    radio.emit(RadioEvent::DescriptorWriteComplete {
        address: DeviceAddress::new(ADDR_A),
        handle: 0x10,
        descriptor: from_u16(0x2902),
        status: 0,
    });

    host.write_all(&line(&request(3, actions::WRITE, json!([ADDR_B, "180d", "2a39", [1]]))))
        .await
        .unwrap();
    radio.wait_for(|c| matches!(c, Call::Write { .. })).await;

    // Input ends while the write is still waiting on the radio
    drop(host);
    tokio::task::yield_now().await;
    radio.emit(RadioEvent::WriteComplete { address: DeviceAddress::new(ADDR_B), handle: 0x20, status: 0 });

    let responses = parse_output(served.await.unwrap().unwrap());
    for id in 1..=3 {
        let last = finals(&responses, id);
        assert_eq!(last.len(), 1, "request {id}");
        assert_eq!(*last[0], Response::done().with_id(id));
    }
    assert!(radio.count(|c| *c == Call::ScanStop) >= 1);
}

#[tokio::test(start_paused = true)]
async fn bridge_gives_up_on_requests_past_the_drain_timeout() {
    let (radio, central) = start();
    connect_ready(&radio, &central, ADDR_A, heart_rate()).await;

    let input = [
        line(&request(1, actions::WRITE, json!([ADDR_A, "180d", "2a39", [1]]))),
        line(&request(2, actions::PERIPHERAL_INFO, json!([ADDR_A]))),
    ]
    .concat();
    let started = tokio::time::Instant::now();
    let output = serve(central, input.as_slice(), Vec::new(), Duration::from_secs(5)).await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(radio.count(|c| matches!(c, Call::Write { .. })), 1);
    let responses = parse_output(output);
    assert!(finals(&responses, 1).is_empty());
    assert_eq!(finals(&responses, 2).len(), 1);
}
