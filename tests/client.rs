// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! End-to-end tests driving the event loop over an in-memory transport.
//!
//! The test acts as the server side of the wire: it reads the frames the
//! client writes and answers with literal reply bytes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use qilin::{
    Client, ConnectOptions, Error, ErrorHandler, ErrorKind, EventLoop, LastWill, Message,
    PayloadReader, PublishHandler, QoS,
};

/// Connect packet written for default connect options.
const CONNECT_FRAME: &[u8] = &[
    0x10, 0x18, // fixed header, remaining length 24
    0x00, 0x04, b'M', b'Q', b'T', b'T', // protocol name
    0x04, // protocol level
    0x02, // connect flags, clean session
    0x01, 0x2c, // keep alive, 300 seconds
    0x00, 0x0a, // payload size
    0x00, 0x0a, b's', b'i', b'm', b'b', b'a', b'_', b'm', b'q', b't', b't',
];

const CONNACK_ACCEPTED: &[u8] = &[0x20, 0x02, 0x00, 0x00];

#[derive(Default)]
struct RecordingPublishHandler {
    messages: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl PublishHandler for RecordingPublishHandler {
    fn on_publish(
        &mut self,
        _client: &str,
        topic: &str,
        payload: &mut PayloadReader,
    ) -> Result<(), Error> {
        let bytes = payload.read_all();
        self.messages
            .lock()
            .unwrap()
            .push((topic.to_string(), bytes));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingErrorHandler {
    errors: Arc<Mutex<Vec<ErrorKind>>>,
}

impl ErrorHandler for RecordingErrorHandler {
    fn on_error(&mut self, _client: &str, error: &Error) {
        self.errors.lock().unwrap().push(error.kind());
    }
}

struct TestBed {
    client: Client,
    server: DuplexStream,
    messages: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    errors: Arc<Mutex<Vec<ErrorKind>>>,
}

fn start_client() -> TestBed {
    let _ = env_logger::builder().is_test(true).try_init();

    let (client_side, server_side) = tokio::io::duplex(4096);
    let (transport_in, transport_out) = tokio::io::split(client_side);

    let publish_handler = RecordingPublishHandler::default();
    let messages = Arc::clone(&publish_handler.messages);
    let error_handler = RecordingErrorHandler::default();
    let errors = Arc::clone(&error_handler.errors);

    let (client, mut event_loop) =
        EventLoop::new("test", transport_in, transport_out, Box::new(publish_handler));
    event_loop.set_on_error(Box::new(error_handler));
    tokio::spawn(event_loop.run());

    TestBed {
        client,
        server: server_side,
        messages,
        errors,
    }
}

async fn expect_frame(server: &mut DuplexStream, expected: &[u8]) {
    let mut buf = vec![0_u8; expected.len()];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, expected);
}

async fn connect(bed: &mut TestBed) {
    let client = bed.client.clone();
    let request = tokio::spawn(async move { client.connect(ConnectOptions::new()).await });

    expect_frame(&mut bed.server, CONNECT_FRAME).await;
    bed.server.write_all(CONNACK_ACCEPTED).await.unwrap();

    request.await.unwrap().unwrap();
}

async fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("Timed out waiting for condition");
}

#[tokio::test]
async fn test_connect_with_default_client_id() {
    let mut bed = start_client();
    connect(&mut bed).await;
}

#[tokio::test]
async fn test_connect_refused_by_server() {
    let mut bed = start_client();

    let client = bed.client.clone();
    let request = tokio::spawn(async move { client.connect(ConnectOptions::new()).await });

    expect_frame(&mut bed.server, CONNECT_FRAME).await;
    // Return code 0x05, not authorized.
    bed.server.write_all(&[0x20, 0x02, 0x00, 0x05]).await.unwrap();

    let err = request.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolError);

    // Still disconnected, a ping request is dropped by the loop.
    let err = bed.client.ping().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChannelError);
}

#[tokio::test]
async fn test_connect_with_will_and_credentials() {
    let mut bed = start_client();

    let mut options = ConnectOptions::new();
    options
        .set_client_id("id")
        .set_will(LastWill::new("w", b"gone", QoS::AtLeastOnce, false))
        .set_username("user")
        .set_password(b"pass");

    let client = bed.client.clone();
    let request = tokio::spawn(async move { client.connect(options).await });

    let expected: Vec<u8> = vec![
        0x10, 0x25, // fixed header, remaining length 37
        0x00, 0x04, b'M', b'Q', b'T', b'T', // protocol name
        0x04, // protocol level
        0b1100_1110, // username, password, will qos 1, will, clean session
        0x01, 0x2c, // keep alive
        0x00, 0x0f, // payload size
        0x00, 0x02, b'i', b'd', // client id
        0x00, 0x01, b'w', // will topic
        0x00, 0x04, b'g', b'o', b'n', b'e', // will message
        0x00, 0x04, b'u', b's', b'e', b'r', // username
        0x00, 0x04, b'p', b'a', b's', b's', // password
    ];
    expect_frame(&mut bed.server, &expected).await;
    bed.server.write_all(CONNACK_ACCEPTED).await.unwrap();

    request.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_connect_with_mismatched_will_fields() {
    let bed = start_client();

    let mut options = ConnectOptions::new();
    options.set_will(LastWill::new("w", b"", QoS::AtMostOnce, false));

    let err = bed.client.connect(options).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn test_publish_qos0() {
    let mut bed = start_client();
    connect(&mut bed).await;

    // A QoS 0 publish resolves without any server reply.
    bed.client
        .publish(Message::new("a/b", QoS::AtMostOnce, b"hi"))
        .await
        .unwrap();

    expect_frame(
        &mut bed.server,
        &[0x30, 0x07, 0x00, 0x03, b'a', b'/', b'b', b'h', b'i'],
    )
    .await;
}

#[tokio::test]
async fn test_publish_qos1_acknowledged() {
    let mut bed = start_client();
    connect(&mut bed).await;

    let client = bed.client.clone();
    let request =
        tokio::spawn(async move { client.publish(Message::new("a", QoS::AtLeastOnce, b"x")).await });

    expect_frame(
        &mut bed.server,
        &[0x32, 0x06, 0x00, 0x01, b'a', 0x00, 0x01, b'x'],
    )
    .await;
    bed.server.write_all(&[0x40, 0x02, 0x00, 0x01]).await.unwrap();

    request.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_publish_qos1_wrong_packet_id() {
    let mut bed = start_client();
    connect(&mut bed).await;

    let client = bed.client.clone();
    let request =
        tokio::spawn(async move { client.publish(Message::new("a", QoS::AtLeastOnce, b"x")).await });

    expect_frame(
        &mut bed.server,
        &[0x32, 0x06, 0x00, 0x01, b'a', 0x00, 0x01, b'x'],
    )
    .await;
    bed.server.write_all(&[0x40, 0x02, 0x00, 0x63]).await.unwrap();

    let err = request.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolError);
}

#[tokio::test]
async fn test_publish_qos2_is_rejected() {
    let mut bed = start_client();
    connect(&mut bed).await;

    let err = bed
        .client
        .publish(Message::new("a", QoS::ExactOnce, b"x"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn test_subscribe_granted() {
    let mut bed = start_client();
    connect(&mut bed).await;

    let client = bed.client.clone();
    let request = tokio::spawn(async move {
        client
            .subscribe(Message::new("t", QoS::AtLeastOnce, b""))
            .await
    });

    expect_frame(
        &mut bed.server,
        &[0x82, 0x06, 0x00, 0x01, 0x00, 0x01, b't', 0x01],
    )
    .await;
    bed.server
        .write_all(&[0x90, 0x03, 0x00, 0x01, 0x01])
        .await
        .unwrap();

    request.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_subscribe_failure_code() {
    let mut bed = start_client();
    connect(&mut bed).await;

    let client = bed.client.clone();
    let request = tokio::spawn(async move {
        client
            .subscribe(Message::new("t", QoS::AtLeastOnce, b""))
            .await
    });

    expect_frame(
        &mut bed.server,
        &[0x82, 0x06, 0x00, 0x01, 0x00, 0x01, b't', 0x01],
    )
    .await;
    bed.server
        .write_all(&[0x90, 0x03, 0x00, 0x01, 0x80])
        .await
        .unwrap();

    let err = request.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolError);
}

#[tokio::test]
async fn test_unsubscribe() {
    let mut bed = start_client();
    connect(&mut bed).await;

    let client = bed.client.clone();
    let request = tokio::spawn(async move {
        client
            .unsubscribe(Message::new("t", QoS::AtMostOnce, b""))
            .await
    });

    expect_frame(&mut bed.server, &[0xa2, 0x05, 0x00, 0x02, 0x00, 0x01, b't']).await;
    bed.server.write_all(&[0xb0, 0x02, 0x00, 0x02]).await.unwrap();

    request.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_ping_pong() {
    let mut bed = start_client();
    connect(&mut bed).await;

    let client = bed.client.clone();
    let request = tokio::spawn(async move { client.ping().await });

    expect_frame(&mut bed.server, &[0xc0, 0x00]).await;
    bed.server.write_all(&[0xd0, 0x00]).await.unwrap();

    request.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_disconnect() {
    let mut bed = start_client();
    connect(&mut bed).await;

    bed.client.disconnect().await.unwrap();
    expect_frame(&mut bed.server, &[0xe0, 0x00]).await;

    // Back to disconnected, publish requests are dropped by the loop.
    let err = bed
        .client
        .publish(Message::new("a", QoS::AtMostOnce, b"x"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChannelError);
}

#[tokio::test]
async fn test_incoming_publish_qos0() {
    let mut bed = start_client();
    connect(&mut bed).await;

    bed.server
        .write_all(&[0x30, 0x07, 0x00, 0x03, b'a', b'/', b'b', b'h', b'i'])
        .await
        .unwrap();

    let messages = Arc::clone(&bed.messages);
    wait_for(move || !messages.lock().unwrap().is_empty()).await;
    let recorded = bed.messages.lock().unwrap();
    assert_eq!(recorded[0], ("a/b".to_string(), b"hi".to_vec()));
}

#[tokio::test]
async fn test_incoming_publish_qos1_is_acknowledged() {
    let mut bed = start_client();
    connect(&mut bed).await;

    bed.server
        .write_all(&[
            0x32, 0x09, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x05, b'h', b'i',
        ])
        .await
        .unwrap();

    // The puback echoes the packet identifier of the publish.
    expect_frame(&mut bed.server, &[0x40, 0x02, 0x00, 0x05]).await;

    let messages = Arc::clone(&bed.messages);
    wait_for(move || !messages.lock().unwrap().is_empty()).await;
    let recorded = bed.messages.lock().unwrap();
    assert_eq!(recorded[0], ("a/b".to_string(), b"hi".to_vec()));
}

#[tokio::test]
async fn test_incoming_publish_qos2_gets_pubrec() {
    let mut bed = start_client();
    connect(&mut bed).await;

    bed.server
        .write_all(&[
            0x34, 0x09, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x07, b'h', b'i',
        ])
        .await
        .unwrap();

    expect_frame(&mut bed.server, &[0x50, 0x02, 0x00, 0x07]).await;
}

#[tokio::test]
async fn test_unhandled_pubrel_is_consumed() {
    let mut bed = start_client();
    connect(&mut bed).await;

    bed.server
        .write_all(&[
            0x34, 0x09, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x07, b'h', b'i',
        ])
        .await
        .unwrap();
    expect_frame(&mut bed.server, &[0x50, 0x02, 0x00, 0x07]).await;

    // The pubrel half of the QoS 2 flow is not implemented; the frame is
    // consumed and dropped.
    bed.server.write_all(&[0x62, 0x02, 0x00, 0x07]).await.unwrap();

    // The next frame still parses.
    let client = bed.client.clone();
    let request = tokio::spawn(async move { client.ping().await });
    expect_frame(&mut bed.server, &[0xc0, 0x00]).await;
    bed.server.write_all(&[0xd0, 0x00]).await.unwrap();
    request.await.unwrap().unwrap();

    assert!(bed.errors.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_remaining_length() {
    let mut bed = start_client();
    connect(&mut bed).await;

    // Four continuation bytes would require a fifth, the decoder abandons
    // the field right there, so no stray bytes are left on the wire.
    bed.server
        .write_all(&[0x20, 0xff, 0xff, 0xff, 0xff])
        .await
        .unwrap();

    let errors = Arc::clone(&bed.errors);
    wait_for(move || errors.lock().unwrap().contains(&ErrorKind::ProtocolError)).await;

    // The loop keeps serving requests.
    let client = bed.client.clone();
    let request = tokio::spawn(async move { client.ping().await });
    expect_frame(&mut bed.server, &[0xc0, 0x00]).await;
    bed.server.write_all(&[0xd0, 0x00]).await.unwrap();
    request.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unexpected_puback() {
    let mut bed = start_client();
    connect(&mut bed).await;

    // No request in flight.
    bed.server.write_all(&[0x40, 0x02, 0x00, 0x01]).await.unwrap();

    let errors = Arc::clone(&bed.errors);
    wait_for(move || errors.lock().unwrap().contains(&ErrorKind::ProtocolError)).await;

    // The loop keeps serving requests.
    let client = bed.client.clone();
    let request = tokio::spawn(async move { client.ping().await });
    expect_frame(&mut bed.server, &[0xc0, 0x00]).await;
    bed.server.write_all(&[0xd0, 0x00]).await.unwrap();
    request.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_incoming_topic_over_limit() {
    let mut bed = start_client();
    connect(&mut bed).await;

    // Topic of 200 bytes, over the default limit of 128.
    let mut frame = vec![0x30, 0xcc, 0x01, 0x00, 0xc8];
    frame.extend(std::iter::repeat(b'a').take(200));
    frame.extend_from_slice(b"hi");
    bed.server.write_all(&frame).await.unwrap();

    let errors = Arc::clone(&bed.errors);
    wait_for(move || errors.lock().unwrap().contains(&ErrorKind::MessageSize)).await;
    assert!(bed.messages.lock().unwrap().is_empty());

    // The whole frame was consumed, the wire is still in sync.
    let client = bed.client.clone();
    let request = tokio::spawn(async move { client.ping().await });
    expect_frame(&mut bed.server, &[0xc0, 0x00]).await;
    bed.server.write_all(&[0xd0, 0x00]).await.unwrap();
    request.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_request_while_another_in_flight() {
    let mut bed = start_client();
    connect(&mut bed).await;

    let client = bed.client.clone();
    let ping = tokio::spawn(async move { client.ping().await });
    expect_frame(&mut bed.server, &[0xc0, 0x00]).await;

    // The ping is still waiting for its response.
    let err = bed
        .client
        .subscribe(Message::new("t", QoS::AtMostOnce, b""))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolError);

    bed.server.write_all(&[0xd0, 0x00]).await.unwrap();
    ping.await.unwrap().unwrap();
}
