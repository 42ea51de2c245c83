//! End-to-end exercises against scripted loopback peers standing in for CoAP servers.

use std::time::Duration;

use coap_lite::{CoapOption, ContentFormat, MessageClass, MessageType, Packet, ResponseType};
use tokio::net::UdpSocket;

use coap_client::{
    ClientConfig, ClientError, CoapClient, CoapEndpoint, TransmissionParameters, UdpTransport,
};

async fn new_client() -> (CoapEndpoint, CoapClient) {
    let endpoint = CoapEndpoint::bind(UdpTransport::new("127.0.0.1:0"), ClientConfig::default())
        .await
        .unwrap();
    let client = CoapClient::new(&endpoint);
    (endpoint, client)
}

async fn recv_packet(socket: &UdpSocket) -> (Packet, std::net::SocketAddr) {
    let mut buf = [0u8; 1500];
    let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
    (Packet::from_bytes(&buf[..n]).unwrap(), peer)
}

async fn send_packet(socket: &UdpSocket, packet: &Packet, peer: std::net::SocketAddr) {
    socket
        .send_to(&packet.to_bytes().unwrap(), peer)
        .await
        .unwrap();
}

fn piggybacked_response(request: &Packet, payload: &[u8]) -> Packet {
    let mut response = Packet::new();
    response.header.set_type(MessageType::Acknowledgement);
    response.header.code = MessageClass::Response(ResponseType::Content);
    response.header.message_id = request.header.message_id;
    response.set_token(request.get_token().to_vec());
    response.payload = payload.to_vec();
    response
}

#[tokio::test]
async fn test_piggybacked_get() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_port = server.local_addr().unwrap().port();
    let (endpoint, client) = new_client().await;

    let server_task = tokio::spawn(async move {
        let (request, peer) = recv_packet(&server).await;
        assert!(matches!(
            request.header.code,
            MessageClass::Request(coap_lite::RequestType::Get)
        ));
        let paths: Vec<_> = request
            .get_option(CoapOption::UriPath)
            .unwrap()
            .iter()
            .cloned()
            .collect();
        assert_eq!(paths, vec![b"r".to_vec()]);
        send_packet(&server, &piggybacked_response(&request, b"hello"), peer).await;
    });

    let response = client
        .get(&format!("coap://127.0.0.1:{server_port}/r"))
        .await
        .unwrap();
    assert!(matches!(
        response.header.code,
        MessageClass::Response(ResponseType::Content)
    ));
    assert_eq!(response.payload, b"hello".to_vec());

    server_task.await.unwrap();
    endpoint.shutdown();
}

#[tokio::test]
async fn test_separate_response_gets_acked() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_port = server.local_addr().unwrap().port();
    let (endpoint, client) = new_client().await;

    let server_task = tokio::spawn(async move {
        let (request, peer) = recv_packet(&server).await;

        let mut empty_ack = Packet::new();
        empty_ack.header.set_type(MessageType::Acknowledgement);
        empty_ack.header.code = MessageClass::Empty;
        empty_ack.header.message_id = request.header.message_id;
        send_packet(&server, &empty_ack, peer).await;

        let mut response = Packet::new();
        response.header.set_type(MessageType::Confirmable);
        response.header.code = MessageClass::Response(ResponseType::Content);
        response.header.message_id = 0x4321;
        response.set_token(request.get_token().to_vec());
        response.payload = b"later".to_vec();
        send_packet(&server, &response, peer).await;

        // The client must acknowledge our confirmable response.
        let (client_ack, _) = recv_packet(&server).await;
        assert_eq!(client_ack.header.get_type(), MessageType::Acknowledgement);
        assert_eq!(client_ack.header.message_id, 0x4321);
        assert!(matches!(client_ack.header.code, MessageClass::Empty));
    });

    let response = client
        .get(&format!("coap://127.0.0.1:{server_port}/r"))
        .await
        .unwrap();
    assert_eq!(response.payload, b"later".to_vec());

    server_task.await.unwrap();
    endpoint.shutdown();
}

#[tokio::test]
async fn test_ping_pong() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_port = server.local_addr().unwrap().port();
    let (endpoint, client) = new_client().await;

    let server_task = tokio::spawn(async move {
        let (ping, peer) = recv_packet(&server).await;
        assert_eq!(ping.header.get_type(), MessageType::Confirmable);
        assert!(matches!(ping.header.code, MessageClass::Empty));

        let mut pong = Packet::new();
        pong.header.set_type(MessageType::Reset);
        pong.header.code = MessageClass::Empty;
        pong.header.message_id = ping.header.message_id;
        send_packet(&server, &pong, peer).await;
    });

    assert!(client.ping(&format!("coap://127.0.0.1:{server_port}")).await);
    server_task.await.unwrap();
    endpoint.shutdown();
}

#[tokio::test]
async fn test_timeout_against_black_hole() {
    // A bound socket that never answers.
    let black_hole = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_port = black_hole.local_addr().unwrap().port();

    let config = ClientConfig {
        transmission: TransmissionParameters::new(Duration::from_millis(50), 1.0, 1).unwrap(),
        ..ClientConfig::default()
    };
    let endpoint = CoapEndpoint::bind(UdpTransport::new("127.0.0.1:0"), config)
        .await
        .unwrap();
    let client = CoapClient::new(&endpoint);

    let result = client
        .get(&format!("coap://127.0.0.1:{server_port}/nothing"))
        .await;
    assert!(matches!(result, Err(ClientError::TimedOut)));
    endpoint.shutdown();
}

#[tokio::test]
async fn test_discover_parses_link_format() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_port = server.local_addr().unwrap().port();
    let (endpoint, client) = new_client().await;

    let server_task = tokio::spawn(async move {
        let (request, peer) = recv_packet(&server).await;
        let paths: Vec<_> = request
            .get_option(CoapOption::UriPath)
            .unwrap()
            .iter()
            .cloned()
            .collect();
        assert_eq!(paths, vec![b".well-known".to_vec(), b"core".to_vec()]);

        let mut response = piggybacked_response(&request, br#"</sensors/temp>;rt="t";obs,</config>"#);
        response.set_content_format(ContentFormat::ApplicationLinkFormat);
        send_packet(&server, &response, peer).await;
    });

    let links = client
        .discover(&format!("coap://127.0.0.1:{server_port}"), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(links.len(), 2);
    assert_eq!(links[0].uri, "/sensors/temp");
    assert_eq!(links[0].attribute("rt"), Some("t"));
    assert_eq!(links[1].uri, "/config");

    server_task.await.unwrap();
    endpoint.shutdown();
}

#[tokio::test]
async fn test_observe_notifications_and_cancel() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_port = server.local_addr().unwrap().port();
    let (endpoint, client) = new_client().await;

    let server_task = tokio::spawn(async move {
        let (request, peer) = recv_packet(&server).await;
        assert_eq!(request.get_observe_value().unwrap().unwrap(), 0);
        let token = request.get_token().to_vec();

        let mut registration = piggybacked_response(&request, b"state-0");
        registration.set_observe_value(5);
        send_packet(&server, &registration, peer).await;

        for (sequence, payload) in [(6u32, &b"state-1"[..]), (7, &b"state-2"[..])] {
            let mut notification = Packet::new();
            notification.header.set_type(MessageType::NonConfirmable);
            notification.header.code = MessageClass::Response(ResponseType::Content);
            notification.header.message_id = 0x2000 + sequence as u16;
            notification.set_token(token.clone());
            notification.set_observe_value(sequence);
            notification.payload = payload.to_vec();
            send_packet(&server, &notification, peer).await;
        }

        // Deregistration: same token, Observe=1; acknowledge it.
        let (deregister, peer) = recv_packet(&server).await;
        assert_eq!(deregister.get_observe_value().unwrap().unwrap(), 1);
        assert_eq!(deregister.get_token().to_vec(), token);
        let mut ack = Packet::new();
        ack.header.set_type(MessageType::Acknowledgement);
        ack.header.code = MessageClass::Empty;
        ack.header.message_id = deregister.header.message_id;
        send_packet(&server, &ack, peer).await;
    });

    let mut relation = client
        .observe(&format!("coap://127.0.0.1:{server_port}/sensors/temp"), None)
        .await
        .unwrap();
    assert!(relation.registered());
    assert_eq!(relation.current().unwrap().payload, b"state-0".to_vec());

    let first = relation.next().await.unwrap().unwrap();
    assert_eq!(first.payload, b"state-1".to_vec());
    let second = relation.next().await.unwrap().unwrap();
    assert_eq!(second.payload, b"state-2".to_vec());

    relation.cancel().await.unwrap();
    server_task.await.unwrap();
    endpoint.shutdown();
}

#[tokio::test]
async fn test_non_confirmable_roundtrip() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_port = server.local_addr().unwrap().port();
    let (endpoint, client) = new_client().await;

    let server_task = tokio::spawn(async move {
        let (request, peer) = recv_packet(&server).await;
        assert_eq!(request.header.get_type(), MessageType::NonConfirmable);

        let mut response = Packet::new();
        response.header.set_type(MessageType::NonConfirmable);
        response.header.code = MessageClass::Response(ResponseType::Content);
        response.header.message_id = 0x0abc;
        response.set_token(request.get_token().to_vec());
        response.payload = b"non".to_vec();
        send_packet(&server, &response, peer).await;
    });

    let request = coap_client::RequestBuilder::get(&format!("coap://127.0.0.1:{server_port}/r"))
        .unwrap()
        .non_confirmable();
    let response = client.execute(request).await.unwrap();
    assert_eq!(response.payload, b"non".to_vec());

    server_task.await.unwrap();
    endpoint.shutdown();
}
