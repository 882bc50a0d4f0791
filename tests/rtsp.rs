use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use livebridge::{HandleId, Plugin};

mod common;
use common::*;

struct RtspClient {
    stream: TcpStream,
    cseq: u32,
    base: String,
}

impl RtspClient {
    async fn connect(addr: std::net::SocketAddr, path: &str) -> Self {
        RtspClient {
            stream: TcpStream::connect(addr).await.unwrap(),
            cseq: 0,
            base: format!("rtsp://127.0.0.1:{}{}", addr.port(), path),
        }
    }

    async fn request(&mut self, method: &str, control: &str, extra: &str) -> String {
        self.cseq += 1;
        let request = format!(
            "{} {}{} RTSP/1.0\r\nCSeq: {}\r\n{}\r\n",
            method, self.base, control, self.cseq, extra
        );
        self.stream.write_all(request.as_bytes()).await.unwrap();
        let mut buf = vec![0u8; 8192];
        let n = self.stream.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).to_string()
    }

    /// Reads whatever the server pushes next (e.g. its TEARDOWN).
    async fn read_server_message(&mut self) -> Vec<u8> {
        let mut buf = vec![0u8; 8192];
        let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut buf))
            .await
            .expect("no server message within 5s")
            .unwrap();
        buf[..n].to_vec()
    }
}

fn header_value<'a>(reply: &'a str, name: &str) -> Option<&'a str> {
    reply
        .lines()
        .find(|line| line.to_ascii_lowercase().starts_with(&name.to_ascii_lowercase()))
        .and_then(|line| line.split_once(':'))
        .map(|(_, value)| value.trim())
}

async fn publish_cam(plugin: &Plugin, host: &CollectingHost, handle: HandleId, id: &str) {
    plugin.create_session(handle).unwrap();
    plugin.handle_message(
        handle,
        "t1",
        Some(&format!(r#"{{"id":"{}"}}"#, id)),
        Some(&offer_jsep(OFFER_VP8)),
    );
    let (_, _, event, _) = host.wait_event().await;
    assert_eq!(event["result"], "ok");
}

#[tokio::test]
async fn test_clean_teardown_sends_teardown_to_client() {
    let registry = stub_registry().await;
    let host = CollectingHost::new();
    let plugin = Plugin::init(test_config(&registry, 25200, Some("VP8")), host.clone()).unwrap();
    let handle = HandleId(20);
    publish_cam(&plugin, &host, handle, "cam1").await;
    assert_eq!(plugin.ports_in_use(), 10);

    let rtp_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let rtcp_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut client = RtspClient::connect(plugin.rtsp_addr(), "/cam1").await;
    let reply = client.request("OPTIONS", "", "").await;
    assert!(reply.starts_with("RTSP/1.0 200"));
    assert!(header_value(&reply, "Public").unwrap().contains("TEARDOWN"));

    let reply = client.request("DESCRIBE", "", "Accept: application/sdp\r\n").await;
    assert!(reply.contains("a=rtcp-fb:96 nack pli"));
    assert!(reply.contains("a=control:streamid=0"));

    let transport = format!(
        "Transport: RTP/AVP;unicast;client_port={}-{}\r\n",
        rtp_sock.local_addr().unwrap().port(),
        rtcp_sock.local_addr().unwrap().port()
    );
    let reply = client.request("SETUP", "/streamid=0", &transport).await;
    assert!(reply.starts_with("RTSP/1.0 200"));
    let session = header_value(&reply, "Session")
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();
    assert!(header_value(&reply, "Transport").unwrap().contains("server_port="));

    let reply = client
        .request("PLAY", "", &format!("Session: {}\r\n", session))
        .await;
    assert!(reply.starts_with("RTSP/1.0 200"));

    // Destroying the session must TEARDOWN the subscribed client, drop the
    // mountpoint, return all ten ports and delete the registry record.
    plugin.destroy_session(handle).unwrap();

    let pushed = client.read_server_message().await;
    let (message, _) = rtsp_types::Message::<Vec<u8>>::parse(&pushed).unwrap();
    match message {
        rtsp_types::Message::Request(request) => {
            assert_eq!(request.method(), rtsp_types::Method::Teardown);
            let uri = request.request_uri().unwrap().to_string();
            assert!(uri.ends_with("/cam1"));
        }
        other => panic!("expected TEARDOWN, got {:?}", other),
    }

    for _ in 0..200 {
        if plugin.ports_in_use() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(plugin.ports_in_use(), 0);
    assert!(registry
        .state
        .deletes
        .lock()
        .unwrap()
        .contains(&"r1".to_string()));

    plugin.destroy().await;
}

#[tokio::test]
async fn test_media_fans_out_with_repackaged_payload_type() {
    let registry = stub_registry().await;
    let host = CollectingHost::new();
    let plugin = Plugin::init(test_config(&registry, 25300, Some("VP8")), host.clone()).unwrap();
    let handle = HandleId(21);
    publish_cam(&plugin, &host, handle, "cam2").await;

    let rtp_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let rtcp_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut client = RtspClient::connect(plugin.rtsp_addr(), "/cam2").await;
    let transport = format!(
        "Transport: RTP/AVP;unicast;client_port={}-{}\r\n",
        rtp_sock.local_addr().unwrap().port(),
        rtcp_sock.local_addr().unwrap().port()
    );
    let reply = client.request("SETUP", "/streamid=0", &transport).await;
    assert!(reply.starts_with("RTSP/1.0 200"));
    let session = header_value(&reply, "Session")
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();
    let server_ports = header_value(&reply, "Transport")
        .unwrap()
        .split("server_port=")
        .nth(1)
        .unwrap()
        .to_string();
    let server_rtcp_port: u16 = server_ports
        .split('-')
        .nth(1)
        .unwrap()
        .trim()
        .parse()
        .unwrap();

    client
        .request("PLAY", "", &format!("Session: {}\r\n", session))
        .await;

    // Gateway relays VP8 on PT 100; the subscriber must see PT 96 with the
    // SSRC preserved.
    let pump = tokio::spawn(async move {
        let mut buf = vec![0u8; 1600];
        let n = tokio::time::timeout(Duration::from_secs(5), rtp_sock.recv(&mut buf))
            .await
            .expect("no rtp fanned out within 5s")
            .unwrap();
        buf[..n].to_vec()
    });
    for seq in 0..50u16 {
        plugin.incoming_rtp(handle, true, &rtp_packet(100, 0xcafebabe, seq));
        tokio::time::sleep(Duration::from_millis(20)).await;
        if pump.is_finished() {
            break;
        }
    }
    let received = pump.await.unwrap();
    assert_eq!(received[1] & 0x7f, 96);
    assert_eq!(&received[8..12], &0xcafebabe_u32.to_be_bytes());

    // The client's receiver reports land back on the gateway relay.
    rtcp_sock
        .send_to(b"\x81\xc9\x00\x01fakefake", ("127.0.0.1", server_rtcp_port))
        .await
        .unwrap();
    let (video, rtcp) = host.wait_rtcp().await;
    assert!(video);
    assert_eq!(&rtcp[..2], b"\x81\xc9");

    plugin.destroy().await;
}

#[tokio::test]
async fn test_pause_releases_the_subscription() {
    let registry = stub_registry().await;
    let host = CollectingHost::new();
    let plugin = Plugin::init(test_config(&registry, 25400, Some("VP8")), host.clone()).unwrap();
    let handle = HandleId(22);
    publish_cam(&plugin, &host, handle, "cam3").await;

    let rtp_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let rtcp_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut client = RtspClient::connect(plugin.rtsp_addr(), "/cam3").await;
    let transport = format!(
        "Transport: RTP/AVP;unicast;client_port={}-{}\r\n",
        rtp_sock.local_addr().unwrap().port(),
        rtcp_sock.local_addr().unwrap().port()
    );
    let reply = client.request("SETUP", "/streamid=0", &transport).await;
    let session = header_value(&reply, "Session")
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();

    client
        .request("PLAY", "", &format!("Session: {}\r\n", session))
        .await;
    let reply = client
        .request("PAUSE", "", &format!("Session: {}\r\n", session))
        .await;
    assert!(reply.starts_with("RTSP/1.0 200"));

    // A paused client gets no media.
    for seq in 0..5u16 {
        plugin.incoming_rtp(handle, true, &rtp_packet(100, 0xabad1dea, seq));
    }
    let mut buf = vec![0u8; 1600];
    let outcome =
        tokio::time::timeout(Duration::from_millis(500), rtp_sock.recv(&mut buf)).await;
    assert!(outcome.is_err(), "paused client still received rtp");

    // TEARDOWN after PAUSE is still answered.
    let reply = client
        .request("TEARDOWN", "", &format!("Session: {}\r\n", session))
        .await;
    assert!(reply.starts_with("RTSP/1.0 200"));

    plugin.destroy().await;
}

#[tokio::test]
async fn test_unsupported_transport_is_rejected() {
    let registry = stub_registry().await;
    let host = CollectingHost::new();
    let plugin = Plugin::init(test_config(&registry, 25500, Some("VP8")), host.clone()).unwrap();
    let handle = HandleId(23);
    publish_cam(&plugin, &host, handle, "cam4").await;

    let mut client = RtspClient::connect(plugin.rtsp_addr(), "/cam4").await;
    let reply = client
        .request(
            "SETUP",
            "/streamid=0",
            "Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n",
        )
        .await;
    assert!(reply.starts_with("RTSP/1.0 461"));

    plugin.destroy().await;
}
