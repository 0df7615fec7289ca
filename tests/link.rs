mod common;

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::*;
use futures_util::future::join_all;
use mcu_bridge::device::{Device, LinkState};
use mcu_bridge::serial::{PinCommand, PortOpener, SerialError, SerialTransport};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream,
    ReadBuf,
};

fn command(number: i64) -> PinCommand {
    PinCommand {
        active: 1,
        number,
        is_output: 1,
        current: 10,
        target: 200,
        velocity: 3,
        ..Default::default()
    }
}

#[tokio::test]
async fn send_resolves_with_reply() {
    let (link, device) = attached_link("/dev/ttyUSB0").await;
    let device = spawn_echo_device(device, Duration::ZERO);

    let status = link.send(&command(7)).await.expect("echo device replies");
    assert_eq!(status.command(), command(7));
    assert_eq!(status.device, "/dev/ttyUSB0");
    assert!(!status.is_degraded());
    assert_eq!(link.state(), LinkState::Connected);

    link.close().await;
    assert_eq!(link.state(), LinkState::Unconnected);
    let seen = device.await.unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["number"], 7);
}

#[tokio::test]
async fn reply_split_across_reads_is_reassembled() {
    let (link, device) = attached_link("/dev/ttyACM0").await;
    let device = tokio::spawn(async move {
        let (reader, mut writer) = tokio::io::split(device);
        let mut lines = BufReader::new(reader).lines();
        let _ = lines.next_line().await.unwrap().unwrap();
        writer
            .write_all(br#"{"number":4,"active":1,"current":"#)
            .await
            .unwrap();
        writer.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        writer.write_all(b"99,\"target\":12,\"velocity\":2}\n").await.unwrap();
        // Keep the stream open until the host hangs up.
        let _ = lines.next_line().await;
    });

    let status = link.send(&command(4)).await.expect("assembled frame");
    assert_eq!(status.number, 4);
    assert_eq!(status.current, 99);
    assert_eq!(status.target, 12);
    assert_eq!(status.velocity, 2);
    assert!(status.error.is_none());

    link.close().await;
    device.await.unwrap();
}

#[tokio::test]
async fn silent_device_times_out_and_faults() {
    let (link, device) = attached_link("/dev/ttyUSB1").await;
    let device = spawn_silent_device(device);

    let started = Instant::now();
    let err = link.send(&command(1)).await.unwrap_err();
    assert!(matches!(err, SerialError::Timeout), "unexpected error: {err}");
    assert!(started.elapsed() >= TEST_TIMEOUT);
    assert_eq!(link.state(), LinkState::Faulted);

    // Port released: the device sees the stream end.
    let seen = tokio::time::timeout(Duration::from_secs(1), device).await.unwrap().unwrap();
    assert_eq!(seen.len(), 1);

    let err = link.send(&command(2)).await.unwrap_err();
    assert!(matches!(err, SerialError::NotConnected));

    link.close().await;
    assert_eq!(link.state(), LinkState::Unconnected);
}

#[tokio::test]
async fn unterminated_stream_is_a_framing_error() {
    let (link, device) = attached_link("/dev/ttyUSB2").await;
    let device = tokio::spawn(async move {
        let (reader, mut writer) = tokio::io::split(device);
        let mut lines = BufReader::new(reader).lines();
        let _ = lines.next_line().await.unwrap().unwrap();
        // 17 reads of 16 bytes without a terminator exceed the limit.
        writer.write_all(&[b'x'; 400]).await.unwrap();
        let _ = lines.next_line().await;
    });

    let err = link.send(&command(3)).await.unwrap_err();
    assert!(matches!(err, SerialError::Framing(_)), "unexpected error: {err}");
    assert_eq!(link.state(), LinkState::Faulted);

    link.close().await;
    device.await.unwrap();
}

#[tokio::test]
async fn abandoned_exchange_faults_instead_of_misrouting_the_late_reply() {
    let (link, device) = attached_link("/dev/ttyUSB8").await;
    let device = spawn_echo_device(device, Duration::from_millis(100));

    let abandoned = tokio::time::timeout(Duration::from_millis(20), link.send(&command(1))).await;
    assert!(abandoned.is_err(), "caller gave up before the reply");
    assert_eq!(link.state(), LinkState::Faulted);

    // The reply to pin 1 must never be handed to the next command.
    let err = link.send(&command(2)).await.unwrap_err();
    assert!(matches!(err, SerialError::NotConnected), "unexpected error: {err}");

    let seen = tokio::time::timeout(Duration::from_secs(1), device)
        .await
        .expect("port released after the abandoned exchange")
        .unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["number"], 1);

    link.close().await;
    assert_eq!(link.state(), LinkState::Unconnected);
}

#[tokio::test]
async fn reader_fault_releases_the_port_without_a_caller() {
    let (link, mut device) = attached_link("/dev/ttyUSB9").await;
    let mut states = link.subscribe();

    device.write_all(&[b'x'; 400]).await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), states.wait_for(|s| *s == LinkState::Faulted))
        .await
        .expect("stalled frame should fault the link")
        .unwrap();

    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(TEST_TIMEOUT, device.read(&mut buf))
        .await
        .expect("device end sees the port close")
        .unwrap();
    assert_eq!(read, 0);

    link.close().await;
    assert_eq!(link.state(), LinkState::Unconnected);
}

#[tokio::test]
async fn malformed_reply_degrades_status_but_keeps_link() {
    let (link, device) = attached_link("/dev/ttyACM1").await;
    let device = tokio::spawn(async move {
        let (reader, mut writer) = tokio::io::split(device);
        let mut lines = BufReader::new(reader).lines();
        let _ = lines.next_line().await.unwrap().unwrap();
        writer.write_all(b"PIN?? garbage\r\n").await.unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        writer.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
        let _ = lines.next_line().await;
    });

    let degraded = link.send(&command(8)).await.expect("degraded status, not an error");
    assert!(degraded.is_degraded());
    assert_eq!(degraded.device, "/dev/ttyACM1");
    assert_eq!(link.state(), LinkState::Connected);

    let status = link.send(&command(9)).await.unwrap();
    assert_eq!(status.number, 9);
    assert!(!status.is_degraded());

    link.close().await;
    device.await.unwrap();
}

#[tokio::test]
async fn unsolicited_frames_are_dropped() {
    let (link, device) = attached_link("/dev/ttyUSB3").await;
    let device = tokio::spawn(async move {
        let (reader, mut writer) = tokio::io::split(device);
        writer.write_all(b"{\"number\":99,\"current\":1}\n").await.unwrap();
        let mut lines = BufReader::new(reader).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        writer.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
        let _ = lines.next_line().await;
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let status = link.send(&command(5)).await.unwrap();
    assert_eq!(status.number, 5);

    link.close().await;
    device.await.unwrap();
}

#[tokio::test]
async fn out_of_range_command_is_rejected_before_the_wire() {
    let (link, device) = attached_link("/dev/ttyUSB4").await;
    let device = spawn_silent_device(device);

    let bad = PinCommand { velocity: 0, ..command(1) };
    let err = link.send(&bad).await.unwrap_err();
    assert!(matches!(err, SerialError::Encode(_)));
    assert_eq!(link.state(), LinkState::Connected);

    link.close().await;
    assert!(device.await.unwrap().is_empty());
}

#[tokio::test]
async fn device_hangup_faults_the_link() {
    let (link, device) = attached_link("/dev/ttyACM2").await;
    let mut states = link.subscribe();
    drop(device);

    tokio::time::timeout(Duration::from_secs(1), states.wait_for(|s| *s == LinkState::Faulted))
        .await
        .expect("link should notice the hangup")
        .unwrap();

    link.close().await;
    assert_eq!(link.state(), LinkState::Unconnected);

    // A closed link can be attached again.
    let (host, device) = tokio::io::duplex(1024);
    link.attach(host).await.unwrap();
    let device = spawn_echo_device(device, Duration::ZERO);
    assert_eq!(link.send(&command(2)).await.unwrap().number, 2);
    link.close().await;
    device.await.unwrap();
}

#[tokio::test]
async fn attach_twice_is_an_invalid_state() {
    let (link, _device) = attached_link("/dev/ttyUSB5").await;
    let (host, _other) = tokio::io::duplex(64);
    let err = link.attach(host).await.unwrap_err();
    assert!(matches!(err, SerialError::InvalidState(_)));
    assert_eq!(link.state(), LinkState::Connected);
}

#[tokio::test]
async fn close_interrupts_in_flight_exchange() {
    let (link, device) = attached_link("/dev/ttyUSB6").await;
    let _device = spawn_silent_device(device);

    let sender = {
        let link = link.clone();
        tokio::spawn(async move { link.send(&command(1)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    link.close().await;
    assert!(started.elapsed() < TEST_TIMEOUT);
    assert_eq!(link.state(), LinkState::Unconnected);

    let err = sender.await.unwrap().unwrap_err();
    assert!(matches!(err, SerialError::Closed), "unexpected error: {err}");
}

struct FailingOpener;

#[async_trait]
impl PortOpener for FailingOpener {
    async fn open(&self, device: &Device) -> mcu_bridge::serial::Result<Box<dyn SerialTransport>> {
        Err(SerialError::ConnectionFailed(format!("{} is busy", device.port_name)))
    }
}

#[tokio::test]
async fn failed_open_returns_to_unconnected() {
    let link = test_link("/dev/ttyUSB7");
    let err = link.connect(&FailingOpener).await.unwrap_err();
    assert!(matches!(err, SerialError::ConnectionFailed(_)));
    assert_eq!(link.state(), LinkState::Unconnected);
}

#[test]
fn port_enumeration_errors_are_not_link_faults() {
    let err = SerialError::from(serialport::Error::new(
        serialport::ErrorKind::NoDevice,
        "no such port",
    ));
    assert!(matches!(err, SerialError::SerialportError(_)));
    assert!(!err.is_link_fault());
    assert!(SerialError::Timeout.is_link_fault());
}

/// Flags any write that starts while the previous frame is still unanswered.
struct WireProbe {
    inner: DuplexStream,
    awaiting_reply: Arc<AtomicBool>,
    overlaps: Arc<AtomicUsize>,
}

impl AsyncRead for WireProbe {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for WireProbe {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.awaiting_reply.load(Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let polled = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &polled {
            if buf[..*n].contains(&b'\n') {
                self.awaiting_reply.store(true, Ordering::SeqCst);
            }
        }
        polled
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[tokio::test]
async fn concurrent_sends_never_overlap_on_the_wire() {
    let (host, device) = tokio::io::duplex(4096);
    let awaiting_reply = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let probe = WireProbe {
        inner: host,
        awaiting_reply: awaiting_reply.clone(),
        overlaps: overlaps.clone(),
    };

    let link = test_link("/dev/ttyACM3");
    link.attach(probe).await.unwrap();

    let device = {
        let awaiting_reply = awaiting_reply.clone();
        tokio::spawn(async move {
            let (reader, mut writer) = tokio::io::split(device);
            let mut lines = BufReader::new(reader).lines();
            let mut received = 0;
            while let Ok(Some(line)) = lines.next_line().await {
                received += 1;
                tokio::time::sleep(Duration::from_millis(5)).await;
                awaiting_reply.store(false, Ordering::SeqCst);
                if writer.write_all(format!("{}\n", line).as_bytes()).await.is_err() {
                    break;
                }
            }
            received
        })
    };

    let sends = (0..8).map(|n| {
        let link = link.clone();
        async move { (n, link.send(&command(n)).await) }
    });
    for (n, result) in join_all(sends).await {
        let status = result.expect("every exchange completes");
        assert_eq!(status.number, n, "reply must belong to its own command");
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    link.close().await;
    assert_eq!(device.await.unwrap(), 8);
}
