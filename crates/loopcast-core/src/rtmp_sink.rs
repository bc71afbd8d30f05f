//! RTMP Sink (C4): dials a publish session, sends the header once, then
//! sends packets as FLV tags. Makes no pacing decisions; every call sends
//! immediately. All timing lives upstream in the Pacing Engine.

use bytes::{BufMut, Bytes, BytesMut};
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ClientSession, ClientSessionConfig, ClientSessionEvent, ClientSessionResult,
    PublishRequestType, StreamMetadata,
};
use rml_rtmp::time::RtmpTimestamp;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use xflv::muxer::FlvMuxer;

use crate::error::{LoopcastError, LoopcastResult};
use crate::media_source::Packet;
use crate::state::{StreamDescriptor, StreamKind};

/// Object-safe packet sink, implemented by [`RtmpSink`] and by an in-memory
/// fake in the Pacing Engine's own test module, so the pace/publish loop
/// can be exercised against a recording fake instead of a real socket.
pub trait PacketSink: Send {
    fn write_packet(&mut self, stream_kind: StreamKind, packet: &Packet) -> LoopcastResult<()>;
}

struct StreamKey {
    app: String,
    key: String,
}

fn split_publish_url(url: &str) -> LoopcastResult<(String, StreamKey)> {
    let parsed = url::Url::parse(url)
        .map_err(|e| LoopcastError::ConnectFailed(format!("invalid RTMP URL: {e}")))?;
    let host_port = format!(
        "{}:{}",
        parsed
            .host_str()
            .ok_or_else(|| LoopcastError::ConnectFailed("RTMP URL missing host".to_string()))?,
        parsed.port_or_known_default().unwrap_or(1935)
    );
    let mut segments = parsed
        .path_segments()
        .ok_or_else(|| LoopcastError::ConnectFailed("RTMP URL missing path".to_string()))?;
    let key = segments
        .next_back()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| LoopcastError::ConnectFailed("RTMP URL missing stream key".to_string()))?
        .to_string();
    let app = segments
        .next_back()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| LoopcastError::ConnectFailed("RTMP URL missing app name".to_string()))?
        .to_string();
    Ok((host_port, StreamKey { app, key }))
}

/// Client-side RTMP publish sink. Handshakes on `dial`, then forwards
/// packets as FLV audio/video tags over a background socket I/O task.
pub struct RtmpSink {
    session: ClientSession,
    muxer: FlvMuxer,
    out_tx: UnboundedSender<ClientSessionResult>,
    in_rx: UnboundedReceiver<Vec<u8>>,
    stream_key: StreamKey,
    usable: bool,
}

impl RtmpSink {
    /// Establishes the publish session: TCP connect, RTMP handshake,
    /// `connect`/`releaseStream`/`publish` exchange. Fails with
    /// `connect-failed` on any networking error, `handshake-failed` on any
    /// RTMP-layer negotiation error.
    pub async fn dial(url: &str) -> LoopcastResult<Self> {
        let (addr, stream_key) = split_publish_url(url)?;

        let socket = TcpStream::connect(&addr)
            .await
            .map_err(|e| LoopcastError::ConnectFailed(e.to_string()))?;

        let mut hs = Handshake::new(PeerType::Client);
        let mut socket = socket;
        let p0_p1 = hs
            .generate_outbound_p0_and_p1()
            .map_err(|e| LoopcastError::HandshakeFailed(e.to_string()))?;
        socket
            .write_all(&p0_p1)
            .await
            .map_err(|e| LoopcastError::ConnectFailed(e.to_string()))?;

        let config = ClientSessionConfig::new();
        let (mut session, initial) = ClientSession::new(config)
            .map_err(|e| LoopcastError::HandshakeFailed(e.to_string()))?;

        let mut buf = [0u8; 4096];
        let (out_tx, in_rx) = loop {
            let n = socket
                .read(&mut buf)
                .await
                .map_err(|e| LoopcastError::ConnectFailed(e.to_string()))?;
            if n == 0 {
                return Err(LoopcastError::HandshakeFailed(
                    "connection closed during handshake".to_string(),
                ));
            }

            match hs
                .process_bytes(&buf[..n])
                .map_err(|e| LoopcastError::HandshakeFailed(e.to_string()))?
            {
                HandshakeProcessResult::InProgress { response_bytes } => {
                    socket
                        .write_all(&response_bytes)
                        .await
                        .map_err(|e| LoopcastError::ConnectFailed(e.to_string()))?;
                }
                HandshakeProcessResult::Completed {
                    response_bytes,
                    remaining_bytes,
                } => {
                    socket
                        .write_all(&response_bytes)
                        .await
                        .map_err(|e| LoopcastError::ConnectFailed(e.to_string()))?;

                    let drained = session
                        .handle_input(&remaining_bytes)
                        .map_err(|e| LoopcastError::HandshakeFailed(e.to_string()))?;

                    let (out_tx, in_rx) = spawn_socket_io(socket);
                    for pkt in initial.into_iter().chain(drained) {
                        out_tx
                            .send(pkt)
                            .map_err(|_| LoopcastError::ConnectFailed("socket task died".into()))?;
                    }
                    break (out_tx, in_rx);
                }
            }
        };

        let connect_request = session
            .request_connection(stream_key.app.clone())
            .map_err(|e| LoopcastError::HandshakeFailed(e.to_string()))?;
        out_tx
            .send(connect_request)
            .map_err(|_| LoopcastError::ConnectFailed("socket task died".into()))?;

        wait_for_event(&mut session, &out_tx, &mut in_rx, |event| {
            matches!(event, ClientSessionEvent::ConnectionRequestAccepted)
        })
        .await?;

        let publish_request = session
            .request_publishing(stream_key.key.clone(), PublishRequestType::Live)
            .map_err(|e| LoopcastError::HandshakeFailed(e.to_string()))?;
        out_tx
            .send(publish_request)
            .map_err(|_| LoopcastError::ConnectFailed("socket task died".into()))?;

        wait_for_event(&mut session, &out_tx, &mut in_rx, |event| {
            matches!(event, ClientSessionEvent::PublishRequestAccepted)
        })
        .await?;

        Ok(Self {
            session,
            muxer: FlvMuxer::new(),
            out_tx,
            in_rx,
            stream_key,
            usable: true,
        })
    }

    /// Sends the FLV header and `onMetaData`, describing the streams in the
    /// order returned by the media source. Must be called exactly once per
    /// dial, before any packet.
    pub fn write_header(&mut self, streams: &[StreamDescriptor]) -> LoopcastResult<()> {
        let has_video = streams.iter().any(|s| s.kind == StreamKind::Video);
        let has_audio = streams.iter().any(|s| s.kind == StreamKind::Audio);

        let mut metadata = StreamMetadata::new();
        for stream in streams {
            match stream.kind {
                StreamKind::Video => {
                    metadata.video_width = stream.width.map(|w| w as f64);
                    metadata.video_height = stream.height.map(|h| h as f64);
                    metadata.video_codec_id = Some(7.0); // AVC
                }
                StreamKind::Audio => {
                    metadata.audio_sample_rate = stream.sample_rate.map(|r| r as f64);
                    metadata.audio_channels = stream.channels.map(|c| c as f64);
                    metadata.audio_codec_id = Some(10.0); // AAC
                }
                StreamKind::Other => {}
            }
        }

        let metadata_packet = self
            .session
            .publish_metadata(&metadata)
            .map_err(|e| LoopcastError::HandshakeFailed(e.to_string()))?;
        self.send(metadata_packet)?;

        self.muxer
            .write_flv_header(has_audio, has_video)
            .map_err(|e| LoopcastError::HandshakeFailed(e.to_string()))?;
        self.muxer
            .write_previous_tag_size(0)
            .map_err(|e| LoopcastError::HandshakeFailed(e.to_string()))?;
        // Only resets the muxer's internal tag-size tracking; the actual
        // audio/video tags are built per-call in publish_video/publish_audio.
        self.muxer.writer.extract_current_bytes();

        Ok(())
    }

    /// Sends a single packet as an FLV audio or video tag. Fails with
    /// `write-failed`; the sink is unusable after this and must be
    /// re-dialed.
    pub fn write_packet(&mut self, stream_kind: StreamKind, packet: &Packet) -> LoopcastResult<()> {
        if !self.usable {
            return Err(LoopcastError::WriteFailed(
                "sink already failed a prior write".to_string(),
            ));
        }

        let result = match stream_kind {
            StreamKind::Video => self.publish_video(packet),
            StreamKind::Audio => self.publish_audio(packet),
            StreamKind::Other => Ok(()),
        };

        if result.is_err() {
            self.usable = false;
        }
        result
    }

    fn publish_video(&mut self, packet: &Packet) -> LoopcastResult<()> {
        let mut body = BytesMut::new();
        let frame_type: u8 = if packet.is_keyframe { 1 } else { 2 };
        body.put_u8((frame_type << 4) | 7); // CodecID 7 = AVC
        body.put_u8(1); // AVCPacketType: NALU
        body.put_u8(0);
        body.put_u8(0);
        body.put_u8(0);
        body.extend_from_slice(&packet.data);

        let pts = packet.timestamp.as_millis() as u32;
        let tag = self.write_flv_tag(9, pts, body.freeze())?;
        let send_result = self
            .session
            .publish_video_data(tag, RtmpTimestamp::new(pts), false);
        self.dispatch(send_result)?;
        Ok(())
    }

    fn publish_audio(&mut self, packet: &Packet) -> LoopcastResult<()> {
        let mut body = BytesMut::new();
        body.put_u8((10 << 4) | (3 << 2) | (1 << 1) | 1); // AAC, 44kHz, 16-bit, stereo
        body.put_u8(1); // AACPacketType: raw
        body.extend_from_slice(&packet.data);

        let pts = packet.timestamp.as_millis() as u32;
        let tag = self.write_flv_tag(8, pts, body.freeze())?;
        let send_result = self
            .session
            .publish_audio_data(tag, RtmpTimestamp::new(pts), false);
        self.dispatch(send_result)?;
        Ok(())
    }

    fn write_flv_tag(&mut self, tag_type: u8, timestamp: u32, body: Bytes) -> LoopcastResult<Bytes> {
        let len = body.len();
        self.muxer
            .write_flv_tag_header(tag_type, len as u32, timestamp)
            .map_err(|e| LoopcastError::WriteFailed(e.to_string()))?;
        self.muxer
            .write_flv_tag_body(BytesMut::from(body.as_ref()))
            .map_err(|e| LoopcastError::WriteFailed(e.to_string()))?;
        self.muxer
            .write_previous_tag_size((11 + len) as u32)
            .map_err(|e| LoopcastError::WriteFailed(e.to_string()))?;
        Ok(self.muxer.writer.extract_current_bytes().freeze())
    }

    fn dispatch(
        &mut self,
        result: Result<ClientSessionResult, rml_rtmp::sessions::ClientSessionError>,
    ) -> LoopcastResult<()> {
        let packet = result.map_err(|e| LoopcastError::WriteFailed(e.to_string()))?;
        self.send(packet)
    }

    fn send(&mut self, result: ClientSessionResult) -> LoopcastResult<()> {
        self.out_tx
            .send(result)
            .map_err(|_| LoopcastError::WriteFailed("socket task died".to_string()))
    }

    /// Idempotent close: dropping the sender ends the socket I/O task.
    pub fn close(&mut self) {
        self.usable = false;
    }
}

impl PacketSink for RtmpSink {
    fn write_packet(&mut self, stream_kind: StreamKind, packet: &Packet) -> LoopcastResult<()> {
        RtmpSink::write_packet(self, stream_kind, packet)
    }
}

async fn wait_for_event(
    session: &mut ClientSession,
    out_tx: &UnboundedSender<ClientSessionResult>,
    in_rx: &mut UnboundedReceiver<Vec<u8>>,
    matches_event: impl Fn(&ClientSessionEvent) -> bool,
) -> LoopcastResult<()> {
    loop {
        let data = in_rx
            .recv()
            .await
            .ok_or_else(|| LoopcastError::HandshakeFailed("socket closed".to_string()))?;
        let results = session
            .handle_input(&data)
            .map_err(|e| LoopcastError::HandshakeFailed(e.to_string()))?;

        for result in results {
            match result {
                ClientSessionResult::RaisedEvent(event) => {
                    if matches_event(&event) {
                        return Ok(());
                    }
                }
                ClientSessionResult::OutboundResponse(_) => {
                    out_tx
                        .send(result)
                        .map_err(|_| LoopcastError::HandshakeFailed("socket task died".into()))?;
                }
                _ => {}
            }
        }
    }
}

fn spawn_socket_io(
    socket: TcpStream,
) -> (
    UnboundedSender<ClientSessionResult>,
    UnboundedReceiver<Vec<u8>>,
) {
    let (in_tx, in_rx) = unbounded_channel();
    let (out_tx, mut out_rx) = unbounded_channel();

    tokio::spawn(async move {
        let (mut read_half, mut write_half) = socket.into_split();
        let mut buf = [0u8; 4096];
        loop {
            tokio::select! {
                result = read_half.read(&mut buf) => {
                    match result {
                        Ok(0) | Err(_) => {
                            tracing::debug!("rtmp sink socket closed");
                            break;
                        }
                        Ok(n) => {
                            if in_tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                    }
                }
                maybe_packet = out_rx.recv() => {
                    match maybe_packet {
                        Some(ClientSessionResult::OutboundResponse(packet)) => {
                            if write_half.write_all(&packet.bytes).await.is_err() {
                                break;
                            }
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        }
    });

    (out_tx, in_rx)
}
