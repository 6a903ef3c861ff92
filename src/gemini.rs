//! Gemini Live API module
//!
//! Session channel over the Gemini Live bidirectional WebSocket. Opening sends
//! the setup message and waits for `setupComplete`; afterwards a writer task
//! drains the outbound media queue and a reader task turns server messages
//! into [`ServerEvent`]s.

use crate::channel::{Channel, ChannelOpener, OpenedChannel};
use crate::config::LiveConfig;
use crate::error::{ChannelOpenError, GeminiError};
use crate::events::{Outbound, ServerEvent, Speaker};
use base64::engine::general_purpose;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Inbound event queue depth
const EVENT_QUEUE: usize = 256;

/// Generation configuration for setup.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Serialize, Clone)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize, Clone)]
pub struct TextPart {
    pub text: String,
}

/// Marker for config objects the API enables by presence (`{}`).
#[derive(Debug, Serialize, Clone, Default)]
pub struct Enabled {}

/// Session setup message.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentSetup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    pub input_audio_transcription: Enabled,
    pub output_audio_transcription: Enabled,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<serde_json::Value>,
}

impl BidiGenerateContentSetup {
    pub fn from_config(config: &LiveConfig) -> Self {
        Self {
            model: config.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice.clone(),
                        },
                    },
                }),
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: config.prompt.render(),
                }],
            },
            input_audio_transcription: Enabled::default(),
            output_audio_transcription: Enabled::default(),
            tools: vec![serde_json::json!({ "googleSearch": {} })],
        }
    }
}

/// Base64 media payload
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub data: String,
    pub mime_type: String,
}

/// A chunk of realtime input
#[derive(Debug, Serialize, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_end: Option<bool>,
}

/// Message sent from client to server.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(BidiGenerateContentSetup),
    RealtimeInput(RealtimeInput),
}

impl From<&Outbound> for ClientMessage {
    fn from(msg: &Outbound) -> Self {
        let input = match msg {
            Outbound::Audio(chunk) => RealtimeInput {
                audio: Some(Blob {
                    data: general_purpose::STANDARD.encode(chunk.to_le_bytes()),
                    mime_type: chunk.mime_type(),
                }),
                ..Default::default()
            },
            Outbound::Frame(frame) => RealtimeInput {
                video: Some(Blob {
                    data: general_purpose::STANDARD.encode(&frame.encoded),
                    mime_type: frame.mime_type.to_string(),
                }),
                ..Default::default()
            },
            Outbound::AudioStreamEnd => RealtimeInput {
                audio_stream_end: Some(true),
                ..Default::default()
            },
        };
        ClientMessage::RealtimeInput(input)
    }
}

/// Server -> client message. Every field is optional on the wire.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<GoAway>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
    turn_complete: bool,
    interrupted: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ModelTurn {
    parts: Vec<ContentPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ContentPart {
    text: Option<String>,
    thought: bool,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct InlineData {
    data: String,
    mime_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Transcription {
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct GoAway {
    time_left: Option<String>,
}

/// What one server message amounts to.
#[derive(Debug, Default, PartialEq)]
pub struct ParsedMessage {
    pub setup_complete: bool,
    pub events: Vec<ServerEvent>,
    /// Present when the server announced an upcoming disconnect
    pub go_away: Option<String>,
}

fn text_fragment(speaker: Speaker, transcription: Option<Transcription>) -> Option<ServerEvent> {
    let text = transcription?.text.filter(|t| !t.is_empty())?;
    Some(ServerEvent::TextFragment { speaker, text })
}

/// Decode one server JSON message.
///
/// Events come out in the order the session must apply them: transcriptions,
/// then turn completion, then agent audio, then interruption.
pub fn parse_server_message(text: &str) -> Result<ParsedMessage, GeminiError> {
    let message: ServerMessage = serde_json::from_str(text)?;
    let mut parsed = ParsedMessage {
        setup_complete: message.setup_complete.is_some(),
        go_away: message
            .go_away
            .map(|g| g.time_left.unwrap_or_else(|| "unknown".to_string())),
        ..Default::default()
    };

    let Some(content) = message.server_content else {
        return Ok(parsed);
    };
    let parts = content.model_turn.map(|t| t.parts).unwrap_or_default();

    parsed.events.extend(text_fragment(Speaker::Agent, content.output_transcription));
    parsed.events.extend(text_fragment(Speaker::User, content.input_transcription));
    for part in &parts {
        if let Some(text) = part.text.as_ref().filter(|t| !part.thought && !t.is_empty()) {
            parsed.events.push(ServerEvent::TextFragment {
                speaker: Speaker::Agent,
                text: text.clone(),
            });
        }
    }
    if content.turn_complete {
        parsed.events.push(ServerEvent::TurnComplete);
    }
    for part in parts {
        let Some(inline) = part.inline_data else {
            continue;
        };
        let is_audio = inline.mime_type.as_deref().map_or(true, |m| m.starts_with("audio/"));
        if is_audio && !inline.data.is_empty() {
            parsed.events.push(ServerEvent::AudioFragment { data: inline.data });
        }
    }
    if content.interrupted {
        parsed.events.push(ServerEvent::Interrupted);
    }
    Ok(parsed)
}

impl From<GeminiError> for ChannelOpenError {
    fn from(err: GeminiError) -> Self {
        match err {
            GeminiError::WebSocket(WsError::Http(response)) => {
                let status = response.status();
                match status.as_u16() {
                    401 | 403 => ChannelOpenError::Unauthorized(format!("HTTP {}", status)),
                    _ => ChannelOpenError::ConnectionRefused(format!("HTTP {}", status)),
                }
            }
            GeminiError::Rejected(reason) => ChannelOpenError::Unauthorized(reason),
            other => ChannelOpenError::ConnectionRefused(other.to_string()),
        }
    }
}

/// JSON payload of a text or binary frame.
fn frame_text(message: &Message) -> Option<&str> {
    match message {
        Message::Text(text) => Some(text.as_str()),
        Message::Binary(bytes) => std::str::from_utf8(bytes).ok(),
        _ => None,
    }
}

/// Error description for an abnormal close, `None` for an orderly one.
fn close_error(frame: Option<CloseFrame>) -> Option<String> {
    let frame = frame?;
    if frame.code == CloseCode::Normal {
        return None;
    }
    let reason: &str = &frame.reason;
    Some(format!("connection closed with code {}: {}", u16::from(frame.code), reason))
}

/// Read until `setupComplete`. A policy close means the key was refused.
async fn wait_for_setup(ws: &mut WsStream) -> Result<(), GeminiError> {
    while let Some(message) = ws.next().await {
        let message = message?;
        if let Message::Close(frame) = message {
            return match frame {
                Some(frame) if frame.code == CloseCode::Policy => {
                    let reason: &str = &frame.reason;
                    Err(GeminiError::Rejected(reason.to_string()))
                }
                _ => Err(GeminiError::ConnectionClosed),
            };
        }
        let Some(text) = frame_text(&message) else {
            continue;
        };
        if parse_server_message(text)?.setup_complete {
            return Ok(());
        }
        debug!("Ignoring message before setup complete: {}", text);
    }
    Err(GeminiError::SetupNotComplete)
}

async fn send_json(sink: &mut SplitSink<WsStream, Message>, msg: &ClientMessage) -> Result<(), GeminiError> {
    let json = serde_json::to_string(msg)?;
    sink.send(Message::text(json)).await?;
    Ok(())
}

/// Drain the outbound queue into the socket. On shutdown, whatever is already
/// queued is flushed before the close frame. A failed write is reported on
/// `events` so the call does not sit connected with nothing going out.
async fn run_writer(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    mut shutdown: oneshot::Receiver<()>,
    events: mpsc::Sender<ServerEvent>,
) {
    loop {
        tokio::select! {
            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = send_json(&mut sink, &ClientMessage::from(&msg)).await {
                    error!("Gemini writer stopped: {}", e);
                    let _ = events.send(ServerEvent::Error(format!("write failed: {}", e))).await;
                    return;
                }
            }
            _ = &mut shutdown => {
                while let Ok(msg) = outbound.try_recv() {
                    if send_json(&mut sink, &ClientMessage::from(&msg)).await.is_err() {
                        return;
                    }
                }
                break;
            }
        }
    }
    if let Err(e) = sink.close().await {
        debug!("Error closing Gemini socket: {}", e);
    }
    debug!("Gemini writer finished");
}

/// Forward server messages as events until the socket closes.
async fn run_reader(mut stream: SplitStream<WsStream>, events: mpsc::Sender<ServerEvent>) {
    let failure = loop {
        let message = match stream.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => break Some(format!("read failed: {}", e)),
            None => break Some("connection dropped".to_string()),
        };
        if let Message::Close(frame) = message {
            info!("Gemini socket closed: {:?}", frame);
            break close_error(frame);
        }
        let Some(text) = frame_text(&message) else {
            continue;
        };
        match parse_server_message(text) {
            Ok(parsed) => {
                if let Some(time_left) = parsed.go_away {
                    warn!("Gemini server going away in {}", time_left);
                }
                for event in parsed.events {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!("Ignoring unparseable server message: {}", e),
        }
    };

    if let Some(reason) = failure {
        error!("Gemini connection error: {}", reason);
        let _ = events.send(ServerEvent::Error(reason)).await;
    }
    let _ = events.send(ServerEvent::Closed).await;
}

/// Opens Gemini Live sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct GeminiConnector;

impl GeminiConnector {
    async fn connect(
        url: String,
        endpoint: String,
        setup: ClientMessage,
        queue: usize,
    ) -> Result<OpenedChannel, GeminiError> {
        info!("Connecting to Gemini API at {}", url);
        let (mut ws, _response) = connect_async(endpoint).await?;
        ws.send(Message::text(serde_json::to_string(&setup)?)).await?;
        wait_for_setup(&mut ws).await?;
        info!("Gemini session setup complete");
        let (sink, stream) = ws.split();

        let (out_tx, out_rx) = mpsc::channel(queue);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(run_writer(sink, out_rx, shutdown_rx, event_tx.clone()));
        let reader = tokio::spawn(run_reader(stream, event_tx)).abort_handle();

        let channel = Channel::new(out_tx, move || {
            let _ = shutdown_tx.send(());
            reader.abort();
            debug!("Gemini channel closed");
        });
        Ok(OpenedChannel {
            channel,
            events: event_rx,
        })
    }
}

impl ChannelOpener for GeminiConnector {
    fn open(
        &self,
        config: &LiveConfig,
    ) -> impl Future<Output = Result<OpenedChannel, ChannelOpenError>> + Send {
        let url = config.url.clone();
        let endpoint = config.endpoint();
        let setup = ClientMessage::Setup(BidiGenerateContentSetup::from_config(config));
        let queue = config.outbound_queue;
        async move {
            Self::connect(url, endpoint, setup, queue)
                .await
                .map_err(ChannelOpenError::from)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AudioChunk, FrameSample};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[test]
    fn test_setup_message_serialization() {
        let config = LiveConfig {
            voice: "Puck".into(),
            ..Default::default()
        };
        let msg = ClientMessage::Setup(BidiGenerateContentSetup::from_config(&config));
        let parsed: serde_json::Value = serde_json::to_value(&msg).unwrap();

        let setup = &parsed["setup"];
        assert_eq!(setup["model"], config.model.as_str());
        assert_eq!(setup["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Puck"
        );
        assert!(setup["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .contains("screen"));
        assert_eq!(setup["inputAudioTranscription"], serde_json::json!({}));
        assert_eq!(setup["outputAudioTranscription"], serde_json::json!({}));
        assert_eq!(setup["tools"][0], serde_json::json!({"googleSearch": {}}));
    }

    #[test]
    fn test_realtime_input_serialization() {
        let audio = Outbound::Audio(AudioChunk {
            samples: vec![1, -1],
            sample_rate: 16_000,
        });
        let json = serde_json::to_value(ClientMessage::from(&audio)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"realtimeInput": {"audio": {"data": "AQD//w==", "mimeType": "audio/pcm;rate=16000"}}})
        );

        let frame = Outbound::Frame(FrameSample {
            encoded: vec![0xff, 0xd8],
            mime_type: "image/jpeg",
        });
        let json = serde_json::to_value(ClientMessage::from(&frame)).unwrap();
        assert_eq!(json["realtimeInput"]["video"]["mimeType"], "image/jpeg");
        assert!(json["realtimeInput"].get("audio").is_none());

        let json = serde_json::to_value(ClientMessage::from(&Outbound::AudioStreamEnd)).unwrap();
        assert_eq!(json, serde_json::json!({"realtimeInput": {"audioStreamEnd": true}}));
    }

    #[test]
    fn test_parse_setup_complete_and_go_away() {
        let parsed = parse_server_message(r#"{"setupComplete": {}}"#).unwrap();
        assert!(parsed.setup_complete);
        assert!(parsed.events.is_empty());

        let parsed = parse_server_message(r#"{"goAway": {"timeLeft": "10s"}}"#).unwrap();
        assert_eq!(parsed.go_away.as_deref(), Some("10s"));
        assert!(!parsed.setup_complete);
    }

    #[test]
    fn test_parse_server_content_variants() {
        let msg = serde_json::json!({
            "serverContent": {
                "inputTranscription": {"text": "hello"},
                "outputTranscription": {"text": "hi"},
                "modelTurn": {"parts": [
                    {"text": "planning", "thought": true},
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAAA"}}
                ]},
                "turnComplete": true,
                "interrupted": true
            }
        });
        let parsed = parse_server_message(&msg.to_string()).unwrap();
        assert_eq!(
            parsed.events,
            vec![
                ServerEvent::TextFragment {
                    speaker: Speaker::Agent,
                    text: "hi".into()
                },
                ServerEvent::TextFragment {
                    speaker: Speaker::User,
                    text: "hello".into()
                },
                ServerEvent::TurnComplete,
                ServerEvent::AudioFragment { data: "AAAA".into() },
                ServerEvent::Interrupted,
            ]
        );
    }

    #[test]
    fn test_parse_skips_empty_and_non_audio() {
        let msg = serde_json::json!({
            "serverContent": {
                "outputTranscription": {"text": ""},
                "modelTurn": {"parts": [
                    {"text": "answer"},
                    {"inlineData": {"mimeType": "image/png", "data": "AAAA"}}
                ]}
            }
        });
        let parsed = parse_server_message(&msg.to_string()).unwrap();
        assert_eq!(
            parsed.events,
            vec![ServerEvent::TextFragment {
                speaker: Speaker::Agent,
                text: "answer".into()
            }]
        );
        assert!(parse_server_message("not json").is_err());
    }

    #[test]
    fn test_close_classification() {
        assert_eq!(close_error(None), None);
        let normal = CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        };
        assert_eq!(close_error(Some(normal)), None);
        let abnormal = CloseFrame {
            code: CloseCode::Away,
            reason: "restart".into(),
        };
        assert_eq!(
            close_error(Some(abnormal)).as_deref(),
            Some("connection closed with code 1001: restart")
        );
    }

    #[test]
    fn test_open_error_mapping() {
        assert_eq!(
            ChannelOpenError::from(GeminiError::Rejected("API key not valid".into())),
            ChannelOpenError::Unauthorized("API key not valid".into())
        );
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            ChannelOpenError::from(GeminiError::WebSocket(WsError::Io(io))),
            ChannelOpenError::ConnectionRefused(_)
        ));
    }

    async fn local_server() -> (TcpListener, LiveConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = LiveConfig {
            url: format!("ws://{}/", listener.local_addr().unwrap()),
            api_key: "test".into(),
            ..Default::default()
        };
        (listener, config)
    }

    #[tokio::test]
    async fn test_open_stream_and_close() {
        let (listener, config) = local_server().await;
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let setup = ws.next().await.unwrap().unwrap();
            assert!(setup.to_text().unwrap().contains("\"setup\""));
            ws.send(Message::binary(br#"{"setupComplete":{}}"#.to_vec())).await.unwrap();

            let audio = ws.next().await.unwrap().unwrap();
            let audio: serde_json::Value = serde_json::from_str(audio.to_text().unwrap()).unwrap();
            assert_eq!(audio["realtimeInput"]["audio"]["mimeType"], "audio/pcm;rate=16000");

            let content = serde_json::json!({"serverContent": {"outputTranscription": {"text": "Hi"}}});
            ws.send(Message::text(content.to_string())).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let OpenedChannel { channel, mut events } = GeminiConnector.open(&config).await.unwrap();
        channel
            .send(Outbound::Audio(AudioChunk {
                samples: vec![0; 160],
                sample_rate: 16_000,
            }))
            .unwrap();

        assert_eq!(
            events.recv().await,
            Some(ServerEvent::TextFragment {
                speaker: Speaker::Agent,
                text: "Hi".into()
            })
        );
        assert_eq!(events.recv().await, Some(ServerEvent::Closed));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_policy_close_during_setup_is_unauthorized() {
        let (listener, config) = local_server().await;
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let _setup = ws.next().await;
            let _ = ws
                .close(Some(CloseFrame {
                    code: CloseCode::Policy,
                    reason: "API key not valid".into(),
                }))
                .await;
        });

        let result = GeminiConnector.open(&config).await;
        assert_eq!(
            result.err(),
            Some(ChannelOpenError::Unauthorized("API key not valid".into()))
        );
    }

    #[tokio::test]
    async fn test_nothing_listening_is_refused() {
        let (listener, config) = local_server().await;
        drop(listener);
        let result = GeminiConnector.open(&config).await;
        assert!(matches!(result, Err(ChannelOpenError::ConnectionRefused(_))));
    }
}
