//! Gemini Live channel over the `BidiGenerateContent` websocket.
//!
//! The first client message is the session setup; the server answers with
//! `setupComplete`, then streams `serverContent` messages. Auth is via API
//! key in query parameter.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use vox_persona_core::config::DEFAULT_BASE_URL;
use vox_persona_core::error::{Result, VoxError};

use crate::channel::{
    ChannelEvent, ConnectRequest, LiveConnection, LiveConnector, LiveEvent, LiveSender, Outbound,
    ResponseModality,
};

const SERVICE_PATH: &str =
    "/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Inbound events buffered between the socket reader and the session.
const EVENT_BUFFER: usize = 256;

pub struct GeminiLiveConnector {
    pub base_url: String,
    api_key: String,
}

impl GeminiLiveConnector {
    pub fn new(api_key: impl Into<String>, base_url: Option<&str>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}{SERVICE_PATH}?key={}",
            self.base_url,
            urlencoding::encode(&self.api_key)
        )
    }
}

// --- Client messages ---

#[derive(Debug, Serialize)]
struct SetupMessage {
    setup: Setup,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    system_instruction: Content,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_audio_transcription: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_audio_transcription: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<ResponseModality>,
    speech_config: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

/// Serialize the setup message that opens a session.
pub fn setup_message(request: &ConnectRequest) -> Result<String> {
    let model = if request.model.starts_with("models/") {
        request.model.clone()
    } else {
        format!("models/{}", request.model)
    };
    let message = SetupMessage {
        setup: Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec![request.response_modality],
                speech_config: json!({
                    "voiceConfig": {
                        "prebuiltVoiceConfig": { "voiceName": request.voice.as_str() }
                    }
                }),
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: request.system_instruction.clone(),
                }],
            },
            input_audio_transcription: request.input_transcription.then(|| json!({})),
            output_audio_transcription: request.output_transcription.then(|| json!({})),
        },
    };
    Ok(serde_json::to_string(&message)?)
}

/// Serialize one outbound message. `None` for [`Outbound::Close`].
pub fn client_message(message: &Outbound) -> Option<String> {
    let value = match message {
        Outbound::Audio(frame) => json!({
            "realtimeInput": {
                "audio": { "data": frame.data, "mimeType": frame.mime_type }
            }
        }),
        Outbound::Text(text) => json!({
            "clientContent": {
                "turns": [{ "role": "user", "parts": [{ "text": text }] }],
                "turnComplete": true
            }
        }),
        Outbound::Close => return None,
    };
    Some(value.to_string())
}

// --- Server messages ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    #[serde(default)]
    setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    server_content: Option<ServerContent>,
    #[serde(default)]
    go_away: Option<GoAway>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    input_transcription: Option<Transcription>,
    #[serde(default)]
    output_transcription: Option<Transcription>,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<ServerPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerPart {
    #[serde(default)]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Deserialize)]
struct Transcription {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoAway {
    #[serde(default)]
    time_left: Option<String>,
}

/// Split one server message into channel events.
///
/// Within a `serverContent` message the order is: audio parts, interruption,
/// input transcription, output transcription, turn completion.
pub fn parse_server_message(text: &str) -> Result<Vec<ChannelEvent>> {
    let message: ServerMessage = serde_json::from_str(text)?;
    let mut events = Vec::new();

    if message.setup_complete.is_some() {
        events.push(ChannelEvent::Open);
    }

    if let Some(content) = message.server_content {
        let parts = content.model_turn.map(|t| t.parts).unwrap_or_default();
        for inline in parts.into_iter().filter_map(|p| p.inline_data) {
            if inline.data.is_empty() {
                continue;
            }
            events.push(ChannelEvent::Message(LiveEvent::Audio {
                data: inline.data,
                mime_type: inline.mime_type,
            }));
        }
        if content.interrupted {
            events.push(ChannelEvent::Message(LiveEvent::Interrupted));
        }
        if let Some(text) = content.input_transcription.and_then(|t| t.text) {
            if !text.is_empty() {
                events.push(ChannelEvent::Message(LiveEvent::InputTranscript(text)));
            }
        }
        if let Some(text) = content.output_transcription.and_then(|t| t.text) {
            if !text.is_empty() {
                events.push(ChannelEvent::Message(LiveEvent::OutputTranscript(text)));
            }
        }
        if content.turn_complete {
            events.push(ChannelEvent::Message(LiveEvent::TurnComplete));
        }
    }

    if let Some(go_away) = message.go_away {
        warn!(time_left = ?go_away.time_left, "Live server announced disconnect");
    }

    Ok(events)
}

#[async_trait]
impl LiveConnector for GeminiLiveConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<LiveConnection> {
        let setup = setup_message(&request)?;
        debug!(base_url = %self.base_url, model = %request.model, voice = %request.voice, "Connecting live channel");

        let (ws, _) = connect_async(self.endpoint())
            .await
            .map_err(|e| VoxError::ChannelOpen(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        sink.send(Message::Text(setup.into()))
            .await
            .map_err(|e| VoxError::ChannelOpen(format!("setup: {e}")))?;

        let (sender, mut outbound) = LiveSender::channel();
        let (event_tx, events) = mpsc::channel(EVENT_BUFFER);

        // Writer: drain outbound queue into the socket.
        tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                let result = match client_message(&message) {
                    Some(text) => sink.send(Message::Text(text.into())).await,
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = result {
                    debug!(error = %e, "Live channel write failed");
                    break;
                }
            }
            let _ = sink.close().await;
            debug!("Live channel writer exited");
        });

        // Reader: turn socket frames into channel events.
        let reader_sender = sender.clone();
        tokio::spawn(async move {
            let mut closed_sent = false;
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text.to_string(),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "Discarding non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        info!(reason = ?frame, "Live channel closed by server");
                        let _ = event_tx.send(ChannelEvent::Closed).await;
                        closed_sent = true;
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        if !reader_sender.is_closed() {
                            let _ = event_tx.send(ChannelEvent::Error(e.to_string())).await;
                        }
                        closed_sent = true;
                        break;
                    }
                };
                trace!(len = text.len(), "Live server message");

                match parse_server_message(&text) {
                    Ok(parsed) => {
                        for event in parsed {
                            if event_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "Unparseable live server message"),
                }
            }
            if !closed_sent {
                let _ = event_tx.send(ChannelEvent::Closed).await;
            }
            reader_sender.close();
            debug!("Live channel reader exited");
        });

        info!(model = %request.model, "Live channel connected");
        Ok(LiveConnection { sender, events })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vox_persona_core::types::Voice;
    use vox_persona_media::Frame;

    fn request() -> ConnectRequest {
        ConnectRequest {
            model: "gemini-live-test".into(),
            voice: Voice::Kore,
            system_instruction: "Be brief.".into(),
            response_modality: ResponseModality::Audio,
            input_transcription: true,
            output_transcription: true,
        }
    }

    #[test]
    fn test_setup_message_shape() {
        let value: serde_json::Value = serde_json::from_str(&setup_message(&request()).unwrap()).unwrap();
        let setup = &value["setup"];
        assert_eq!(setup["model"], "models/gemini-live-test");
        assert_eq!(setup["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Kore"
        );
        assert_eq!(setup["systemInstruction"]["parts"][0]["text"], "Be brief.");
        assert!(setup["inputAudioTranscription"].is_object());
        assert!(setup["outputAudioTranscription"].is_object());
    }

    #[test]
    fn test_setup_omits_disabled_transcription() {
        let mut req = request();
        req.model = "models/already-prefixed".into();
        req.input_transcription = false;
        let value: serde_json::Value = serde_json::from_str(&setup_message(&req).unwrap()).unwrap();
        assert_eq!(value["setup"]["model"], "models/already-prefixed");
        assert!(value["setup"].get("inputAudioTranscription").is_none());
    }

    #[test]
    fn test_client_messages() {
        let audio = client_message(&Outbound::Audio(Frame {
            data: "AQI=".into(),
            mime_type: "audio/pcm;rate=16000".into(),
        }))
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&audio).unwrap();
        assert_eq!(value["realtimeInput"]["audio"]["data"], "AQI=");
        assert_eq!(value["realtimeInput"]["audio"]["mimeType"], "audio/pcm;rate=16000");

        let text = client_message(&Outbound::Text("hi".into())).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["clientContent"]["turns"][0]["parts"][0]["text"], "hi");
        assert_eq!(value["clientContent"]["turnComplete"], true);

        assert!(client_message(&Outbound::Close).is_none());
    }

    #[test]
    fn test_parse_setup_complete() {
        assert_eq!(
            parse_server_message(r#"{"setupComplete":{}}"#).unwrap(),
            vec![ChannelEvent::Open]
        );
    }

    #[test]
    fn test_parse_server_content_order() {
        let msg = r#"{"serverContent":{
            "modelTurn":{"parts":[
                {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAA="}},
                {"text":"ignored"},
                {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AQI="}}
            ]},
            "interrupted":true,
            "inputTranscription":{"text":"hello"},
            "outputTranscription":{"text":"hi there"},
            "turnComplete":true
        }}"#;
        let events = parse_server_message(msg).unwrap();
        assert_eq!(
            events,
            vec![
                ChannelEvent::Message(LiveEvent::Audio {
                    data: "AAA=".into(),
                    mime_type: "audio/pcm;rate=24000".into()
                }),
                ChannelEvent::Message(LiveEvent::Audio {
                    data: "AQI=".into(),
                    mime_type: "audio/pcm;rate=24000".into()
                }),
                ChannelEvent::Message(LiveEvent::Interrupted),
                ChannelEvent::Message(LiveEvent::InputTranscript("hello".into())),
                ChannelEvent::Message(LiveEvent::OutputTranscript("hi there".into())),
                ChannelEvent::Message(LiveEvent::TurnComplete),
            ]
        );
    }

    #[test]
    fn test_parse_ignores_empty_and_unknown() {
        assert!(parse_server_message(r#"{"serverContent":{"inputTranscription":{}}}"#)
            .unwrap()
            .is_empty());
        assert!(parse_server_message(r#"{"usageMetadata":{"totalTokenCount":3}}"#)
            .unwrap()
            .is_empty());
        assert!(parse_server_message(r#"{"goAway":{"timeLeft":"10s"}}"#)
            .unwrap()
            .is_empty());
        assert!(parse_server_message("not json").is_err());
    }

    #[test]
    fn test_endpoint() {
        let connector = GeminiLiveConnector::new("k123", Some("ws://127.0.0.1:9/"));
        assert_eq!(
            connector.endpoint(),
            "ws://127.0.0.1:9/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent?key=k123"
        );
    }

    #[test]
    fn test_endpoint_encodes_key() {
        let connector = GeminiLiveConnector::new("a&b#c+d e", Some("wss://example.test"));
        let endpoint = connector.endpoint();
        assert!(endpoint.ends_with("?key=a%26b%23c%2Bd%20e"), "{endpoint}");
    }
}
