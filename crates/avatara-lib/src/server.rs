//! HTTP control API for avatara sessions.
//!
//! Runs on port 8010 by default. CORS-permissive. Every endpoint answers
//! `{code, msg, data?}` with HTTP 200; `code` is 0 on success and -1 on
//! failure, with the reason in `msg`.
//!
//! Media delivery is out of scope here: server-side sessions pace their
//! frames into a channel whose consumer only logs eventpoints.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use avatara_core::types::{CustomClipConfig, EventStatus, ModelConfig, SessionConfig};

use crate::cache::AssetCache;
use crate::custom::CustomClip;
use crate::error::SessionError;
use crate::features::{FeatureExtractor, MelExtractor};
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionParts};
use crate::synth::SpeechSynth;
use crate::transport::ChannelTransport;

/// Defaults applied to every session created over HTTP.
#[derive(Debug, Clone, Default)]
pub struct ServerDefaults {
    pub session: SessionConfig,
    pub model: ModelConfig,
    pub clips: Vec<CustomClipConfig>,
}

pub struct ServerState {
    defaults: ServerDefaults,
    registry: Arc<SessionRegistry>,
    cache: AssetCache,
    extractor: Arc<dyn FeatureExtractor>,
    synth: Arc<dyn SpeechSynth>,
}

pub type AppState = Arc<ServerState>;

impl ServerState {
    pub fn new(defaults: ServerDefaults, synth: Arc<dyn SpeechSynth>) -> Self {
        Self::with_cache(defaults, synth, AssetCache::new())
    }

    pub fn with_cache(defaults: ServerDefaults, synth: Arc<dyn SpeechSynth>, cache: AssetCache) -> Self {
        Self {
            defaults,
            registry: Arc::new(SessionRegistry::new()),
            cache,
            extractor: Arc::new(MelExtractor::new()),
            synth,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Build and register a session. Blocking: may load a model.
    pub fn create_session(&self, req: &CreateSessionRequest) -> Result<u32, SessionError> {
        let mut model_cfg = self.defaults.model.clone();
        if let Some(model) = &req.model {
            model_cfg.model = model.clone();
        }
        if let Some(avatar) = &req.avatar_id {
            model_cfg.avatar_id = avatar.clone();
        }
        let mut config = self.defaults.session.clone();
        if let Some(b) = req.batch_size {
            config.batch_size = b;
        }
        if let Some(fps) = req.fps {
            config.fps = fps;
        }
        config.validate()?;

        let model = self
            .cache
            .get_or_load(&model_cfg, config.batch_size, self.extractor.as_ref())?;
        let clips = self
            .defaults
            .clips
            .iter()
            .map(|c| CustomClip::load(c).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        let backlog_limit = (config.backlog_factor * config.batch_size as f32).ceil() as usize;
        let timeout = config.queue_timeout;
        let (extractor, synth) = (self.extractor.clone(), self.synth.clone());
        let on_close = self.registry.deregister_on_close();
        let session = self.registry.insert_new(|id| {
            let (transport, frames) = ChannelTransport::new(backlog_limit * 2 + 8);
            let session = Session::start(
                id,
                config,
                SessionParts {
                    model,
                    extractor,
                    clips,
                    synth,
                    sink: Arc::new(transport),
                    on_close: Some(on_close),
                },
            )?;
            let cancel = session.cancel_flag();
            std::thread::Builder::new()
                .name(format!("avatara-transport-{id}"))
                .spawn(move || {
                    let frames = frames.on_event(move |ep| match ep.status {
                        EventStatus::Start => info!("session {id}: utterance started: {:?}", ep.text),
                        EventStatus::End => info!("session {id}: utterance finished: {:?}", ep.text),
                    });
                    frames.discard_until(timeout, &cancel);
                })
                .map_err(|source| SessionError::Spawn {
                    stage: "transport",
                    source,
                })?;
            Ok(session)
        })?;
        Ok(session.id())
    }
}

/// Build the axum router over shared server state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/session", post(create_session))
        .route("/session/{id}", axum::routing::delete(delete_session))
        .route("/session/{id}/status", get(session_status))
        .route("/human", post(human))
        .route("/interrupt_talk", post(interrupt_talk))
        .route("/humanaudio", post(human_audio))
        .route("/set_audiotype", post(set_audiotype))
        .route("/record", post(record))
        .route("/is_speaking", post(is_speaking))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub code: i32,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ApiResponse {
    fn ok() -> Json<Self> {
        Json(Self {
            code: 0,
            msg: "ok".into(),
            data: None,
        })
    }

    fn data(data: Value) -> Json<Self> {
        Json(Self {
            code: 0,
            msg: "ok".into(),
            data: Some(data),
        })
    }

    fn error(msg: impl std::fmt::Display) -> Json<Self> {
        let msg = msg.to_string();
        warn!("request failed: {msg}");
        Json(Self {
            code: -1,
            msg,
            data: None,
        })
    }
}

fn respond(result: Result<Json<ApiResponse>, SessionError>) -> Json<ApiResponse> {
    result.unwrap_or_else(ApiResponse::error)
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub avatar_id: Option<String>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub fps: Option<u32>,
}

#[derive(Deserialize)]
struct SessionRef {
    sessionid: u32,
}

#[derive(Deserialize)]
struct HumanRequest {
    sessionid: u32,
    #[serde(rename = "type", default = "default_human_type")]
    kind: String,
    text: String,
    #[serde(default)]
    interrupt: bool,
    #[serde(default)]
    msgevent: Option<Value>,
}

fn default_human_type() -> String {
    "echo".into()
}

#[derive(Deserialize)]
struct AudiotypeRequest {
    sessionid: u32,
    audiotype: u32,
    #[serde(default)]
    reinit: bool,
}

#[derive(Deserialize)]
struct RecordRequest {
    sessionid: u32,
    #[serde(rename = "type")]
    kind: String,
}

async fn create_session(
    State(state): State<AppState>,
    body: Option<Json<CreateSessionRequest>>,
) -> Json<ApiResponse> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let result = tokio::task::spawn_blocking(move || state.create_session(&req)).await;
    match result {
        Ok(Ok(id)) => ApiResponse::data(serde_json::json!({ "sessionid": id })),
        Ok(Err(e)) => ApiResponse::error(e),
        Err(e) => ApiResponse::error(format!("session setup panicked: {e}")),
    }
}

async fn delete_session(State(state): State<AppState>, Path(id): Path<u32>) -> Json<ApiResponse> {
    let result = tokio::task::spawn_blocking(move || state.registry.remove(id)).await;
    match result {
        Ok(Ok(())) => ApiResponse::ok(),
        Ok(Err(e)) => ApiResponse::error(e),
        Err(e) => ApiResponse::error(format!("session teardown panicked: {e}")),
    }
}

async fn session_status(State(state): State<AppState>, Path(id): Path<u32>) -> Json<ApiResponse> {
    respond(state.registry.get(id).map(|s| {
        ApiResponse::data(serde_json::to_value(s.status()).unwrap_or(Value::Null))
    }))
}

async fn human(State(state): State<AppState>, Json(req): Json<HumanRequest>) -> Json<ApiResponse> {
    if req.kind != "echo" {
        return ApiResponse::error(format!("unsupported message type {:?}", req.kind));
    }
    respond(state.registry.get(req.sessionid).and_then(|s| {
        if req.interrupt {
            s.interrupt();
        }
        s.put_text(&req.text, req.msgevent)?;
        Ok(ApiResponse::ok())
    }))
}

async fn interrupt_talk(State(state): State<AppState>, Json(req): Json<SessionRef>) -> Json<ApiResponse> {
    respond(state.registry.get(req.sessionid).map(|s| {
        s.interrupt();
        ApiResponse::ok()
    }))
}

async fn human_audio(
    State(state): State<AppState>,
    Query(req): Query<SessionRef>,
    body: Bytes,
) -> Json<ApiResponse> {
    respond(state.registry.get(req.sessionid).and_then(|s| {
        let queued = s.put_audio(&body)?;
        Ok(ApiResponse::data(serde_json::json!({ "chunks": queued })))
    }))
}

async fn set_audiotype(State(state): State<AppState>, Json(req): Json<AudiotypeRequest>) -> Json<ApiResponse> {
    respond(state.registry.get(req.sessionid).map(|s| {
        if s.set_custom_state(req.audiotype, req.reinit) {
            ApiResponse::ok()
        } else {
            ApiResponse::error(format!("no custom clip for audiotype {}", req.audiotype))
        }
    }))
}

async fn record(State(state): State<AppState>, Json(req): Json<RecordRequest>) -> Json<ApiResponse> {
    let session = match state.registry.get(req.sessionid) {
        Ok(s) => s,
        Err(e) => return ApiResponse::error(e),
    };
    match req.kind.as_str() {
        "start_record" => respond(session.start_recording().map(|()| ApiResponse::ok())),
        "end_record" => {
            // Muxing waits on ffmpeg.
            match tokio::task::spawn_blocking(move || session.stop_recording()).await {
                Ok(Ok(path)) => ApiResponse::data(serde_json::json!({ "path": path })),
                Ok(Err(e)) => ApiResponse::error(e),
                Err(e) => ApiResponse::error(format!("recording stop panicked: {e}")),
            }
        }
        other => ApiResponse::error(format!("unknown record type {other:?}")),
    }
}

async fn is_speaking(State(state): State<AppState>, Json(req): Json<SessionRef>) -> Json<ApiResponse> {
    respond(
        state
            .registry
            .get(req.sessionid)
            .map(|s| ApiResponse::data(Value::Bool(s.is_speaking()))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::assets::tests::test_cycle;
    use crate::renderer::{LoadedModel, StaticRenderer};
    use crate::synth::tests::FakeSynth;

    fn state() -> AppState {
        let defaults = ServerDefaults {
            session: SessionConfig {
                batch_size: 2,
                stride_left: 1,
                stride_right: 1,
                queue_timeout: Duration::from_millis(20),
                realtime: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let cache = AssetCache::with_loader(|cfg: &ModelConfig| {
            let cycle = Arc::new(test_cycle(3));
            Ok(LoadedModel {
                model: cfg.model.clone(),
                avatar_id: cfg.avatar_id.clone(),
                renderer: Arc::new(StaticRenderer::new(cycle.clone())),
                cycle,
            })
        });
        Arc::new(ServerState::with_cache(
            defaults,
            Arc::new(FakeSynth::new(2, 320)),
            cache,
        ))
    }

    fn session_id(resp: &ApiResponse) -> u32 {
        resp.data.as_ref().unwrap()["sessionid"].as_u64().unwrap() as u32
    }

    #[tokio::test]
    async fn session_lifecycle() {
        let state = state();
        let Json(created) = create_session(State(state.clone()), None).await;
        assert_eq!(created.code, 0, "{}", created.msg);
        let id = session_id(&created);
        assert!((100_000..1_000_000).contains(&id));

        let Json(r) = human(
            State(state.clone()),
            Json(HumanRequest {
                sessionid: id,
                kind: "echo".into(),
                text: "hello".into(),
                interrupt: true,
                msgevent: None,
            }),
        )
        .await;
        assert_eq!(r.code, 0);

        let Json(r) = session_status(State(state.clone()), Path(id)).await;
        assert_eq!(r.data.unwrap()["sessionId"], id);

        let session = state.registry().get(id).unwrap();
        let cancel = session.cancel_flag();
        let Json(r) = delete_session(State(state.clone()), Path(id)).await;
        assert_eq!(r.code, 0);
        assert!(state.registry().is_empty());
        // The transport consumer watches the same flag as the stages.
        assert!(cancel.is_cancelled());
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn unknown_session_is_reported() {
        let state = state();
        let Json(r) = interrupt_talk(State(state.clone()), Json(SessionRef { sessionid: 42 })).await;
        assert_eq!(r.code, -1);
        assert!(r.msg.contains("42"));
        let Json(r) = is_speaking(State(state), Json(SessionRef { sessionid: 42 })).await;
        assert_eq!(r.code, -1);
    }

    #[tokio::test]
    async fn bad_requests_are_rejected() {
        let state = state();
        let Json(created) = create_session(
            State(state.clone()),
            Some(Json(CreateSessionRequest {
                fps: Some(33),
                ..Default::default()
            })),
        )
        .await;
        assert_eq!(created.code, -1);

        let Json(created) = create_session(State(state.clone()), None).await;
        let id = session_id(&created);
        let Json(r) = human(
            State(state.clone()),
            Json(HumanRequest {
                sessionid: id,
                kind: "chat".into(),
                text: "hi".into(),
                interrupt: false,
                msgevent: None,
            }),
        )
        .await;
        assert_eq!(r.code, -1);

        let Json(r) = set_audiotype(
            State(state.clone()),
            Json(AudiotypeRequest {
                sessionid: id,
                audiotype: 5,
                reinit: true,
            }),
        )
        .await;
        assert_eq!(r.code, -1);

        let Json(r) = human_audio(
            State(state.clone()),
            Query(SessionRef { sessionid: id }),
            Bytes::from_static(b"garbage"),
        )
        .await;
        assert_eq!(r.code, -1);

        let Json(r) = record(
            State(state.clone()),
            Json(RecordRequest {
                sessionid: id,
                kind: "end_record".into(),
            }),
        )
        .await;
        assert_eq!(r.code, -1);
        tokio::task::spawn_blocking(move || state.registry().clear())
            .await
            .unwrap();
    }

    #[test]
    fn response_omits_missing_data() {
        let Json(r) = ApiResponse::ok();
        assert_eq!(serde_json::to_string(&r).unwrap(), r#"{"code":0,"msg":"ok"}"#);
    }
}
