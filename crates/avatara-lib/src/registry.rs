//! Live sessions by id.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard};

use rand::Rng;
use tracing::{info, warn};

use crate::error::SessionError;
use crate::session::{OnClose, Session};

const ID_RANGE: Range<u32> = 100_000..1_000_000;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<u32, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pick a fresh six-digit id, build the session for it and register it,
    /// all under one lock.
    pub fn insert_new(
        &self,
        build: impl FnOnce(u32) -> Result<Session, SessionError>,
    ) -> Result<Arc<Session>, SessionError> {
        let mut sessions = self.lock();
        let mut rng = rand::thread_rng();
        let id = loop {
            let id = rng.gen_range(ID_RANGE);
            if !sessions.contains_key(&id) {
                break id;
            }
        };
        let session = Arc::new(build(id)?);
        sessions.insert(id, session.clone());
        info!("session {id} registered");
        Ok(session)
    }

    /// Close hook that unregisters and shuts down the session. The teardown
    /// runs on its own thread, off the stage thread that fires the hook.
    pub fn deregister_on_close(self: &Arc<Self>) -> OnClose {
        let registry = Arc::downgrade(self);
        Box::new(move |id| {
            let spawned = std::thread::Builder::new()
                .name(format!("avatara-reap-{id}"))
                .spawn(move || {
                    if let Some(registry) = registry.upgrade() {
                        let _ = registry.remove(id);
                    }
                });
            if let Err(e) = spawned {
                warn!("session {id}: cannot spawn teardown: {e}");
            }
        })
    }

    pub fn get(&self, id: u32) -> Result<Arc<Session>, SessionError> {
        self.lock().get(&id).cloned().ok_or(SessionError::NotFound(id))
    }

    /// Unregister and shut the session down.
    pub fn remove(&self, id: u32) -> Result<(), SessionError> {
        let session = self.lock().remove(&id).ok_or(SessionError::NotFound(id))?;
        session.shutdown();
        info!("session {id} removed");
        Ok(())
    }

    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Shut down every session.
    pub fn clear(&self) {
        let sessions: Vec<Arc<Session>> = self.lock().drain().map(|(_, s)| s).collect();
        for s in sessions {
            s.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::{Duration, Instant};

    use avatara_core::types::SessionConfig;

    use crate::assets::tests::test_cycle;
    use crate::features::MelExtractor;
    use crate::renderer::{LoadedModel, StaticRenderer};
    use crate::session::SessionParts;
    use crate::synth::tests::FakeSynth;
    use crate::transport::{ChannelTransport, FrameReceiver};

    fn session(id: u32, on_close: Option<OnClose>) -> (Session, FrameReceiver) {
        let cycle = Arc::new(test_cycle(3));
        let (transport, rx) = ChannelTransport::new(8);
        let session = Session::start(
            id,
            SessionConfig {
                batch_size: 1,
                stride_left: 0,
                stride_right: 0,
                queue_timeout: Duration::from_millis(10),
                realtime: false,
                ..Default::default()
            },
            SessionParts {
                model: Arc::new(LoadedModel {
                    model: "static".into(),
                    avatar_id: "t".into(),
                    cycle: cycle.clone(),
                    renderer: Arc::new(StaticRenderer::new(cycle)),
                }),
                extractor: Arc::new(MelExtractor::new()),
                clips: Vec::new(),
                synth: Arc::new(FakeSynth::new(1, 320)),
                sink: Arc::new(transport),
                on_close,
            },
        )
        .unwrap();
        (session, rx)
    }

    #[test]
    fn ids_are_six_digits_and_distinct() {
        let reg = SessionRegistry::new();
        let mut receivers = Vec::new();
        for _ in 0..10 {
            let s = reg
                .insert_new(|id| {
                    let (s, rx) = session(id, None);
                    receivers.push(rx);
                    Ok(s)
                })
                .unwrap();
            assert!(ID_RANGE.contains(&s.id()));
        }
        let ids: HashSet<u32> = reg.ids().into_iter().collect();
        assert_eq!(ids.len(), 10);
        reg.clear();
    }

    #[test]
    fn concurrent_creates_never_share_an_id() {
        let reg = Arc::new(SessionRegistry::new());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    let mut receivers = Vec::new();
                    for _ in 0..5 {
                        reg.insert_new(|id| {
                            let (s, rx) = session(id, None);
                            receivers.push(rx);
                            Ok(s)
                        })
                        .unwrap();
                    }
                    receivers
                })
            })
            .collect();
        let receivers: Vec<FrameReceiver> = workers.into_iter().flat_map(|w| w.join().unwrap()).collect();
        assert_eq!(receivers.len(), 20);
        assert_eq!(reg.len(), 20);
        reg.clear();
    }

    #[test]
    fn failed_build_registers_nothing() {
        let reg = SessionRegistry::new();
        let result = reg.insert_new(|_| Err(SessionError::Closed));
        assert!(matches!(result, Err(SessionError::Closed)));
        assert!(reg.is_empty());
    }

    #[test]
    fn get_and_remove() {
        let reg = SessionRegistry::new();
        let mut receivers = Vec::new();
        let id = reg
            .insert_new(|id| {
                let (s, r) = session(id, None);
                receivers.push(r);
                Ok(s)
            })
            .unwrap()
            .id();
        assert_eq!(reg.get(id).unwrap().id(), id);
        assert!(matches!(reg.get(1), Err(SessionError::NotFound(1))));
        reg.remove(id).unwrap();
        assert!(reg.is_empty());
        assert!(matches!(reg.remove(id), Err(SessionError::NotFound(_))));
    }

    #[test]
    fn removed_session_is_shut_down() {
        let reg = SessionRegistry::new();
        let mut receivers = Vec::new();
        let s = reg
            .insert_new(|id| {
                let (s, r) = session(id, None);
                receivers.push(r);
                Ok(s)
            })
            .unwrap();
        reg.remove(s.id()).unwrap();
        assert!(matches!(s.put_text("x", None), Err(SessionError::Closed)));
    }

    #[test]
    fn closed_transport_unregisters_session() {
        let reg = Arc::new(SessionRegistry::new());
        let hook = reg.deregister_on_close();
        let s = reg
            .insert_new(|id| {
                let (s, rx) = session(id, Some(hook));
                drop(rx);
                Ok(s)
            })
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !reg.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(reg.is_empty());
        assert!(s.is_closed());
    }
}
