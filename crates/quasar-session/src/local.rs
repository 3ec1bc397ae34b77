//! Co-located session pairs.
//!
//! When both ends of a session live in the same process they skip the socket
//! entirely: each half's transfer handler hands frames straight to its twin
//! through the loop. The pair always runs in trusted mode since there is no
//! transport to lose.

use std::sync::Arc;

use crate::event_loop::LoopContext;
use crate::handshake::HandshakeMode;
use crate::pipeline::{Effect, Env};
use crate::protocol::{Endpoint, SessionId};
use crate::registry::RegistryError;
use crate::session::{Session, SessionConfig, SessionError, SessionHandle, SessionKey};
use crate::transfer::{Link, LocalLink};

impl<P: Send + 'static> LoopContext<P> {
    /// Open both halves of a session from `initiator` to `acceptor` in this loop.
    pub(crate) fn open_local_pair(
        &mut self,
        initiator: Endpoint,
        acceptor: Endpoint,
        config: SessionConfig,
    ) -> Result<(SessionHandle<P>, SessionHandle<P>), SessionError> {
        let config = Arc::new(SessionConfig {
            mode: HandshakeMode::Trusted,
            ..config
        });
        let session_id = SessionId::derive(&initiator, &acceptor, 0);
        let initiator_key = SessionKey::initiator(session_id.clone());
        let acceptor_key = SessionKey::acceptor(session_id);
        for key in [&initiator_key, &acceptor_key] {
            if self.registry.contains(key) || self.connecting.contains_key(key) {
                return Err(RegistryError::Duplicate(key.clone()).into());
            }
        }

        let id = self.next_transport_id();
        let mut effects = Vec::new();
        let initiator_handle = self.open_local_half(
            initiator_key.clone(),
            initiator.clone(),
            acceptor.clone(),
            LocalLink {
                id,
                twin: acceptor_key.clone(),
            },
            &config,
            &mut effects,
        )?;
        let acceptor_handle = self.open_local_half(
            acceptor_key.clone(),
            acceptor,
            initiator,
            LocalLink {
                id,
                twin: initiator_key.clone(),
            },
            &config,
            &mut effects,
        )?;
        tracing::info!("Opened local session pair {initiator_key} and {acceptor_key}");

        for key in [&initiator_key, &acceptor_key] {
            if let Some(more) = self.with_session(key, |session, env| session.fire_active(env)) {
                effects.extend(more);
            }
        }
        self.settle(effects);
        Ok((initiator_handle, acceptor_handle))
    }

    fn open_local_half(
        &mut self,
        key: SessionKey,
        local: Endpoint,
        remote: Endpoint,
        link: LocalLink,
        config: &Arc<SessionConfig>,
        effects: &mut Vec<Effect<P>>,
    ) -> Result<SessionHandle<P>, SessionError> {
        let mut session = Session::new(key, local, Arc::clone(config), None);
        let mut env = Env {
            token: &self.token,
            services: &self.services,
            effects,
        };
        session.install_chain(Link::Local(link), &mut env);
        session.activate(remote, env.token);
        let handle = session
            .handle(&self.services.handle)
            .ok_or_else(|| SessionError::NotActive(session.id().clone()))?;
        self.registry.register(session, &self.token)?;
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::codec::PostcardCodec;
    use crate::event_loop::{LoopConfig, SessionLoop};
    use crate::session::SessionState;
    use crate::support::AppEvent;

    use super::*;

    fn a() -> Endpoint {
        Endpoint::new("A", "gate")
    }

    fn b() -> Endpoint {
        Endpoint::new("B", "battle")
    }

    #[tokio::test]
    async fn test_local_pair_exchanges_messages_in_order() {
        let (session_loop, events) =
            SessionLoop::<String>::spawn(LoopConfig::default(), Arc::new(PostcardCodec)).unwrap();
        let (initiator, acceptor) = session_loop
            .handle()
            .connect_local(a(), b(), SessionConfig::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(initiator.session_id().as_str(), "A|B");
        assert_eq!(acceptor.remote_identity(), &a());

        for n in 0..3 {
            initiator.send(n.to_string()).unwrap();
        }
        initiator.flush().unwrap();

        let received: Vec<String> = tokio::task::spawn_blocking(move || {
            events
                .iter()
                .filter_map(|event| match event {
                    AppEvent::Message { key, payload } if key == SessionKey::acceptor(SessionId::new("A|B")) => {
                        Some(payload)
                    }
                    _ => None,
                })
                .take(3)
                .collect()
        })
        .await
        .unwrap();
        assert_eq!(received, vec!["0", "1", "2"]);
        tokio::task::spawn_blocking(move || session_loop.shutdown()).await.unwrap();
    }

    #[tokio::test]
    async fn test_closing_one_half_closes_both() {
        let (session_loop, _events) =
            SessionLoop::<String>::spawn(LoopConfig::default(), Arc::new(PostcardCodec)).unwrap();
        let handle = session_loop.handle().clone();
        let (initiator, acceptor) = handle
            .connect_local(a(), b(), SessionConfig::default())
            .await
            .unwrap()
            .unwrap();

        initiator.close().await.unwrap();
        let mut state = acceptor.subscribe();
        tokio::time::timeout(Duration::from_secs(1), state.wait_for(|s| *s == SessionState::Closed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle.lookup(&SessionId::new("A|B")).await, Ok(None));

        // Closing again is a no-op.
        acceptor.close().await.unwrap();
        tokio::task::spawn_blocking(move || session_loop.shutdown()).await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_pair_is_refused() {
        let (session_loop, _events) =
            SessionLoop::<String>::spawn(LoopConfig::default(), Arc::new(PostcardCodec)).unwrap();
        let handle = session_loop.handle().clone();
        handle.connect_local(a(), b(), SessionConfig::default()).await.unwrap().unwrap();
        let second = handle.connect_local(a(), b(), SessionConfig::default()).await.unwrap();
        assert!(matches!(second, Err(SessionError::Registry(RegistryError::Duplicate(_)))));
        tokio::task::spawn_blocking(move || session_loop.shutdown()).await.unwrap();
    }
}
