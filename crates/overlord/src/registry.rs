//! The process-wide directory of live agents, simple-logcat producers, and
//! pending browser contexts.
//!
//! Every mutation goes through [`DashMap`]'s atomic entry/remove APIs so
//! that the two-step "check-then-insert" and "check-then-remove-and-return"
//! operations this registry relies on are actually indivisible, without a
//! single global lock serializing unrelated keys.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::WebSocket;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use overlord_protocol::Mode;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::Error;
use crate::monitor::MonitorSink;

pub type AgentId = String;
pub type ClientId = String;

/// Commands delivered to an [`crate::agent::AgentSession`]'s mailbox. This is
/// an in-process type, distinct from the wire-level
/// [`overlord_protocol::Frame`] the session relays to the real endpoint.
#[derive(Debug)]
pub enum AgentCommand {
    SpawnTerminal { cid: ClientId },
    SpawnLogcat { cid: ClientId, filename: String },
    ConnectLogcat { stream: WebSocket },
    Shell { command: String, reply: oneshot::Sender<Vec<u8>> },
    Terminate,
}

/// A cloneable reference to a live [`crate::agent::AgentSession`]'s mailbox,
/// stored in the registry in place of the session itself.
#[derive(Clone)]
pub struct AgentHandle {
    /// Empty for AGENT sessions.
    pub cid: ClientId,
    pub tx: mpsc::UnboundedSender<AgentCommand>,
    /// Set once a SLOGCAT session's stream has been attached via
    /// `ConnectLogcat`. Unused for other modes.
    pub attached: Arc<AtomicBool>,
}

impl AgentHandle {
    pub fn new(cid: ClientId, tx: mpsc::UnboundedSender<AgentCommand>) -> Self {
        Self {
            cid,
            tx,
            attached: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// The operator-side half of a PTY/LOGCAT rendezvous, awaiting its
/// agent-side counterpart in `pending`.
///
/// Does not hold the `WebSocket` itself: a watcher task owns it so it can
/// keep reading for a browser-initiated close while the context sits
/// parked. `claim` is that task's half of the handoff — sending it a reply
/// channel asks the watcher to stop watching and hand the socket back.
pub struct BrowserContext {
    pub sid: ClientId,
    claim: oneshot::Sender<oneshot::Sender<WebSocket>>,
}

impl BrowserContext {
    pub fn new(claim: oneshot::Sender<oneshot::Sender<WebSocket>>) -> Self {
        Self {
            sid: Uuid::new_v4().to_string(),
            claim,
        }
    }
}

/// Outcome of a successful [`Registry::register`] call.
pub enum Registered {
    /// AGENT or SLOGCAT: the session now lives in the registry.
    Joined,
    /// TERMINAL or LOGCAT: the matching pending browser socket, ready to
    /// splice.
    Paired(WebSocket),
}

#[derive(Serialize)]
pub struct AgentSummary {
    pub mid: String,
    pub cid: String,
}

#[derive(Serialize)]
pub struct SlogcatSummary {
    pub mid: String,
    pub cids: Vec<String>,
}

struct Inner {
    agents: DashMap<AgentId, AgentHandle>,
    simple_logcats: DashMap<AgentId, DashMap<ClientId, AgentHandle>>,
    pending: DashMap<ClientId, BrowserContext>,
    monitor: MonitorSink,
}

#[derive(Clone)]
pub struct Registry(Arc<Inner>);

impl Registry {
    pub fn new(monitor: MonitorSink) -> Self {
        Self(Arc::new(Inner {
            agents: DashMap::new(),
            simple_logcats: DashMap::new(),
            pending: DashMap::new(),
            monitor,
        }))
    }

    /// Registers a freshly handshaked session; the exact contract differs
    /// per mode, see each arm below.
    ///
    /// TERMINAL/LOGCAT awaits the pending context's watcher task handing
    /// the socket back over its claim channel; that await resolves
    /// immediately unless the watcher is mid-poll, and fails with
    /// `NoContext` if the operator had already disconnected.
    pub async fn register(
        &self,
        mode: Mode,
        mid: &str,
        cid: &str,
        handle: AgentHandle,
    ) -> Result<Registered, Error> {
        match mode {
            Mode::Agent => match self.0.agents.entry(mid.to_string()) {
                Entry::Occupied(_) => Err(Error::DuplicateAgent(mid.to_string())),
                Entry::Vacant(slot) => {
                    slot.insert(handle);
                    self.0.monitor.publish("agent joined", mid, "");
                    Ok(Registered::Joined)
                }
            },
            Mode::Terminal | Mode::Logcat => {
                let Some((_, ctx)) = self.0.pending.remove(cid) else {
                    return Err(Error::NoContext(cid.to_string()));
                };
                let (reply_tx, reply_rx) = oneshot::channel();
                if ctx.claim.send(reply_tx).is_err() {
                    // Watcher already gave up (operator socket closed) and
                    // reaped itself; nothing to pair with.
                    return Err(Error::NoContext(cid.to_string()));
                }
                reply_rx
                    .await
                    .map(Registered::Paired)
                    .map_err(|_| Error::NoContext(cid.to_string()))
            }
            Mode::Slogcat => {
                let inner = self
                    .0
                    .simple_logcats
                    .entry(mid.to_string())
                    .or_insert_with(DashMap::new);
                match inner.entry(cid.to_string()) {
                    Entry::Occupied(_) => Err(Error::DuplicateSlogcatClient(cid.to_string())),
                    Entry::Vacant(slot) => {
                        slot.insert(handle);
                        drop(inner);
                        self.0.monitor.publish("slogcat joined", mid, cid);
                        Ok(Registered::Joined)
                    }
                }
            }
        }
    }

    /// Unregisters a session on its way to TERMINATED. Called exactly once
    /// per session, regardless of whether `register` ever succeeded.
    pub fn unregister(&self, mode: Mode, mid: &str, cid: &str) {
        match mode {
            Mode::Agent => {
                if self.0.agents.remove(mid).is_some() {
                    self.0.monitor.publish("agent left", mid, "");
                }
            }
            Mode::Slogcat => {
                let removed = self
                    .0
                    .simple_logcats
                    .get(mid)
                    .map(|inner| inner.remove(cid).is_some())
                    .unwrap_or(false);
                if removed {
                    self.0.monitor.publish("slogcat left", mid, cid);
                }
                // Evaluated while holding the outer shard's lock, so a
                // concurrent registration landing between the lines above
                // and here is seen by the predicate and survives (I5).
                self.0
                    .simple_logcats
                    .remove_if(mid, |_, inner| inner.is_empty());
            }
            Mode::Terminal | Mode::Logcat => {
                // Covers abandonment: the operator disconnected before the
                // agent ever claimed this cid.
                self.0.pending.remove(cid);
            }
        }
    }

    pub fn add_browser_context(&self, ctx: BrowserContext) -> ClientId {
        let sid = ctx.sid.clone();
        self.0.pending.insert(sid.clone(), ctx);
        sid
    }

    /// Removes an abandoned pending context, e.g. when the frontend fails to
    /// hand the spawn command to the agent's mailbox after inserting it.
    pub fn remove_pending(&self, sid: &str) {
        self.0.pending.remove(sid);
    }

    pub fn lookup_agent(&self, mid: &str) -> Option<AgentHandle> {
        self.0.agents.get(mid).map(|e| e.clone())
    }

    pub fn lookup_slogcat(&self, mid: &str, cid: &str) -> Option<AgentHandle> {
        self.0.simple_logcats.get(mid)?.get(cid).map(|e| e.clone())
    }

    pub fn snapshot_agents(&self) -> Vec<AgentSummary> {
        self.0
            .agents
            .iter()
            .map(|e| AgentSummary {
                mid: e.key().clone(),
                cid: e.value().cid.clone(),
            })
            .collect()
    }

    pub fn snapshot_slogcats(&self) -> Vec<SlogcatSummary> {
        self.0
            .simple_logcats
            .iter()
            .map(|e| SlogcatSummary {
                mid: e.key().clone(),
                cids: e.value().iter().map(|c| c.key().clone()).collect(),
            })
            .collect()
    }

    pub fn agent_count(&self) -> usize {
        self.0.agents.len()
    }

    pub fn slogcat_count(&self) -> usize {
        self.0.simple_logcats.iter().map(|e| e.value().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (AgentHandle, mpsc::UnboundedReceiver<AgentCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (AgentHandle::new(String::new(), tx), rx)
    }

    #[tokio::test]
    async fn duplicate_agent_registration_fails() {
        let registry = Registry::new(MonitorSink::new());
        let (h1, _rx1) = handle();
        let (h2, _rx2) = handle();

        assert!(registry.register(Mode::Agent, "host-01", "", h1).await.is_ok());
        match registry.register(Mode::Agent, "host-01", "", h2).await {
            Err(Error::DuplicateAgent(mid)) => assert_eq!(mid, "host-01"),
            other => panic!("expected DuplicateAgent, got {other:?}"),
        }
        assert_eq!(registry.snapshot_agents().len(), 1);
    }

    /// Regression test for the incumbent-eviction bug: a failed duplicate
    /// registration must never reach `unregister`, so the caller that owns
    /// that lifecycle (the agent session loop) skips cleanup on `Err`. Here
    /// we pin down the registry half of that contract directly: the
    /// incumbent survives a rejected duplicate with no cleanup call at all.
    #[tokio::test]
    async fn duplicate_agent_registration_does_not_evict_incumbent() {
        let registry = Registry::new(MonitorSink::new());
        let (h1, _rx1) = handle();
        let (h2, _rx2) = handle();

        registry.register(Mode::Agent, "host-01", "", h1).await.unwrap();
        assert!(registry
            .register(Mode::Agent, "host-01", "", h2)
            .await
            .is_err());

        assert!(registry.lookup_agent("host-01").is_some());
        assert_eq!(registry.agent_count(), 1);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = Registry::new(MonitorSink::new());
        let (h1, _rx1) = handle();
        registry.register(Mode::Agent, "host-01", "", h1).await.unwrap();
        registry.unregister(Mode::Agent, "host-01", "");
        registry.unregister(Mode::Agent, "host-01", "");
        assert!(registry.snapshot_agents().is_empty());
    }

    #[tokio::test]
    async fn terminal_register_consumes_pending_context() {
        // Registering before a context exists fails with NoContext.
        let registry = Registry::new(MonitorSink::new());
        let (h, _rx) = handle();
        match registry.register(Mode::Terminal, "", "sid-1", h).await {
            Err(Error::NoContext(cid)) => assert_eq!(cid, "sid-1"),
            other => panic!("expected NoContext, got {other:?}"),
        }
    }

    /// If the watcher holding a pending context's socket has already given
    /// up (its claim sender dropped without ever being parked, e.g. the
    /// operator disconnected) registering against that cid must report
    /// `NoContext` rather than hang or panic.
    #[tokio::test]
    async fn terminal_register_reports_no_context_when_watcher_is_gone() {
        let registry = Registry::new(MonitorSink::new());
        let (claim_tx, claim_rx) = oneshot::channel();
        let sid = registry.add_browser_context(BrowserContext::new(claim_tx));
        drop(claim_rx); // watcher task gone without ever being claimed

        let (h, _rx) = handle();
        match registry.register(Mode::Terminal, "", &sid, h).await {
            Err(Error::NoContext(cid)) => assert_eq!(cid, sid),
            other => panic!("expected NoContext, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn slogcat_duplicate_client_fails_and_cleans_up_on_unregister() {
        let registry = Registry::new(MonitorSink::new());
        let (h1, _rx1) = handle();
        let (h2, _rx2) = handle();

        registry
            .register(Mode::Slogcat, "host-01", "c1", h1)
            .await
            .unwrap();
        match registry.register(Mode::Slogcat, "host-01", "c1", h2).await {
            Err(Error::DuplicateSlogcatClient(cid)) => assert_eq!(cid, "c1"),
            other => panic!("expected DuplicateSlogcatClient, got {other:?}"),
        }

        registry.unregister(Mode::Slogcat, "host-01", "c1");
        assert!(registry.snapshot_slogcats().is_empty());
    }

    #[tokio::test]
    async fn snapshot_never_sees_duplicate_mids() {
        let registry = Registry::new(MonitorSink::new());
        for i in 0..50 {
            let (h, _rx) = handle();
            registry
                .register(Mode::Agent, &format!("host-{i}"), "", h)
                .await
                .unwrap();
        }
        let snapshot = registry.snapshot_agents();
        let mut mids: Vec<_> = snapshot.iter().map(|a| a.mid.clone()).collect();
        mids.sort();
        mids.dedup();
        assert_eq!(mids.len(), 50);
    }
}
