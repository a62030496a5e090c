//! Scripted in-memory prober and membership source for tests.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use super::checker::Prober;
use super::types::{DownloadSample, ProbeKind};
use crate::directory::{MembershipSource, Peer};
use crate::error::{DiscoveryError, ProbeError};

pub const SCRIPTED_PAYLOAD_BYTES: u64 = 1024;

/// Loopback peer on `port`
pub fn peer(name: &str, port: u16, zone: &str) -> Peer {
    Peer::new(name, SocketAddr::from((Ipv4Addr::LOCALHOST, port)), zone)
}

#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Fail(ProbeError),
    /// Never answers
    Hang,
    /// Answers successfully after the delay
    Delay(Duration),
}

#[derive(Debug, Clone)]
pub struct Call {
    pub peer: String,
    pub address: SocketAddr,
    pub kind: ProbeKind,
    pub at: Instant,
}

/// Prober whose answers are scripted per (peer, kind). Unscripted probes succeed.
#[derive(Default)]
pub struct ScriptedProber {
    behaviors: Mutex<HashMap<(String, ProbeKind), Behavior>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, peer: &str, kind: ProbeKind, behavior: Behavior) {
        self.behaviors.lock().unwrap().insert((peer.to_string(), kind), behavior);
    }

    pub fn calls(&self, peer: &str, kind: ProbeKind) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.peer == peer && c.kind == kind).count()
    }

    pub fn call_log(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_times(&self, peer: &str, kind: ProbeKind) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.peer == peer && c.kind == kind)
            .map(|c| c.at)
            .collect()
    }

    async fn answer(&self, peer: &Peer, kind: ProbeKind) -> Result<(), ProbeError> {
        self.calls.lock().unwrap().push(Call {
            peer: peer.name.clone(),
            address: peer.address,
            kind,
            at: Instant::now(),
        });

        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&(peer.name.clone(), kind))
            .cloned()
            .unwrap_or(Behavior::Succeed);

        match behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail(error) => Err(error),
            Behavior::Hang => std::future::pending().await,
            Behavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

#[async_trait::async_trait]
impl Prober for ScriptedProber {
    async fn ping(&self, peer: &Peer) -> Result<Duration, ProbeError> {
        self.answer(peer, ProbeKind::Ping).await?;
        Ok(Duration::from_millis(1))
    }

    async fn download(&self, peer: &Peer) -> Result<DownloadSample, ProbeError> {
        self.answer(peer, ProbeKind::Download).await?;
        Ok(DownloadSample { duration: Duration::from_millis(5), payload_bytes: SCRIPTED_PAYLOAD_BYTES })
    }
}

enum Answer {
    Peers(Vec<Peer>),
    Fail(DiscoveryError),
    Hang,
}

/// Membership source returning whatever the test last scripted
pub struct ScriptedMembership {
    answer: Mutex<Answer>,
    queries: AtomicUsize,
}

impl ScriptedMembership {
    pub fn new(peers: Vec<Peer>) -> Self {
        Self { answer: Mutex::new(Answer::Peers(peers)), queries: AtomicUsize::new(0) }
    }

    pub fn set_peers(&self, peers: Vec<Peer>) {
        *self.answer.lock().unwrap() = Answer::Peers(peers);
    }

    pub fn fail_with(&self, error: DiscoveryError) {
        *self.answer.lock().unwrap() = Answer::Fail(error);
    }

    pub fn hang(&self) {
        *self.answer.lock().unwrap() = Answer::Hang;
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl MembershipSource for ScriptedMembership {
    async fn list_peers(&self) -> Result<Vec<Peer>, DiscoveryError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let answer = match &*self.answer.lock().unwrap() {
            Answer::Peers(peers) => Some(Ok(peers.clone())),
            Answer::Fail(error) => Some(Err(error.clone())),
            Answer::Hang => None,
        };
        match answer {
            Some(answer) => answer,
            None => std::future::pending().await,
        }
    }
}
