//! ICE transport: the collaborator interface a call drives, plus a UDP
//! implementation with host/server-reflexive gathering and STUN checks.
//!
//! A transport initializes asynchronously after creation and reports
//! progress through an [`IceEventSink`]:
//! 1. `create` binds one socket per component and starts gathering
//! 2. `InitDone(ok)` once local candidates are known
//! 3. `start_ice` with the peer credentials and candidates runs checks
//! 4. `NegoDone(ok)` once every component has a working remote address

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use super::stun::{self, StunMessage, TransactionId};

/// How long a re-invite may wait for local candidates.
pub const ICE_INIT_TIMEOUT: Duration = Duration::from_secs(35);

/// Public STUN server for server-reflexive candidate gathering.
pub const DEFAULT_STUN_SERVER: &str = "stun.l.google.com:19302";

/// Per-attempt connectivity check timeout.
const CHECK_TIMEOUT: Duration = Duration::from_millis(500);

const CHECK_MAX_RETRIES: u32 = 3;

const SRFLX_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum IceError {
    #[error("ICE socket bind failed: {0}")]
    Bind(#[from] std::io::Error),

    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),

    #[error("transport must be created inside a tokio runtime")]
    NoRuntime,
}

/// Local or remote ICE credentials (`a=ice-ufrag` / `a=ice-pwd`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IceAttributes {
    pub ufrag: String,
    pub pwd: String,
}

impl IceAttributes {
    /// Random credentials: 4-char ufrag, 24-char hex password.
    ///
    /// Hex keeps the password free of characters some SDP parsers reject.
    pub fn generate() -> Self {
        Self {
            ufrag: random_hex(2),
            pwd: random_hex(12),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ufrag.is_empty() || self.pwd.is_empty()
    }
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    if getrandom::getrandom(&mut bytes).is_err() {
        bytes.copy_from_slice(&uuid::Uuid::new_v4().as_bytes()[..len]);
    }
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    Relay,
}

impl CandidateType {
    fn as_str(self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::Relay => "relay",
        }
    }

    /// RFC 8445 §5.1.2.2 recommended type preference.
    fn preference(self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relay => 0,
        }
    }
}

/// One `a=candidate` value (UDP only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub foundation: String,
    pub component: u16,
    pub priority: u32,
    pub addr: SocketAddr,
    pub candidate_type: CandidateType,
    /// raddr/rport for srflx and relay candidates.
    pub related: Option<SocketAddr>,
}

impl IceCandidate {
    fn new(foundation: &str, component: u16, addr: SocketAddr, kind: CandidateType) -> Self {
        Self {
            foundation: foundation.to_string(),
            component,
            priority: compute_priority(kind, 65535, component),
            addr,
            candidate_type: kind,
            related: None,
        }
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} UDP {} {} {} typ {}",
            self.foundation,
            self.component,
            self.priority,
            self.addr.ip(),
            self.addr.port(),
            self.candidate_type.as_str()
        )?;
        if let Some(rel) = self.related {
            write!(f, " raddr {} rport {}", rel.ip(), rel.port())?;
        }
        Ok(())
    }
}

impl FromStr for IceCandidate {
    type Err = IceError;

    /// Accepts the attribute value with or without the `candidate:` prefix.
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let bad = || IceError::InvalidCandidate(line.to_string());
        let content = line.trim();
        let content = content.strip_prefix("a=").unwrap_or(content);
        let content = content.strip_prefix("candidate:").unwrap_or(content);

        let parts: Vec<&str> = content.split_whitespace().collect();
        if parts.len() < 8 || parts[6] != "typ" {
            return Err(bad());
        }
        if !parts[2].eq_ignore_ascii_case("udp") {
            return Err(bad());
        }
        let ip: IpAddr = parts[4].parse().map_err(|_| bad())?;
        let port: u16 = parts[5].parse().map_err(|_| bad())?;
        let candidate_type = match parts[7] {
            "host" => CandidateType::Host,
            "srflx" | "prflx" => CandidateType::ServerReflexive,
            "relay" => CandidateType::Relay,
            _ => return Err(bad()),
        };

        let mut raddr: Option<IpAddr> = None;
        let mut rport: Option<u16> = None;
        for pair in parts[8..].chunks(2) {
            match pair {
                ["raddr", v] => raddr = v.parse().ok(),
                ["rport", v] => rport = v.parse().ok(),
                _ => {}
            }
        }

        Ok(Self {
            foundation: parts[0].to_string(),
            component: parts[1].parse().map_err(|_| bad())?,
            priority: parts[3].parse().map_err(|_| bad())?,
            addr: SocketAddr::new(ip, port),
            candidate_type,
            related: raddr.zip(rport).map(|(ip, port)| SocketAddr::new(ip, port)),
        })
    }
}

/// Candidate priority per RFC 8445 §5.1.2.1.
pub fn compute_priority(kind: CandidateType, local_preference: u16, component: u16) -> u32 {
    (kind.preference() << 24)
        | (u32::from(local_preference) << 8)
        | (256 - u32::from(component.min(256)))
}

/// Asynchronous progress reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceEvent {
    InitDone(bool),
    NegoDone(bool),
}

pub type IceEventSink = Arc<dyn Fn(IceEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct IceTransportOptions {
    /// Two per media: RTP then RTCP.
    pub component_count: usize,
    /// Controlling agent.
    pub master: bool,
    pub bind_address: IpAddr,
    pub stun_server: Option<String>,
}

impl Default for IceTransportOptions {
    fn default() -> Self {
        Self {
            component_count: 2,
            master: true,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            stun_server: None,
        }
    }
}

/// What a call needs from an ICE session.
#[async_trait]
pub trait IceTransport: Send + Sync {
    fn name(&self) -> &str;
    fn is_initialized(&self) -> bool;
    fn is_started(&self) -> bool;
    fn is_running(&self) -> bool;
    fn is_failed(&self) -> bool;
    fn component_count(&self) -> usize;

    /// Wait until gathering finished. Returns `is_initialized()`.
    async fn wait_for_initialization(&self, timeout: Duration) -> bool;

    fn local_attributes(&self) -> IceAttributes;
    fn local_candidates(&self, component: u16) -> Vec<IceCandidate>;

    /// Start connectivity checks. Returns `false` if they cannot start.
    fn start_ice(&self, remote: &IceAttributes, candidates: Vec<IceCandidate>) -> bool;

    /// Selected remote address of a component once running.
    fn remote_address(&self, component: u16) -> Option<SocketAddr>;
    fn local_address(&self, component: u16) -> Option<SocketAddr>;

    async fn shutdown(&self);
}

pub trait IceTransportFactory: Send + Sync {
    fn create(
        &self,
        name: &str,
        options: IceTransportOptions,
        sink: IceEventSink,
    ) -> Result<Arc<dyn IceTransport>, IceError>;
}

/// Creates [`UdpIceTransport`]s.
#[derive(Debug, Default, Clone)]
pub struct UdpIceTransportFactory;

impl IceTransportFactory for UdpIceTransportFactory {
    fn create(
        &self,
        name: &str,
        options: IceTransportOptions,
        sink: IceEventSink,
    ) -> Result<Arc<dyn IceTransport>, IceError> {
        let transport = UdpIceTransport::spawn(name, options, sink)?;
        Ok(Arc::new(transport))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IceState {
    Gathering,
    Ready,
    Checking,
    Running,
    Failed,
    Shutdown,
}

struct Component {
    socket: Arc<UdpSocket>,
    candidates: Vec<IceCandidate>,
    remote: Option<SocketAddr>,
}

struct Inner {
    name: String,
    options: IceTransportOptions,
    local: IceAttributes,
    tie_breaker: u64,
    sink: IceEventSink,
    state: watch::Sender<IceState>,
    initialized: AtomicBool,
    started: AtomicBool,
    components: RwLock<Vec<Component>>,
    pending: Mutex<HashMap<TransactionId, oneshot::Sender<SocketAddr>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn set_state(&self, state: IceState) {
        self.state.send_replace(state);
    }

    fn state(&self) -> IceState {
        *self.state.borrow()
    }
}

/// ICE over plain UDP sockets, one per component.
pub struct UdpIceTransport {
    inner: Arc<Inner>,
}

impl UdpIceTransport {
    pub fn spawn(
        name: &str,
        options: IceTransportOptions,
        sink: IceEventSink,
    ) -> Result<Self, IceError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| IceError::NoRuntime)?;
        let (state, _) = watch::channel(IceState::Gathering);
        let mut tb = [0u8; 8];
        let _ = getrandom::getrandom(&mut tb);

        let inner = Arc::new(Inner {
            name: name.to_string(),
            options,
            local: IceAttributes::generate(),
            tie_breaker: u64::from_be_bytes(tb),
            sink,
            state,
            initialized: AtomicBool::new(false),
            started: AtomicBool::new(false),
            components: RwLock::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        });

        let init = runtime.spawn(initialize(inner.clone()));
        inner.tasks.lock().push(init);
        Ok(Self { inner })
    }
}

async fn initialize(inner: Arc<Inner>) {
    match gather(&inner).await {
        Ok(components) => {
            let sockets: Vec<Arc<UdpSocket>> =
                components.iter().map(|c| c.socket.clone()).collect();
            *inner.components.write() = components;
            for (idx, socket) in sockets.into_iter().enumerate() {
                let pump = tokio::spawn(pump(inner.clone(), idx, socket));
                inner.tasks.lock().push(pump);
            }
            inner.initialized.store(true, Ordering::SeqCst);
            inner.set_state(IceState::Ready);
            tracing::debug!("[ice:{}] initialized", inner.name);
            (inner.sink)(IceEvent::InitDone(true));
        }
        Err(e) => {
            tracing::error!("[ice:{}] initialization failed: {}", inner.name, e);
            inner.set_state(IceState::Failed);
            (inner.sink)(IceEvent::InitDone(false));
        }
    }
}

async fn gather(inner: &Inner) -> Result<Vec<Component>, IceError> {
    let mut components = Vec::with_capacity(inner.options.component_count);
    for idx in 0..inner.options.component_count {
        let comp_id = idx as u16 + 1;
        let socket = UdpSocket::bind(SocketAddr::new(inner.options.bind_address, 0)).await?;
        let local = socket.local_addr()?;

        let mut candidates: Vec<IceCandidate> = host_addresses(local)
            .into_iter()
            .map(|addr| IceCandidate::new("1", comp_id, addr, CandidateType::Host))
            .collect();

        if let Some(server) = &inner.options.stun_server {
            if let Some(mapped) = query_srflx(&socket, server).await {
                let mut srflx =
                    IceCandidate::new("2", comp_id, mapped, CandidateType::ServerReflexive);
                srflx.related = Some(local);
                candidates.push(srflx);
            }
        }

        components.push(Component {
            socket: Arc::new(socket),
            candidates,
            remote: None,
        });
    }
    Ok(components)
}

/// Host addresses for a bound socket. An unspecified bind uses the address
/// of the default route.
fn host_addresses(local: SocketAddr) -> Vec<SocketAddr> {
    if !local.ip().is_unspecified() {
        return vec![local];
    }
    let outbound = std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| s.connect("8.8.8.8:80").map(|_| s))
        .and_then(|s| s.local_addr())
        .map(|a| a.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    vec![SocketAddr::new(outbound, local.port())]
}

/// Server-reflexive address of `socket` as seen by a STUN server.
async fn query_srflx(socket: &UdpSocket, server: &str) -> Option<SocketAddr> {
    let server_addr = match tokio::net::lookup_host(server).await {
        Ok(mut addrs) => addrs.next()?,
        Err(e) => {
            tracing::debug!("Failed to resolve STUN server {}: {}", server, e);
            return None;
        }
    };
    let txn = stun::new_transaction_id();
    let request = StunMessage::new(stun::BINDING_REQUEST, txn).encode(None);

    for attempt in 0..2 {
        if socket.send_to(&request, server_addr).await.is_err() {
            return None;
        }
        let mut buf = [0u8; 512];
        match tokio::time::timeout(SRFLX_TIMEOUT, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => {
                let reply = StunMessage::decode(&buf[..len]);
                if let Some(msg) = reply.filter(|m| m.is_success() && m.transaction_id == txn) {
                    return msg.mapped_address();
                }
            }
            Ok(Err(e)) => tracing::debug!("STUN recv error (attempt {}): {}", attempt, e),
            Err(_) => tracing::debug!("STUN timeout (attempt {})", attempt),
        }
    }
    None
}

/// Receive loop of one component: answers peer checks and completes ours.
async fn pump(inner: Arc<Inner>, idx: usize, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; 1500];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("[ice:{}] comp {} recv error: {}", inner.name, idx + 1, e);
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        let data = &buf[..len];
        let Some(msg) = StunMessage::decode(data) else {
            // Media is not carried by this transport
            continue;
        };

        if msg.is_request() {
            let expected = format!("{}:", inner.local.ufrag);
            if !msg.username().is_some_and(|u| u.starts_with(&expected)) {
                tracing::debug!("[ice:{}] check from {} with foreign username", inner.name, from);
                continue;
            }
            if !stun::verify_integrity(data, inner.local.pwd.as_bytes()) {
                tracing::debug!("[ice:{}] check from {} failed integrity", inner.name, from);
                continue;
            }
            let reply = StunMessage::binding_success(msg.transaction_id, from)
                .encode(Some(inner.local.pwd.as_bytes()));
            if let Err(e) = socket.send_to(&reply, from).await {
                tracing::debug!("[ice:{}] failed to answer {}: {}", inner.name, from, e);
            }
        } else if msg.is_success() {
            if let Some(waiter) = inner.pending.lock().remove(&msg.transaction_id) {
                let _ = waiter.send(from);
            }
        }
    }
}

async fn run_checks(inner: Arc<Inner>, remote: IceAttributes, candidates: Vec<IceCandidate>) {
    let count = inner.components.read().len();
    let username = format!("{}:{}", remote.ufrag, inner.local.ufrag);
    let mut connected = 0;

    for idx in 0..count {
        let comp_id = idx as u16 + 1;
        let socket = match inner.components.read().get(idx) {
            Some(c) => c.socket.clone(),
            None => break,
        };
        let mut targets: Vec<&IceCandidate> =
            candidates.iter().filter(|c| c.component == comp_id).collect();
        if targets.is_empty() {
            // Media rejected by one side, nothing to check
            tracing::debug!("[ice:{}] component {} has no remote candidate", inner.name, comp_id);
            continue;
        }
        targets.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut selected = None;
        'targets: for target in targets {
            for attempt in 0..CHECK_MAX_RETRIES {
                if inner.state() == IceState::Shutdown {
                    return;
                }
                let txn = stun::new_transaction_id();
                let (tx, rx) = oneshot::channel();
                inner.pending.lock().insert(txn, tx);
                let request = StunMessage::binding_request(
                    txn,
                    &username,
                    compute_priority(CandidateType::Host, 65535, comp_id),
                    inner.options.master,
                    inner.tie_breaker,
                )
                .encode(Some(remote.pwd.as_bytes()));

                if let Err(e) = socket.send_to(&request, target.addr).await {
                    tracing::debug!("[ice:{}] send to {} failed: {}", inner.name, target.addr, e);
                    inner.pending.lock().remove(&txn);
                    continue 'targets;
                }
                match tokio::time::timeout(CHECK_TIMEOUT, rx).await {
                    Ok(Ok(_)) => {
                        selected = Some(target.addr);
                        break 'targets;
                    }
                    _ => {
                        inner.pending.lock().remove(&txn);
                        tracing::trace!(
                            "[ice:{}] check #{} to {} timed out",
                            inner.name,
                            attempt + 1,
                            target.addr
                        );
                    }
                }
            }
        }

        match selected {
            Some(addr) => {
                tracing::debug!("[ice:{}] component {} -> {}", inner.name, comp_id, addr);
                if let Some(c) = inner.components.write().get_mut(idx) {
                    c.remote = Some(addr);
                }
                connected += 1;
            }
            None => {
                tracing::warn!("[ice:{}] component {} has no valid pair", inner.name, comp_id);
                inner.set_state(IceState::Failed);
                (inner.sink)(IceEvent::NegoDone(false));
                return;
            }
        }
    }

    if connected == 0 {
        tracing::warn!("[ice:{}] no component to connect", inner.name);
        inner.set_state(IceState::Failed);
        (inner.sink)(IceEvent::NegoDone(false));
        return;
    }

    inner.set_state(IceState::Running);
    tracing::info!("[ice:{}] negotiation succeeded", inner.name);
    (inner.sink)(IceEvent::NegoDone(true));
}

#[async_trait]
impl IceTransport for UdpIceTransport {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    fn is_running(&self) -> bool {
        self.inner.state() == IceState::Running
    }

    fn is_failed(&self) -> bool {
        self.inner.state() == IceState::Failed
    }

    fn component_count(&self) -> usize {
        self.inner.options.component_count
    }

    async fn wait_for_initialization(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.state.subscribe();
        let settled = async {
            loop {
                if *rx.borrow_and_update() != IceState::Gathering {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(timeout, settled).await.is_err() {
            tracing::warn!("[ice:{}] initialization timed out", self.inner.name);
        }
        self.is_initialized()
    }

    fn local_attributes(&self) -> IceAttributes {
        self.inner.local.clone()
    }

    fn local_candidates(&self, component: u16) -> Vec<IceCandidate> {
        let idx = usize::from(component).saturating_sub(1);
        self.inner
            .components
            .read()
            .get(idx)
            .map(|c| c.candidates.clone())
            .unwrap_or_default()
    }

    fn start_ice(&self, remote: &IceAttributes, candidates: Vec<IceCandidate>) -> bool {
        if !self.is_initialized() || remote.is_empty() {
            return false;
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return true;
        }
        self.inner.set_state(IceState::Checking);
        tracing::info!(
            "[ice:{}] starting checks ({} remote candidates)",
            self.inner.name,
            candidates.len()
        );
        let task = tokio::spawn(run_checks(self.inner.clone(), remote.clone(), candidates));
        self.inner.tasks.lock().push(task);
        true
    }

    fn remote_address(&self, component: u16) -> Option<SocketAddr> {
        let idx = usize::from(component).saturating_sub(1);
        self.inner.components.read().get(idx).and_then(|c| c.remote)
    }

    fn local_address(&self, component: u16) -> Option<SocketAddr> {
        let idx = usize::from(component).saturating_sub(1);
        self.inner
            .components
            .read()
            .get(idx)
            .and_then(|c| c.socket.local_addr().ok())
    }

    async fn shutdown(&self) {
        self.inner.set_state(IceState::Shutdown);
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.pending.lock().clear();
        tracing::debug!("[ice:{}] shut down", self.inner.name);
    }
}

impl Drop for UdpIceTransport {
    fn drop(&mut self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_parse_host_candidate() {
        let c: IceCandidate = "a=candidate:1 1 UDP 2130706431 10.0.0.1 21730 typ host"
            .parse()
            .unwrap();
        assert_eq!(c.foundation, "1");
        assert_eq!(c.component, 1);
        assert_eq!(c.priority, 2130706431);
        assert_eq!(c.addr, "10.0.0.1:21730".parse().unwrap());
        assert_eq!(c.candidate_type, CandidateType::Host);
        assert!(c.related.is_none());
    }

    #[test]
    fn test_parse_srflx_candidate_roundtrip() {
        let line = "6 2 UDP 1694234111 203.0.113.1 11632 typ srflx raddr 10.0.0.1 rport 11633";
        let c: IceCandidate = line.parse().unwrap();
        assert_eq!(c.candidate_type, CandidateType::ServerReflexive);
        assert_eq!(c.related, Some("10.0.0.1:11633".parse().unwrap()));
        assert_eq!(c.to_string(), line);
    }

    #[test]
    fn test_reject_tcp_and_garbage() {
        assert!("1 1 TCP 1 10.0.0.1 9 typ host".parse::<IceCandidate>().is_err());
        assert!("1 1 UDP 1 10.0.0.1".parse::<IceCandidate>().is_err());
        assert!("1 1 UDP 1 notanip 9 typ host".parse::<IceCandidate>().is_err());
    }

    #[test]
    fn test_compute_priority() {
        let host = compute_priority(CandidateType::Host, 65535, 1);
        let srflx = compute_priority(CandidateType::ServerReflexive, 65535, 1);
        let relay = compute_priority(CandidateType::Relay, 65535, 1);
        assert!(host > srflx);
        assert!(srflx > relay);
        assert!(
            compute_priority(CandidateType::Host, 65535, 1)
                > compute_priority(CandidateType::Host, 65535, 2)
        );
    }

    #[test]
    fn test_generated_credentials() {
        let a = IceAttributes::generate();
        assert_eq!(a.ufrag.len(), 4);
        assert_eq!(a.pwd.len(), 24);
        assert!(a.pwd.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!a.is_empty());
        assert!(IceAttributes::default().is_empty());
    }

    fn loopback_options(master: bool) -> IceTransportOptions {
        IceTransportOptions {
            component_count: 2,
            master,
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            stun_server: None,
        }
    }

    fn channel_sink() -> (IceEventSink, mpsc::UnboundedReceiver<IceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink: IceEventSink = Arc::new(move |ev| {
            let _ = tx.send(ev);
        });
        (sink, rx)
    }

    #[tokio::test]
    async fn test_loopback_negotiation() {
        let (sink_a, mut ev_a) = channel_sink();
        let (sink_b, mut ev_b) = channel_sink();
        let a = UdpIceTransport::spawn("a", loopback_options(true), sink_a).unwrap();
        let b = UdpIceTransport::spawn("b", loopback_options(false), sink_b).unwrap();

        assert!(a.wait_for_initialization(Duration::from_secs(5)).await);
        assert!(b.wait_for_initialization(Duration::from_secs(5)).await);
        assert_eq!(ev_a.recv().await, Some(IceEvent::InitDone(true)));
        assert_eq!(ev_b.recv().await, Some(IceEvent::InitDone(true)));

        let cands_a: Vec<IceCandidate> = (1..=2).flat_map(|c| a.local_candidates(c)).collect();
        let cands_b: Vec<IceCandidate> = (1..=2).flat_map(|c| b.local_candidates(c)).collect();
        assert_eq!(cands_a.len(), 2);

        assert!(a.start_ice(&b.local_attributes(), cands_b));
        assert!(b.start_ice(&a.local_attributes(), cands_a));

        let done_a = tokio::time::timeout(Duration::from_secs(5), ev_a.recv()).await.unwrap();
        let done_b = tokio::time::timeout(Duration::from_secs(5), ev_b.recv()).await.unwrap();
        assert_eq!(done_a, Some(IceEvent::NegoDone(true)));
        assert_eq!(done_b, Some(IceEvent::NegoDone(true)));
        assert!(a.is_running());
        assert_eq!(a.remote_address(1), b.local_address(1));
        assert_eq!(b.remote_address(2), a.local_address(2));

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_wrong_password_fails() {
        let (sink_a, mut ev_a) = channel_sink();
        let (sink_b, _ev_b) = channel_sink();
        let mut opts = loopback_options(true);
        opts.component_count = 1;
        let a = UdpIceTransport::spawn("a", opts.clone(), sink_a).unwrap();
        let b = UdpIceTransport::spawn("b", opts, sink_b).unwrap();
        assert!(a.wait_for_initialization(Duration::from_secs(5)).await);
        assert!(b.wait_for_initialization(Duration::from_secs(5)).await);
        let _ = ev_a.recv().await;

        let mut wrong = b.local_attributes();
        wrong.pwd = "0000000000000000000000".into();
        assert!(a.start_ice(&wrong, b.local_candidates(1)));
        let done = tokio::time::timeout(Duration::from_secs(5), ev_a.recv()).await.unwrap();
        assert_eq!(done, Some(IceEvent::NegoDone(false)));
        assert!(a.is_failed());
    }

    #[tokio::test]
    async fn test_start_without_credentials_refused() {
        let (sink, _rx) = channel_sink();
        let t = UdpIceTransport::spawn("t", loopback_options(true), sink).unwrap();
        assert!(!t.start_ice(&IceAttributes::default(), Vec::new()));
        t.shutdown().await;
    }
}
