//! IKE SA and its command queue
//!
//! An [`IkeSa`] is driven exclusively through [`Command`]s. Commands are
//! pushed by any thread (the directory, the dispatcher, timers) and
//! processed one at a time by [`IkeSa::process_command`], so negotiation
//! logic of one SA never races against itself.
//!
//! # Locks
//!
//! - `worker` holds the negotiation state. A command checks it out, runs
//!   with no lock held and checks it back in; a thread finding it checked
//!   out leaves the queue to the holder.
//! - `queue`, `cipher` and `status` are only held for a single read or
//!   update and never while taking another lock.
//!
//! # Exchanges
//!
//! ```text
//! initiator                                   responder
//! IKE_SA_INIT  SA, Ni               ───►
//!                                   ◄───      SA, Nr            (or N(COOKIE))
//! IKE_AUTH     IDi, AUTH, SA(child) ───►
//!                                   ◄───      IDr, AUTH, SA(child)
//! ```
//!
//! Key exchange is not performed here. Once keys exist, the owner installs
//! a [`CipherSuite`] with [`IkeSa::install_cipher_suite`] and every later
//! message is carried in an Encrypted payload.

use crate::ipsec::child_sa::{ChildSa, ChildSaRegistry, ChildSaSnapshot, ChildSaState, SaLifetime};
pub use crate::ipsec::child_sa::{IpsecMode, IpsecProtocol};
use crate::ipsec::context::EngineContext;
use crate::ipsec::crypto::{CipherSuite, PrfAlgorithm};
use crate::ipsec::ikev2::{
    AuthPayload, DeletePayload, ExchangeType, IdPayload, Identity, IkeFlags, IkeHeader,
    IkeMessage, IkePayload, IkeSaState, NoncePayload, NotifyPayload, NotifyType, PayloadCodec,
    Proposal, ProtocolId, SaPayload, StateMachine, select_proposal,
};
use crate::ipsec::logging;
use crate::ipsec::policy::{Authenticator, PeerConfiguration, Role};
use crate::ipsec::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use rand::RngCore;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

/// Length of locally generated nonces
const NONCE_SIZE: usize = 32;

/// Scheduled timer kinds delivered as [`Command::Timeout`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    /// Outstanding request not answered in time
    Retransmit,
    /// IKE SA lifetime reached
    Rekey,
    /// Nothing heard from the peer for a while
    Idle,
    /// Negotiation took too long
    HalfOpenExpiry,
}

/// Parameters of a requested Child SA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSaRequest {
    /// ESP or AH
    pub protocol: IpsecProtocol,
    /// Tunnel or transport
    pub mode: IpsecMode,
    /// Overrides the policy lifetime
    pub lifetime: Option<SaLifetime>,
}

impl ChildSaRequest {
    /// Request with the policy lifetime
    pub fn new(protocol: IpsecProtocol, mode: IpsecMode) -> Self {
        ChildSaRequest {
            protocol,
            mode,
            lifetime: None,
        }
    }

    /// Override the lifetime
    pub fn with_lifetime(mut self, lifetime: SaLifetime) -> Self {
        self.lifetime = Some(lifetime);
        self
    }
}

/// Care-of address substitution for mobile peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MobilityContext {
    /// Current address of the mobile node
    pub care_of_address: IpAddr,
    /// We are the home agent: the peer is the mobile node, reached at
    /// its care-of address. Otherwise we are the mobile node.
    pub is_home_agent: bool,
}

/// A decoded datagram handed to its IKE SA
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Decoded message, Encrypted payload still sealed
    pub message: IkeMessage,
    /// Raw datagram, needed for integrity checks and AUTH
    pub datagram: Bytes,
    /// Sender address
    pub source: IpAddr,
}

/// Work item for one IKE SA
#[derive(Debug, Clone)]
pub enum Command {
    /// Message received from the peer
    Inbound(Box<InboundMessage>),
    /// Negotiate a new Child SA
    CreateChildSa(ChildSaRequest),
    /// Install a Child SA created elsewhere
    ChildSaEstablished(ChildSa),
    /// Delete a Child SA and tell the peer
    DeleteChildSa {
        /// Inbound or outbound SPI
        spi: u32,
    },
    /// The data plane already dropped a Child SA
    ChildSaDeleted {
        /// Inbound or outbound SPI
        spi: u32,
    },
    /// Replace a Child SA
    RekeyChildSa {
        /// Inbound or outbound SPI
        spi: u32,
    },
    /// Rekey the IKE SA itself
    RekeyIkeSa,
    /// External authentication (AAA) accepted `peer_id`
    Authenticate {
        /// Identity confirmed by the backend
        peer_id: Identity,
    },
    /// Check that the peer is alive
    Liveness,
    /// Timer expiry
    Timeout(TimerKind),
    /// Tear down the IKE SA
    DeleteIkeSa,
    /// Send or act on a notification
    Notify(NotifyType),
}

impl Command {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Command::Inbound(_) => "inbound",
            Command::CreateChildSa(_) => "create_child_sa",
            Command::ChildSaEstablished(_) => "child_sa_established",
            Command::DeleteChildSa { .. } => "delete_child_sa",
            Command::ChildSaDeleted { .. } => "child_sa_deleted",
            Command::RekeyChildSa { .. } => "rekey_child_sa",
            Command::RekeyIkeSa => "rekey_ike_sa",
            Command::Authenticate { .. } => "authenticate",
            Command::Liveness => "liveness",
            Command::Timeout(_) => "timeout",
            Command::DeleteIkeSa => "delete_ike_sa",
            Command::Notify(_) => "notify",
        }
    }

    /// Commands that start a request exchange wait while one is outstanding
    fn starts_exchange(&self) -> bool {
        matches!(
            self,
            Command::CreateChildSa(_)
                | Command::DeleteChildSa { .. }
                | Command::RekeyChildSa { .. }
                | Command::RekeyIkeSa
                | Command::Liveness
                | Command::Notify(_)
                | Command::Timeout(TimerKind::Rekey)
                | Command::Timeout(TimerKind::Idle)
        )
    }
}

/// Two-tier FIFO: urgent commands run before normal ones
#[derive(Debug, Default)]
pub struct CommandQueue {
    urgent: VecDeque<Command>,
    normal: VecDeque<Command>,
}

impl CommandQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue at the back of its tier
    pub fn push(&mut self, command: Command, urgent: bool) {
        if urgent {
            self.urgent.push_back(command);
        } else {
            self.normal.push_back(command);
        }
    }

    /// Put deferred commands back in front of the normal tier, in order
    fn requeue(&mut self, commands: impl DoubleEndedIterator<Item = Command>) {
        for command in commands.rev() {
            self.normal.push_front(command);
        }
    }

    /// Next command
    pub fn pop(&mut self) -> Option<Command> {
        self.urgent.pop_front().or_else(|| self.normal.pop_front())
    }

    /// Queued command count
    pub fn len(&self) -> usize {
        self.urgent.len() + self.normal.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A message ready for transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Peer address
    pub destination: IpAddr,
    /// Message before protection
    pub message: IkeMessage,
    /// Wire bytes
    pub bytes: Vec<u8>,
}

/// Result of processing one command
#[derive(Debug)]
pub struct CommandOutcome {
    /// Command name
    pub command: &'static str,
    /// Messages to send
    pub outbound: Vec<OutboundMessage>,
    /// Failure, if the command was rejected or ended the negotiation
    pub error: Option<Error>,
}

/// Read-only view for operational tooling
#[derive(Debug, Clone, Serialize)]
pub struct IkeSaSnapshot {
    /// Our SPI
    pub local_spi: u64,
    /// Peer SPI, 0 until known
    pub remote_spi: u64,
    /// Our role
    pub role: Role,
    /// Lifecycle state
    pub state: IkeSaState,
    /// Local address
    pub local_addr: IpAddr,
    /// Peer address
    pub peer_addr: IpAddr,
    /// Mobility care-of address
    pub care_of_address: Option<IpAddr>,
    /// Authenticated peer identity
    pub peer_id: Option<String>,
    /// Creation time
    pub created_at: SystemTime,
    /// Last message received
    pub last_activity: SystemTime,
    /// Bytes received
    pub bytes_in: u64,
    /// Bytes sent
    pub bytes_out: u64,
    /// Messages received
    pub packets_in: u64,
    /// Messages sent
    pub packets_out: u64,
    /// IKE SA rekeys completed
    pub rekeys: u32,
    /// Child SAs
    pub child_sas: Vec<ChildSaSnapshot>,
}

#[derive(Debug, Clone)]
enum Purpose {
    Init,
    Auth {
        child: ChildSaRequest,
        inbound_spi: u32,
    },
    CreateChild {
        request: ChildSaRequest,
        inbound_spi: u32,
        rekey_of: Option<u32>,
    },
    RekeyIke,
    DeleteChild {
        spis: Vec<u32>,
    },
    DeleteIke,
    Informational,
}

#[derive(Debug)]
struct PendingRequest {
    message_id: u32,
    purpose: Purpose,
    outbound: OutboundMessage,
    retransmits: u32,
}

/// IKE_AUTH request waiting for an external authentication verdict
#[derive(Debug)]
struct ParkedAuth {
    request: IkeMessage,
    peer_id: Identity,
}

#[derive(Debug, Default, Clone, Copy)]
struct Traffic {
    bytes_in: u64,
    bytes_out: u64,
    packets_in: u64,
    packets_out: u64,
}

struct IkeSaInner {
    machine: StateMachine,
    policy: PeerConfiguration,
    proposal: Option<Proposal>,
    prf: PrfAlgorithm,
    nonce_local: Bytes,
    nonce_peer: Bytes,
    init_request: Vec<u8>,
    init_response: Vec<u8>,
    cookie: Option<Bytes>,
    first_child: Option<ChildSaRequest>,
    pending: Option<PendingRequest>,
    last_response: Option<(u32, OutboundMessage)>,
    deferred: VecDeque<Command>,
    parked_auth: Option<ParkedAuth>,
    delete_pending: bool,
    outbox: Vec<OutboundMessage>,
}

/// Readable while a command runs
#[derive(Debug)]
struct Status {
    state: IkeSaState,
    peer_id: Option<Identity>,
    created_at: SystemTime,
    last_activity: SystemTime,
    traffic: Traffic,
    rekeys: u32,
}

/// One IKE SA
///
/// Owned by the directory and shared as `Arc<IkeSa>` with whoever is
/// processing it.
pub struct IkeSa {
    local_spi: u64,
    remote_spi: AtomicU64,
    role: Role,
    local_addr: IpAddr,
    peer_addr: IpAddr,
    mobility: Option<MobilityContext>,
    half_open: AtomicBool,
    queue: Mutex<CommandQueue>,
    child_sas: ChildSaRegistry,
    cipher: Mutex<Option<Arc<dyn CipherSuite>>>,
    status: Mutex<Status>,
    worker: Mutex<Option<Box<IkeSaInner>>>,
}

impl fmt::Debug for IkeSa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IkeSa")
            .field("local_spi", &format_args!("{:016x}", self.local_spi))
            .field("remote_spi", &format_args!("{:016x}", self.remote_spi()))
            .field("role", &self.role)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

fn random_nonce() -> Bytes {
    let mut nonce = vec![0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    Bytes::from(nonce)
}

fn prf_for(proposal: &Proposal) -> PrfAlgorithm {
    proposal
        .prf()
        .map_or(PrfAlgorithm::HmacSha256, PrfAlgorithm::from_transform)
}

/// `first message | peer nonce | ID payload`, the octets an AUTH value covers
fn signed_octets(first_message: &[u8], nonce: &[u8], id: &IdPayload) -> Result<Vec<u8>> {
    let id_bytes = id.to_bytes()?;
    let mut octets = Vec::with_capacity(first_message.len() + nonce.len() + id_bytes.len());
    octets.extend_from_slice(first_message);
    octets.extend_from_slice(nonce);
    octets.extend_from_slice(&id_bytes);
    Ok(octets)
}

fn child_spi(proposal: &Proposal) -> Result<u32> {
    let spi: [u8; 4] = proposal.spi.as_slice().try_into().map_err(|_| {
        Error::InvalidPayload(format!(
            "Child SA proposal SPI of {} bytes",
            proposal.spi.len()
        ))
    })?;
    match u32::from_be_bytes(spi) {
        0 => Err(Error::InvalidPayload("Child SA SPI is zero".to_string())),
        spi => Ok(spi),
    }
}

fn single_proposal(message: &IkeMessage) -> Result<&Proposal> {
    match message.sa().map(|sa| sa.proposals.as_slice()) {
        Some([proposal]) => Ok(proposal),
        Some(_) => Err(Error::InvalidPayload(
            "Response must carry exactly one proposal".to_string(),
        )),
        None => Err(Error::InvalidMessage("Response without SA payload".to_string())),
    }
}

fn refusal(notify: NotifyType) -> Error {
    match notify {
        NotifyType::NO_PROPOSAL_CHOSEN => Error::NoProposalChosen,
        NotifyType::AUTHENTICATION_FAILED => {
            Error::AuthenticationFailed("peer rejected our authentication".to_string())
        }
        other => Error::InvalidMessage(format!("Peer refused with notify {}", other.0)),
    }
}

impl IkeSa {
    fn build(
        local_spi: u64,
        remote_spi: u64,
        role: Role,
        local_addr: IpAddr,
        peer_addr: IpAddr,
        policy: PeerConfiguration,
        mobility: Option<MobilityContext>,
    ) -> Self {
        let now = SystemTime::now();
        IkeSa {
            local_spi,
            remote_spi: AtomicU64::new(remote_spi),
            role,
            local_addr,
            peer_addr,
            mobility,
            half_open: AtomicBool::new(true),
            queue: Mutex::new(CommandQueue::new()),
            child_sas: ChildSaRegistry::new(),
            cipher: Mutex::new(None),
            status: Mutex::new(Status {
                state: IkeSaState::Idle,
                peer_id: None,
                created_at: now,
                last_activity: now,
                traffic: Traffic::default(),
                rekeys: 0,
            }),
            worker: Mutex::new(Some(Box::new(IkeSaInner {
                machine: StateMachine::default(),
                policy,
                proposal: None,
                prf: PrfAlgorithm::HmacSha256,
                nonce_local: Bytes::new(),
                nonce_peer: Bytes::new(),
                init_request: Vec::new(),
                init_response: Vec::new(),
                cookie: None,
                first_child: None,
                pending: None,
                last_response: None,
                deferred: VecDeque::new(),
                parked_auth: None,
                delete_pending: false,
                outbox: Vec::new(),
            }))),
        }
    }

    /// IKE SA we initiate towards `peer_addr`
    pub fn initiator(
        local_spi: u64,
        local_addr: IpAddr,
        peer_addr: IpAddr,
        policy: PeerConfiguration,
        mobility: Option<MobilityContext>,
    ) -> Self {
        Self::build(
            local_spi,
            0,
            Role::Initiator,
            local_addr,
            peer_addr,
            policy,
            mobility,
        )
    }

    /// IKE SA answering an IKE_SA_INIT from `peer_addr`
    pub fn responder(
        local_spi: u64,
        remote_spi: u64,
        local_addr: IpAddr,
        peer_addr: IpAddr,
        policy: PeerConfiguration,
    ) -> Self {
        Self::build(
            local_spi,
            remote_spi,
            Role::Responder,
            local_addr,
            peer_addr,
            policy,
            None,
        )
    }

    /// Our SPI, the directory key
    pub fn local_spi(&self) -> u64 {
        self.local_spi
    }

    /// Peer SPI, 0 until the IKE_SA_INIT response arrives
    pub fn remote_spi(&self) -> u64 {
        self.remote_spi.load(Ordering::Acquire)
    }

    /// Our role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Local address
    pub fn local_addr(&self) -> IpAddr {
        self.local_addr
    }

    /// Peer address
    pub fn peer_addr(&self) -> IpAddr {
        self.peer_addr
    }

    /// Mobility context, if any
    pub fn mobility(&self) -> Option<&MobilityContext> {
        self.mobility.as_ref()
    }

    /// Where messages to the peer go
    pub fn destination(&self) -> IpAddr {
        match self.mobility {
            Some(MobilityContext {
                care_of_address,
                is_home_agent: true,
            }) => care_of_address,
            _ => self.peer_addr,
        }
    }

    /// Child SAs owned by this IKE SA
    pub fn child_sas(&self) -> &ChildSaRegistry {
        &self.child_sas
    }

    /// Current state
    pub fn state(&self) -> IkeSaState {
        self.status.lock().state
    }

    /// Authenticated peer identity
    pub fn peer_id(&self) -> Option<Identity> {
        self.status.lock().peer_id.clone()
    }

    /// Install the cipher suite protecting every exchange after IKE_SA_INIT
    pub fn install_cipher_suite(&self, suite: Box<dyn CipherSuite>) {
        *self.cipher.lock() = Some(Arc::from(suite));
    }

    /// Enqueue a command; `urgent` commands run first
    pub fn push_command(&self, command: Command, urgent: bool) {
        logging::log_command_enqueued(self.local_spi, command.name(), urgent);
        self.queue.lock().push(command, urgent);
    }

    /// Queued command count
    pub fn pending_commands(&self) -> usize {
        self.queue.lock().len()
    }

    /// Clear the half-open mark, returning whether it was set
    ///
    /// The caller that gets `true` owns the matching counter decrement.
    pub fn release_half_open(&self) -> bool {
        self.half_open.swap(false, Ordering::AcqRel)
    }

    /// Snapshot for tooling
    pub fn snapshot(&self) -> IkeSaSnapshot {
        let child_sas = self.child_sas.snapshot();
        let status = self.status.lock();
        IkeSaSnapshot {
            local_spi: self.local_spi,
            remote_spi: self.remote_spi(),
            role: self.role,
            state: status.state,
            local_addr: self.local_addr,
            peer_addr: self.peer_addr,
            care_of_address: self.mobility.map(|m| m.care_of_address),
            peer_id: status.peer_id.as_ref().map(Identity::to_string),
            created_at: status.created_at,
            last_activity: status.last_activity,
            bytes_in: status.traffic.bytes_in,
            bytes_out: status.traffic.bytes_out,
            packets_in: status.traffic.packets_in,
            packets_out: status.traffic.packets_out,
            rekeys: status.rekeys,
            child_sas,
        }
    }

    /// Process the next queued command
    ///
    /// Returns `None` when the queue is empty or another thread is
    /// processing this SA; that thread drains what is queued.
    pub fn process_command(&self, ctx: &EngineContext) -> Option<CommandOutcome> {
        loop {
            let mut inner = self.worker.lock().take()?;
            let next = self.queue.lock().pop();
            let Some(command) = next else {
                *self.worker.lock() = Some(inner);
                // a push may have lost the race against our check-in
                if self.queue.lock().is_empty() {
                    return None;
                }
                continue;
            };
            let name = command.name();

            let result = self.handle(&mut inner, ctx, command);
            if let Err(e) = &result {
                debug!(
                    ike_spi = %format!("{:016x}", self.local_spi),
                    command = name,
                    error = %e,
                    "Command failed"
                );
            }
            let outbound = std::mem::take(&mut inner.outbox);
            *self.worker.lock() = Some(inner);

            return Some(CommandOutcome {
                command: name,
                outbound,
                error: result.err(),
            });
        }
    }

    fn handle(&self, inner: &mut IkeSaInner, ctx: &EngineContext, command: Command) -> Result<()> {
        let state = inner.machine.state();
        if state.is_terminal() {
            return Err(Error::InvalidState("IKE SA is deleted".to_string()));
        }
        if command.starts_exchange() && (inner.pending.is_some() || state.is_half_open()) {
            let start_now = matches!(command, Command::CreateChildSa(_))
                && state == IkeSaState::Idle
                && self.role == Role::Initiator;
            let handled_in_place = matches!(
                command,
                Command::Liveness | Command::Timeout(TimerKind::Idle) | Command::Notify(_)
            );
            if !start_now && !handled_in_place {
                inner.deferred.push_back(command);
                return Ok(());
            }
        }

        match command {
            Command::Inbound(inbound) => match self.handle_inbound(inner, ctx, *inbound) {
                Err(e) if self.role == Role::Responder && inner.machine.state() == IkeSaState::Idle => {
                    Err(self.fail(inner, ctx, e))
                }
                other => other,
            },
            Command::CreateChildSa(request) => self.create_child_sa(inner, ctx, request),
            Command::ChildSaEstablished(child) => {
                if !self.child_sas.can_add(child.inbound_spi, child.outbound_spi)
                    || !ctx.directory().reserve_child_spi(child.inbound_spi)
                {
                    return Err(Error::InvalidParameter(format!(
                        "Child SA SPI {:08x}/{:08x} already in use",
                        child.inbound_spi, child.outbound_spi
                    )));
                }
                self.register_child(ctx, child);
                Ok(())
            }
            Command::DeleteChildSa { spi } => self.delete_child_sa(inner, ctx, spi),
            Command::ChildSaDeleted { spi } => {
                let child = self
                    .child_sas
                    .get(spi)
                    .ok_or_else(|| Error::SaNotFound(format!("Child SA {:08x}", spi)))?;
                self.remove_child(ctx, child.inbound_spi, "removed by data plane");
                self.resume_delete(inner);
                Ok(())
            }
            Command::RekeyChildSa { spi } => {
                let child = self
                    .child_sas
                    .get(spi)
                    .ok_or_else(|| Error::SaNotFound(format!("Child SA {:08x}", spi)))?;
                self.child_sas
                    .set_state(child.inbound_spi, ChildSaState::Rekeying);
                let request = ChildSaRequest::new(child.protocol, child.mode)
                    .with_lifetime(child.lifetime);
                self.start_create_child(inner, ctx, request, Some(child.inbound_spi))
            }
            Command::RekeyIkeSa | Command::Timeout(TimerKind::Rekey) => {
                self.rekey_ike_sa(inner, ctx)
            }
            Command::Authenticate { peer_id } => self.authenticate(inner, ctx, peer_id),
            Command::Liveness | Command::Timeout(TimerKind::Idle) => {
                if state.is_established() && inner.pending.is_none() {
                    self.send_request(inner, ExchangeType::Informational, Vec::new(), Purpose::Informational)?;
                }
                Ok(())
            }
            Command::Timeout(TimerKind::Retransmit) => self.retransmit(inner, ctx),
            Command::Timeout(TimerKind::HalfOpenExpiry) => {
                if state.is_half_open() {
                    return Err(self.fail(
                        inner,
                        ctx,
                        Error::Timeout("negotiation did not complete".to_string()),
                    ));
                }
                Ok(())
            }
            Command::DeleteIkeSa => self.delete_ike_sa(inner, ctx),
            Command::Notify(notify) => {
                if state.is_established() {
                    if inner.pending.is_some() {
                        inner.deferred.push_back(Command::Notify(notify));
                        return Ok(());
                    }
                    let payload = IkePayload::Notify(NotifyPayload::new(notify, Bytes::new()));
                    self.send_request(inner, ExchangeType::Informational, vec![payload], Purpose::Informational)
                } else if notify.is_error() {
                    Err(self.fail(inner, ctx, refusal(notify)))
                } else {
                    Ok(())
                }
            }
        }
    }

    // ----- state bookkeeping -----

    fn transition(&self, inner: &mut IkeSaInner, ctx: &EngineContext, next: IkeSaState) -> Result<()> {
        let previous = inner.machine.transition(next)?;
        self.after_transition(ctx, previous, next);
        Ok(())
    }

    fn after_transition(&self, ctx: &EngineContext, previous: IkeSaState, next: IkeSaState) {
        self.status.lock().state = next;
        if previous != next {
            logging::log_ike_state_transition(
                ctx.log(),
                self.local_spi,
                &previous.to_string(),
                &next.to_string(),
            );
        }
        if !next.is_half_open() && self.release_half_open() {
            ctx.directory().dec_half_open_counter();
        }
        if next == IkeSaState::Established && previous.is_half_open() {
            ctx.metrics().record_ike_sa_established();
        }
    }

    /// Forget the outstanding request, returning reserved SPIs
    fn abandon_pending(&self, inner: &mut IkeSaInner, ctx: &EngineContext) {
        if let Some(pending) = inner.pending.take() {
            match pending.purpose {
                Purpose::Auth { inbound_spi, .. } | Purpose::CreateChild { inbound_spi, .. } => {
                    ctx.directory().release_child_spi(inbound_spi)
                }
                _ => {}
            }
        }
    }

    /// Move to `via` (Failed or Deleting) then Deleted, dropping Child SAs
    fn terminate(&self, inner: &mut IkeSaInner, ctx: &EngineContext, via: IkeSaState) {
        for next in [via, IkeSaState::Deleted] {
            if inner.machine.state().can_transition_to(next) {
                if let Ok(previous) = inner.machine.transition(next) {
                    self.after_transition(ctx, previous, next);
                }
            }
        }
        self.abandon_pending(inner, ctx);
        inner.deferred.clear();
        inner.parked_auth = None;

        for child in self.child_sas.drain() {
            ctx.directory().release_child_spi(child.inbound_spi);
            logging::log_child_sa_removed(self.local_spi, child.inbound_spi, "IKE SA closed");
            ctx.metrics().record_child_sa_deleted(1);
        }
    }

    /// End the negotiation with `reason`
    fn fail(&self, inner: &mut IkeSaInner, ctx: &EngineContext, reason: Error) -> Error {
        if reason.is_policy_error() {
            ctx.metrics().record_policy_failure();
            logging::log_policy_mismatch(ctx.log(), self.local_spi, &reason.to_string());
        } else {
            warn!(
                ike_spi = %format!("{:016x}", self.local_spi),
                error = %reason,
                "IKE SA failed"
            );
        }
        self.terminate(inner, ctx, IkeSaState::Failed);
        reason
    }

    fn release_deferred(&self, inner: &mut IkeSaInner) {
        if inner.deferred.is_empty() {
            return;
        }
        let deferred: Vec<Command> = inner.deferred.drain(..).collect();
        self.queue.lock().requeue(deferred.into_iter());
    }

    /// Re-issue a deferred IKE SA delete once no Child SA is half-closed
    fn resume_delete(&self, inner: &mut IkeSaInner) {
        if inner.delete_pending && !self.child_sas.has_half_closed() {
            inner.delete_pending = false;
            self.queue.lock().push(Command::DeleteIkeSa, true);
        }
    }

    fn register_child(&self, ctx: &EngineContext, child: ChildSa) {
        logging::log_child_sa_registered(self.local_spi, child.inbound_spi, child.outbound_spi);
        ctx.log().emit(
            "ike_sa",
            &format!(
                "Child SA {:08x}/{:08x} established",
                child.inbound_spi, child.outbound_spi
            ),
            ike_platform::LogType::IPSEC,
            true,
        );
        self.child_sas.add(child);
        ctx.metrics().record_child_sa_created();
    }

    fn remove_child(&self, ctx: &EngineContext, inbound_spi: u32, reason: &str) {
        self.child_sas.remove(inbound_spi);
        ctx.directory().release_child_spi(inbound_spi);
        logging::log_child_sa_removed(self.local_spi, inbound_spi, reason);
        ctx.metrics().record_child_sa_deleted(1);
    }

    // ----- message plumbing -----

    fn header(&self, exchange: ExchangeType, message_id: u32, response: bool) -> IkeHeader {
        let is_initiator = self.role == Role::Initiator;
        let (spi_i, spi_r) = if is_initiator {
            (self.local_spi, self.remote_spi())
        } else {
            (self.remote_spi(), self.local_spi)
        };
        let flags = if response {
            IkeFlags::response(is_initiator)
        } else {
            IkeFlags::request(is_initiator)
        };
        IkeHeader::new(exchange, spi_i, spi_r, flags, message_id)
    }

    fn protect(&self, message: IkeMessage) -> Result<OutboundMessage> {
        let cipher = self.cipher.lock().clone();
        let bytes = match &cipher {
            Some(suite) if message.header.exchange_type != ExchangeType::IkeSaInit => {
                let mut iv = vec![0u8; suite.iv_size()];
                rand::thread_rng().fill_bytes(&mut iv);
                message.seal(suite.as_ref(), &iv)?
            }
            _ => message.encode()?,
        };
        Ok(OutboundMessage {
            destination: self.destination(),
            message,
            bytes,
        })
    }

    fn emit(&self, inner: &mut IkeSaInner, outbound: OutboundMessage) {
        {
            let mut status = self.status.lock();
            status.traffic.bytes_out += outbound.bytes.len() as u64;
            status.traffic.packets_out += 1;
        }
        inner.outbox.push(outbound);
    }

    fn send_with_id(
        &self,
        inner: &mut IkeSaInner,
        exchange: ExchangeType,
        message_id: u32,
        payloads: Vec<IkePayload>,
        purpose: Purpose,
    ) -> Result<()> {
        let mut message = IkeMessage::new(self.header(exchange, message_id, false));
        message.payloads = payloads;
        let outbound = self.protect(message)?;

        inner.pending = Some(PendingRequest {
            message_id,
            purpose,
            outbound: outbound.clone(),
            retransmits: 0,
        });
        self.emit(inner, outbound);
        Ok(())
    }

    fn send_request(
        &self,
        inner: &mut IkeSaInner,
        exchange: ExchangeType,
        payloads: Vec<IkePayload>,
        purpose: Purpose,
    ) -> Result<()> {
        let message_id = inner.machine.next_request_id();
        self.send_with_id(inner, exchange, message_id, payloads, purpose)
    }

    fn respond(&self, inner: &mut IkeSaInner, request: &IkeMessage, payloads: Vec<IkePayload>) -> Result<()> {
        let message_id = request.header.message_id;
        let mut message = IkeMessage::new(self.header(request.header.exchange_type, message_id, true));
        message.payloads = payloads;
        let outbound = self.protect(message)?;

        inner.last_response = Some((message_id, outbound.clone()));
        self.emit(inner, outbound);
        Ok(())
    }

    fn unprotect(&self, inbound: InboundMessage) -> Result<IkeMessage> {
        let exchange = inbound.message.header.exchange_type;
        let cipher = self.cipher.lock().clone();
        match &cipher {
            _ if exchange == ExchangeType::IkeSaInit => Ok(inbound.message),
            Some(suite) if inbound.message.is_encrypted() => {
                IkeMessage::open(&inbound.datagram, suite.as_ref())
            }
            Some(_) => Err(Error::InvalidMessage(
                "Unprotected message after keys were installed".to_string(),
            )),
            None if inbound.message.is_encrypted() => Err(Error::InvalidMessage(
                "Encrypted payload but no keys installed".to_string(),
            )),
            None => Ok(inbound.message),
        }
    }

    fn retransmit(&self, inner: &mut IkeSaInner, ctx: &EngineContext) -> Result<()> {
        let limit = inner.policy.ike_sa_config.timers.retransmit_count;
        let outbound = match inner.pending.as_mut() {
            None => return Ok(()),
            Some(pending) if pending.retransmits >= limit => None,
            Some(pending) => {
                pending.retransmits += 1;
                Some(pending.outbound.clone())
            }
        };

        match outbound {
            Some(outbound) => {
                self.emit(inner, outbound);
                Ok(())
            }
            None => Err(self.fail(
                inner,
                ctx,
                Error::Timeout(format!("no response after {} retransmissions", limit)),
            )),
        }
    }

    // ----- locally initiated work -----

    fn create_child_sa(&self, inner: &mut IkeSaInner, ctx: &EngineContext, request: ChildSaRequest) -> Result<()> {
        match inner.machine.state() {
            IkeSaState::Idle if self.role == Role::Initiator => {
                inner.first_child = Some(request);
                self.send_init(inner, ctx)
            }
            state if state.is_established() => self.start_create_child(inner, ctx, request, None),
            state => Err(Error::InvalidState(format!(
                "Cannot create a Child SA in state {}",
                state
            ))),
        }
    }

    fn send_init(&self, inner: &mut IkeSaInner, ctx: &EngineContext) -> Result<()> {
        if inner.nonce_local.is_empty() {
            inner.nonce_local = random_nonce();
        }

        let mut payloads = Vec::with_capacity(3);
        if let Some(cookie) = &inner.cookie {
            payloads.push(IkePayload::Notify(NotifyPayload::cookie(cookie.clone())));
        }
        payloads.push(IkePayload::Sa(SaPayload::new(
            inner.policy.ike_sa_config.proposals.clone(),
        )));
        payloads.push(IkePayload::Nonce(NoncePayload::new(inner.nonce_local.clone())?));

        // IKE_SA_INIT always uses message ID 0, also when retried with a cookie
        if inner.machine.state() == IkeSaState::Idle {
            inner.machine.next_request_id();
        }
        self.send_with_id(inner, ExchangeType::IkeSaInit, 0, payloads, Purpose::Init)?;
        if let Some(pending) = &inner.pending {
            inner.init_request = pending.outbound.bytes.clone();
        }
        self.transition(inner, ctx, IkeSaState::InitSent)
    }

    fn offer_child(&self, inner: &IkeSaInner, ctx: &EngineContext, protocol: IpsecProtocol) -> (u32, SaPayload) {
        let inbound_spi = ctx.directory().next_child_spi();
        let proposals = inner
            .policy
            .ike_sa_config
            .child_proposals_for(protocol)
            .into_iter()
            .map(|p| p.with_spi(inbound_spi.to_be_bytes().to_vec()))
            .collect();
        (inbound_spi, SaPayload::new(proposals))
    }

    fn start_create_child(
        &self,
        inner: &mut IkeSaInner,
        ctx: &EngineContext,
        request: ChildSaRequest,
        rekey_of: Option<u32>,
    ) -> Result<()> {
        let (inbound_spi, sa) = self.offer_child(inner, ctx, request.protocol);

        let mut payloads = Vec::with_capacity(3);
        if let Some(old) = rekey_of {
            payloads.push(IkePayload::Notify(
                NotifyPayload::new(NotifyType::REKEY_SA, Bytes::new())
                    .with_spi(request.protocol.protocol_id(), old.to_be_bytes().to_vec()),
            ));
        }
        payloads.push(IkePayload::Sa(sa));
        payloads.push(IkePayload::Nonce(NoncePayload::new(random_nonce())?));

        let purpose = Purpose::CreateChild {
            request,
            inbound_spi,
            rekey_of,
        };
        self.send_request(inner, ExchangeType::CreateChildSa, payloads, purpose)
            .map_err(|e| {
                ctx.directory().release_child_spi(inbound_spi);
                e
            })
    }

    fn rekey_ike_sa(&self, inner: &mut IkeSaInner, ctx: &EngineContext) -> Result<()> {
        if inner.machine.state() != IkeSaState::Established {
            return Err(Error::InvalidState(format!(
                "Cannot rekey in state {}",
                inner.machine.state()
            )));
        }

        let proposals = inner
            .policy
            .ike_sa_config
            .proposals
            .iter()
            .map(|p| p.clone().with_spi(self.local_spi.to_be_bytes().to_vec()))
            .collect();
        let payloads = vec![
            IkePayload::Sa(SaPayload::new(proposals)),
            IkePayload::Nonce(NoncePayload::new(random_nonce())?),
        ];
        self.send_request(inner, ExchangeType::CreateChildSa, payloads, Purpose::RekeyIke)?;
        self.transition(inner, ctx, IkeSaState::Rekeying)
    }

    fn delete_child_sa(&self, inner: &mut IkeSaInner, ctx: &EngineContext, spi: u32) -> Result<()> {
        let child = self
            .child_sas
            .get(spi)
            .ok_or_else(|| Error::SaNotFound(format!("Child SA {:08x}", spi)))?;

        if !inner.machine.state().is_established() {
            self.remove_child(ctx, child.inbound_spi, "deleted locally");
            return Ok(());
        }

        self.child_sas
            .set_state(child.inbound_spi, ChildSaState::Deleting);
        let delete = DeletePayload::child(child.protocol.protocol_id(), &[child.inbound_spi]);
        self.send_request(
            inner,
            ExchangeType::Informational,
            vec![IkePayload::Delete(delete)],
            Purpose::DeleteChild {
                spis: vec![child.inbound_spi],
            },
        )
    }

    fn delete_ike_sa(&self, inner: &mut IkeSaInner, ctx: &EngineContext) -> Result<()> {
        if self.child_sas.has_half_closed() {
            inner.delete_pending = true;
            debug!(
                ike_spi = %format!("{:016x}", self.local_spi),
                "IKE SA delete waits for half-closed Child SAs"
            );
            return Ok(());
        }

        let state = inner.machine.state();
        if state == IkeSaState::Deleting {
            return Ok(());
        }
        if !state.is_established() {
            self.terminate(inner, ctx, IkeSaState::Deleting);
            return Ok(());
        }

        self.abandon_pending(inner, ctx);
        inner.deferred.clear();
        self.send_request(
            inner,
            ExchangeType::Informational,
            vec![IkePayload::Delete(DeletePayload::ike())],
            Purpose::DeleteIke,
        )?;
        self.transition(inner, ctx, IkeSaState::Deleting)
    }

    // ----- inbound -----

    fn handle_inbound(&self, inner: &mut IkeSaInner, ctx: &EngineContext, inbound: InboundMessage) -> Result<()> {
        {
            let mut status = self.status.lock();
            status.traffic.bytes_in += inbound.datagram.len() as u64;
            status.traffic.packets_in += 1;
            status.last_activity = SystemTime::now();
        }

        let datagram = inbound.datagram.clone();
        let message = self.unprotect(inbound)?;
        if message.is_request() {
            self.handle_request(inner, ctx, message, &datagram)
        } else {
            self.handle_response(inner, ctx, message, &datagram)
        }
    }

    fn handle_request(&self, inner: &mut IkeSaInner, ctx: &EngineContext, message: IkeMessage, datagram: &[u8]) -> Result<()> {
        let message_id = message.header.message_id;
        if let Some((last_id, response)) = &inner.last_response {
            if *last_id == message_id {
                let response = response.clone();
                self.emit(inner, response);
                return Ok(());
            }
        }
        inner.machine.accept_request(message_id)?;

        match message.header.exchange_type {
            ExchangeType::IkeSaInit => self.on_init_request(inner, ctx, &message, datagram),
            ExchangeType::IkeAuth => self.on_auth_request(inner, ctx, message),
            ExchangeType::CreateChildSa => self.on_create_child_request(inner, ctx, &message),
            ExchangeType::Informational => self.on_informational_request(inner, ctx, &message),
        }
    }

    fn on_init_request(&self, inner: &mut IkeSaInner, ctx: &EngineContext, message: &IkeMessage, datagram: &[u8]) -> Result<()> {
        if self.role != Role::Responder || inner.machine.state() != IkeSaState::Idle {
            return Err(Error::InvalidState("Unexpected IKE_SA_INIT request".to_string()));
        }
        let offered = message
            .sa()
            .ok_or_else(|| Error::InvalidMessage("IKE_SA_INIT without SA payload".to_string()))?;
        let nonce = message
            .nonce()
            .ok_or_else(|| Error::InvalidMessage("IKE_SA_INIT without nonce".to_string()))?;

        let chosen = match select_proposal(
            &offered.proposals,
            &inner.policy.ike_sa_config.proposals,
        ) {
            Ok(chosen) => chosen,
            Err(e) => {
                let refuse = NotifyPayload::new(NotifyType::NO_PROPOSAL_CHOSEN, Bytes::new());
                self.respond(inner, message, vec![IkePayload::Notify(refuse)])?;
                return Err(self.fail(inner, ctx, e));
            }
        };

        inner.prf = prf_for(&chosen);
        inner.proposal = Some(chosen.clone());
        inner.nonce_peer = nonce.nonce.clone();
        inner.nonce_local = random_nonce();
        inner.init_request = datagram.to_vec();

        let payloads = vec![
            IkePayload::Sa(SaPayload::new(vec![chosen])),
            IkePayload::Nonce(NoncePayload::new(inner.nonce_local.clone())?),
        ];
        self.respond(inner, message, payloads)?;
        if let Some((_, response)) = &inner.last_response {
            inner.init_response = response.bytes.clone();
        }
        self.transition(inner, ctx, IkeSaState::InitDone)
    }

    fn on_auth_request(&self, inner: &mut IkeSaInner, ctx: &EngineContext, message: IkeMessage) -> Result<()> {
        if self.role != Role::Responder || inner.machine.state() != IkeSaState::InitDone {
            return Err(Error::InvalidState("Unexpected IKE_AUTH request".to_string()));
        }
        let id = message
            .initiator_id()
            .cloned()
            .ok_or_else(|| Error::InvalidMessage("IKE_AUTH without IDi".to_string()))?;

        if !inner.policy.ike_sa_config.check_id(&id.id) {
            return Err(self.reject_auth(inner, ctx, &message, Error::IdentityNotAllowed(id.id.to_string())));
        }

        match &inner.policy.ike_sa_config.authenticator {
            Authenticator::Aaa => {
                debug!(
                    ike_spi = %format!("{:016x}", self.local_spi),
                    peer_id = %id.id,
                    "IKE_AUTH waits for AAA verdict"
                );
                inner.parked_auth = Some(ParkedAuth {
                    request: message,
                    peer_id: id.id,
                });
                Ok(())
            }
            authenticator => {
                let verdict = match message.auth() {
                    Some(auth) => {
                        signed_octets(&inner.init_request, &inner.nonce_local, &id)
                            .and_then(|octets| authenticator.verify(inner.prf, &octets, &auth.data))
                    }
                    None => Err(Error::AuthenticationFailed("IKE_AUTH without AUTH".to_string())),
                };
                match verdict {
                    Ok(()) => self.complete_auth(inner, ctx, &message, id.id),
                    Err(e) => Err(self.reject_auth(inner, ctx, &message, e)),
                }
            }
        }
    }

    fn reject_auth(&self, inner: &mut IkeSaInner, ctx: &EngineContext, request: &IkeMessage, reason: Error) -> Error {
        let notify = NotifyPayload::new(NotifyType::AUTHENTICATION_FAILED, Bytes::new());
        if let Err(e) = self.respond(inner, request, vec![IkePayload::Notify(notify)]) {
            debug!(error = %e, "Could not send AUTHENTICATION_FAILED");
        }
        self.fail(inner, ctx, reason)
    }

    fn authenticate(&self, inner: &mut IkeSaInner, ctx: &EngineContext, peer_id: Identity) -> Result<()> {
        let parked = inner
            .parked_auth
            .take()
            .ok_or_else(|| Error::InvalidState("No authentication pending".to_string()))?;

        if parked.peer_id != peer_id || !inner.policy.ike_sa_config.check_id(&peer_id) {
            return Err(self.reject_auth(
                inner,
                ctx,
                &parked.request,
                Error::AuthenticationFailed(format!("AAA did not confirm {}", parked.peer_id)),
            ));
        }
        self.complete_auth(inner, ctx, &parked.request, peer_id)
    }

    /// Answer an accepted IKE_AUTH request and install its Child SA
    fn complete_auth(&self, inner: &mut IkeSaInner, ctx: &EngineContext, request: &IkeMessage, peer_id: Identity) -> Result<()> {
        let my_id = IdPayload::new(inner.policy.ike_sa_config.my_id.clone());
        let mut payloads = Vec::with_capacity(3);

        if let Some(method) = inner.policy.ike_sa_config.authenticator.method() {
            let octets = signed_octets(&inner.init_response, &inner.nonce_peer, &my_id)?;
            let data = inner
                .policy
                .ike_sa_config
                .authenticator
                .expected_auth(inner.prf, &octets)?;
            payloads.push(IkePayload::Auth(AuthPayload::new(method, data)));
        }
        payloads.insert(0, IkePayload::IdR(my_id));

        if let Some(offered) = request.sa() {
            payloads.push(self.accept_child(inner, ctx, &offered.proposals, None));
        }

        self.status.lock().peer_id = Some(peer_id);
        self.respond(inner, request, payloads)?;
        self.transition(inner, ctx, IkeSaState::Established)?;
        self.release_deferred(inner);
        Ok(())
    }

    /// Select and install a Child SA offered by the peer; returns the
    /// payload answering the offer
    fn accept_child(&self, inner: &IkeSaInner, ctx: &EngineContext, offered: &[Proposal], rekey_of: Option<u32>) -> IkePayload {
        match self.install_offered_child(inner, ctx, offered, rekey_of) {
            Ok(proposal) => IkePayload::Sa(SaPayload::new(vec![proposal])),
            Err(e) => {
                debug!(error = %e, "Child SA offer refused");
                IkePayload::Notify(NotifyPayload::new(NotifyType::NO_PROPOSAL_CHOSEN, Bytes::new()))
            }
        }
    }

    fn install_offered_child(&self, inner: &IkeSaInner, ctx: &EngineContext, offered: &[Proposal], rekey_of: Option<u32>) -> Result<Proposal> {
        let config = &inner.policy.ike_sa_config;
        let (chosen, protocol) = offered
            .iter()
            .find_map(|p| {
                let protocol = IpsecProtocol::from_protocol_id(p.protocol_id)?;
                select_proposal(std::slice::from_ref(p), &config.child_proposals_for(protocol))
                    .ok()
                    .map(|answer| (answer, protocol))
            })
            .ok_or(Error::NoProposalChosen)?;

        let outbound_spi = child_spi(&chosen)?;
        let inbound_spi = ctx.directory().next_child_spi();
        if !self.child_sas.can_add(inbound_spi, outbound_spi) {
            ctx.directory().release_child_spi(inbound_spi);
            return Err(Error::InvalidPayload(format!(
                "Child SA SPI {:08x} already in use",
                outbound_spi
            )));
        }

        let lifetime = rekey_of
            .and_then(|old| self.child_sas.get(old))
            .map_or(config.child_lifetime, |old| old.lifetime);
        let child = ChildSa::new(inbound_spi, outbound_spi, protocol, config.child_mode)
            .with_lifetime(lifetime)
            .with_state(ChildSaState::Established);
        self.register_child(ctx, child);

        Ok(chosen.with_spi(inbound_spi.to_be_bytes().to_vec()))
    }

    fn on_create_child_request(&self, inner: &mut IkeSaInner, ctx: &EngineContext, message: &IkeMessage) -> Result<()> {
        if !inner.machine.state().is_established() {
            return Err(Error::InvalidState(
                "CREATE_CHILD_SA before IKE SA is established".to_string(),
            ));
        }
        let offered = message
            .sa()
            .ok_or_else(|| Error::InvalidMessage("CREATE_CHILD_SA without SA payload".to_string()))?;
        if message.nonce().is_none() {
            return Err(Error::InvalidMessage("CREATE_CHILD_SA without nonce".to_string()));
        }
        let nonce = IkePayload::Nonce(NoncePayload::new(random_nonce())?);

        if offered.proposals.iter().any(|p| p.protocol_id == ProtocolId::Ike) {
            let answer = match select_proposal(
                &offered.proposals,
                &inner.policy.ike_sa_config.proposals,
            ) {
                Ok(chosen) => {
                    let chosen = chosen.with_spi(self.local_spi.to_be_bytes().to_vec());
                    self.status.lock().rekeys += 1;
                    vec![IkePayload::Sa(SaPayload::new(vec![chosen])), nonce]
                }
                Err(_) => vec![IkePayload::Notify(NotifyPayload::new(
                    NotifyType::NO_PROPOSAL_CHOSEN,
                    Bytes::new(),
                ))],
            };
            return self.respond(inner, message, answer);
        }

        let rekey_of = message
            .notify(NotifyType::REKEY_SA)
            .and_then(|n| <[u8; 4]>::try_from(n.spi.as_ref()).ok())
            .map(u32::from_be_bytes)
            .and_then(|spi| self.child_sas.get(spi))
            .map(|old| old.inbound_spi);

        let answer = self.accept_child(inner, ctx, &offered.proposals, rekey_of);
        let accepted = matches!(answer, IkePayload::Sa(_));
        let payloads = if accepted { vec![answer, nonce] } else { vec![answer] };
        self.respond(inner, message, payloads)?;

        if let (true, Some(old)) = (accepted, rekey_of) {
            self.child_sas.set_state(old, ChildSaState::Rekeying);
        }
        Ok(())
    }

    fn on_informational_request(&self, inner: &mut IkeSaInner, ctx: &EngineContext, message: &IkeMessage) -> Result<()> {
        let mut delete_ike = false;
        let mut answers = Vec::new();

        for delete in message.deletes() {
            if delete.protocol_id == ProtocolId::Ike {
                delete_ike = true;
                continue;
            }
            let mut ours = Vec::new();
            for spi in delete.child_spis() {
                if let Some(child) = self.child_sas.get(spi) {
                    self.remove_child(ctx, child.inbound_spi, "deleted by peer");
                    ours.push(child.inbound_spi);
                }
            }
            if !ours.is_empty() {
                answers.push(IkePayload::Delete(DeletePayload::child(delete.protocol_id, &ours)));
            }
        }

        if delete_ike {
            self.respond(inner, message, Vec::new())?;
            self.terminate(inner, ctx, IkeSaState::Deleting);
            return Ok(());
        }

        self.respond(inner, message, answers)?;
        self.resume_delete(inner);
        Ok(())
    }

    fn handle_response(&self, inner: &mut IkeSaInner, ctx: &EngineContext, message: IkeMessage, datagram: &[u8]) -> Result<()> {
        let pending = match inner.pending.take() {
            Some(pending) if pending.message_id == message.header.message_id => pending,
            other => {
                inner.pending = other;
                return Err(Error::InvalidMessage(format!(
                    "Unexpected response with message ID {}",
                    message.header.message_id
                )));
            }
        };

        let result = match pending.purpose {
            Purpose::Init => return self.on_init_response(inner, ctx, &message, datagram),
            Purpose::Auth { child, inbound_spi } => {
                self.on_auth_response(inner, ctx, &message, child, inbound_spi)
            }
            Purpose::CreateChild {
                request,
                inbound_spi,
                rekey_of,
            } => self.on_create_child_response(inner, ctx, &message, request, inbound_spi, rekey_of),
            Purpose::RekeyIke => {
                self.transition(inner, ctx, IkeSaState::Established)?;
                match message.error_notify() {
                    Some(notify) => Err(refusal(notify)),
                    None => {
                        self.status.lock().rekeys += 1;
                        Ok(())
                    }
                }
            }
            Purpose::DeleteChild { spis } => {
                for spi in spis {
                    if self.child_sas.contains(spi) {
                        self.remove_child(ctx, spi, "delete acknowledged");
                    }
                }
                self.resume_delete(inner);
                Ok(())
            }
            Purpose::DeleteIke => {
                self.terminate(inner, ctx, IkeSaState::Deleting);
                return Ok(());
            }
            Purpose::Informational => Ok(()),
        };

        if inner.machine.state().is_established() {
            self.release_deferred(inner);
        }
        result
    }

    fn on_init_response(&self, inner: &mut IkeSaInner, ctx: &EngineContext, message: &IkeMessage, datagram: &[u8]) -> Result<()> {
        if let Some(cookie) = message.cookie() {
            if inner.cookie.as_ref() == Some(cookie) {
                return Err(self.fail(
                    inner,
                    ctx,
                    Error::InvalidMessage("Responder rejected our cookie".to_string()),
                ));
            }
            debug!(
                ike_spi = %format!("{:016x}", self.local_spi),
                "Retrying IKE_SA_INIT with cookie"
            );
            inner.cookie = Some(cookie.clone());
            return self.send_init(inner, ctx);
        }
        if let Some(notify) = message.error_notify() {
            return Err(self.fail(inner, ctx, refusal(notify)));
        }

        let accepted = single_proposal(message).and_then(|proposal| {
            select_proposal(std::slice::from_ref(proposal), &inner.policy.ike_sa_config.proposals)
        });
        let proposal = match accepted {
            Ok(proposal) => proposal,
            Err(e) => return Err(self.fail(inner, ctx, e)),
        };
        let nonce = match message.nonce() {
            Some(nonce) => nonce.nonce.clone(),
            None => {
                return Err(self.fail(
                    inner,
                    ctx,
                    Error::InvalidMessage("IKE_SA_INIT response without nonce".to_string()),
                ))
            }
        };
        if message.header.spi_r == 0 {
            return Err(self.fail(
                inner,
                ctx,
                Error::InvalidMessage("Responder SPI is zero".to_string()),
            ));
        }

        self.remote_spi.store(message.header.spi_r, Ordering::Release);
        inner.prf = prf_for(&proposal);
        inner.proposal = Some(proposal);
        inner.nonce_peer = nonce;
        inner.init_response = datagram.to_vec();
        self.transition(inner, ctx, IkeSaState::InitDone)?;

        self.send_auth(inner, ctx)
    }

    fn send_auth(&self, inner: &mut IkeSaInner, ctx: &EngineContext) -> Result<()> {
        let config = &inner.policy.ike_sa_config;
        let child = inner
            .first_child
            .take()
            .unwrap_or_else(|| ChildSaRequest::new(IpsecProtocol::Esp, config.child_mode));

        let my_id = IdPayload::new(config.my_id.clone());
        let mut payloads = vec![IkePayload::IdI(my_id.clone())];
        if let Some(method) = config.authenticator.method() {
            let octets = signed_octets(&inner.init_request, &inner.nonce_peer, &my_id)?;
            let data = config.authenticator.expected_auth(inner.prf, &octets)?;
            payloads.push(IkePayload::Auth(AuthPayload::new(method, data)));
        }

        let (inbound_spi, sa) = self.offer_child(inner, ctx, child.protocol);
        payloads.push(IkePayload::Sa(sa));

        if let Err(e) = self.send_request(
            inner,
            ExchangeType::IkeAuth,
            payloads,
            Purpose::Auth { child, inbound_spi },
        ) {
            ctx.directory().release_child_spi(inbound_spi);
            return Err(e);
        }
        self.transition(inner, ctx, IkeSaState::AuthSent)
    }

    fn on_auth_response(
        &self,
        inner: &mut IkeSaInner,
        ctx: &EngineContext,
        message: &IkeMessage,
        child: ChildSaRequest,
        inbound_spi: u32,
    ) -> Result<()> {
        let authenticated = self.verify_responder(inner, message);
        let peer_id = match authenticated {
            Ok(peer_id) => peer_id,
            Err(e) => {
                ctx.directory().release_child_spi(inbound_spi);
                return Err(self.fail(inner, ctx, e));
            }
        };

        self.status.lock().peer_id = Some(peer_id);
        self.transition(inner, ctx, IkeSaState::Established)?;

        let installed = match message.notify(NotifyType::NO_PROPOSAL_CHOSEN) {
            Some(_) => Err(Error::NoProposalChosen),
            None => self.install_answered_child(inner, ctx, message, &child, inbound_spi),
        };
        if installed.is_err() {
            ctx.directory().release_child_spi(inbound_spi);
        }
        installed
    }

    fn verify_responder(&self, inner: &IkeSaInner, message: &IkeMessage) -> Result<Identity> {
        if let Some(notify) = message.error_notify() {
            if notify != NotifyType::NO_PROPOSAL_CHOSEN {
                return Err(refusal(notify));
            }
        }
        let id = message
            .responder_id()
            .ok_or_else(|| Error::AuthenticationFailed("IKE_AUTH response without IDr".to_string()))?;

        let config = &inner.policy.ike_sa_config;
        if !config.check_id(&id.id) {
            return Err(Error::IdentityNotAllowed(id.id.to_string()));
        }
        if config.authenticator.method().is_some() {
            let auth = message
                .auth()
                .ok_or_else(|| Error::AuthenticationFailed("IKE_AUTH response without AUTH".to_string()))?;
            let octets = signed_octets(&inner.init_response, &inner.nonce_local, id)?;
            config.authenticator.verify(inner.prf, &octets, &auth.data)?;
        }
        Ok(id.id.clone())
    }

    fn install_answered_child(
        &self,
        inner: &IkeSaInner,
        ctx: &EngineContext,
        message: &IkeMessage,
        request: &ChildSaRequest,
        inbound_spi: u32,
    ) -> Result<()> {
        let proposal = single_proposal(message)?;
        if proposal.protocol_id != request.protocol.protocol_id() {
            return Err(Error::InvalidPayload(format!(
                "Child SA answered for {:?}, offered {:?}",
                proposal.protocol_id, request.protocol
            )));
        }
        let outbound_spi = child_spi(proposal)?;
        if !self.child_sas.can_add(inbound_spi, outbound_spi) {
            return Err(Error::InvalidPayload(format!(
                "Child SA SPI {:08x} already in use",
                outbound_spi
            )));
        }

        let lifetime = request
            .lifetime
            .unwrap_or(inner.policy.ike_sa_config.child_lifetime);
        let child = ChildSa::new(inbound_spi, outbound_spi, request.protocol, request.mode)
            .with_lifetime(lifetime)
            .with_state(ChildSaState::Established);
        self.register_child(ctx, child);
        Ok(())
    }

    fn on_create_child_response(
        &self,
        inner: &mut IkeSaInner,
        ctx: &EngineContext,
        message: &IkeMessage,
        request: ChildSaRequest,
        inbound_spi: u32,
        rekey_of: Option<u32>,
    ) -> Result<()> {
        let installed = match message.error_notify() {
            Some(notify) => Err(refusal(notify)),
            None => self.install_answered_child(inner, ctx, message, &request, inbound_spi),
        };

        match (installed, rekey_of) {
            (Ok(()), Some(old)) => {
                self.queue
                    .lock()
                    .push(Command::DeleteChildSa { spi: old }, true);
                Ok(())
            }
            (Ok(()), None) => Ok(()),
            (Err(e), rekey_of) => {
                ctx.directory().release_child_spi(inbound_spi);
                if let Some(old) = rekey_of {
                    self.child_sas.set_state(old, ChildSaState::Established);
                }
                Err(e)
            }
        }
    }
}
