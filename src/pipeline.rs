//! one client connection's lifecycle
//!
//! a [Pipeline] owns the client stream, the lazily opened upstream stream,
//! the two relay flows and the FIFO queue of outstanding exchanges. The
//! event loop drives it through [ProxySession::ready]; everything else is
//! internal sequencing: lazy connection, reconnection on a changed upstream
//! address, strict in-order response delivery, keep-alive and shutdown.

use std::{
    cell::RefCell,
    collections::VecDeque,
    net::SocketAddr,
    os::unix::io::{FromRawFd, IntoRawFd},
    rc::Rc,
    time::Instant,
};

use mio::{net::TcpStream, Interest, Token};
use rusty_ulid::Ulid;

use crate::{
    answers::AnswerKind,
    config::ProxyConfig,
    exchange::{Exchange, Handover, RequestHead, SessionPin},
    fault::RelayFault,
    flow::{Flow, FlowDirection, FlowEvent},
    logging::AccessRecord,
    pool::Checkout,
    registry::LimitBreach,
    server::{ServerContext, SessionManager},
    socket::{SocketResult, UpstreamAddr, UpstreamConnection},
    stream::ChunkedStream,
    timer::TimeoutContainer,
    util::UnwrapLog,
    ProxySession, Ready, Readiness, SessionResult,
};

/// a runaway dispatch loop means a state machine bug; crash loudly instead
/// of spinning
const MAX_LOOP_ITERATIONS: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// no upstream connection yet, or one being established
    Connecting,
    /// upstream open, relaying
    Active,
    /// the upstream address changed; draining before switching over
    Reconnecting,
    /// flushing the last bytes (an answer or relayed data) to the client
    ShuttingDown,
    Closed,
}

/// everything an external handler needs to take a connection over
pub struct HandoverPayload {
    pub kind: Handover,
    pub stream: std::net::TcpStream,
    /// bytes already read from the client, starting with the request head
    pub buffered: Vec<u8>,
    pub request: RequestHead,
    pub upstream: Option<UpstreamAddr>,
}

pub struct Pipeline {
    request_id: Ulid,
    peer: SocketAddr,
    config: Rc<ProxyConfig>,
    ctx: Rc<RefCell<ServerContext>>,
    sessions: Rc<RefCell<SessionManager>>,
    poll_registry: Rc<mio::Registry>,

    client: Option<ChunkedStream<TcpStream>>,
    client_token: Token,
    client_readiness: Readiness,

    upstream: Option<ChunkedStream<UpstreamConnection>>,
    upstream_token: Option<Token>,
    upstream_readiness: Readiness,
    upstream_addr: Option<UpstreamAddr>,
    upstream_connected: bool,
    ever_connected: bool,

    /// upstream address switch deferred until the queue drains
    pending_reconnect: Option<UpstreamAddr>,
    /// request head waiting for the deferred reconnection
    deferred_block: Option<Vec<u8>>,

    inbound: Flow,
    outbound: Flow,
    /// bytes on their way to the upstream
    to_upstream: Checkout,
    /// bytes on their way to the client
    to_client: Checkout,
    /// rewritten head that did not fit its buffer yet
    pending_upstream_block: Option<(Vec<u8>, usize)>,
    pending_client_block: Option<(Vec<u8>, usize)>,
    chunk: Vec<u8>,

    queue: VecDeque<Exchange>,
    pin: SessionPin,
    seq: u64,

    state: PipelineState,
    /// canned or redirect answer being written to the client
    answer: Option<(u16, Rc<Vec<u8>>, usize)>,
    response_started: bool,
    staged_handover: Option<(Handover, RequestHead, Option<UpstreamAddr>)>,
    stopping: bool,
    last_event: Instant,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sock: TcpStream,
        client_token: Token,
        peer: SocketAddr,
        config: Rc<ProxyConfig>,
        ctx: Rc<RefCell<ServerContext>>,
        sessions: Rc<RefCell<SessionManager>>,
        poll_registry: Rc<mio::Registry>,
        to_upstream: Checkout,
        to_client: Checkout,
    ) -> Pipeline {
        let idle = TimeoutContainer::new(config.idle_timeout, client_token);
        let client = ChunkedStream::new(sock, idle, config.replay_reset_limit);
        let max_line = config.max_header_line;
        let buffer_size = config.buffer_size;

        Pipeline {
            request_id: Ulid::generate(),
            peer,
            config,
            ctx,
            sessions,
            poll_registry,
            client: Some(client),
            client_token,
            client_readiness: Readiness {
                interest: Ready::READABLE | Ready::HUP | Ready::ERROR,
                event: Ready::EMPTY,
            },
            upstream: None,
            upstream_token: None,
            upstream_readiness: Readiness::new(),
            upstream_addr: None,
            upstream_connected: false,
            ever_connected: false,
            pending_reconnect: None,
            deferred_block: None,
            inbound: Flow::new(FlowDirection::Inbound, max_line),
            outbound: Flow::new(FlowDirection::Outbound, max_line),
            to_upstream,
            to_client,
            pending_upstream_block: None,
            pending_client_block: None,
            chunk: vec![0; buffer_size],
            queue: VecDeque::new(),
            pin: SessionPin::new(),
            seq: 0,
            state: PipelineState::Connecting,
            answer: None,
            response_started: false,
            staged_handover: None,
            stopping: false,
            last_event: Instant::now(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    fn log_context(&self) -> String {
        format!("{} {} ", self.request_id, self.peer)
    }

    // ------------------------------------------------------------------
    // client side
    // ------------------------------------------------------------------

    fn client_readable(&mut self, session: &Rc<RefCell<dyn ProxySession>>) {
        if self.answer.is_some() || self.state == PipelineState::ShuttingDown {
            self.client_readiness.interest.remove(Ready::READABLE);
            return;
        }

        // a new client chunk is only read once the previous one fully
        // drained to the upstream; this applies backpressure toward the
        // client while the outbound direction keeps running freely
        if self.to_upstream.available_data() > 0
            || self.pending_upstream_block.is_some()
            || self.pending_reconnect.is_some()
        {
            self.client_readiness.interest.remove(Ready::READABLE);
            if self.upstream.is_some() {
                self.upstream_readiness.interest.insert(Ready::WRITABLE);
            }
            return;
        }

        let (size, res) = match self.client.as_mut() {
            Some(client) => client.read_chunk(&mut self.chunk),
            None => return,
        };
        debug!("{}FRONT: read {} bytes", self.log_context(), size);

        if size > 0 {
            self.process_client_bytes(size, session);
        } else {
            self.client_readiness.event.remove(Ready::READABLE);
        }

        match res {
            SocketResult::Error => {
                error!("{}client socket read error", self.log_context());
                self.shutdown_quiet();
            }
            SocketResult::Closed => {
                if size == 0 {
                    self.client_closed();
                } else {
                    // deliver what we got; the next read reports the close
                    self.client_readiness.event.insert(Ready::READABLE);
                }
            }
            SocketResult::WouldBlock => {
                self.client_readiness.event.remove(Ready::READABLE);
            }
            SocketResult::Continue => {}
        }
    }

    /// runs the inbound flow over one freshly read chunk
    fn process_client_bytes(&mut self, size: usize, session: &Rc<RefCell<dyn ProxySession>>) {
        let mut offset = 0usize;

        while offset < size {
            if self.state == PipelineState::Closed || self.answer.is_some() {
                return;
            }

            let event = {
                let slice = &self.chunk[offset..size];
                self.inbound.process(slice)
            };

            let (event, consumed) = match event {
                Ok(done) => done,
                Err(fault) => {
                    self.apply_fault(fault);
                    return;
                }
            };

            match event {
                FlowEvent::NeedMore => {
                    offset += consumed;
                }
                FlowEvent::Headers(lines) => {
                    offset += consumed;
                    if !self.handle_request_head(lines, session) {
                        // deferred, handed over or faulted: put the rest of
                        // the chunk back for later
                        if offset < size {
                            self.pushback_client(offset, size);
                        }
                        return;
                    }
                }
                FlowEvent::Data { len, complete } => {
                    if let Err(breach) = self.account_bytes(len as u64) {
                        self.limit_breach(breach);
                        return;
                    }

                    let written = {
                        let slice = &self.chunk[offset..offset + len];
                        std::io::Write::write(&mut *self.to_upstream, slice).unwrap_or(0)
                    };
                    if let Some(exchange) = self.queue.back_mut() {
                        exchange.bytes_in += written as u64;
                    }
                    offset += written;

                    if written < len {
                        self.inbound.rewind_body((len - written) as u64);
                        self.pushback_client(offset, size);
                        self.client_readiness.interest.remove(Ready::READABLE);
                        self.upstream_readiness.interest.insert(Ready::WRITABLE);
                        return;
                    }

                    if complete {
                        trace!("{}request {} fully read", self.log_context(), self.seq);
                    }
                }
            }
        }

        if self.to_upstream.available_data() > 0 || self.pending_upstream_block.is_some() {
            self.upstream_readiness.interest.insert(Ready::WRITABLE);
        }
    }

    fn pushback_client(&mut self, offset: usize, size: usize) {
        let client = match self.client.as_mut() {
            Some(client) => client,
            None => return,
        };
        if let Err(e) = client.unconsume(&self.chunk[offset..size], false) {
            error!("{}could not push back client bytes: {}", self.log_context(), e);
        }
    }

    /// a complete request head: create the exchange, validate, route and
    /// decide how its bytes reach the upstream. Returns false when the
    /// caller must stop consuming the current chunk.
    fn handle_request_head(
        &mut self,
        lines: Vec<Vec<u8>>,
        session: &Rc<RefCell<dyn ProxySession>>,
    ) -> bool {
        let seq = self.seq;
        self.seq += 1;
        let mut exchange = Exchange::new(seq, self.peer.ip());

        {
            let mut ctx = self.ctx.borrow_mut();
            ctx.stats.record_request(self.peer.ip());
            ctx.registry.refresh(&self.peer);
        }
        if let Err(breach) = self.account_bytes(0) {
            self.limit_breach(breach);
            return false;
        }

        let directive = {
            let ctx = &mut *self.ctx.borrow_mut();
            exchange.process_request(
                &lines,
                &mut self.pin,
                ctx.router.as_mut(),
                ctx.line_hook.as_mut(),
                &self.config,
                self.peer,
            )
        };

        let directive = match directive {
            Ok(directive) => directive,
            Err(fault) => {
                exchange.fault_status = fault.status();
                self.log_access(&exchange, true);
                self.apply_fault(fault);
                return false;
            }
        };

        if let Some(kind) = directive.handover {
            let request = unwrap_msg!(exchange.request.clone());
            self.stage_handover(kind, request, directive.upstream);
            return false;
        }

        self.inbound.begin_body(directive.body_length);
        if let Err(breach) = self.account_bytes(directive.block.len() as u64) {
            self.limit_breach(breach);
            return false;
        }
        exchange.bytes_in += directive.block.len() as u64;
        self.queue.push_back(exchange);

        let addr = unwrap_msg!(directive.upstream);
        let changed = self
            .upstream_addr
            .as_ref()
            .map(|current| *current != addr)
            .unwrap_or(false);

        if self.upstream.is_none() {
            self.upstream_addr = Some(addr);
            if !self.connect_upstream(session) {
                return false;
            }
            self.write_upstream_block(directive.block);
        } else if changed {
            if self.queue.len() == 1 {
                // the new request is the only outstanding one: switch now
                self.replace_upstream(addr, session);
                if self.state == PipelineState::Closed || self.answer.is_some() {
                    return false;
                }
                self.write_upstream_block(directive.block);
            } else {
                // responses are still in flight on the old connection;
                // switch once the queue drains
                debug!(
                    "{}upstream changed to {}, deferring reconnection ({} in flight)",
                    self.log_context(),
                    addr,
                    self.queue.len() - 1
                );
                self.pending_reconnect = Some(addr);
                self.deferred_block = Some(directive.block);
                self.state = PipelineState::Reconnecting;
                self.client_readiness.interest.remove(Ready::READABLE);
                return false;
            }
        } else {
            self.write_upstream_block(directive.block);
        }

        true
    }

    fn write_upstream_block(&mut self, block: Vec<u8>) {
        let written = std::io::Write::write(&mut *self.to_upstream, &block).unwrap_or(0);
        if written < block.len() {
            self.pending_upstream_block = Some((block, written));
            self.client_readiness.interest.remove(Ready::READABLE);
        }
        self.upstream_readiness.interest.insert(Ready::WRITABLE);
    }

    fn client_writable(&mut self) {
        if let Some((status, buf, mut index)) = self.answer.take() {
            let client = match self.client.as_mut() {
                Some(client) => client,
                None => return,
            };
            let (size, res) = client.write(&buf[index..]);
            index += size;

            if index == buf.len() {
                debug!("{}answered {} to the client", self.log_context(), status);
                self.close_now();
                return;
            }
            match res {
                SocketResult::WouldBlock => {
                    self.answer = Some((status, buf, index));
                    self.client_readiness.event.remove(Ready::WRITABLE);
                }
                SocketResult::Continue => {
                    self.answer = Some((status, buf, index));
                }
                SocketResult::Closed | SocketResult::Error => {
                    self.close_now();
                }
            }
            return;
        }

        // drain the relay buffer, then a pending oversized head
        while self.to_client.available_data() > 0 || self.pending_client_block.is_some() {
            if self.to_client.available_data() > 0 {
                let client = match self.client.as_mut() {
                    Some(client) => client,
                    None => return,
                };
                let (size, res) = client.write(self.to_client.data());
                self.to_client.consume(size);
                if size > 0 {
                    self.response_started = true;
                }
                match res {
                    SocketResult::WouldBlock => {
                        self.client_readiness.event.remove(Ready::WRITABLE);
                        return;
                    }
                    SocketResult::Closed | SocketResult::Error => {
                        self.client_closed();
                        return;
                    }
                    SocketResult::Continue => {}
                }
            } else if let Some((block, index)) = self.pending_client_block.take() {
                let written = std::io::Write::write(&mut *self.to_client, &block[index..])
                    .unwrap_or(0);
                if index + written < block.len() {
                    self.pending_client_block = Some((block, index + written));
                }
            }
        }

        self.client_readiness.interest.remove(Ready::WRITABLE);
        // room freed for more response bytes
        if self.upstream.is_some() && !self.outbound_idle() {
            self.upstream_readiness.interest.insert(Ready::READABLE);
        }

        if self.state == PipelineState::ShuttingDown {
            self.close_now();
        }
    }

    fn outbound_idle(&self) -> bool {
        self.queue.is_empty() && !self.outbound.is_passthrough()
    }

    fn client_hup(&mut self) {
        self.client_readiness.event.remove(Ready::HUP);
        if self.client_readiness.event.is_readable()
            && self.client_readiness.interest.is_readable()
        {
            // drain what the kernel still holds; the read path reports the
            // close once it runs dry
            return;
        }
        self.client_closed();
    }

    fn client_closed(&mut self) {
        debug!("{}client closed the connection", self.log_context());
        self.shutdown_quiet();
    }

    // ------------------------------------------------------------------
    // upstream side
    // ------------------------------------------------------------------

    /// opens the upstream connection; returns false when the session is
    /// already being torn down because the connect failed outright
    fn connect_upstream(&mut self, session: &Rc<RefCell<dyn ProxySession>>) -> bool {
        let addr = unwrap_msg!(self.upstream_addr.clone());
        info!("{}connecting upstream {}", self.log_context(), addr);

        let mut connection = match UpstreamConnection::connect(&addr) {
            Ok(connection) => connection,
            Err(e) => {
                error!("{}could not connect to {}: {}", self.log_context(), addr, e);
                self.upstream_failed();
                return false;
            }
        };

        let token = {
            let mut sessions = self.sessions.borrow_mut();
            let entry = sessions.slab.vacant_entry();
            let token = Token(entry.key());
            entry.insert(session.clone());
            token
        };

        if let Err(e) = connection.register(
            &self.poll_registry,
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            error!("{}could not register upstream socket: {}", self.log_context(), e);
            self.sessions.borrow_mut().slab.remove(token.0);
            self.upstream_failed();
            return false;
        }

        let timeout = TimeoutContainer::new(self.config.connect_timeout, token);
        let stream = ChunkedStream::new(connection, timeout, self.config.replay_reset_limit);

        self.upstream = Some(stream);
        self.upstream_token = Some(token);
        self.upstream_connected = false;
        self.upstream_readiness = Readiness {
            interest: Ready::READABLE | Ready::WRITABLE | Ready::HUP | Ready::ERROR,
            event: Ready::EMPTY,
        };
        self.state = PipelineState::Connecting;
        true
    }

    fn replace_upstream(&mut self, addr: UpstreamAddr, session: &Rc<RefCell<dyn ProxySession>>) {
        debug!("{}switching upstream to {}", self.log_context(), addr);
        self.close_upstream();
        self.upstream_addr = Some(addr);
        self.connect_upstream(session);
    }

    /// tears the upstream side down, keeping the client side open
    fn close_upstream(&mut self) {
        if let Some(mut stream) = self.upstream.take() {
            stream.idle_timeout.cancel();
            let (mut connection, buffered) = stream.into_parts();
            if !buffered.is_empty() {
                warn!(
                    "{}dropping {} buffered upstream bytes",
                    self.log_context(),
                    buffered.len()
                );
            }
            if let Err(e) = connection.deregister(&self.poll_registry) {
                debug!("{}error deregistering upstream: {}", self.log_context(), e);
            }
        }
        if let Some(token) = self.upstream_token.take() {
            let mut sessions = self.sessions.borrow_mut();
            if sessions.slab.contains(token.0) {
                sessions.slab.remove(token.0);
            }
        }
        self.upstream_readiness.reset();
        self.upstream_connected = false;
    }

    fn upstream_writable(&mut self) {
        if !self.upstream_connected {
            let stream = match self.upstream.as_mut() {
                Some(stream) => stream,
                None => return,
            };
            match stream.socket_ref().take_error() {
                Ok(None) => {
                    self.upstream_connected = true;
                    self.ever_connected = true;
                    self.state = PipelineState::Active;
                    stream.idle_timeout.set_duration(self.config.idle_timeout);
                    stream.idle_timeout.reset();
                    debug!("{}upstream connected", self.log_context());
                }
                Ok(Some(e)) => {
                    error!("{}upstream connection failed: {}", self.log_context(), e);
                    self.upstream_failed();
                    return;
                }
                Err(e) => {
                    error!("{}upstream connection failed: {}", self.log_context(), e);
                    self.upstream_failed();
                    return;
                }
            }
        }

        while self.to_upstream.available_data() > 0 || self.pending_upstream_block.is_some() {
            if self.to_upstream.available_data() > 0 {
                let stream = match self.upstream.as_mut() {
                    Some(stream) => stream,
                    None => return,
                };
                let (size, res) = stream.write(self.to_upstream.data());
                self.to_upstream.consume(size);
                debug!("{}BACK: wrote {} bytes", self.log_context(), size);
                match res {
                    SocketResult::WouldBlock => {
                        self.upstream_readiness.event.remove(Ready::WRITABLE);
                        return;
                    }
                    SocketResult::Closed | SocketResult::Error => {
                        self.upstream_closed();
                        return;
                    }
                    SocketResult::Continue => {}
                }
            } else if let Some((block, index)) = self.pending_upstream_block.take() {
                let written = std::io::Write::write(&mut *self.to_upstream, &block[index..])
                    .unwrap_or(0);
                if index + written < block.len() {
                    self.pending_upstream_block = Some((block, index + written));
                }
            }
        }

        self.upstream_readiness.interest.remove(Ready::WRITABLE);
        // everything drained: the client may be read again
        if self.answer.is_none()
            && self.pending_reconnect.is_none()
            && self.state != PipelineState::ShuttingDown
        {
            self.client_readiness.interest.insert(Ready::READABLE);
        }
    }

    fn upstream_readable(&mut self, session: &Rc<RefCell<dyn ProxySession>>) {
        if self.answer.is_some() {
            self.upstream_readiness.interest.remove(Ready::READABLE);
            return;
        }

        // the outbound direction never waits for the client write to
        // complete, it is only bounded by buffer capacity
        if self.to_client.available_space() == 0 || self.pending_client_block.is_some() {
            self.upstream_readiness.interest.remove(Ready::READABLE);
            self.client_readiness.interest.insert(Ready::WRITABLE);
            return;
        }

        let (size, res) = match self.upstream.as_mut() {
            Some(stream) => stream.read_chunk(&mut self.chunk),
            None => return,
        };
        debug!("{}BACK: read {} bytes", self.log_context(), size);

        if size > 0 {
            self.process_upstream_bytes(size, session);
        } else {
            self.upstream_readiness.event.remove(Ready::READABLE);
        }

        match res {
            SocketResult::Error => {
                error!("{}upstream socket read error", self.log_context());
                self.upstream_closed();
            }
            SocketResult::Closed => {
                if size == 0 {
                    self.upstream_closed();
                } else {
                    self.upstream_readiness.event.insert(Ready::READABLE);
                }
            }
            SocketResult::WouldBlock => {
                self.upstream_readiness.event.remove(Ready::READABLE);
            }
            SocketResult::Continue => {}
        }
    }

    fn process_upstream_bytes(&mut self, size: usize, session: &Rc<RefCell<dyn ProxySession>>) {
        let mut offset = 0usize;

        while offset < size {
            if self.state == PipelineState::Closed || self.answer.is_some() {
                return;
            }

            let event = {
                let slice = &self.chunk[offset..size];
                self.outbound.process(slice)
            };

            let (event, consumed) = match event {
                Ok(done) => done,
                Err(fault) => {
                    self.apply_fault(fault);
                    return;
                }
            };

            match event {
                FlowEvent::NeedMore => {
                    offset += consumed;
                }
                FlowEvent::Headers(lines) => {
                    offset += consumed;
                    if !self.handle_response_head(lines, session) {
                        if offset < size {
                            self.pushback_upstream(offset, size);
                        }
                        return;
                    }
                    if self.state == PipelineState::Closed
                        || self.state == PipelineState::ShuttingDown
                    {
                        if offset < size {
                            self.pushback_upstream(offset, size);
                        }
                        return;
                    }
                }
                FlowEvent::Data { len, complete } => {
                    if let Err(breach) = self.account_bytes(len as u64) {
                        self.limit_breach(breach);
                        return;
                    }

                    let written = {
                        let slice = &self.chunk[offset..offset + len];
                        std::io::Write::write(&mut *self.to_client, slice).unwrap_or(0)
                    };
                    if let Some(exchange) = self.queue.front_mut() {
                        exchange.bytes_out += written as u64;
                    }
                    offset += written;
                    self.client_readiness.interest.insert(Ready::WRITABLE);

                    if written < len {
                        self.outbound.rewind_body((len - written) as u64);
                        self.pushback_upstream(offset, size);
                        self.upstream_readiness.interest.remove(Ready::READABLE);
                        return;
                    }

                    if complete {
                        self.finish_response(session);
                        if self.state == PipelineState::Closed
                            || self.state == PipelineState::ShuttingDown
                        {
                            if offset < size {
                                self.pushback_upstream(offset, size);
                            }
                            return;
                        }
                    }
                }
            }
        }

        if self.to_client.available_data() > 0 || self.pending_client_block.is_some() {
            self.client_readiness.interest.insert(Ready::WRITABLE);
        }
    }

    fn pushback_upstream(&mut self, offset: usize, size: usize) {
        let stream = match self.upstream.as_mut() {
            Some(stream) => stream,
            None => return,
        };
        if let Err(e) = stream.unconsume(&self.chunk[offset..size], false) {
            error!(
                "{}could not push back upstream bytes: {}",
                self.log_context(),
                e
            );
        }
    }

    /// a complete response head for the queue's front exchange
    fn handle_response_head(
        &mut self,
        lines: Vec<Vec<u8>>,
        session: &Rc<RefCell<dyn ProxySession>>,
    ) -> bool {
        let directive = match self.queue.front_mut() {
            Some(exchange) => exchange.process_response(&lines, &self.config),
            None => {
                error!("{}upstream answered with no request in flight", self.log_context());
                self.shutdown_quiet();
                return false;
            }
        };

        let directive = match directive {
            Ok(directive) => directive,
            Err(fault) => {
                self.apply_fault(fault);
                return false;
            }
        };

        if let Err(breach) = self.account_bytes(directive.block.len() as u64) {
            self.limit_breach(breach);
            return false;
        }
        if let Some(exchange) = self.queue.front_mut() {
            exchange.bytes_out += directive.block.len() as u64;
        }

        if directive.upgraded {
            info!("{}connection upgraded, switching to passthrough", self.log_context());
            self.inbound.set_passthrough();
            self.outbound.set_passthrough();
        } else if directive.close_delimited {
            self.outbound.set_passthrough();
        } else {
            self.outbound.begin_body(directive.body_length);
        }

        let written = std::io::Write::write(&mut *self.to_client, &directive.block).unwrap_or(0);
        if written < directive.block.len() {
            self.pending_client_block = Some((directive.block, written));
            self.upstream_readiness.interest.remove(Ready::READABLE);
        }
        self.client_readiness.interest.insert(Ready::WRITABLE);

        // a zero length body completes right away, except for interim
        // responses which leave the exchange waiting for the real one
        if !directive.interim
            && !directive.upgraded
            && !directive.close_delimited
            && directive.body_length == 0
        {
            self.finish_response(session);
        }

        true
    }

    /// the front exchange's response has been fully relayed
    fn finish_response(&mut self, session: &Rc<RefCell<dyn ProxySession>>) {
        let exchange = match self.queue.pop_front() {
            Some(exchange) => exchange,
            None => return,
        };

        self.log_access(&exchange, false);
        {
            let mut ctx = self.ctx.borrow_mut();
            ctx.registry.refresh(&self.peer);
        }

        let client_requested_close = exchange.connection_close
            || exchange.version() == Some(crate::parser::Version::V10);

        if client_requested_close {
            debug!("{}closing after response {}", self.log_context(), exchange.seq);
            self.shutdown_flush();
            return;
        }

        // a deferred upstream switch fires once only the request that caused
        // it is left outstanding
        if self.queue.len() <= 1 {
            if let Some(addr) = self.pending_reconnect.take() {
                self.replace_upstream(addr, session);
                if self.state == PipelineState::Closed || self.answer.is_some() {
                    return;
                }
                if let Some(block) = self.deferred_block.take() {
                    self.write_upstream_block(block);
                }
                self.client_readiness.interest.insert(Ready::READABLE);
                return;
            }
        }

        if self.queue.is_empty() {
            if self.stopping {
                self.shutdown_flush();
                return;
            }

            if !self.config.keep_upstream_alive {
                let safe = self
                    .upstream
                    .as_ref()
                    .map(|stream| !stream.data_available())
                    .unwrap_or(false)
                    && self.to_upstream.available_data() == 0
                    && self.pending_upstream_block.is_none();
                if safe {
                    debug!("{}tearing down idle upstream", self.log_context());
                    self.close_upstream();
                    self.state = PipelineState::Connecting;
                }
            }
        }
    }

    fn upstream_failed(&mut self) {
        self.close_upstream();
        if self.response_started {
            self.shutdown_quiet();
        } else {
            self.set_answer(AnswerKind::Answer502);
        }
    }

    fn upstream_hup(&mut self) {
        self.upstream_readiness.event.remove(Ready::HUP);
        if self.upstream_readiness.event.is_readable()
            && self.upstream_readiness.interest.is_readable()
        {
            // drain buffered response bytes first
            return;
        }
        self.upstream_closed();
    }

    /// the upstream side ended; depending on where we are this is normal
    /// end-of-response, a failure to answer, or an idle close
    fn upstream_closed(&mut self) {
        if self.outbound.is_passthrough() {
            // close delimited response (or upgraded connection): this is the
            // regular end
            if let Some(exchange) = self.queue.pop_front() {
                self.log_access(&exchange, false);
            }
            self.shutdown_flush();
            return;
        }

        if self.queue.is_empty() {
            // idle keep-alive upstream went away; reopen lazily on the next
            // request
            debug!("{}idle upstream closed", self.log_context());
            self.close_upstream();
            self.state = PipelineState::Connecting;
            return;
        }

        error!("{}upstream closed mid exchange", self.log_context());
        self.close_upstream();
        if self.response_started {
            self.shutdown_quiet();
        } else {
            self.set_answer(AnswerKind::Answer502);
        }
    }

    // ------------------------------------------------------------------
    // faults, hand-over, shutdown
    // ------------------------------------------------------------------

    fn account_bytes(&mut self, count: u64) -> Result<(), LimitBreach> {
        let limits = match self.config.source_limits {
            Some(limits) => limits,
            None => return Ok(()),
        };
        let mut ctx = self.ctx.borrow_mut();
        if count > 0 {
            ctx.stats.record_bytes(self.peer.ip(), count);
        }
        ctx.stats.check(self.peer.ip(), &limits)
    }

    fn limit_breach(&mut self, breach: LimitBreach) {
        error!(
            "{}bandwidth limit exceeded: {} requests and {} bytes in the last {:?}, blocking {}",
            self.log_context(),
            breach.requests,
            breach.bytes,
            breach.window_age,
            self.peer.ip()
        );
        self.ctx.borrow_mut().blocklist.block_temporarily(self.peer.ip());
        self.shutdown_quiet();
    }

    fn apply_fault(&mut self, fault: RelayFault) {
        if self.config.debug {
            error!("{}fault: {:?}", self.log_context(), fault);
        }

        match fault {
            RelayFault::Status(kind) => {
                if self.response_started {
                    self.shutdown_quiet();
                } else {
                    self.set_answer(kind);
                }
            }
            RelayFault::Redirect {
                location,
                permanent,
            } => {
                let status = if permanent { 301 } else { 302 };
                let buf = Rc::new(crate::answers::HttpAnswers::redirect(&location, permanent));
                self.set_answer_bytes(status, buf);
            }
            RelayFault::Silent => self.shutdown_quiet(),
            RelayFault::Internal(message) => {
                error!("{}internal fault: {}", self.log_context(), message);
                let kind = if self.ever_connected {
                    AnswerKind::Answer500
                } else {
                    AnswerKind::Answer502
                };
                if self.response_started {
                    self.shutdown_quiet();
                } else {
                    self.set_answer(kind);
                }
            }
        }
    }

    fn set_answer(&mut self, kind: AnswerKind) {
        let buf = self.ctx.borrow().answers.get(kind);
        self.set_answer_bytes(kind.into(), buf);
    }

    fn set_answer_bytes(&mut self, status: u16, buf: Rc<Vec<u8>>) {
        if self.state == PipelineState::Closed {
            return;
        }
        if let Some((existing, _, _)) = self.answer {
            error!(
                "{}already answering {}, dropping a second {} answer",
                self.log_context(),
                existing,
                status
            );
            return;
        }

        // the upstream side goes first on every shutdown we initiate
        self.close_upstream();
        self.to_client.clear();
        self.pending_client_block = None;

        if let Some(exchange) = self.queue.front_mut() {
            exchange.fault_status = Some(status);
        }

        self.answer = Some((status, buf, 0));
        self.client_readiness.interest = Ready::WRITABLE | Ready::HUP | Ready::ERROR;
        self.state = PipelineState::ShuttingDown;
    }

    fn stage_handover(
        &mut self,
        kind: Handover,
        request: RequestHead,
        upstream: Option<UpstreamAddr>,
    ) {
        let raw = self.inbound.take_raw();
        if let Some(client) = self.client.as_mut() {
            if let Err(e) = client.unconsume(&raw, true) {
                error!(
                    "{}could not re-drive the request for hand-over: {}",
                    self.log_context(),
                    e
                );
                self.apply_fault(RelayFault::internal("hand-over pushback failed"));
                return;
            }
        }

        debug!("{}handing connection over ({:?})", self.log_context(), kind);
        self.staged_handover = Some((kind, request, upstream));
        self.client_readiness.interest = Ready::EMPTY;
    }

    /// closes without sending anything; pending relayed bytes are still
    /// flushed to the client first
    fn shutdown_quiet(&mut self) {
        match self.state {
            PipelineState::Closed | PipelineState::ShuttingDown => return,
            _ => {}
        }
        self.close_upstream();
        if self.to_client.available_data() > 0 {
            self.state = PipelineState::ShuttingDown;
            self.client_readiness.interest = Ready::WRITABLE | Ready::HUP | Ready::ERROR;
        } else {
            self.close_now();
        }
    }

    /// flush whatever is queued toward the client, then close
    fn shutdown_flush(&mut self) {
        if self.state == PipelineState::Closed {
            return;
        }
        self.close_upstream();
        if self.to_client.available_data() > 0 || self.pending_client_block.is_some() {
            self.state = PipelineState::ShuttingDown;
            self.client_readiness.interest = Ready::WRITABLE | Ready::HUP | Ready::ERROR;
        } else {
            self.close_now();
        }
    }

    fn close_now(&mut self) {
        self.state = PipelineState::Closed;
        self.client_readiness.reset();
        self.upstream_readiness.reset();
    }

    fn log_access(&mut self, exchange: &Exchange, error: bool) {
        let should_log = self
            .ctx
            .borrow_mut()
            .stats
            .should_log(self.peer.ip(), self.config.access_log_interval);
        if !should_log {
            return;
        }

        let request = exchange.request.as_ref();
        let record = AccessRecord {
            client_ip: exchange.peer_ip,
            method: request.map(|r| &r.line.method),
            path: request.map(|r| r.line.uri.as_str()),
            version: request.map(|r| r.line.version),
            status: exchange.status(),
            bytes_out: exchange.bytes_out,
            referer: request.and_then(|r| r.headers.first("Referer")),
            user_agent: request.and_then(|r| r.headers.first("User-Agent")),
        };
        if error {
            error_access!("{}", record);
        } else {
            info_access!("{}", record);
        }
    }
}

impl ProxySession for Pipeline {
    fn ready(&mut self, session: Rc<RefCell<dyn ProxySession>>) -> SessionResult {
        self.last_event = Instant::now();

        if self.state == PipelineState::Closed {
            return SessionResult::Close;
        }

        let mut counter = 0usize;
        loop {
            counter += 1;
            if counter == MAX_LOOP_ITERATIONS {
                error!(
                    "{}dispatch loop ran {} times, closing the session",
                    self.log_context(),
                    MAX_LOOP_ITERATIONS
                );
                self.close_now();
                return SessionResult::Close;
            }

            let client_interest = self.client_readiness.filter_interest();
            let upstream_interest = self.upstream_readiness.filter_interest();

            trace!(
                "{}ready: client={:?} upstream={:?}",
                self.log_context(),
                self.client_readiness,
                self.upstream_readiness
            );

            if client_interest.is_empty() && upstream_interest.is_empty() {
                break;
            }

            if client_interest.is_error() {
                error!("{}client socket error", self.log_context());
                self.close_now();
                return SessionResult::Close;
            }
            if upstream_interest.is_error() {
                self.upstream_readiness.event.remove(Ready::ERROR);
                self.upstream_failed();
                continue;
            }

            if client_interest.is_readable() {
                self.client_readable(&session);
            }
            if self.state != PipelineState::Closed {
                if self.upstream_readiness.filter_interest().is_writable() {
                    self.upstream_writable();
                }
                if self.upstream_readiness.filter_interest().is_readable() {
                    self.upstream_readable(&session);
                }
                if self.client_readiness.filter_interest().is_writable() {
                    self.client_writable();
                }
                if self.upstream_readiness.filter_interest().is_hup() {
                    self.upstream_hup();
                }
                if self.client_readiness.filter_interest().is_hup() {
                    self.client_hup();
                }
            }

            if self.staged_handover.is_some() {
                return SessionResult::Handover;
            }
            if self.state == PipelineState::Closed {
                return SessionResult::Close;
            }
        }

        if self.staged_handover.is_some() {
            SessionResult::Handover
        } else if self.state == PipelineState::Closed {
            SessionResult::Close
        } else {
            SessionResult::Continue
        }
    }

    fn update_readiness(&mut self, token: Token, events: Ready) {
        if token == self.client_token {
            self.client_readiness.event.insert(events);
        } else if Some(token) == self.upstream_token {
            self.upstream_readiness.event.insert(events);
        }
        self.last_event = Instant::now();
    }

    fn timeout(&mut self, token: Token) -> SessionResult {
        if token == self.client_token {
            let can_close = match self.client.as_mut() {
                Some(client) => client.idle_expired(),
                None => true,
            };
            if can_close {
                debug!("{}client idle timeout", self.log_context());
                self.shutdown_quiet();
                return if self.state == PipelineState::Closed {
                    SessionResult::Close
                } else {
                    SessionResult::Continue
                };
            }
            // buffered bytes remain: re-drive the state machine so they are
            // delivered before the close is finalized
            self.client_readiness.event.insert(Ready::READABLE);
            return SessionResult::Continue;
        }

        if Some(token) == self.upstream_token {
            if !self.upstream_connected {
                error!("{}upstream connect timeout", self.log_context());
                self.upstream_failed();
                return SessionResult::Continue;
            }
            let can_close = match self.upstream.as_mut() {
                Some(stream) => stream.idle_expired(),
                None => true,
            };
            if can_close {
                debug!("{}upstream idle timeout", self.log_context());
                self.upstream_closed();
                if self.state == PipelineState::Closed {
                    return SessionResult::Close;
                }
            } else {
                self.upstream_readiness.event.insert(Ready::READABLE);
            }
            return SessionResult::Continue;
        }

        SessionResult::Continue
    }

    fn last_event(&self) -> Instant {
        self.last_event
    }

    fn close(&mut self) {
        if let Some(stream) = self.client.take() {
            let (mut sock, _buffered) = stream.into_parts();
            if let Err(e) = self.poll_registry.deregister(&mut sock) {
                debug!("{}error deregistering client: {}", self.log_context(), e);
            }
        }
        self.close_upstream();
        self.ctx.borrow_mut().registry.remove(&self.peer);
        self.state = PipelineState::Closed;
    }

    fn shutting_down(&mut self) -> SessionResult {
        self.stopping = true;
        if self.queue.is_empty()
            && self.to_client.available_data() == 0
            && self.answer.is_none()
            && self.staged_handover.is_none()
        {
            self.close_now();
            SessionResult::Close
        } else {
            SessionResult::Continue
        }
    }

    fn tokens(&self) -> Vec<Token> {
        let mut tokens = vec![self.client_token];
        if let Some(token) = self.upstream_token {
            tokens.push(token);
        }
        tokens
    }

    fn print_state(&self, context: &str) {
        error!(
            "{} Session(Pipeline) {}: state={:?} queue={} client={:?} upstream={:?} addr={:?}",
            context,
            self.request_id,
            self.state,
            self.queue.len(),
            self.client_readiness,
            self.upstream_readiness,
            self.upstream_addr,
        );
    }

    fn take_handover(&mut self) -> Option<HandoverPayload> {
        let (kind, request, upstream) = self.staged_handover.take()?;
        let stream = self.client.take()?;
        let (mut sock, buffered) = stream.into_parts();

        if let Err(e) = self.poll_registry.deregister(&mut sock) {
            debug!("{}error deregistering client: {}", self.log_context(), e);
        }
        self.close_upstream();
        self.state = PipelineState::Closed;

        let stream = unsafe { std::net::TcpStream::from_raw_fd(sock.into_raw_fd()) };
        Some(HandoverPayload {
            kind,
            stream,
            buffered,
            request,
            upstream,
        })
    }
}
