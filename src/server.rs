//! event loop management
//!
//! `Server` owns the mio poll, the listeners and the slab of sessions, all
//! indexed by [Token]. One thread runs the whole proxy: socket events and
//! timeouts are dispatched to sessions, periodic maintenance prunes expired
//! blocks and usage windows, and a [ServerHandle] lets another thread
//! request a graceful stop through a waker.

use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    io::Write,
    net::SocketAddr,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use mio::{net::TcpListener, net::TcpStream, Events, Interest, Poll, Token, Waker};
use slab::Slab;

use crate::{
    answers::{AnswerKind, HttpAnswers},
    config::ProxyConfig,
    exchange::{Handover, LineHook, LocalHandler, Router, UpgradeHandler},
    pipeline::Pipeline,
    pool::Pool,
    registry::{BlockSpec, Blocklist, ConnectionRegistry, SourceStats},
    socket::server_bind,
    timer::Timer,
    ProxySession, Ready, SessionResult,
};

thread_local! {
  pub static TIMER: RefCell<Timer<Token>> = RefCell::new(Timer::default());
}

const WAKER_TOKEN: Token = Token(0);
/// how long a graceful stop may drain before sessions are force closed
const HARD_STOP_DELAY: Duration = Duration::from_secs(30);

pub struct SessionManager {
    pub slab: Slab<Rc<RefCell<dyn ProxySession>>>,
    pub max_connections: usize,
    pub nb_connections: usize,
    pub can_accept: bool,
}

impl SessionManager {
    pub fn new(max_connections: usize) -> SessionManager {
        SessionManager {
            slab: Slab::with_capacity(10 + 2 * max_connections),
            max_connections,
            nb_connections: 0,
            can_accept: true,
        }
    }

    pub fn slab_capacity(&self) -> usize {
        10 + 2 * self.max_connections
    }

    pub fn check_limits(&mut self) -> bool {
        if self.nb_connections >= self.max_connections {
            error!("max number of client connections reached, flushing the accept queue");
            self.can_accept = false;
            return false;
        }

        if self.slab.len() >= self.slab_capacity() {
            error!(
                "not enough session slots to accept another connection, nb_connections: {}, max_connections: {}",
                self.nb_connections, self.max_connections
            );
            self.can_accept = false;
            return false;
        }

        true
    }

    pub fn incr(&mut self) {
        self.nb_connections += 1;
    }

    pub fn decr(&mut self) {
        if self.nb_connections == 0 {
            error!("closing a session but no connection was counted");
            return;
        }
        self.nb_connections -= 1;

        // do not be ready to accept right away, wait until we get back to
        // 90% capacity
        if !self.can_accept && self.nb_connections < self.max_connections * 90 / 100 {
            debug!(
                "nb_connections = {}, max_connections = {}, starting to accept again",
                self.nb_connections, self.max_connections
            );
            self.can_accept = true;
        }
    }
}

/// process wide collaborators injected into every session
///
/// tests can run several independent servers because nothing here is a
/// global: each server carries its own context
pub struct ServerContext {
    pub config: Rc<ProxyConfig>,
    pub answers: HttpAnswers,
    pub registry: ConnectionRegistry,
    pub blocklist: Blocklist,
    pub stats: SourceStats,
    pub router: Box<dyn Router>,
    pub line_hook: Option<LineHook>,
    pub local_handler: Option<Box<dyn LocalHandler>>,
    pub upgrade_handler: Option<Box<dyn UpgradeHandler>>,
}

/// slab placeholder for tokens that do not belong to a client session (the
/// waker, the listeners)
struct ListenSession;

impl ProxySession for ListenSession {
    fn ready(&mut self, _session: Rc<RefCell<dyn ProxySession>>) -> SessionResult {
        SessionResult::Continue
    }

    fn update_readiness(&mut self, _token: Token, _events: Ready) {}

    fn timeout(&mut self, _token: Token) -> SessionResult {
        SessionResult::Continue
    }

    fn last_event(&self) -> Instant {
        Instant::now()
    }

    fn close(&mut self) {}

    fn shutting_down(&mut self) -> SessionResult {
        SessionResult::Continue
    }

    fn tokens(&self) -> Vec<Token> {
        Vec::new()
    }

    fn print_state(&self, _context: &str) {}
}

/// asks the event loop thread to stop from anywhere else
#[derive(Clone)]
pub struct ServerHandle {
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
}

impl ServerHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            error!("could not wake the event loop: {}", e);
        }
    }
}

pub struct Server {
    poll: Poll,
    poll_registry: Rc<mio::Registry>,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
    config: Rc<ProxyConfig>,
    sessions: Rc<RefCell<SessionManager>>,
    ctx: Rc<RefCell<ServerContext>>,
    pool: Rc<RefCell<Pool>>,
    listeners: HashMap<Token, TcpListener>,
    accept_ready: HashSet<Token>,
    shutting_down: bool,
    hard_stop_deadline: Option<Instant>,
    last_maintenance: Instant,
    last_zombie_check: Instant,
}

impl Server {
    pub fn try_new(config: ProxyConfig, router: Box<dyn Router>) -> anyhow::Result<Server> {
        let poll = Poll::new().with_context(|| "could not create the event loop")?;
        let waker = Arc::new(
            Waker::new(poll.registry(), WAKER_TOKEN)
                .with_context(|| "could not create the waker")?,
        );
        let poll_registry = Rc::new(
            poll.registry()
                .try_clone()
                .with_context(|| "could not clone the mio registry")?,
        );

        let config = Rc::new(config);
        let pool = Rc::new(RefCell::new(Pool::with_capacity(
            config.min_buffers,
            config.max_buffers,
            config.buffer_size,
        )));

        let mut sessions = SessionManager::new(config.max_sessions);
        let entry = sessions.slab.vacant_entry();
        assert_eq!(Token(entry.key()), WAKER_TOKEN);
        entry.insert(Rc::new(RefCell::new(ListenSession)));
        let sessions = Rc::new(RefCell::new(sessions));

        let static_blocklist = config
            .static_blocklist
            .iter()
            .map(|line| line.parse::<BlockSpec>())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| "invalid static block list")?;
        let blocklist = Blocklist::new(static_blocklist, config.blocklist_path.clone());

        let ctx = Rc::new(RefCell::new(ServerContext {
            config: config.clone(),
            answers: HttpAnswers::new(),
            registry: ConnectionRegistry::new(),
            blocklist,
            stats: SourceStats::new(),
            router,
            line_hook: None,
            local_handler: None,
            upgrade_handler: None,
        }));

        let mut server = Server {
            poll,
            poll_registry,
            waker,
            stop: Arc::new(AtomicBool::new(false)),
            config: config.clone(),
            sessions,
            ctx,
            pool,
            listeners: HashMap::new(),
            accept_ready: HashSet::new(),
            shutting_down: false,
            hard_stop_deadline: None,
            last_maintenance: Instant::now(),
            last_zombie_check: Instant::now(),
        };

        for addr in config.listen_addresses.iter() {
            server.add_listener(*addr)?;
        }

        Ok(server)
    }

    pub fn add_listener(&mut self, addr: SocketAddr) -> anyhow::Result<Token> {
        let mut listener =
            server_bind(addr).with_context(|| format!("could not bind {addr}"))?;

        let token = {
            let mut sessions = self.sessions.borrow_mut();
            let entry = sessions.slab.vacant_entry();
            let token = Token(entry.key());
            entry.insert(Rc::new(RefCell::new(ListenSession)));
            token
        };

        self.poll
            .registry()
            .register(&mut listener, token, Interest::READABLE)
            .with_context(|| format!("could not register the listener for {addr}"))?;

        info!("listening on {}", addr);
        self.listeners.insert(token, listener);
        Ok(token)
    }

    pub fn set_line_hook(&mut self, hook: LineHook) {
        self.ctx.borrow_mut().line_hook = Some(hook);
    }

    pub fn set_local_handler(&mut self, handler: Box<dyn LocalHandler>) {
        self.ctx.borrow_mut().local_handler = Some(handler);
    }

    pub fn set_upgrade_handler(&mut self, handler: Box<dyn UpgradeHandler>) {
        self.ctx.borrow_mut().upgrade_handler = Some(handler);
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            waker: self.waker.clone(),
            stop: self.stop.clone(),
        }
    }

    /// administrator block; also rewrites the blocklist file
    pub fn block(&mut self, spec: BlockSpec) {
        self.ctx.borrow_mut().blocklist.block(spec);
    }

    pub fn unblock(&mut self, spec: BlockSpec) {
        self.ctx.borrow_mut().blocklist.unblock(spec);
    }

    pub fn list_blocked(&self) -> Vec<String> {
        self.ctx.borrow().blocklist.list_blocked()
    }

    pub fn run(&mut self) {
        let mut events = Events::with_capacity(1024);
        let max_poll_errors = 10_000;
        let mut current_poll_errors = 0;

        loop {
            if current_poll_errors == max_poll_errors {
                error!(
                    "Something is going very wrong. Last {} poll() calls failed, crashing..",
                    current_poll_errors
                );
                panic!("poll() calls failed {current_poll_errors} times in a row");
            }

            let timeout = self.poll_timeout();
            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(_) => current_poll_errors = 0,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("error while polling events: {:?}", e);
                    current_poll_errors += 1;
                    continue;
                }
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {
                        // nothing to read, the wake only interrupts the poll
                    }
                    token if self.listeners.contains_key(&token) => {
                        self.accept_ready.insert(token);
                    }
                    token => {
                        self.ready(token, Ready::from(event));
                    }
                }
            }

            self.accept_sockets();

            loop {
                let token = TIMER.with(|timer| timer.borrow_mut().poll());
                match token {
                    Some(token) => self.timeout(token),
                    None => break,
                }
            }

            self.maintenance_tick();

            if self.stop.load(Ordering::SeqCst) && !self.shutting_down {
                self.start_shutdown();
            }

            if self.shutting_down {
                let connections = self.sessions.borrow().nb_connections;
                let past_deadline = self
                    .hard_stop_deadline
                    .map(|deadline| Instant::now() >= deadline)
                    .unwrap_or(false);

                if connections == 0 {
                    info!("last session closed, stopping the event loop");
                    break;
                }
                if past_deadline {
                    warn!("hard stop: closing {} remaining sessions", connections);
                    self.close_all_sessions();
                    break;
                }
            }
        }
    }

    fn poll_timeout(&self) -> Duration {
        let default = Duration::from_millis(1000);
        let now = Instant::now();
        TIMER
            .with(|timer| timer.borrow().next_poll_date())
            .map(|date| {
                if date <= now {
                    Duration::from_millis(0)
                } else {
                    std::cmp::min(date - now, default)
                }
            })
            .unwrap_or(default)
    }

    fn accept_sockets(&mut self) {
        let ready: Vec<Token> = self.accept_ready.iter().copied().collect();

        for token in ready {
            loop {
                if !self.sessions.borrow().can_accept || self.shutting_down {
                    // keep the token in accept_ready, the kernel queue is
                    // drained again once capacity frees up
                    break;
                }

                let accepted = match self.listeners.get_mut(&token) {
                    Some(listener) => listener.accept(),
                    None => break,
                };

                match accepted {
                    Ok((stream, peer)) => self.create_session(stream, peer),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        self.accept_ready.remove(&token);
                        break;
                    }
                    Err(e) => {
                        error!("accept() failed: {:?}", e);
                        self.accept_ready.remove(&token);
                        break;
                    }
                }
            }
        }
    }

    fn create_session(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        if self.ctx.borrow().blocklist.is_blocked(peer.ip()) {
            debug!("rejecting connection from blocked address {}", peer.ip());
            return;
        }

        // admission control: evict the least recently refreshed sessions,
        // unless they are all protected by the keepalive floor
        let (evicted, exceeded) = {
            let ctx = self.ctx.borrow();
            ctx.registry
                .eviction_plan(self.config.max_sessions, self.config.min_session_keepalive)
        };
        for token in evicted {
            info!("evicting session {:?} to make room", token);
            self.close_session(token);
        }
        if exceeded {
            let known = self.ctx.borrow().stats.known_source(peer.ip());
            if known {
                warn!(
                    "registry exceeds capacity ({} sessions), keeping known client {}",
                    self.ctx.borrow().registry.len(),
                    peer.ip()
                );
            } else {
                info!("registry full, rejecting unknown client {}", peer.ip());
                let answer = self.ctx.borrow().answers.get(AnswerKind::Answer503);
                let _ = stream.write(&answer);
                return;
            }
        }

        if !self.sessions.borrow_mut().check_limits() {
            return;
        }

        let (to_upstream, to_client) = {
            let mut pool = self.pool.borrow_mut();
            match (pool.checkout(), pool.checkout()) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    error!("could not get buffers from the pool, dropping the connection");
                    return;
                }
            }
        };

        let token = Token(self.sessions.borrow().slab.vacant_key());
        if let Err(e) = self.poll_registry.register(
            &mut stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            error!("could not register the client socket: {}", e);
            return;
        }

        let pipeline = Pipeline::new(
            stream,
            token,
            peer,
            self.config.clone(),
            self.ctx.clone(),
            self.sessions.clone(),
            self.poll_registry.clone(),
            to_upstream,
            to_client,
        );
        let session: Rc<RefCell<dyn ProxySession>> = Rc::new(RefCell::new(pipeline));

        {
            let mut sessions = self.sessions.borrow_mut();
            let entry = sessions.slab.vacant_entry();
            assert_eq!(Token(entry.key()), token);
            entry.insert(session);
            sessions.incr();
        }
        self.ctx.borrow_mut().registry.insert(peer, token);
        debug!("accepted {} as {:?}", peer, token);
    }

    fn ready(&mut self, token: Token, events: Ready) {
        let session = match self.sessions.borrow().slab.get(token.0) {
            Some(session) => session.clone(),
            None => return,
        };

        session.borrow_mut().update_readiness(token, events);
        let result = session.borrow_mut().ready(session.clone());
        self.handle_session_result(&session, result);
    }

    fn timeout(&mut self, token: Token) {
        let session = match self.sessions.borrow().slab.get(token.0) {
            Some(session) => session.clone(),
            None => return,
        };

        let timeout_result = session.borrow_mut().timeout(token);
        match timeout_result {
            SessionResult::Close => self.close_session_rc(&session),
            _ => {
                let result = session.borrow_mut().ready(session.clone());
                self.handle_session_result(&session, result);
            }
        }
    }

    fn handle_session_result(
        &mut self,
        session: &Rc<RefCell<dyn ProxySession>>,
        result: SessionResult,
    ) {
        match result {
            SessionResult::Continue => {}
            SessionResult::Close => self.close_session_rc(session),
            SessionResult::Handover => {
                let payload = session.borrow_mut().take_handover();
                self.close_session_rc(session);

                let payload = match payload {
                    Some(payload) => payload,
                    None => return,
                };
                let mut ctx = self.ctx.borrow_mut();
                match payload.kind {
                    Handover::Local => match ctx.local_handler.as_mut() {
                        Some(handler) => {
                            handler.take_over(payload.stream, payload.buffered, payload.request)
                        }
                        None => warn!("no local handler configured, dropping the connection"),
                    },
                    Handover::Upgrade => match (ctx.upgrade_handler.as_mut(), payload.upstream) {
                        (Some(handler), Some(upstream)) => handler.take_over(
                            payload.stream,
                            payload.buffered,
                            upstream,
                            payload.request,
                        ),
                        _ => warn!("no upgrade handler configured, dropping the connection"),
                    },
                }
            }
        }
    }

    fn close_session(&mut self, token: Token) {
        let session = match self.sessions.borrow().slab.get(token.0) {
            Some(session) => session.clone(),
            None => return,
        };
        self.close_session_rc(&session);
    }

    fn close_session_rc(&mut self, session: &Rc<RefCell<dyn ProxySession>>) {
        let tokens = session.borrow().tokens();
        let main = match tokens.first() {
            Some(token) => *token,
            None => return,
        };
        if !self.sessions.borrow().slab.contains(main.0) {
            // already closed from another trigger
            return;
        }

        session.borrow_mut().close();

        let mut sessions = self.sessions.borrow_mut();
        for token in tokens {
            if sessions.slab.contains(token.0) {
                sessions.slab.remove(token.0);
            }
        }
        sessions.decr();
    }

    fn maintenance_tick(&mut self) {
        let now = Instant::now();

        if now.duration_since(self.last_maintenance) >= self.config.maintenance_interval {
            self.last_maintenance = now;
            let mut ctx = self.ctx.borrow_mut();
            let pruned = ctx.blocklist.prune(self.config.block_retention);
            if pruned > 0 {
                info!("pruned {} expired temporary blocks", pruned);
            }
            ctx.stats.prune(self.config.block_retention);
            drop(ctx);
            log::logger().flush();
        }

        if now.duration_since(self.last_zombie_check) >= self.config.zombie_check_interval {
            self.last_zombie_check = now;
            self.zombie_check(now);
        }
    }

    /// sessions which saw no event for a whole check interval are stuck;
    /// dump their state and close them
    fn zombie_check(&mut self, now: Instant) {
        let mut zombies = Vec::new();
        for (_, session) in self.sessions.borrow().slab.iter() {
            let s = session.borrow();
            if s.tokens().is_empty() {
                continue;
            }
            if now.duration_since(s.last_event()) > self.config.zombie_check_interval {
                s.print_state("ZOMBIE");
                zombies.push(session.clone());
            }
        }

        let count = zombies.len();
        for session in zombies {
            self.close_session_rc(&session);
        }
        if count > 0 {
            warn!("closed {} zombie sessions", count);
        }
    }

    fn start_shutdown(&mut self) {
        info!("shutting down gracefully");
        self.shutting_down = true;
        self.hard_stop_deadline = Some(Instant::now() + HARD_STOP_DELAY);

        for (token, mut listener) in self.listeners.drain() {
            if let Err(e) = self.poll.registry().deregister(&mut listener) {
                error!("error deregistering listener: {}", e);
            }
            let mut sessions = self.sessions.borrow_mut();
            if sessions.slab.contains(token.0) {
                sessions.slab.remove(token.0);
            }
        }
        self.accept_ready.clear();

        let candidates: Vec<Rc<RefCell<dyn ProxySession>>> = self
            .sessions
            .borrow()
            .slab
            .iter()
            .map(|(_, session)| session.clone())
            .filter(|session| !session.borrow().tokens().is_empty())
            .collect();

        for session in candidates {
            let result = session.borrow_mut().shutting_down();
            if result == SessionResult::Close {
                self.close_session_rc(&session);
            }
        }
    }

    fn close_all_sessions(&mut self) {
        let candidates: Vec<Rc<RefCell<dyn ProxySession>>> = self
            .sessions
            .borrow()
            .slab
            .iter()
            .map(|(_, session)| session.clone())
            .filter(|session| !session.borrow().tokens().is_empty())
            .collect();

        for session in candidates {
            self.close_session_rc(&session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::SourceLimits,
        exchange::{Handover, RequestHead, Route},
        parser::RequestLine,
        socket::UpstreamAddr,
    };
    use serial_test::serial;
    use std::{
        io::Read,
        net::{TcpListener as StdTcpListener, TcpStream as StdTcpStream},
        sync::{mpsc, Barrier},
        thread,
    };
    use tiny_http::{Response, Server as UpstreamServer};

    struct StaticRouter {
        upstream: UpstreamAddr,
    }

    impl StaticRouter {
        fn to_port(port: u16) -> Box<StaticRouter> {
            Box::new(StaticRouter {
                upstream: UpstreamAddr::Tcp(format!("127.0.0.1:{port}").parse().unwrap()),
            })
        }
    }

    impl Router for StaticRouter {
        fn route(
            &mut self,
            _request: &mut RequestHead,
            _peer: SocketAddr,
        ) -> Result<Route, crate::fault::RelayFault> {
            Ok(Route::Upstream(self.upstream.clone()))
        }
    }

    fn setup_test_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn proxy_config(port: u16) -> ProxyConfig {
        ProxyConfig {
            listen_addresses: vec![format!("127.0.0.1:{port}").parse().unwrap()],
            ..Default::default()
        }
    }

    /// the server is built in its own thread (it is not Send); the handle
    /// comes back once the listeners are bound
    fn start_proxy(config: ProxyConfig, router: Box<dyn Router + Send>) -> ServerHandle {
        start_proxy_with(config, router, |_| {})
    }

    fn start_proxy_with(
        config: ProxyConfig,
        router: Box<dyn Router + Send>,
        setup: impl FnOnce(&mut Server) + Send + 'static,
    ) -> ServerHandle {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            setup_test_logger();
            let mut server = Server::try_new(config, router).expect("could not create the proxy");
            setup(&mut server);
            tx.send(server.handle()).expect("could not send the handle");
            server.run();
        });
        rx.recv().expect("the proxy thread died during setup")
    }

    fn start_upstream(port: u16, barrier: Arc<Barrier>) {
        thread::spawn(move || {
            let server = UpstreamServer::http(format!("127.0.0.1:{port}"))
                .expect("could not create the upstream server");
            info!("starting upstream server on port {}", port);
            barrier.wait();

            for request in server.incoming_requests() {
                let body = request.url().to_string();
                let response = Response::from_string(body);
                request.respond(response).unwrap();
            }
        });
    }

    fn connect_client(port: u16) -> StdTcpStream {
        let client = StdTcpStream::connect(("127.0.0.1", port)).expect("could not connect");
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client
    }

    fn read_until_close(client: &mut StdTcpStream) -> Vec<u8> {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match client.read(&mut chunk) {
                Ok(0) => break,
                Ok(size) => buffer.extend_from_slice(&chunk[..size]),
                Err(_) => break,
            }
        }
        buffer
    }

    #[test]
    #[serial]
    fn round_trip() {
        setup_test_logger();
        let barrier = Arc::new(Barrier::new(2));
        start_upstream(16025, barrier.clone());
        barrier.wait();

        let handle = start_proxy(proxy_config(16024), StaticRouter::to_port(16025));

        let mut client = connect_client(16024);
        client
            .write_all(b"GET /hello HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .unwrap();

        let response = read_until_close(&mut client);
        let text = String::from_utf8_lossy(&response);
        println!("response: {text}");
        assert!(text.starts_with("HTTP/1.1 200"));
        assert!(text.ends_with("/hello"));

        handle.stop();
    }

    #[test]
    #[serial]
    fn pipelined_responses_come_back_in_request_order() {
        setup_test_logger();
        let barrier = Arc::new(Barrier::new(2));
        start_upstream(16035, barrier.clone());
        barrier.wait();

        let handle = start_proxy(proxy_config(16034), StaticRouter::to_port(16035));

        let mut client = connect_client(16034);
        // both requests leave before the first response is read back
        client
            .write_all(
                &b"GET /first HTTP/1.1\r\nHost: localhost\r\n\r\nGET /second HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"[..],
            )
            .unwrap();

        let response = read_until_close(&mut client);
        let text = String::from_utf8_lossy(&response);
        println!("response: {text}");

        let first = text.find("/first").expect("first response missing");
        let second = text.find("/second").expect("second response missing");
        assert!(first < second, "responses came back out of order");
        assert_eq!(text.matches("HTTP/1.1 200").count(), 2);

        handle.stop();
    }

    #[test]
    #[serial]
    fn upstream_refusal_answers_502() {
        setup_test_logger();
        // nothing listens on the routed port
        let handle = start_proxy(proxy_config(16044), StaticRouter::to_port(16045));

        let mut client = connect_client(16044);
        client
            .write_all(b"GET /a HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap();

        let response = read_until_close(&mut client);
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 502"), "got: {text}");

        handle.stop();
    }

    #[test]
    #[serial]
    fn blocked_sources_are_dropped_on_accept() {
        setup_test_logger();
        let mut config = proxy_config(16054);
        config.static_blocklist = vec!["127.0.0.1".to_string()];
        let handle = start_proxy(config, StaticRouter::to_port(16055));

        let mut client = connect_client(16054);
        let _ = client.write_all(b"GET /a HTTP/1.1\r\nHost: localhost\r\n\r\n");

        let mut chunk = [0u8; 256];
        match client.read(&mut chunk) {
            Ok(0) => {}
            Ok(size) => panic!("expected an immediate close, read {size} bytes"),
            // a reset is fine too
            Err(_) => {}
        }

        handle.stop();
    }

    #[test]
    #[serial]
    fn double_content_length_answers_400() {
        setup_test_logger();
        let handle = start_proxy(proxy_config(16064), StaticRouter::to_port(16065));

        let mut client = connect_client(16064);
        client
            .write_all(
                &b"POST /a HTTP/1.1\r\nHost: localhost\r\nContent-Length: 2\r\nContent-Length: 5\r\n\r\nab"[..],
            )
            .unwrap();

        let response = read_until_close(&mut client);
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 400"), "got: {text}");

        handle.stop();
    }

    /// raw upstream that answers 101 to the first request head, then echoes
    /// every byte it receives
    fn start_upgrade_upstream(port: u16, barrier: Arc<Barrier>) {
        thread::spawn(move || {
            let listener = StdTcpListener::bind(("127.0.0.1", port)).expect("could not bind");
            barrier.wait();

            let (mut sock, _) = listener.accept().expect("accept failed");
            let mut head = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let size = sock.read(&mut chunk).expect("read failed");
                assert!(size > 0, "client closed before the head completed");
                head.extend_from_slice(&chunk[..size]);
                if head.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let text = String::from_utf8_lossy(&head);
            assert!(text.contains("Upgrade: websocket"));

            sock.write_all(
                b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
            )
            .unwrap();

            loop {
                match sock.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(size) => sock.write_all(&chunk[..size]).unwrap(),
                }
            }
        });
    }

    #[test]
    #[serial]
    fn upgrade_switches_both_directions_to_passthrough() {
        setup_test_logger();
        let barrier = Arc::new(Barrier::new(2));
        start_upgrade_upstream(16075, barrier.clone());
        barrier.wait();

        let handle = start_proxy(proxy_config(16074), StaticRouter::to_port(16075));

        let mut client = connect_client(16074);
        client
            .write_all(
                b"GET /ws HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
            )
            .unwrap();

        // read the relayed 101 head
        let mut head = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let size = client.read(&mut chunk).expect("read failed");
            assert!(size > 0, "proxy closed before the 101 came back");
            head.extend_from_slice(&chunk[..size]);
            if head.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        let text = String::from_utf8_lossy(&head);
        assert!(text.starts_with("HTTP/1.1 101"), "got: {text}");

        // after the upgrade, bytes are no longer HTTP: they must relay
        // verbatim in both directions
        client.write_all(b"\x00ping-frame\xff").unwrap();
        let mut echoed = [0u8; 12];
        client.read_exact(&mut echoed).expect("echo did not come back");
        assert_eq!(&echoed[..], b"\x00ping-frame\xff");

        handle.stop();
    }

    struct TestLocalHandler;

    impl LocalHandler for TestLocalHandler {
        fn take_over(
            &mut self,
            mut stream: StdTcpStream,
            buffered: Vec<u8>,
            request: RequestHead,
        ) {
            // the raw stream arrives with the request bytes pushed back
            let text = String::from_utf8_lossy(&buffered);
            assert!(text.starts_with("GET /local"), "got: {text}");

            stream.set_nonblocking(false).unwrap();
            let body = format!("local:{}", request.line.uri);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).unwrap();
        }
    }

    #[test]
    #[serial]
    fn local_handover_releases_the_connection() {
        setup_test_logger();
        let handle = start_proxy_with(
            proxy_config(16084),
            StaticRouter::to_port(16085),
            |server| {
                server.set_line_hook(Box::new(|line: &mut RequestLine| {
                    if line.uri.starts_with("/local") {
                        Some(Handover::Local)
                    } else {
                        None
                    }
                }));
                server.set_local_handler(Box::new(TestLocalHandler));
            },
        );

        let mut client = connect_client(16084);
        client
            .write_all(b"GET /local/status HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap();

        let response = read_until_close(&mut client);
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200"), "got: {text}");
        assert!(text.ends_with("local:/local/status"), "got: {text}");

        handle.stop();
    }

    #[test]
    #[serial]
    fn request_ceiling_breach_blocks_the_source() {
        setup_test_logger();
        let barrier = Arc::new(Barrier::new(2));
        start_upstream(16095, barrier.clone());
        barrier.wait();

        let mut config = proxy_config(16094);
        config.source_limits = Some(SourceLimits {
            max_requests: 2,
            max_bytes: 1_000_000,
            window: Duration::from_secs(60),
        });
        let handle = start_proxy(config, StaticRouter::to_port(16095));

        // the first two requests pass
        for _ in 0..2 {
            let mut client = connect_client(16094);
            client
                .write_all(b"GET /ok HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                .unwrap();
            let response = read_until_close(&mut client);
            assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 200"));
        }

        // the third breaches the ceiling: silent shutdown, no response
        let mut client = connect_client(16094);
        client
            .write_all(b"GET /over HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap();
        let response = read_until_close(&mut client);
        assert!(response.is_empty(), "expected a silent close");

        // and the source address is now temporarily blocked at accept
        let mut client = connect_client(16094);
        let _ = client.write_all(b"GET /blocked HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let response = read_until_close(&mut client);
        assert!(response.is_empty(), "expected the blocked source to be dropped");

        handle.stop();
    }

    #[test]
    fn session_manager_limits() {
        let mut manager = SessionManager::new(2);
        assert!(manager.check_limits());
        manager.incr();
        manager.incr();
        assert!(!manager.check_limits());
        assert!(!manager.can_accept);

        manager.decr();
        manager.decr();
        assert!(manager.can_accept);
        assert!(manager.check_limits());
    }
}
