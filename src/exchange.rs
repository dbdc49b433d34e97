//! per request processing
//!
//! an [Exchange] is one request/response pair on a session: it parses and
//! validates one request head (inbound direction) or response head (outbound
//! direction), applies the injected routing policy, rewrites the configured
//! headers and detects hand-over situations. All processing errors surface
//! as a [RelayFault].

use std::net::{IpAddr, SocketAddr};

use crate::{
    answers::AnswerKind,
    config::ProxyConfig,
    fault::RelayFault,
    headers::HeaderMap,
    parser::{
        self, compare_no_case, message_header, request_line, status_line, Method, RequestLine,
        StatusLine, Version,
    },
    socket::UpstreamAddr,
};

/// where a request goes, decided per request by the deployment's policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Upstream(UpstreamAddr),
    /// hand the connection to the in-process local handler
    Local,
}

/// the upstream selection policy, injected per deployment
///
/// it receives the parsed request head (and may rewrite the target or the
/// headers) and returns where to relay it, or aborts with a fault
pub trait Router {
    fn route(&mut self, request: &mut RequestHead, peer: SocketAddr) -> Result<Route, RelayFault>;
}

/// external owner of connections routed to local handling
pub trait LocalHandler {
    fn take_over(&mut self, stream: std::net::TcpStream, buffered: Vec<u8>, request: RequestHead);
}

/// external owner of multiplexed upgraded connections
pub trait UpgradeHandler {
    fn take_over(
        &mut self,
        stream: std::net::TcpStream,
        buffered: Vec<u8>,
        upstream: UpstreamAddr,
        request: RequestHead,
    );
}

/// optional hook rewriting the request line before any other processing; may
/// also divert the request to local handling
pub type LineHook = Box<dyn FnMut(&mut RequestLine) -> Option<Handover>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handover {
    Local,
    Upgrade,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub line: RequestLine,
    pub headers: HeaderMap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: StatusLine,
    pub headers: HeaderMap,
}

/// connection scoped state the exchange validates against: the protocol
/// version and virtual host are pinned by the first request
pub struct SessionPin {
    pub host: Option<String>,
    pub version: Option<Version>,
}

impl SessionPin {
    pub fn new() -> SessionPin {
        SessionPin {
            host: None,
            version: None,
        }
    }
}

impl Default for SessionPin {
    fn default() -> SessionPin {
        SessionPin::new()
    }
}

/// what the flow should do after a request head was processed
#[derive(Debug)]
pub struct RequestDirective {
    /// rewritten head, ready to forward upstream
    pub block: Vec<u8>,
    /// request body bytes to relay after the head
    pub body_length: u64,
    pub upstream: Option<UpstreamAddr>,
    pub handover: Option<Handover>,
}

/// what the flow should do after a response head was processed
#[derive(Debug)]
pub struct ResponseDirective {
    /// rewritten head, ready to forward to the client
    pub block: Vec<u8>,
    pub body_length: u64,
    /// no declared length: relay until the upstream closes
    pub close_delimited: bool,
    /// successful 101: both directions switch to passthrough
    pub upgraded: bool,
    /// 1xx interim response: relay it but keep waiting for the real one
    pub interim: bool,
}

#[derive(Debug)]
pub struct Exchange {
    pub seq: u64,
    pub peer_ip: IpAddr,
    pub request: Option<RequestHead>,
    pub response: Option<ResponseHead>,
    pub request_length: u64,
    pub response_length: Option<u64>,
    pub close_delimited: bool,
    pub upgrade_requested: bool,
    pub upgraded: bool,
    /// the session shuts down once this exchange's response is fully relayed
    pub connection_close: bool,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// status of the answer the proxy produced itself, if it did
    pub fault_status: Option<u16>,
}

impl Exchange {
    pub fn new(seq: u64, peer_ip: IpAddr) -> Exchange {
        Exchange {
            seq,
            peer_ip,
            request: None,
            response: None,
            request_length: 0,
            response_length: None,
            close_delimited: false,
            upgrade_requested: false,
            upgraded: false,
            connection_close: false,
            bytes_in: 0,
            bytes_out: 0,
            fault_status: None,
        }
    }

    pub fn version(&self) -> Option<Version> {
        self.request.as_ref().map(|r| r.line.version)
    }

    pub fn status(&self) -> Option<u16> {
        self.fault_status
            .or_else(|| self.response.as_ref().map(|r| r.status.status))
    }

    /// parses and validates one request head from complete CRLF terminated
    /// lines (the first one being the request line), rewrites it, and asks
    /// the policy where it goes
    pub fn process_request(
        &mut self,
        lines: &[Vec<u8>],
        pin: &mut SessionPin,
        router: &mut dyn Router,
        hook: Option<&mut LineHook>,
        config: &ProxyConfig,
        peer: SocketAddr,
    ) -> Result<RequestDirective, RelayFault> {
        let raw = lines.first().ok_or(RelayFault::Status(AnswerKind::Answer400))?;
        let (_, raw_line) =
            request_line(raw).map_err(|_| RelayFault::Status(AnswerKind::Answer400))?;
        let mut line =
            RequestLine::from_raw(raw_line).ok_or(RelayFault::Status(AnswerKind::Answer400))?;

        let mut handover = None;
        if let Some(hook) = hook {
            handover = hook(&mut line);
        }

        // the protocol version is fixed by the first request of the session
        match pin.version {
            None => pin.version = Some(line.version),
            Some(pinned) if pinned != line.version => {
                return Err(RelayFault::Status(AnswerKind::Answer400));
            }
            Some(_) => {}
        }

        let mut headers = parse_header_lines(&lines[1..], AnswerKind::Answer400)?;

        if !config
            .allowed_methods
            .iter()
            .any(|m| compare_no_case(m.as_bytes(), line.method.as_ref().as_bytes()))
        {
            return Err(RelayFault::Status(AnswerKind::Answer405));
        }

        if headers.contains("Transfer-Encoding") {
            return Err(RelayFault::Status(AnswerKind::Answer501));
        }

        let declared = content_length(&headers, AnswerKind::Answer400)?;
        let body_length = match declared {
            Some(length) if line.method.expects_body() => length,
            // a declared length on a bodyless method relays nothing
            Some(_) => 0,
            None if line.method.expects_body() => {
                return Err(RelayFault::Status(AnswerKind::Answer411));
            }
            None => 0,
        };

        // all pipelined requests of one connection must target the same
        // virtual host
        let host = headers.first("Host").map(normalize_host);
        match (&pin.host, &host) {
            (Some(pinned), Some(host)) if pinned != host => {
                return Err(RelayFault::Status(AnswerKind::Answer400));
            }
            (None, Some(host)) => pin.host = Some(host.clone()),
            (_, None) => {
                if line.version == Version::V11 {
                    return Err(RelayFault::Status(AnswerKind::Answer400));
                }
            }
            _ => {}
        }

        self.upgrade_requested =
            headers.contains("Upgrade") && headers.has_token("Connection", "upgrade");

        self.connection_close = match line.version {
            Version::V10 => !headers.has_token("Connection", "keep-alive"),
            Version::V11 => headers.has_token("Connection", "close"),
        };

        if config.forward_headers {
            headers.set("X-Real-Ip", &peer.ip().to_string());
            headers.set("X-Scheme", config.scheme());
        } else {
            // never relay client forged forwarding headers
            headers.remove("X-Real-Ip");
            headers.remove("X-Scheme");
        }
        if let Some(host_override) = config.host_header.as_deref() {
            headers.set("Host", host_override);
        }

        let mut head = RequestHead { line, headers };

        let mut upstream = None;
        if handover != Some(Handover::Local) {
            match router.route(&mut head, peer)? {
                Route::Local => handover = Some(Handover::Local),
                Route::Upstream(addr) => upstream = Some(addr),
            }
        }

        if handover.is_none() && self.upgrade_requested && config.multiplex.is_some() {
            handover = Some(Handover::Upgrade);
        }

        let block = serialize_request(&head);
        self.request_length = body_length;
        self.request = Some(head);

        Ok(RequestDirective {
            block,
            body_length,
            upstream,
            handover,
        })
    }

    /// parses and validates one response head against this exchange's
    /// request; faults from here are internal (the client gets a 502)
    pub fn process_response(
        &mut self,
        lines: &[Vec<u8>],
        config: &ProxyConfig,
    ) -> Result<ResponseDirective, RelayFault> {
        let raw = lines
            .first()
            .ok_or_else(|| RelayFault::internal("empty response head"))?;
        let (_, raw_status) = status_line(raw)
            .map_err(|_| RelayFault::internal("could not parse the response status line"))?;
        let status = StatusLine::from_raw(raw_status)
            .ok_or_else(|| RelayFault::internal("invalid response status line"))?;

        let request_version = self
            .version()
            .ok_or_else(|| RelayFault::internal("response without a request"))?;
        if status.version != request_version {
            return Err(RelayFault::internal(format!(
                "upstream answered in {} to a {} request",
                status.version, request_version
            )));
        }

        let mut headers = parse_header_lines(&lines[1..], AnswerKind::Answer502)
            .map_err(|_| RelayFault::internal("could not parse the response headers"))?;

        if headers.contains("Transfer-Encoding") {
            return Err(RelayFault::internal(
                "transfer-encoded upstream responses are not supported",
            ));
        }
        let declared = content_length(&headers, AnswerKind::Answer502)
            .map_err(|_| RelayFault::internal("conflicting response content lengths"))?;

        let interim = status.status >= 100 && status.status < 200 && status.status != 101;

        let upgraded = status.status == 101 && self.upgrade_matches(&headers);
        if status.status == 101 && !upgraded {
            return Err(RelayFault::internal(
                "upstream switched protocols without a matching upgrade request",
            ));
        }

        let request_method = self.request.as_ref().map(|r| r.line.method.clone());
        let bodyless = interim
            || status.status == 204
            || status.status == 304
            || request_method == Some(Method::Head);

        let response_close = match status.version {
            Version::V10 => !headers.has_token("Connection", "keep-alive"),
            Version::V11 => headers.has_token("Connection", "close"),
        };

        let (body_length, close_delimited) = if upgraded || bodyless {
            (0, false)
        } else {
            match declared {
                Some(length) => (length, false),
                // a closing response without a length is relayed until the
                // upstream side ends
                None if response_close => (0, true),
                None => (0, false),
            }
        };

        if let Some(server) = config.server_header.as_deref() {
            headers.set("Server", server);
        }

        if !interim {
            self.connection_close |= response_close;
            self.response_length = if close_delimited { None } else { Some(body_length) };
            self.close_delimited = close_delimited;
            self.upgraded = upgraded;
        }

        let block = serialize_response(&status, &headers);
        if !interim {
            self.response = Some(ResponseHead { status, headers });
        }

        Ok(ResponseDirective {
            block,
            body_length,
            close_delimited,
            upgraded,
            interim,
        })
    }

    fn upgrade_matches(&self, response_headers: &HeaderMap) -> bool {
        if !self.upgrade_requested {
            return false;
        }
        let requested = match self
            .request
            .as_ref()
            .and_then(|head| head.headers.first("Upgrade"))
        {
            Some(value) => value,
            None => return false,
        };

        response_headers.has_token("Connection", "upgrade")
            && response_headers
                .first("Upgrade")
                .map(|value| compare_no_case(value.as_bytes(), requested.as_bytes()))
                .unwrap_or(false)
    }
}

fn parse_header_lines(lines: &[Vec<u8>], on_error: AnswerKind) -> Result<HeaderMap, RelayFault> {
    let mut headers = HeaderMap::new();
    for line in lines {
        let (_, header) =
            message_header(line).map_err(|_| RelayFault::Status(on_error))?;
        let name =
            std::str::from_utf8(header.name).map_err(|_| RelayFault::Status(on_error))?;
        let value =
            std::str::from_utf8(header.value).map_err(|_| RelayFault::Status(on_error))?;
        headers.push(name, value);
    }
    Ok(headers)
}

/// more than one value is a request smuggling vector and is rejected outright
fn content_length(headers: &HeaderMap, on_error: AnswerKind) -> Result<Option<u64>, RelayFault> {
    let mut values = headers.values("Content-Length");
    let first = match values.next() {
        None => return Ok(None),
        Some(value) => value,
    };
    if values.next().is_some() {
        return Err(RelayFault::Status(on_error));
    }
    first
        .trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| RelayFault::Status(on_error))
}

/// lowercases and strips the port so pinned host comparisons are stable
fn normalize_host(value: &str) -> String {
    let host = match parser::hostname_and_port(value.as_bytes()) {
        Ok((_, (host, _port))) => host,
        Err(_) => value.as_bytes(),
    };
    String::from_utf8_lossy(host).to_ascii_lowercase()
}

fn serialize_request(head: &RequestHead) -> Vec<u8> {
    let mut block = Vec::with_capacity(256);
    block.extend_from_slice(head.line.to_string().as_bytes());
    block.extend_from_slice(b"\r\n");
    head.headers.write_to(&mut block);
    block.extend_from_slice(b"\r\n");
    block
}

fn serialize_response(status: &StatusLine, headers: &HeaderMap) -> Vec<u8> {
    let mut block = Vec::with_capacity(256);
    if status.reason.is_empty() {
        block.extend_from_slice(format!("{} {}\r\n", status.version, status.status).as_bytes());
    } else {
        block.extend_from_slice(
            format!("{} {} {}\r\n", status.version, status.status, status.reason).as_bytes(),
        );
    }
    headers.write_to(&mut block);
    block.extend_from_slice(b"\r\n");
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticRouter {
        upstream: UpstreamAddr,
    }

    impl StaticRouter {
        fn new(addr: &str) -> StaticRouter {
            StaticRouter {
                upstream: UpstreamAddr::Tcp(addr.parse().unwrap()),
            }
        }
    }

    impl Router for StaticRouter {
        fn route(
            &mut self,
            _request: &mut RequestHead,
            _peer: SocketAddr,
        ) -> Result<Route, RelayFault> {
            Ok(Route::Upstream(self.upstream.clone()))
        }
    }

    fn head_lines(text: &str) -> Vec<Vec<u8>> {
        text.split_inclusive("\r\n")
            .filter(|line| *line != "\r\n")
            .map(|line| line.as_bytes().to_vec())
            .collect()
    }

    fn peer() -> SocketAddr {
        "192.0.2.7:49152".parse().unwrap()
    }

    fn process(
        text: &str,
        pin: &mut SessionPin,
        config: &ProxyConfig,
    ) -> Result<(Exchange, RequestDirective), RelayFault> {
        let mut exchange = Exchange::new(0, peer().ip());
        let mut router = StaticRouter::new("127.0.0.1:8000");
        let directive = exchange.process_request(
            &head_lines(text),
            pin,
            &mut router,
            None,
            config,
            peer(),
        )?;
        Ok((exchange, directive))
    }

    #[test]
    fn plain_get() {
        let config = ProxyConfig::default();
        let (exchange, directive) = process(
            "GET /a HTTP/1.1\r\nHost: example.com\r\n\r\n",
            &mut SessionPin::new(),
            &config,
        )
        .expect("valid request");

        assert_eq!(directive.body_length, 0);
        assert_eq!(
            directive.upstream,
            Some(UpstreamAddr::Tcp("127.0.0.1:8000".parse().unwrap()))
        );
        assert!(directive.handover.is_none());
        assert!(!exchange.connection_close);

        let block = String::from_utf8(directive.block).unwrap();
        assert!(block.starts_with("GET /a HTTP/1.1\r\n"));
        assert!(block.contains("X-Real-Ip: 192.0.2.7\r\n"));
        assert!(block.contains("X-Scheme: http\r\n"));
        assert!(block.ends_with("\r\n\r\n"));
    }

    #[test]
    fn forged_forward_headers_are_replaced() {
        let config = ProxyConfig::default();
        let (_, directive) = process(
            "GET /a HTTP/1.1\r\nHost: x\r\nX-Real-Ip: 10.0.0.1\r\nX-Scheme: https\r\n\r\n",
            &mut SessionPin::new(),
            &config,
        )
        .expect("valid request");

        let block = String::from_utf8(directive.block).unwrap();
        assert!(!block.contains("10.0.0.1"));
        assert_eq!(block.matches("X-Real-Ip:").count(), 1);
        assert!(block.contains("X-Scheme: http\r\n"));
    }

    #[test]
    fn double_content_length_is_rejected() {
        let config = ProxyConfig::default();
        let err = process(
            "POST /a HTTP/1.1\r\nHost: x\r\nContent-Length: 2\r\nContent-Length: 5\r\n\r\n",
            &mut SessionPin::new(),
            &config,
        )
        .unwrap_err();
        assert_eq!(err, RelayFault::Status(AnswerKind::Answer400));
    }

    #[test]
    fn method_allow_list() {
        let config = ProxyConfig::default();
        let err = process(
            "TRACE /a HTTP/1.1\r\nHost: x\r\n\r\n",
            &mut SessionPin::new(),
            &config,
        )
        .unwrap_err();
        assert_eq!(err, RelayFault::Status(AnswerKind::Answer405));
    }

    #[test]
    fn transfer_encoding_is_not_implemented() {
        let config = ProxyConfig::default();
        let err = process(
            "POST /a HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n",
            &mut SessionPin::new(),
            &config,
        )
        .unwrap_err();
        assert_eq!(err, RelayFault::Status(AnswerKind::Answer501));
    }

    #[test]
    fn post_requires_a_length() {
        let config = ProxyConfig::default();
        let err = process(
            "POST /a HTTP/1.1\r\nHost: x\r\n\r\n",
            &mut SessionPin::new(),
            &config,
        )
        .unwrap_err();
        assert_eq!(err, RelayFault::Status(AnswerKind::Answer411));
    }

    #[test]
    fn get_with_declared_length_relays_no_body() {
        let config = ProxyConfig::default();
        let (_, directive) = process(
            "GET /a HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\n",
            &mut SessionPin::new(),
            &config,
        )
        .expect("valid request");
        assert_eq!(directive.body_length, 0);
    }

    #[test]
    fn post_body_length_is_declared() {
        let config = ProxyConfig::default();
        let (_, directive) = process(
            "POST /a HTTP/1.1\r\nHost: x\r\nContent-Length: 42\r\n\r\n",
            &mut SessionPin::new(),
            &config,
        )
        .expect("valid request");
        assert_eq!(directive.body_length, 42);
    }

    #[test]
    fn host_is_pinned_for_the_session() {
        let config = ProxyConfig::default();
        let mut pin = SessionPin::new();

        process("GET /a HTTP/1.1\r\nHost: one.example\r\n\r\n", &mut pin, &config)
            .expect("first request pins the host");
        assert_eq!(pin.host.as_deref(), Some("one.example"));

        // same host with a port or different case still matches
        process(
            "GET /b HTTP/1.1\r\nHost: One.Example:8080\r\n\r\n",
            &mut pin,
            &config,
        )
        .expect("same virtual host");

        let err = process(
            "GET /c HTTP/1.1\r\nHost: two.example\r\n\r\n",
            &mut pin,
            &config,
        )
        .unwrap_err();
        assert_eq!(err, RelayFault::Status(AnswerKind::Answer400));
    }

    #[test]
    fn version_is_pinned_for_the_session() {
        let config = ProxyConfig::default();
        let mut pin = SessionPin::new();

        process("GET /a HTTP/1.1\r\nHost: x\r\n\r\n", &mut pin, &config).unwrap();
        let err = process("GET /b HTTP/1.0\r\nHost: x\r\n\r\n", &mut pin, &config).unwrap_err();
        assert_eq!(err, RelayFault::Status(AnswerKind::Answer400));
    }

    #[test]
    fn http10_without_keepalive_closes() {
        let config = ProxyConfig::default();
        let (exchange, _) = process(
            "GET /a HTTP/1.0\r\n\r\n",
            &mut SessionPin::new(),
            &config,
        )
        .expect("valid request");
        assert!(exchange.connection_close);
    }

    #[test]
    fn websocket_upgrade_hands_over_when_multiplexing() {
        let mut config = ProxyConfig::default();
        config.multiplex = Some(Default::default());

        let (exchange, directive) = process(
            "GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
            &mut SessionPin::new(),
            &config,
        )
        .expect("valid request");

        assert!(exchange.upgrade_requested);
        assert_eq!(directive.handover, Some(Handover::Upgrade));
        // the multiplexer still needs the resolved endpoint
        assert!(directive.upstream.is_some());
    }

    #[test]
    fn websocket_upgrade_relays_without_multiplexing() {
        let config = ProxyConfig::default();
        let (exchange, directive) = process(
            "GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
            &mut SessionPin::new(),
            &config,
        )
        .expect("valid request");

        assert!(exchange.upgrade_requested);
        assert!(directive.handover.is_none());
    }

    #[test]
    fn router_faults_propagate() {
        struct RedirectingRouter;
        impl Router for RedirectingRouter {
            fn route(
                &mut self,
                _request: &mut RequestHead,
                _peer: SocketAddr,
            ) -> Result<Route, RelayFault> {
                Err(RelayFault::Redirect {
                    location: "https://example.com/".to_string(),
                    permanent: false,
                })
            }
        }

        let config = ProxyConfig::default();
        let mut exchange = Exchange::new(0, peer().ip());
        let err = exchange
            .process_request(
                &head_lines("GET /a HTTP/1.1\r\nHost: x\r\n\r\n"),
                &mut SessionPin::new(),
                &mut RedirectingRouter,
                None,
                &config,
                peer(),
            )
            .unwrap_err();
        assert_eq!(err.status(), Some(302));
    }

    fn request_for_response(text: &str, config: &ProxyConfig) -> Exchange {
        let (exchange, _) = process(text, &mut SessionPin::new(), config).unwrap();
        exchange
    }

    #[test]
    fn response_with_length() {
        let config = ProxyConfig::default();
        let mut exchange =
            request_for_response("GET /a HTTP/1.1\r\nHost: x\r\n\r\n", &config);

        let directive = exchange
            .process_response(
                &head_lines("HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\n"),
                &config,
            )
            .expect("valid response");

        assert_eq!(directive.body_length, 11);
        assert!(!directive.close_delimited);
        assert!(!directive.upgraded);
        assert_eq!(exchange.status(), Some(200));
    }

    #[test]
    fn response_version_must_match() {
        let config = ProxyConfig::default();
        let mut exchange =
            request_for_response("GET /a HTTP/1.1\r\nHost: x\r\n\r\n", &config);

        let err = exchange
            .process_response(
                &head_lines("HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n"),
                &config,
            )
            .unwrap_err();
        assert!(matches!(err, RelayFault::Internal(_)));
    }

    #[test]
    fn response_duplicate_length_is_internal() {
        let config = ProxyConfig::default();
        let mut exchange =
            request_for_response("GET /a HTTP/1.1\r\nHost: x\r\n\r\n", &config);

        let err = exchange
            .process_response(
                &head_lines(
                    "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nContent-Length: 3\r\n\r\n",
                ),
                &config,
            )
            .unwrap_err();
        assert!(matches!(err, RelayFault::Internal(_)));
    }

    #[test]
    fn closing_response_without_length_is_close_delimited() {
        let config = ProxyConfig::default();
        let mut exchange =
            request_for_response("GET /a HTTP/1.1\r\nHost: x\r\n\r\n", &config);

        let directive = exchange
            .process_response(
                &head_lines("HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n"),
                &config,
            )
            .expect("valid response");

        assert!(directive.close_delimited);
        assert!(exchange.connection_close);
        assert_eq!(exchange.response_length, None);
    }

    #[test]
    fn upgrade_response_switches_to_passthrough() {
        let config = ProxyConfig::default();
        let mut exchange = request_for_response(
            "GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
            &config,
        );

        let directive = exchange
            .process_response(
                &head_lines(
                    "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
                ),
                &config,
            )
            .expect("valid upgrade");

        assert!(directive.upgraded);
        assert!(exchange.upgraded);
    }

    #[test]
    fn unsolicited_upgrade_is_refused() {
        let config = ProxyConfig::default();
        let mut exchange =
            request_for_response("GET /a HTTP/1.1\r\nHost: x\r\n\r\n", &config);

        let err = exchange
            .process_response(
                &head_lines(
                    "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
                ),
                &config,
            )
            .unwrap_err();
        assert!(matches!(err, RelayFault::Internal(_)));
    }

    #[test]
    fn interim_responses_do_not_complete_the_exchange() {
        let config = ProxyConfig::default();
        let mut exchange = request_for_response(
            "POST /a HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\nExpect: 100-continue\r\n\r\n",
            &config,
        );

        let directive = exchange
            .process_response(&head_lines("HTTP/1.1 100 Continue\r\n\r\n"), &config)
            .expect("valid interim response");
        assert!(directive.interim);
        assert!(exchange.response.is_none());

        let directive = exchange
            .process_response(
                &head_lines("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n"),
                &config,
            )
            .expect("valid final response");
        assert!(!directive.interim);
        assert_eq!(exchange.status(), Some(200));
    }

    #[test]
    fn head_response_has_no_body() {
        let config = ProxyConfig::default();
        let mut exchange =
            request_for_response("HEAD /a HTTP/1.1\r\nHost: x\r\n\r\n", &config);

        let directive = exchange
            .process_response(
                &head_lines("HTTP/1.1 200 OK\r\nContent-Length: 500\r\n\r\n"),
                &config,
            )
            .expect("valid response");
        assert_eq!(directive.body_length, 0);
    }

    #[test]
    fn server_header_override() {
        let mut config = ProxyConfig::default();
        config.server_header = Some("relais".to_string());
        let mut exchange =
            request_for_response("GET /a HTTP/1.1\r\nHost: x\r\n\r\n", &config);

        let directive = exchange
            .process_response(
                &head_lines("HTTP/1.1 200 OK\r\nServer: upstream/2\r\nContent-Length: 0\r\n\r\n"),
                &config,
            )
            .expect("valid response");
        let block = String::from_utf8(directive.block).unwrap();
        assert!(block.contains("Server: relais\r\n"));
        assert!(!block.contains("upstream/2"));
    }

    #[test]
    fn line_hook_can_rewrite_and_divert() {
        let config = ProxyConfig::default();
        let mut exchange = Exchange::new(0, peer().ip());
        let mut router = StaticRouter::new("127.0.0.1:8000");
        let mut hook: LineHook = Box::new(|line: &mut RequestLine| {
            if line.uri.starts_with("/internal/") {
                Some(Handover::Local)
            } else {
                line.uri = format!("/rewritten{}", line.uri);
                None
            }
        });

        let directive = exchange
            .process_request(
                &head_lines("GET /a HTTP/1.1\r\nHost: x\r\n\r\n"),
                &mut SessionPin::new(),
                &mut router,
                Some(&mut hook),
                &config,
                peer(),
            )
            .expect("valid request");
        let block = String::from_utf8(directive.block).unwrap();
        assert!(block.starts_with("GET /rewritten/a HTTP/1.1\r\n"));

        let mut exchange = Exchange::new(1, peer().ip());
        let directive = exchange
            .process_request(
                &head_lines("GET /internal/status HTTP/1.1\r\nHost: x\r\n\r\n"),
                &mut SessionPin::new(),
                &mut router,
                Some(&mut hook),
                &config,
                peer(),
            )
            .expect("valid request");
        assert_eq!(directive.handover, Some(Handover::Local));
        assert!(directive.upstream.is_none());
    }
}
