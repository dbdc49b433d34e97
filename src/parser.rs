//! HTTP/1.x grammar primitives
//!
//! the flow state machine accumulates complete CRLF terminated lines, so all
//! parsers here run over complete input

use std::{fmt, str};

use nom::{
    branch::alt,
    bytes::complete::{tag, take, take_while, take_while1},
    character::{complete::char, complete::one_of, is_alphanumeric, is_space},
    combinator::opt,
    error::{Error, ErrorKind},
    sequence::preceded,
    Err, IResult,
};

pub fn compare_no_case(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }

    left.iter().zip(right).all(|(a, b)| match (*a, *b) {
        (0..=64, 0..=64) | (91..=96, 91..=96) | (123..=255, 123..=255) => a == b,
        (65..=90, 65..=90) | (97..=122, 97..=122) | (65..=90, 97..=122) | (97..=122, 65..=90) => {
            *a | 0b00_10_00_00 == *b | 0b00_10_00_00
        }
        _ => false,
    })
}

// Primitives
fn is_token_char(i: u8) -> bool {
    is_alphanumeric(i) || b"!#$%&'*+-.^_`|~".contains(&i)
}

fn is_status_token_char(i: u8) -> bool {
    i >= 32 && i != 127
}

fn is_vchar(i: u8) -> bool {
    i > 32 && i <= 126
}

fn is_header_value_char(i: u8) -> bool {
    i == 9 || (32..=126).contains(&i)
}

pub fn token(i: &[u8]) -> IResult<&[u8], &[u8]> {
    take_while1(is_token_char)(i)
}

pub fn crlf(i: &[u8]) -> IResult<&[u8], &[u8]> {
    tag("\r\n")(i)
}

#[derive(PartialEq, Eq, Debug, Clone, Hash)]
pub enum Method {
    Get,
    Post,
    Head,
    Options,
    Put,
    Delete,
    Trace,
    Connect,
    Custom(String),
}

impl Method {
    pub fn new(s: &[u8]) -> Method {
        if compare_no_case(s, b"GET") {
            Method::Get
        } else if compare_no_case(s, b"POST") {
            Method::Post
        } else if compare_no_case(s, b"HEAD") {
            Method::Head
        } else if compare_no_case(s, b"OPTIONS") {
            Method::Options
        } else if compare_no_case(s, b"PUT") {
            Method::Put
        } else if compare_no_case(s, b"DELETE") {
            Method::Delete
        } else if compare_no_case(s, b"TRACE") {
            Method::Trace
        } else if compare_no_case(s, b"CONNECT") {
            Method::Connect
        } else {
            Method::Custom(String::from(unsafe { str::from_utf8_unchecked(s) }))
        }
    }

    /// methods defined without request body semantics: a declared length on
    /// these relays zero body bytes
    pub fn expects_body(&self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Custom(_))
    }
}

impl AsRef<str> for Method {
    fn as_ref(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Custom(s) => s,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum Version {
    V10,
    V11,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Version::V10 => write!(f, "HTTP/1.0"),
            Version::V11 => write!(f, "HTTP/1.1"),
        }
    }
}

#[derive(PartialEq, Eq, Debug)]
pub struct RawRequestLine<'a> {
    pub method: &'a [u8],
    pub uri: &'a [u8],
    pub version: Version,
}

/// the request line, with method recognized and uri checked for utf8
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct RequestLine {
    pub method: Method,
    pub uri: String,
    pub version: Version,
}

impl RequestLine {
    pub fn from_raw(raw: RawRequestLine) -> Option<RequestLine> {
        let uri = str::from_utf8(raw.uri).ok()?;
        Some(RequestLine {
            method: Method::new(raw.method),
            uri: String::from(uri),
            version: raw.version,
        })
    }
}

impl fmt::Display for RequestLine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} {}", self.method, self.uri, self.version)
    }
}

#[derive(PartialEq, Eq, Debug)]
pub struct RawStatusLine<'a> {
    pub version: Version,
    pub status: &'a [u8],
    pub reason: &'a [u8],
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub struct StatusLine {
    pub version: Version,
    pub status: u16,
    pub reason: String,
}

impl StatusLine {
    pub fn from_raw(raw: RawStatusLine) -> Option<StatusLine> {
        let status = str::from_utf8(raw.status).ok()?.parse::<u16>().ok()?;
        let reason = str::from_utf8(raw.reason).ok()?;
        Some(StatusLine {
            version: raw.version,
            status,
            reason: String::from(reason),
        })
    }
}

pub fn http_version(i: &[u8]) -> IResult<&[u8], Version> {
    let (i, _) = tag("HTTP/1.")(i)?;
    let (i, minor) = one_of("01")(i)?;

    Ok((
        i,
        if minor == '0' {
            Version::V10
        } else {
            Version::V11
        },
    ))
}

pub fn request_line(i: &[u8]) -> IResult<&[u8], RawRequestLine> {
    let (i, method) = token(i)?;
    let (i, _) = char(' ')(i)?;
    let (i, uri) = take_while1(is_vchar)(i)?;
    let (i, _) = char(' ')(i)?;
    let (i, version) = http_version(i)?;
    let (i, _) = crlf(i)?;

    Ok((
        i,
        RawRequestLine {
            method,
            uri,
            version,
        },
    ))
}

pub fn status_line(i: &[u8]) -> IResult<&[u8], RawStatusLine> {
    let (i, version) = http_version(i)?;
    let (i, _) = char(' ')(i)?;
    let (i, status) = take(3usize)(i)?;
    let (i, reason) = opt(preceded(char(' '), take_while(is_status_token_char)))(i)?;
    let (i, _) = crlf(i)?;

    Ok((
        i,
        RawStatusLine {
            version,
            status,
            reason: reason.unwrap_or(&b""[..]),
        },
    ))
}

#[derive(PartialEq, Eq, Debug)]
pub struct HeaderLine<'a> {
    pub name: &'a [u8],
    pub value: &'a [u8],
}

pub fn message_header(i: &[u8]) -> IResult<&[u8], HeaderLine> {
    let (i, name) = token(i)?;
    let (i, _) = tag(":")(i)?;
    let (i, _) = take_while(is_space)(i)?;
    let (i, value) = take_while(is_header_value_char)(i)?;
    let (i, _) = crlf(i)?;

    Ok((i, HeaderLine { name, value }))
}

fn is_hostname_char(i: u8) -> bool {
    is_alphanumeric(i) ||
  // the domain name should not start with a hyphen or dot
  // but is it important here, since we only compare it to
  // the host pinned on the connection?
  b"-.".contains(&i)
}

fn digits(i: &[u8]) -> IResult<&[u8], &[u8]> {
    take_while1(|c: u8| c.is_ascii_digit())(i)
}

/// splits `host[:port]`, rejecting trailing garbage
#[allow(clippy::type_complexity)]
pub fn hostname_and_port(i: &[u8]) -> IResult<&[u8], (&[u8], Option<&[u8]>)> {
    let (i, host) = alt((
        take_while1(is_hostname_char),
        // IPv6 literal
        |i| {
            let (i, _) = tag("[")(i)?;
            let (i, h) = take_while1(|c: u8| c != b']')(i)?;
            let (i, _) = tag("]")(i)?;
            Ok((i, h))
        },
    ))(i)?;
    let (i, port) = opt(preceded(tag(":"), digits))(i)?;

    if !i.is_empty() {
        return Err(Err::Error(Error::new(i, ErrorKind::Eof)));
    }
    Ok((i, (host, port)))
}
