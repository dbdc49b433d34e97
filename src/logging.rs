//! access logging
//!
//! access records go through the `log` facade under the dedicated `access`
//! target, one fixed-field line per completed request, so a deployment can
//! route them to their own sink without touching the diagnostic logs

use std::{fmt, net::IpAddr};

use time::{macros::format_description, OffsetDateTime};

use crate::parser::{Method, Version};

#[macro_export]
macro_rules! info_access {
    ($($args:tt)*) => {
        log::info!(target: "access", $($args)*)
    };
}

#[macro_export]
macro_rules! error_access {
    ($($args:tt)*) => {
        log::error!(target: "access", $($args)*)
    };
}

/// one line per completed request:
/// `client_ip - [timestamp] "METHOD path HTTP/x.y" status bytes "referer" "user-agent"`
pub struct AccessRecord<'a> {
    pub client_ip: IpAddr,
    pub method: Option<&'a Method>,
    pub path: Option<&'a str>,
    pub version: Option<Version>,
    pub status: Option<u16>,
    pub bytes_out: u64,
    pub referer: Option<&'a str>,
    pub user_agent: Option<&'a str>,
}

impl fmt::Display for AccessRecord<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let format = format_description!(
            "[day]/[month repr:short]/[year]:[hour]:[minute]:[second] +0000"
        );
        let timestamp = OffsetDateTime::now_utc()
            .format(&format)
            .unwrap_or_else(|_| String::from("-"));

        write!(f, "{} - [{}] \"", self.client_ip, timestamp)?;
        match (self.method, self.path, self.version) {
            (Some(method), Some(path), Some(version)) => {
                write!(f, "{method} {path} {version}")?;
            }
            _ => f.write_str("-")?,
        }
        write!(f, "\" ")?;
        match self.status {
            Some(status) => write!(f, "{status}")?,
            None => f.write_str("-")?,
        }
        write!(
            f,
            " {} \"{}\" \"{}\"",
            self.bytes_out,
            self.referer.unwrap_or("-"),
            self.user_agent.unwrap_or("-")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_format() {
        let method = Method::Get;
        let record = AccessRecord {
            client_ip: "192.0.2.7".parse().unwrap(),
            method: Some(&method),
            path: Some("/index.html"),
            version: Some(Version::V11),
            status: Some(200),
            bytes_out: 1234,
            referer: None,
            user_agent: Some("curl/8.0"),
        };

        let line = record.to_string();
        assert!(line.starts_with("192.0.2.7 - ["));
        assert!(line.contains("\"GET /index.html HTTP/1.1\" 200 1234 \"-\" \"curl/8.0\""));
    }

    #[test]
    fn record_without_request() {
        let record = AccessRecord {
            client_ip: "192.0.2.7".parse().unwrap(),
            method: None,
            path: None,
            version: None,
            status: None,
            bytes_out: 0,
            referer: None,
            user_agent: None,
        };

        let line = record.to_string();
        assert!(line.ends_with("\"-\" - 0 \"-\" \"-\""));
    }
}
