use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerKind {
    Answer400,
    Answer405,
    Answer411,
    Answer413,
    Answer500,
    Answer501,
    Answer502,
    Answer503,
}

#[allow(clippy::from_over_into)]
impl Into<u16> for AnswerKind {
    fn into(self) -> u16 {
        match self {
            AnswerKind::Answer400 => 400,
            AnswerKind::Answer405 => 405,
            AnswerKind::Answer411 => 411,
            AnswerKind::Answer413 => 413,
            AnswerKind::Answer500 => 500,
            AnswerKind::Answer501 => 501,
            AnswerKind::Answer502 => 502,
            AnswerKind::Answer503 => 503,
        }
    }
}

impl std::fmt::Display for AnswerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let status: u16 = (*self).into();
        write!(f, "{status}")
    }
}

/// canned answers sent back when the proxy produces the response itself
/// instead of relaying one
#[allow(non_snake_case)]
pub struct HttpAnswers {
    pub BadRequest: Rc<Vec<u8>>,
    pub MethodNotAllowed: Rc<Vec<u8>>,
    pub LengthRequired: Rc<Vec<u8>>,
    pub PayloadTooLarge: Rc<Vec<u8>>,
    pub InternalError: Rc<Vec<u8>>,
    pub NotImplemented: Rc<Vec<u8>>,
    pub BadGateway: Rc<Vec<u8>>,
    pub ServiceUnavailable: Rc<Vec<u8>>,
}

fn canned(status_line: &str) -> Rc<Vec<u8>> {
    Rc::new(
        format!("HTTP/1.1 {status_line}\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n")
            .into_bytes(),
    )
}

impl Default for HttpAnswers {
    fn default() -> HttpAnswers {
        HttpAnswers::new()
    }
}

impl HttpAnswers {
    pub fn new() -> HttpAnswers {
        HttpAnswers {
            BadRequest: canned("400 Bad Request"),
            MethodNotAllowed: canned("405 Method Not Allowed"),
            LengthRequired: canned("411 Length Required"),
            PayloadTooLarge: canned("413 Payload Too Large"),
            InternalError: canned("500 Internal Server Error"),
            NotImplemented: canned("501 Not Implemented"),
            BadGateway: canned("502 Bad Gateway"),
            ServiceUnavailable: canned("503 Service Unavailable"),
        }
    }

    pub fn get(&self, answer: AnswerKind) -> Rc<Vec<u8>> {
        match answer {
            AnswerKind::Answer400 => self.BadRequest.clone(),
            AnswerKind::Answer405 => self.MethodNotAllowed.clone(),
            AnswerKind::Answer411 => self.LengthRequired.clone(),
            AnswerKind::Answer413 => self.PayloadTooLarge.clone(),
            AnswerKind::Answer500 => self.InternalError.clone(),
            AnswerKind::Answer501 => self.NotImplemented.clone(),
            AnswerKind::Answer502 => self.BadGateway.clone(),
            AnswerKind::Answer503 => self.ServiceUnavailable.clone(),
        }
    }

    /// the 301/302 answer is generated dynamically
    pub fn redirect(location: &str, permanent: bool) -> Vec<u8> {
        let status = if permanent {
            "301 Moved Permanently"
        } else {
            "302 Found"
        };
        format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\nLocation: {location}\r\nConnection: close\r\n\r\n")
            .into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canned_answers_are_closing() {
        let answers = HttpAnswers::new();
        let buf = answers.get(AnswerKind::Answer400);
        let text = std::str::from_utf8(&buf).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Connection: close"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn redirect_answer() {
        let buf = HttpAnswers::redirect("https://example.com/a?b=c", true);
        let text = std::str::from_utf8(&buf).unwrap();
        assert!(text.starts_with("HTTP/1.1 301 Moved Permanently\r\n"));
        assert!(text.contains("Location: https://example.com/a?b=c\r\n"));
    }
}
