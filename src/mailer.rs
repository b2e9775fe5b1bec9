//! Minimal SMTP transport for alert notifications.
//!
//! Speaks just enough of the protocol for a relay handoff: EHLO, optional
//! AUTH LOGIN, one message per connection. Blocking socket I/O with short
//! timeouts; callers run it under `spawn_blocking`.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::config::Config;
use crate::error::MailError;

/// Seam for tests: the alert engine only knows this trait.
pub trait Mailer: Send + Sync {
    fn send(&self, subject: &str, body: &str, html: bool) -> Result<(), MailError>;
}

pub struct SmtpMailer {
    host: String,
    port: u16,
    user: Option<String>,
    pass: Option<String>,
    from: String,
    to: Vec<String>,
    timeout: Duration,
}

impl SmtpMailer {
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.smtp_host.clone(),
            port: config.smtp_port,
            user: config.smtp_user.clone(),
            pass: config.smtp_pass.clone(),
            from: config.mail_from.clone(),
            to: config.mail_to.clone(),
            timeout: Duration::from_secs(5),
        }
    }
}

struct Session {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Session {
    fn open(host: &str, port: u16, timeout: Duration) -> Result<Self, MailError> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| MailError::Protocol(format!("no address for {host}")))?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self { stream, reader })
    }

    /// Read one (possibly multi-line) reply and require the given code.
    fn expect(&mut self, code: &str) -> Result<(), MailError> {
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line)?;
            if n == 0 {
                return Err(MailError::Protocol("connection closed".into()));
            }
            let line = line.trim_end();
            if !line.starts_with(code) {
                return Err(MailError::Protocol(line.to_string()));
            }
            // "250-EXT" continues the reply, "250 done" ends it.
            if line.len() < 4 || line.as_bytes()[3] == b' ' {
                return Ok(());
            }
        }
    }

    fn command(&mut self, line: &str, code: &str) -> Result<(), MailError> {
        self.stream.write_all(line.as_bytes())?;
        self.stream.write_all(b"\r\n")?;
        self.expect(code)
    }
}

/// Standard base64, used only for AUTH LOGIN exchanges.
fn base64(input: &[u8]) -> String {
    const TABLE: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity(input.len().div_ceil(3) * 4);
    for chunk in input.chunks(3) {
        let b = [
            chunk[0],
            chunk.get(1).copied().unwrap_or(0),
            chunk.get(2).copied().unwrap_or(0),
        ];
        let triple = (b[0] as u32) << 16 | (b[1] as u32) << 8 | b[2] as u32;
        out.push(TABLE[(triple >> 18 & 0x3f) as usize] as char);
        out.push(TABLE[(triple >> 12 & 0x3f) as usize] as char);
        out.push(if chunk.len() > 1 {
            TABLE[(triple >> 6 & 0x3f) as usize] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            TABLE[(triple & 0x3f) as usize] as char
        } else {
            '='
        });
    }
    out
}

/// Dot-stuff message lines per RFC 5321.
fn stuffed(body: &str) -> String {
    body.lines()
        .map(|line| {
            if line.starts_with('.') {
                format!(".{line}")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\r\n")
}

impl Mailer for SmtpMailer {
    fn send(&self, subject: &str, body: &str, html: bool) -> Result<(), MailError> {
        if self.to.is_empty() {
            return Err(MailError::Protocol("no recipients configured".into()));
        }
        let mut session = Session::open(&self.host, self.port, self.timeout)?;
        session.expect("220")?;
        session.command("EHLO telemetry", "250")?;
        if let (Some(user), Some(pass)) = (&self.user, &self.pass) {
            session.command("AUTH LOGIN", "334")?;
            session.command(&base64(user.as_bytes()), "334")?;
            session.command(&base64(pass.as_bytes()), "235")?;
        }
        session.command(&format!("MAIL FROM:<{}>", self.from), "250")?;
        for recipient in &self.to {
            session.command(&format!("RCPT TO:<{recipient}>"), "250")?;
        }
        session.command("DATA", "354")?;
        let content_type = if html {
            "text/html; charset=utf-8"
        } else {
            "text/plain; charset=utf-8"
        };
        let message = format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\nMIME-Version: 1.0\r\nContent-Type: {}\r\n\r\n{}\r\n.",
            self.from,
            self.to.join(", "),
            subject,
            content_type,
            stuffed(body)
        );
        session.command(&message, "250")?;
        session.command("QUIT", "221")?;
        Ok(())
    }
}
