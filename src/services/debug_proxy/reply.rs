//! Stop replies sent by debugserver while the inferior runs

use crate::DeployError;

use super::packet::hex_decode;

/// A decoded packet from the event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReply {
    /// `W<code>`: the process exited
    Exited(u8),
    /// `O<hex>`: console output
    Output(Vec<u8>),
    /// `T<signal><pairs>`: a thread stopped on a signal
    Signaled {
        signal: u8,
        thread: Option<String>,
        threads: Vec<String>,
    },
    /// `X<signal><pairs>`: the process was terminated by a signal
    Crashed {
        signal: u8,
        description: Option<String>,
    },
}

impl StopReply {
    /// Dispatches on the leading tag character of a frame payload
    ///
    /// # Errors
    /// `ProtocolViolation` for any other tag or a malformed body
    pub fn parse(payload: &str) -> Result<Self, DeployError> {
        let violation = || DeployError::ProtocolViolation(payload.to_string());
        let mut chars = payload.chars();
        let tag = chars.next().ok_or_else(violation)?;
        let body = chars.as_str();

        match tag {
            'W' => Ok(Self::Exited(signal_byte(body).ok_or_else(violation)?)),
            'O' => Ok(Self::Output(hex_decode(body)?)),
            'T' => {
                let signal = signal_byte(body).ok_or_else(violation)?;
                let mut thread = None;
                let mut threads = Vec::new();
                for (key, value) in pairs(&body[2..]) {
                    match key {
                        "thread" => thread = Some(value.to_string()),
                        "threads" => {
                            threads = value
                                .split(',')
                                .filter(|t| !t.is_empty())
                                .map(|t| t.to_string())
                                .collect()
                        }
                        _ => {}
                    }
                }
                Ok(Self::Signaled {
                    signal,
                    thread,
                    threads,
                })
            }
            'X' => {
                let signal = signal_byte(body).ok_or_else(violation)?;
                let mut description = None;
                for (key, value) in pairs(&body[2..]) {
                    if key == "description" {
                        let text = String::from_utf8_lossy(&hex_decode(value)?)
                            .trim()
                            .to_string();
                        if !text.is_empty() {
                            description = Some(text);
                        }
                    }
                }
                Ok(Self::Crashed {
                    signal,
                    description,
                })
            }
            _ => Err(violation()),
        }
    }
}

/// Reads the two hex digits that lead a stop reply body
fn signal_byte(body: &str) -> Option<u8> {
    body.get(..2).and_then(|s| u8::from_str_radix(s, 16).ok())
}

/// Splits `key:value;key:value;` pairs
fn pairs(s: &str) -> impl Iterator<Item = (&str, &str)> {
    s.split(';').filter_map(|pair| pair.split_once(':'))
}

/// Builds the packet that resumes every thread after a signal stop
///
/// Threads other than the stopped one continue plainly; the stopped thread continues
/// with its signal re-delivered.
pub fn continue_packet(signal: u8, thread: Option<&str>, threads: &[String]) -> String {
    let Some(stopped) = thread else {
        return format!("C{signal:02x}");
    };
    let mut packet = String::from("vCont");
    for t in threads.iter().filter(|t| t.as_str() != stopped) {
        packet.push_str(";c:");
        packet.push_str(t);
    }
    packet.push_str(&format!(";C{signal:02x}:{stopped}"));
    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::debug_proxy::packet::hex_encode;

    #[test]
    fn exit_codes() {
        assert_eq!(StopReply::parse("W00").unwrap(), StopReply::Exited(0));
        assert_eq!(StopReply::parse("W01").unwrap(), StopReply::Exited(1));
        assert_eq!(StopReply::parse("Wff").unwrap(), StopReply::Exited(255));
        assert!(StopReply::parse("W").is_err());
    }

    #[test]
    fn console_output() {
        assert_eq!(
            StopReply::parse("O48656c6c6f").unwrap(),
            StopReply::Output(b"Hello".to_vec())
        );
    }

    #[test]
    fn signal_stop_resumes_other_threads() {
        let reply =
            StopReply::parse("T0bthread:2403;threads:2403,2603,2703;name:Hello;").unwrap();
        let StopReply::Signaled {
            signal,
            thread,
            threads,
        } = reply
        else {
            panic!("expected a signal stop");
        };
        assert_eq!(signal, 0x0b);
        assert_eq!(thread.as_deref(), Some("2403"));
        assert_eq!(threads, vec!["2403", "2603", "2703"]);
        assert_eq!(
            continue_packet(signal, thread.as_deref(), &threads),
            "vCont;c:2603;c:2703;C0b:2403"
        );
        assert_eq!(continue_packet(0x11, None, &[]), "C11");
    }

    #[test]
    fn crash_description_is_trimmed() {
        let payload = format!(
            "X0b;description:{};",
            hex_encode(b"  EXC_BAD_ACCESS (code=1, address=0x0)\n")
        );
        assert_eq!(
            StopReply::parse(&payload).unwrap(),
            StopReply::Crashed {
                signal: 11,
                description: Some("EXC_BAD_ACCESS (code=1, address=0x0)".into())
            }
        );
        assert_eq!(
            StopReply::parse("X06").unwrap(),
            StopReply::Crashed {
                signal: 6,
                description: None
            }
        );
    }

    #[test]
    fn unknown_tags_are_violations() {
        assert!(matches!(
            StopReply::parse("S05"),
            Err(DeployError::ProtocolViolation(p)) if p == "S05"
        ));
        assert!(StopReply::parse("").is_err());
    }
}
