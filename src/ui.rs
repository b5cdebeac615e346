use crate::call::CallState;
use crate::event::{Command, EngineEvent, EventQueue, EventReceiver, UiEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One line typed at the terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Digits(String),
    Clear,
    /// Dial the given number, or the dial buffer when none is given.
    Call(Option<String>),
    Hangup,
    Accept,
    Reject,
    Devices,
    Use(String),
    Stats,
    Lock,
    Unlock,
}

pub fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    let input = match word.to_ascii_lowercase().as_str() {
        "" => return None,
        "call" | "dial" => Input::Call(Some(rest.to_string()).filter(|r| !r.is_empty())),
        "hangup" | "bye" => Input::Hangup,
        "accept" | "answer" => Input::Accept,
        "reject" => Input::Reject,
        "clear" => Input::Clear,
        "devices" => Input::Devices,
        "use" if !rest.is_empty() => Input::Use(rest.to_string()),
        "stats" => Input::Stats,
        "lock" => Input::Lock,
        "unlock" => Input::Unlock,
        _ if is_dialable(line) => Input::Digits(line.to_string()),
        _ => return None,
    };
    Some(input)
}

fn is_dialable(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '*' | '#' | '+'))
}

/// `mm:ss`, or `h:mm:ss` from one hour on.
pub fn format_duration(seconds: u64) -> String {
    let (h, m, s) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}

/// What the agent sees, derived only from engine events and typed input.
#[derive(Debug, Clone, PartialEq)]
pub struct Presentation {
    pub dial_buffer: String,
    pub status: String,
    pub timer: String,
    pub call_state: CallState,
    pub alerting: bool,
    pub ringback: bool,
    pub registration: String,
    pub last_error: Option<(String, String)>,
    pub locked: bool,
}

impl Default for Presentation {
    fn default() -> Self {
        Self {
            dial_buffer: String::new(),
            status: "Starting".to_string(),
            timer: format_duration(0),
            call_state: CallState::Idle,
            alerting: false,
            ringback: false,
            registration: "disconnected".to_string(),
            last_error: None,
            locked: false,
        }
    }
}

impl Presentation {
    /// Fold one engine event in. Returns the line to print, if any.
    pub fn apply(&mut self, event: &UiEvent) -> Option<String> {
        match event {
            UiEvent::Status { text } => {
                if *text == self.status {
                    return None;
                }
                self.status = text.clone();
                Some(format!("[status] {}", text))
            }
            UiEvent::CallState {
                state,
                peer,
                direction,
                ..
            } => {
                self.call_state = *state;
                if *state == CallState::Idle {
                    self.timer = format_duration(0);
                    self.alerting = false;
                    self.ringback = false;
                }
                Some(format!("[call] {} ({:?} {})", state, direction, peer))
            }
            UiEvent::Registration { state, status_code } => {
                self.registration = state.clone();
                Some(match status_code {
                    Some(code) => format!("[sip] {} ({})", state, code),
                    None => format!("[sip] {}", state),
                })
            }
            UiEvent::IncomingCall { peer, .. } => {
                Some(format!("[call] incoming call from {}, type accept or reject", peer))
            }
            UiEvent::Alert { active } => {
                self.alerting = *active;
                None
            }
            UiEvent::Ringback { active } => {
                self.ringback = *active;
                None
            }
            UiEvent::Duration { seconds, .. } => {
                self.timer = format_duration(*seconds);
                None
            }
            UiEvent::RemoteAudio { tracks, .. } => {
                Some(format!("[media] playing {} remote track(s)", tracks))
            }
            UiEvent::Error { code, message } => {
                self.last_error = Some((code.clone(), message.clone()));
                Some(format!("[error] {} ({})", message, code))
            }
            UiEvent::Stats { stats, .. } => Some(format!(
                "[stats] sent {} pkts/{} bytes, received {} pkts/{} bytes, {}",
                stats.packets_sent,
                stats.bytes_sent,
                stats.packets_received,
                stats.bytes_received,
                self.timer
            )),
            UiEvent::Devices { devices } => {
                let lines: Vec<String> = devices
                    .iter()
                    .map(|d| {
                        let marker = if d.is_default { " (default)" } else { "" };
                        format!("  {} {}{}", d.id, d.label, marker)
                    })
                    .collect();
                Some(format!("[devices]\n{}", lines.join("\n")))
            }
            UiEvent::Locked => {
                self.locked = true;
                Some("[lock] agent session locked".to_string())
            }
            UiEvent::Unlocked => {
                self.locked = false;
                Some("[lock] agent session unlocked".to_string())
            }
        }
    }

    /// Turn typed input into an engine command. Digits only edit the buffer.
    pub fn input(&mut self, input: Input) -> Option<Command> {
        match input {
            Input::Digits(digits) => {
                self.dial_buffer.push_str(&digits);
                None
            }
            Input::Clear => {
                self.dial_buffer.clear();
                None
            }
            Input::Call(number) => {
                let buffered = std::mem::take(&mut self.dial_buffer);
                Some(Command::PlaceCall {
                    number: number.unwrap_or(buffered),
                })
            }
            Input::Hangup => Some(Command::Hangup),
            Input::Accept => Some(Command::Accept),
            Input::Reject => Some(Command::Reject),
            Input::Devices => Some(Command::ListDevices),
            Input::Use(device_id) => Some(Command::SelectDevice { device_id }),
            Input::Stats => Some(Command::CollectStats),
            Input::Lock => Some(Command::ForceLock),
            Input::Unlock => Some(Command::Unlock),
        }
    }
}

/// Read commands from stdin and print engine events until cancelled. Once
/// stdin is closed the events are still printed.
pub async fn run_terminal(mut events: EventReceiver, queue: EventQueue, token: CancellationToken) {
    let mut presentation = Presentation::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        select! {
            _ = token.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(line) = presentation.apply(&event) {
                        println!("{}", line);
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "presentation lagging behind engine"),
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let Some(input) = parse_input(&line) else {
                        println!("[help] digits, call [number], hangup, accept, reject, clear, devices, use <id>, stats, lock, unlock");
                        continue;
                    };
                    if let Some(command) = presentation.input(input) {
                        if queue.send(EngineEvent::Command(command)).is_err() {
                            break;
                        }
                    } else if !presentation.dial_buffer.is_empty() {
                        println!("[dial] {}", presentation.dial_buffer);
                    }
                }
                Ok(None) => {
                    debug!("stdin closed, only rendering events");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!("failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallDirection;

    #[test]
    fn test_parse_input() {
        assert_eq!(parse_input("5551234"), Some(Input::Digits("5551234".into())));
        assert_eq!(parse_input("call 1002"), Some(Input::Call(Some("1002".into()))));
        assert_eq!(parse_input(" CALL "), Some(Input::Call(None)));
        assert_eq!(parse_input("use mic-1"), Some(Input::Use("mic-1".into())));
        assert_eq!(parse_input("use"), None);
        assert_eq!(parse_input("hello"), None);
        assert_eq!(parse_input(""), None);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "00:00");
        assert_eq!(format_duration(75), "01:15");
        assert_eq!(format_duration(3661), "1:01:01");
    }

    #[test]
    fn test_dial_buffer_feeds_place_call() {
        let mut p = Presentation::default();
        assert_eq!(p.input(Input::Digits("555".into())), None);
        assert_eq!(p.input(Input::Digits("1234".into())), None);
        assert_eq!(
            p.input(Input::Call(None)),
            Some(Command::PlaceCall {
                number: "5551234".into()
            })
        );
        assert!(p.dial_buffer.is_empty());
    }

    #[test]
    fn test_events_drive_state() {
        let mut p = Presentation::default();
        p.apply(&UiEvent::Alert { active: true });
        p.apply(&UiEvent::Duration {
            call_id: "c".into(),
            seconds: 62,
        });
        assert!(p.alerting);
        assert_eq!(p.timer, "01:02");
        p.apply(&UiEvent::Error {
            code: "busy".into(),
            message: "busy".into(),
        });
        assert_eq!(p.last_error, Some(("busy".into(), "busy".into())));
        p.apply(&UiEvent::CallState {
            call_id: "c".into(),
            state: CallState::Idle,
            direction: CallDirection::Outbound,
            peer: "1002".into(),
        });
        assert_eq!(p.timer, "00:00");
        assert!(!p.alerting);
        assert_eq!(
            p.apply(&UiEvent::Status { text: "Ready".into() }),
            Some("[status] Ready".to_string())
        );
        assert_eq!(p.apply(&UiEvent::Status { text: "Ready".into() }), None);
    }
}
