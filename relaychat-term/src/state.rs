//! Front-end state: the visible chat log and input commands.

use std::collections::VecDeque;

use relaychat_net::PeerEvent;

/// Lines kept on screen; older ones scroll away.
pub const CHAT_LOG_CAPACITY: usize = 100;

/// Time-stamped chat history, bounded to [`CHAT_LOG_CAPACITY`] lines.
#[derive(Debug, Default)]
pub struct ChatLog {
    lines: VecDeque<String>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `[HH:MM:SS] who: text` and return the formatted line.
    pub fn push(&mut self, who: &str, text: &str) -> &str {
        let time_tag = chrono::Local::now().format("%H:%M:%S");
        self.push_line(format!("[{time_tag}] {who}: {text}"))
    }

    fn push_line(&mut self, line: String) -> &str {
        if self.lines.len() == CHAT_LOG_CAPACITY {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
        self.lines.back().map(String::as_str).unwrap_or_default()
    }

    /// Record an event if it belongs in the chat log.
    pub fn record(&mut self, event: &PeerEvent) -> Option<&str> {
        match event {
            PeerEvent::Chat { from_name, text, .. } => Some(self.push(from_name, text)),
            PeerEvent::PeerMessage(value) => Some(self.push("PEER", &value.to_string())),
            _ => None,
        }
    }
}

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Chat(String),
    SetName(String),
    ToggleLocalIp,
    Status,
    Quit,
    Empty,
}

impl Command {
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        if input.is_empty() {
            return Command::Empty;
        }

        match input.split_once(char::is_whitespace) {
            Some(("/name", rest)) if !rest.trim().is_empty() => {
                Command::SetName(rest.trim().to_string())
            }
            _ => match input {
                "/ip" => Command::ToggleLocalIp,
                "/status" => Command::Status,
                "/quit" | "/exit" => Command::Quit,
                _ => Command::Chat(input.to_string()),
            },
        }
    }
}
