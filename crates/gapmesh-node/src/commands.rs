//! Slash-command parsing for the user text stream, plus the share
//! deep-link format. Parsing only — what a command means is the
//! application's business.

/// Deep-link schemes that carry text to post via `?content=`.
pub const DEEP_LINK_SCHEMES: [&str; 2] = ["bitchat://", "gap://"];
pub const DEEP_LINK_HOST: &str = "share";

/// A recognized command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/j <channel>`
    Join { channel: String },
    /// `/m <name> <text>`
    PrivateMessage { nickname: String, text: String },
    /// `/w` — who is around
    Who,
    /// `/channels`
    Channels,
    /// `/block <name>`
    Block { nickname: String },
    /// `/unblock <name>`
    Unblock { nickname: String },
    /// `/slap <name>`
    Slap { nickname: String },
    /// `/hug <name>`
    Hug { nickname: String },
    /// `/clear`
    Clear,
}

/// What one line of user input is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedInput {
    Command(Command),
    /// A slash line that matched no known command.
    UnknownCommand(String),
    /// Ordinary message text.
    Text(String),
}

pub fn parse_input(line: &str) -> ParsedInput {
    let trimmed = line.trim();
    if !trimmed.starts_with('/') {
        return ParsedInput::Text(trimmed.to_string());
    }

    let mut parts = trimmed.splitn(3, char::is_whitespace);
    let verb = parts.next().unwrap_or_default();
    let arg1 = parts.next().map(str::to_string);
    let rest = parts.next().map(str::to_string);

    let command = match (verb, arg1, rest) {
        ("/j", Some(channel), _) => Command::Join { channel },
        ("/m", Some(nickname), Some(text)) => Command::PrivateMessage { nickname, text },
        ("/w", None, None) => Command::Who,
        ("/channels", None, None) => Command::Channels,
        ("/block", Some(nickname), None) => Command::Block { nickname },
        ("/unblock", Some(nickname), None) => Command::Unblock { nickname },
        ("/slap", Some(nickname), None) => Command::Slap { nickname },
        ("/hug", Some(nickname), None) => Command::Hug { nickname },
        ("/clear", None, None) => Command::Clear,
        _ => return ParsedInput::UnknownCommand(verb.to_string()),
    };
    ParsedInput::Command(command)
}

/// Extract the text payload from a `bitchat://share?content=...` or
/// `gap://share?content=...` link.
pub fn parse_share_link(url: &str) -> Option<String> {
    let rest = DEEP_LINK_SCHEMES
        .iter()
        .find_map(|scheme| url.strip_prefix(scheme))?;
    let rest = rest.strip_prefix(DEEP_LINK_HOST)?;
    let query = rest.strip_prefix('?').or_else(|| {
        rest.strip_prefix('/')
            .and_then(|path| path.strip_prefix('?'))
    })?;
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("content="))
        .map(percent_decode)
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 3 <= bytes.len() => {
                let decoded = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match decoded {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
