//! Console stand-in for a game server.
//!
//! Reads lines from stdin and prints relayed messages to stdout.
//!
//! ```text
//! Steve: hello §lworld     chat line, legacy codes allowed
//! /join Steve
//! /leave Steve
//! /death Steve Steve fell from a high place
//! /advancement Steve challenge Into Fire
//! /relay stop              pause relaying
//! /relay start
//! ```

use std::io::IsTerminal;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{AdvancementFrame, DisplayKind, DisplayRequest, GameEvent};
use crate::bridge::RelayHandle;
use crate::common::shutdown::wait_for_shutdown;
use crate::common::types::{RichText, Style, TextSegment, UserRef};
use crate::format::{from_legacy, to_legacy};

#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Event(GameEvent),
    SetEnabled(bool),
}

/// Parse one console line. Blank and unrecognised lines yield `Err`
/// with a usage hint.
pub fn parse_console_line(line: &str) -> Result<ConsoleCommand, String> {
    let line = line.trim();
    if line.is_empty() {
        return Err(String::new());
    }

    let Some(command) = line.strip_prefix('/') else {
        let Some((name, text)) = line.split_once(':') else {
            return Err("Chat lines look like 'name: text'".to_string());
        };
        let (name, text) = (name.trim(), text.trim_start());
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(format!("Invalid player name '{}'", name));
        }
        return Ok(ConsoleCommand::Event(GameEvent::chat(name, from_legacy(text))));
    };

    let mut parts = command.splitn(2, ' ');
    let verb = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default().trim();
    let (player, tail) = match rest.split_once(' ') {
        Some((player, tail)) => (player, tail.trim()),
        None => (rest, ""),
    };

    match verb {
        "join" | "leave" if !player.is_empty() => {
            let player = UserRef::player(player);
            Ok(ConsoleCommand::Event(if verb == "join" {
                GameEvent::Joined { player }
            } else {
                GameEvent::Left { player }
            }))
        }
        "death" if !player.is_empty() => Ok(ConsoleCommand::Event(GameEvent::Death {
            message: if tail.is_empty() {
                format!("{} died", player)
            } else {
                tail.to_string()
            },
            player: UserRef::player(player),
        })),
        "advancement" => {
            let (frame, title) = tail.split_once(' ').unwrap_or((tail, ""));
            match AdvancementFrame::parse(frame) {
                Some(frame) if !player.is_empty() && !title.trim().is_empty() => {
                    Ok(ConsoleCommand::Event(GameEvent::Advancement {
                        player: UserRef::player(player),
                        title: title.trim().to_string(),
                        frame,
                    }))
                }
                _ => Err("Usage: /advancement <player> <task|goal|challenge> <title>".to_string()),
            }
        }
        "relay" => match rest {
            "stop" => Ok(ConsoleCommand::SetEnabled(false)),
            "start" => Ok(ConsoleCommand::SetEnabled(true)),
            _ => Err("Usage: /relay <stop|start>".to_string()),
        },
        _ => Err(format!("Unknown command '/{}'", verb)),
    }
}

/// Render a display request as one output line.
///
/// `ansi` selects terminal escape codes, otherwise legacy codes are kept.
pub fn render_display(request: &DisplayRequest, ansi: bool) -> String {
    let mut text = match request.kind {
        DisplayKind::SystemNotice => RichText::plain("[relay] "),
        DisplayKind::Relayed => RichText::new(),
    };
    text.append(request.text.clone());
    if request.untranslated {
        text.push(TextSegment::plain(" (untranslated)"));
    }

    if ansi {
        to_ansi(&text)
    } else {
        to_legacy(&text)
    }
}

fn to_ansi(text: &RichText) -> String {
    let mut out = String::new();
    for segment in text.segments() {
        let codes = ansi_codes(&segment.style);
        if codes.is_empty() {
            out.push_str(&segment.content);
        } else {
            out.push_str(&format!("\x1b[{}m{}\x1b[0m", codes.join(";"), segment.content));
        }
    }
    out
}

fn ansi_codes(style: &Style) -> Vec<&'static str> {
    let mut codes = Vec::new();
    if style.bold || style.mention_of.is_some() {
        codes.push("1");
    }
    if style.italic {
        codes.push("3");
    }
    if style.underline {
        codes.push("4");
    }
    if style.strikethrough {
        codes.push("9");
    }
    codes
}

/// Run the console until stdin closes or shutdown is signalled.
pub async fn run_console(
    handle: RelayHandle,
    mut display_rx: mpsc::UnboundedReceiver<DisplayRequest>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let ansi = std::io::stdout().is_terminal();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut stdin_open = true;

    info!("Console ready. Type 'name: message' to chat.");

    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown_rx) => break,
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match parse_console_line(&line) {
                    Ok(ConsoleCommand::Event(event)) => handle.game_event(event),
                    Ok(ConsoleCommand::SetEnabled(enabled)) => handle.set_enabled(enabled),
                    Err(hint) if hint.is_empty() => {}
                    Err(hint) => warn!("{}", hint),
                },
                Ok(None) => {
                    debug!("Console input closed");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!("Failed to read console input: {}", e);
                    stdin_open = false;
                }
            },
            request = display_rx.recv() => match request {
                Some(request) => {
                    let line = render_display(&request, ansi) + "\n";
                    if let Err(e) = stdout.write_all(line.as_bytes()).await {
                        warn!("Failed to write to console: {}", e);
                    }
                    let _ = stdout.flush().await;
                }
                None => break,
            },
        }
    }
}
