//! Line-oriented admin console.
//!
//! Reads operator commands from stdin and calls into the relay engine.
//! Output goes to stdout; the engine's logs go to stderr, so the console
//! owns the terminal. [`run`] returns when the operator quits or stdin
//! closes, after which the caller tears the relay down.

use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::node::Relay;

/// A parsed console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Add { address: String },
    Delete { peer_id: String },
    Show,
    Help,
    Quit,
    /// Known keyword missing its argument; holds the usage line.
    Usage(&'static str),
    Unknown(String),
}

/// Parse one console line. `None` for blank lines.
pub fn parse_line(line: &str) -> Option<Command> {
    let mut words = line.split_whitespace();
    let keyword = words.next()?;
    Some(match keyword {
        "add" => match words.next() {
            Some(address) => Command::Add {
                address: address.to_string(),
            },
            None => Command::Usage("add remoteIP[:remoteTcpPort]"),
        },
        "delete" => match words.next() {
            Some(peer_id) => Command::Delete {
                peer_id: peer_id.to_string(),
            },
            None => Command::Usage("delete remoteIP"),
        },
        "show" => Command::Show,
        "help" => Command::Help,
        "quit" => Command::Quit,
        other => Command::Unknown(other.to_string()),
    })
}

fn print_help() {
    println!("add remoteIP[:remoteTcpPort] : connect to a remote segment relay");
    println!("delete remoteIP              : drop the connection to remoteIP");
    println!("show                         : list current peer connections");
    println!("help                         : summarize available commands");
    println!("quit                         : shut the relay down");
}

/// Drive the console until `quit` or end of input.
pub async fn run(relay: &Relay) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("% ");
        let _ = std::io::stdout().flush();

        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => break,
        };
        let command = match parse_line(&line) {
            Some(command) => command,
            None => continue,
        };

        match command {
            Command::Add { address } => match relay.add_peer(&address).await {
                Ok(peer_id) => println!("added {peer_id}"),
                Err(e) => println!("add failed: {e:#}"),
            },
            Command::Delete { peer_id } => {
                if relay.remove_peer(&peer_id).await {
                    println!("deleted {peer_id}");
                } else {
                    println!("no such connection");
                }
            }
            Command::Show => {
                let peers = relay.peers().await;
                if peers.is_empty() {
                    println!("no connection");
                } else {
                    for (peer_id, addr) in peers {
                        println!("remote peer {peer_id} via {addr}");
                    }
                }
            }
            Command::Help => print_help(),
            Command::Usage(usage) => println!("usage: {usage}"),
            Command::Unknown(word) => {
                println!("illegal command: {word}");
                print_help();
            }
            Command::Quit => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_command() {
        assert_eq!(
            parse_line("add 10.1.2.3:24779"),
            Some(Command::Add {
                address: "10.1.2.3:24779".to_string()
            })
        );
        assert_eq!(
            parse_line("delete 10.1.2.3"),
            Some(Command::Delete {
                peer_id: "10.1.2.3".to_string()
            })
        );
        assert_eq!(parse_line("show"), Some(Command::Show));
        assert_eq!(parse_line("help"), Some(Command::Help));
        assert_eq!(parse_line("quit"), Some(Command::Quit));
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("   \t "), None);
    }

    #[test]
    fn missing_arguments_report_usage() {
        assert!(matches!(parse_line("add"), Some(Command::Usage(_))));
        assert!(matches!(parse_line("delete"), Some(Command::Usage(_))));
    }

    #[test]
    fn unknown_keyword_reported() {
        assert_eq!(
            parse_line("frobnicate now"),
            Some(Command::Unknown("frobnicate".to_string()))
        );
    }

    #[test]
    fn surrounding_whitespace_tolerated() {
        assert_eq!(
            parse_line("  add   peer-host  "),
            Some(Command::Add {
                address: "peer-host".to_string()
            })
        );
    }
}
