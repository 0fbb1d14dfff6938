//! Line-oriented chat front end driving a [`ChatSessionController`].

use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::debug;

use vistachat::account::User;
use vistachat::chat::{ChatSessionController, ControllerEvent, Part};
use vistachat::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub enum SlashCommand {
    Attach(PathBuf),
    Remove,
    Draft,
    Quit,
    Help,
    Unknown(String),
}

pub struct CommandParser;

impl CommandParser {
    /// `None` for anything that is not a slash command.
    pub fn parse(input: &str) -> Option<SlashCommand> {
        let input = input.trim().strip_prefix('/')?;
        let (command, rest) = match input.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (input, ""),
        };

        Some(match command.to_lowercase().as_str() {
            "" | "help" | "h" | "?" => SlashCommand::Help,
            "attach" | "a" if !rest.is_empty() => SlashCommand::Attach(PathBuf::from(rest)),
            "attach" | "a" => SlashCommand::Unknown("/attach needs a file path".to_string()),
            "remove" | "rm" => SlashCommand::Remove,
            "draft" => SlashCommand::Draft,
            "quit" | "exit" | "q" => SlashCommand::Quit,
            other => SlashCommand::Unknown(format!("Unknown command: /{}", other)),
        })
    }
}

pub struct ChatRepl {
    controller: ChatSessionController,
    user: User,
}

impl ChatRepl {
    pub fn new(controller: ChatSessionController, user: User) -> Self {
        Self { controller, user }
    }

    pub async fn run(&mut self) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        self.print_welcome();

        loop {
            prompt(self.controller.draft().attachment().map(|a| a.file_name()));

            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = tokio::signal::ctrl_c() => None,
            };
            let Some(line) = line else {
                println!("Bye!");
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(command) = CommandParser::parse(line) {
                if self.handle_command(command).await {
                    break;
                }
                continue;
            }

            self.controller.set_input(line);
            match self.controller.submit().await {
                Ok(()) => self.stream_reply(&mut lines).await,
                Err(e) => eprintln!("Error: {}", e),
            }
        }

        Ok(())
    }

    fn print_welcome(&self) {
        println!();
        println!("VistaChat - signed in as {} <{}>", self.user.name, self.user.email);
        println!("Type a message and press Enter. /help lists commands, Ctrl-C stops a reply.");
        println!();
    }

    /// Returns true when the REPL should exit.
    async fn handle_command(&mut self, command: SlashCommand) -> bool {
        match command {
            SlashCommand::Quit => {
                println!("Bye!");
                return true;
            }
            SlashCommand::Help => print_help(),
            SlashCommand::Attach(path) => match self.controller.pick_file(&path).await {
                Ok(()) => {
                    if let Some(attachment) = self.controller.draft().attachment() {
                        println!(
                            "Attached {} ({}, {} bytes)",
                            attachment.file_name(),
                            attachment.media_type(),
                            attachment.size_bytes()
                        );
                    }
                }
                Err(e) => eprintln!("Error: {}", e),
            },
            SlashCommand::Remove => match self.controller.remove_attachment() {
                Ok(Some(removed)) => println!("Removed {}", removed.file_name()),
                Ok(None) => println!("No attachment to remove"),
                Err(e) => eprintln!("Error: {}", e),
            },
            SlashCommand::Draft => match self.controller.draft().attachment() {
                Some(attachment) => println!("Attachment: {} ({})", attachment.file_name(), attachment.media_type()),
                None => println!("No attachment"),
            },
            SlashCommand::Unknown(message) => {
                println!("{}", message);
                println!("Type /help for available commands");
            }
        }
        false
    }

    /// Prints the reply as it arrives. Ctrl-C keeps what has arrived so far.
    /// Lines typed meanwhile are dropped since the controller is busy.
    async fn stream_reply(&mut self, lines: &mut Lines<BufReader<Stdin>>) {
        println!();
        loop {
            let event = tokio::select! {
                event = self.controller.next_event() => event,
                _ = tokio::signal::ctrl_c() => {
                    self.controller.cancel();
                    println!();
                    println!("[stopped]");
                    break;
                }
                line = lines.next_line() => {
                    if let Ok(Some(line)) = line {
                        debug!("Ignoring input while busy: {:?}", line);
                    }
                    continue;
                }
            };

            match event {
                Some(event) => {
                    if render(&event) {
                        break;
                    }
                }
                None => break,
            }
        }
        println!();
    }
}

fn prompt(attachment: Option<&str>) {
    match attachment {
        Some(name) => print!("[{}] >>> ", name),
        None => print!(">>> "),
    }
    let _ = std::io::stdout().flush();
}

/// Writes one event to the terminal. Returns true once the reply is over.
fn render(event: &ControllerEvent) -> bool {
    match event {
        ControllerEvent::PartAppended { part, .. } => {
            if let Part::File { media_type, .. } = part {
                print!("[image: {}] ", media_type);
            }
            false
        }
        ControllerEvent::TextExtended { fragment, .. } => {
            print!("{}", fragment);
            let _ = std::io::stdout().flush();
            false
        }
        ControllerEvent::Completed { .. } => {
            println!();
            true
        }
        ControllerEvent::Failed { error, .. } => {
            println!();
            eprintln!("Error: {}", error);
            true
        }
    }
}

fn print_help() {
    println!();
    println!("Commands:");
    println!("  /attach <path>    - Attach an image (JPEG, PNG, GIF, WEBP up to 5 MB)");
    println!("  /remove, /rm      - Remove the attachment");
    println!("  /draft            - Show the pending attachment");
    println!("  /help, /h, /?     - Show this help");
    println!("  /quit, /exit, /q  - Exit chat");
    println!();
}
