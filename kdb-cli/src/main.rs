mod network;

use clap::{Parser, Subcommand};
use colored::*;
use network::KdbClient;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

const DEFAULT_READ_LEN: u64 = 4096;

#[derive(Parser)]
#[command(name = "kdb")]
#[command(about = "Client for the kdb block database", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Server Address
    #[arg(long, default_value = "127.0.0.1:8000")]
    host: String,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Start an interactive shell (Default)
    Shell,
    /// Write text into an object, creating it if needed
    Put {
        file_id: String,
        data: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Name recorded when the object is created (defaults to the id)
        #[arg(long)]
        name: Option<String>,
    },
    /// Read bytes from an object
    Get {
        file_id: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long, default_value_t = DEFAULT_READ_LEN)]
        length: u64,
    },
    /// Make an object read-only
    Close { file_id: String },
    /// Delete an object
    Delete { file_id: String },
}

/// One line typed into the shell.
#[derive(Debug, PartialEq)]
enum ShellLine {
    Run(Commands),
    Help,
    Exit,
    Empty,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let host = cli.host;

    match cli.command {
        Some(Commands::Shell) | None => start_repl(&host).await?,
        Some(command) => {
            let client = KdbClient::connect(&host).await?;
            run(&client, command).await?;
            client.disconnect().await;
        }
    }

    Ok(())
}

async fn run(client: &KdbClient, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Put {
            file_id,
            data,
            offset,
            name,
        } => {
            let name = name.unwrap_or_else(|| file_id.clone());
            client.put(&file_id, &name, offset, data.as_bytes()).await?;
            println!("{} wrote {} bytes to {}", "OK:".green(), data.len(), file_id);
        }
        Commands::Get {
            file_id,
            offset,
            length,
        } => {
            let data = client.get(&file_id, offset, length).await?;
            println!("{}", String::from_utf8_lossy(&data));
        }
        Commands::Close { file_id } => {
            client.close(&file_id).await?;
            println!("{} closed {}", "OK:".green(), file_id);
        }
        Commands::Delete { file_id } => {
            client.delete(&file_id).await?;
            println!("{} deleted {}", "OK:".green(), file_id);
        }
        Commands::Shell => {}
    }
    Ok(())
}

/// Shell syntax:
/// `put <id> <offset> <text...>`, `get <id> [offset] [length]`,
/// `close <id>`, `delete <id>`, `help`, `exit`.
fn parse_line(line: &str) -> Result<ShellLine, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(ShellLine::Empty);
    };

    let file_id = |word: Option<&str>| {
        word.map(str::to_string)
            .ok_or_else(|| format!("usage: {} <id> ...", verb))
    };
    let number = |word: Option<&str>, default: u64| match word {
        None => Ok(default),
        Some(w) => w.parse::<u64>().map_err(|_| format!("not a number: {}", w)),
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "exit" | "quit" => return Ok(ShellLine::Exit),
        "help" => return Ok(ShellLine::Help),
        "put" => {
            let file_id = file_id(words.next())?;
            let offset = number(words.next(), 0)?;
            let data = words.collect::<Vec<_>>().join(" ");
            if data.is_empty() {
                return Err("usage: put <id> <offset> <text>".into());
            }
            Commands::Put {
                file_id,
                data,
                offset,
                name: None,
            }
        }
        "get" => Commands::Get {
            file_id: file_id(words.next())?,
            offset: number(words.next(), 0)?,
            length: number(words.next(), DEFAULT_READ_LEN)?,
        },
        "close" => Commands::Close {
            file_id: file_id(words.next())?,
        },
        "delete" => Commands::Delete {
            file_id: file_id(words.next())?,
        },
        other => return Err(format!("unknown command: {}", other)),
    };
    Ok(ShellLine::Run(command))
}

fn print_help() {
    println!("  put <id> <offset> <text>   write text at offset");
    println!("  get <id> [offset] [len]    read bytes");
    println!("  close <id>                 make read-only");
    println!("  delete <id>                delete the object");
    println!("  exit");
}

async fn start_repl(host: &str) -> anyhow::Result<()> {
    let client = match KdbClient::connect(host).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{} {:#}", "Fatal Error:".red().bold(), e);
            return Ok(());
        }
    };

    println!(
        "{}",
        format!("Connected to {}. Type 'help' for commands, 'exit' to quit.", host).green()
    );

    let mut rl = DefaultEditor::new()?;

    loop {
        let readline = rl.readline(&format!("{} > ", "kdb".blue().bold()));
        match readline {
            Ok(line) => {
                let input = line.trim();
                let parsed = parse_line(input);
                if !input.is_empty() {
                    rl.add_history_entry(input)?;
                }

                match parsed {
                    Ok(ShellLine::Run(command)) => {
                        if let Err(e) = run(&client, command).await {
                            println!("{} {:#}", "Error:".red(), e);
                        }
                    }
                    Ok(ShellLine::Help) => print_help(),
                    Ok(ShellLine::Exit) => break,
                    Ok(ShellLine::Empty) => continue,
                    Err(msg) => println!("{} {}", "Error:".red(), msg),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                println!("Error: {:?}", err);
                break;
            }
        }
    }

    client.disconnect().await;
    Ok(())
}
