//! dialogd-control - CLI control utility for the dialogd daemon
//!
//! Sends directives over the daemon's line-delimited JSON ingress and prints
//! what comes back.

use chrono::Local;
use clap::{Parser, Subcommand};
use dialogd::directive::{Directive, Header};
use dialogd::ingress::{Outcome, Reply, Request};
use dialogd::message::generate_id;
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;

/// CLI control utility for the dialogd daemon
#[derive(Parser)]
#[command(name = "dialogd-control")]
#[command(version)]
#[command(about = "Control utility for the dialogd dialog daemon", long_about = None)]
struct Cli {
    /// Daemon address
    #[arg(short, long, default_value = "127.0.0.1:7878")]
    addr: String,

    /// Dialog request id to send under, a fresh one when omitted
    #[arg(short, long)]
    dialog: Option<String>,

    /// Keep printing events after the directive resolved
    #[arg(short, long)]
    follow: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Speak text using TTS
    Speak {
        /// Text to speak
        text: String,
        /// Play service the speech belongs to
        #[arg(short, long)]
        service: Option<String>,
    },

    /// Play audio from URL
    Play {
        /// URL of the stream
        url: String,
        /// Stream token, derived from the URL when omitted
        #[arg(short, long)]
        token: Option<String>,
        /// Start offset in milliseconds
        #[arg(short, long, default_value = "0")]
        offset: u64,
        #[arg(short, long)]
        service: Option<String>,
    },

    /// Pause audio playback
    Pause,

    /// Stop audio playback
    Stop,

    /// Stop speech
    Shush,

    /// Open the microphone for a follow-up utterance
    ExpectSpeech {
        /// Listening timeout in milliseconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Show a card
    Card {
        /// Template name, e.g. FullText1
        template: String,
        /// Card token
        token: String,
        /// Body text
        #[arg(long, default_value = "")]
        text: String,
    },

    /// Cancel an in-flight directive
    Cancel {
        message_id: String,
    },

    /// Print the device context
    Context,

    /// Send any directive
    Raw {
        namespace: String,
        name: String,
        /// Payload as JSON text
        #[arg(default_value = "{}")]
        payload: String,
    },

    /// Print events as they arrive
    Watch,
}

struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Connection {
    fn open(addr: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let writer = TcpStream::connect(addr)?;
        let mut connection = Self {
            reader: BufReader::new(writer.try_clone()?),
            writer,
        };
        match connection.next_reply()? {
            Some(Reply::Ready { version }) => println!("Connected to dialogd {}", version),
            other => return Err(format!("unexpected greeting: {:?}", other).into()),
        }
        Ok(connection)
    }

    fn send(&mut self, request: &Request) -> Result<(), Box<dyn std::error::Error>> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes())?;
        Ok(())
    }

    fn next_reply(&mut self) -> Result<Option<Reply>, Box<dyn std::error::Error>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(line.trim())?))
    }
}

fn print_reply(reply: &Reply) {
    let at = Local::now().format("%H:%M:%S%.3f");
    match reply {
        Reply::Event { event } => {
            println!("{} event  {} {}", at, event.full_name(), event.payload);
        }
        Reply::Result {
            message_id,
            outcome,
            description,
        } => match description {
            Some(d) => println!("{} result {} {:?}: {}", at, message_id, outcome, d),
            None => println!("{} result {} {:?}", at, message_id, outcome),
        },
        Reply::Cancel { message_id, found } => {
            if *found {
                println!("Cancelled {}", message_id);
            } else {
                println!("Nothing to cancel for {}", message_id);
            }
        }
        Reply::Context { context } => {
            println!(
                "{}",
                serde_json::to_string_pretty(context).unwrap_or_else(|_| context.to_string())
            );
        }
        Reply::Error { message } => println!("error  {}", message),
        Reply::Ready { version } => println!("ready  {}", version),
    }
}

fn directive(dialog: &str, namespace: &str, name: &str, payload: serde_json::Value) -> Directive {
    Directive::new(
        Header {
            namespace: namespace.to_string(),
            name: name.to_string(),
            message_id: generate_id(),
            dialog_request_id: dialog.to_string(),
            referrer_dialog_request_id: None,
            version: "1.0".to_string(),
        },
        payload.to_string(),
    )
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut conn = Connection::open(&cli.addr)?;
    let dialog = cli.dialog.clone().unwrap_or_else(generate_id);

    let request = match cli.command {
        Commands::Speak { text, service } => Request::Directive {
            directive: directive(
                &dialog,
                "TTS",
                "Speak",
                json!({ "token": generate_id(), "text": text, "playServiceId": service }),
            ),
        },
        Commands::Play {
            url,
            token,
            offset,
            service,
        } => {
            let token = token.unwrap_or_else(|| url.clone());
            Request::Directive {
                directive: directive(
                    &dialog,
                    "AudioPlayer",
                    "Play",
                    json!({
                        "playServiceId": service,
                        "audioItem": { "stream": {
                            "url": url,
                            "token": token,
                            "offsetInMilliseconds": offset,
                        }},
                    }),
                ),
            }
        }
        Commands::Pause => Request::Directive {
            directive: directive(&dialog, "AudioPlayer", "Pause", json!({})),
        },
        Commands::Stop => Request::Directive {
            directive: directive(&dialog, "AudioPlayer", "Stop", json!({})),
        },
        Commands::Shush => Request::Directive {
            directive: directive(&dialog, "TTS", "Stop", json!({})),
        },
        Commands::ExpectSpeech { timeout } => Request::Directive {
            directive: directive(
                &dialog,
                "ASR",
                "ExpectSpeech",
                json!({ "timeoutInMilliseconds": timeout }),
            ),
        },
        Commands::Card {
            template,
            token,
            text,
        } => Request::Directive {
            directive: directive(
                &dialog,
                "Display",
                &template,
                json!({ "token": token, "text": text }),
            ),
        },
        Commands::Cancel { message_id } => Request::Cancel { message_id },
        Commands::Context => Request::Context,
        Commands::Raw {
            namespace,
            name,
            payload,
        } => {
            let payload: serde_json::Value = serde_json::from_str(&payload)?;
            Request::Directive {
                directive: directive(&dialog, &namespace, &name, payload),
            }
        }
        Commands::Watch => {
            while let Some(reply) = conn.next_reply()? {
                print_reply(&reply);
            }
            return Ok(());
        }
    };

    let message_id = match &request {
        Request::Directive { directive } => {
            println!("Sending {} ({})", directive.namespace_and_name(), directive.message_id());
            Some(directive.message_id().to_string())
        }
        _ => None,
    };
    conn.send(&request)?;

    let mut failed = false;
    while let Some(reply) = conn.next_reply()? {
        print_reply(&reply);
        let done = match (&reply, &message_id) {
            (Reply::Result { message_id: id, outcome, .. }, Some(expected)) if id == expected => {
                failed = *outcome == Outcome::Failed;
                true
            }
            (Reply::Cancel { .. }, None) | (Reply::Context { .. }, None) => true,
            (Reply::Error { .. }, _) => {
                failed = true;
                true
            }
            _ => false,
        };
        if done && !cli.follow {
            break;
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}
