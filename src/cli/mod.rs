//! CLI commands for agentbus using clap.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::brokers::{pubsub, topic};
use crate::config::{get_settings_path, save_settings_to, BrokerKind, Settings};
use crate::protocol::{channel, ChannelAddress, Pattern};

pub mod demo;

/// agentbus - typed pub/sub routing for agents.
#[derive(Parser)]
#[command(name = "agentbus")]
#[command(version = "0.1.0")]
#[command(about = "agentbus - Typed message routing between agents over a pluggable broker", long_about = None)]
pub struct Commands {
    /// Settings file (defaults to ~/.agentbus/settings.json)
    #[arg(long, global = true, env = "AGENTBUS_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Channel codec helpers
    #[command(subcommand)]
    Channel(ChannelCommand),

    /// Check whether a channel matches a subscription pattern
    Match {
        /// Pattern, e.g. PaymentRequestMessage:*:*
        pattern: String,
        /// Concrete channel
        channel: String,
    },

    /// Show how a pattern is subscribed on each broker
    Translate {
        /// Pattern, e.g. *:*:session456
        pattern: String,
    },

    /// Run the payment request/response flow end to end
    Demo {
        /// Broker to run on (defaults to broker.kind from settings)
        #[arg(long, value_enum)]
        broker: Option<BrokerKind>,

        /// Payment amount
        #[arg(long, default_value_t = 100.0)]
        amount: f64,

        /// Paying user
        #[arg(long, default_value = "user123")]
        user: String,
    },

    /// Show effective settings
    Config {
        /// Write a default settings file if none exists
        #[arg(long)]
        init: bool,
    },
}

#[derive(Subcommand)]
pub enum ChannelCommand {
    /// Build a channel from its tokens
    Encode {
        type_name: String,
        direction: String,
        session: String,
    },
    /// Split a channel into its tokens
    Decode { channel: String },
    /// Response channel for a request channel
    Response { channel: String },
}

impl Commands {
    /// Run the command.
    pub async fn run(&self, settings: &Settings) -> Result<()> {
        match &self.command {
            Command::Channel(cmd) => cmd_channel(cmd),
            Command::Match { pattern, channel } => cmd_match(pattern, channel),
            Command::Translate { pattern } => cmd_translate(pattern),
            Command::Demo { broker, amount, user } => {
                cmd_demo(settings, *broker, *amount, user).await
            }
            Command::Config { init } => cmd_config(settings, self.config.as_ref(), *init),
        }
    }
}

// Command implementations

fn cmd_channel(cmd: &ChannelCommand) -> Result<()> {
    match cmd {
        ChannelCommand::Encode {
            type_name,
            direction,
            session,
        } => {
            println!("{}", channel::encode(type_name, direction, session)?);
        }
        ChannelCommand::Decode { channel: raw } => {
            let address = channel::decode(raw)?;
            println!("type:      {}", address.type_name);
            println!("direction: {}", address.direction);
            println!("session:   {}", address.session_id);
            if !address.is_concrete() {
                println!("(contains wildcards; usable as a pattern only)");
            }
        }
        ChannelCommand::Response { channel: raw } => {
            println!("{}", channel::response_channel(raw)?);
        }
    }
    Ok(())
}

fn cmd_match(pattern: &str, raw_channel: &str) -> Result<()> {
    let pattern = Pattern::parse(pattern)?;
    let address: ChannelAddress = raw_channel.parse()?;
    if pattern.matches(&address) {
        println!("match: {} receives {}", pattern, address);
    } else {
        println!("no match: {} does not receive {}", pattern, address);
    }
    Ok(())
}

fn cmd_translate(pattern: &str) -> Result<()> {
    let pattern = Pattern::parse(pattern)?;
    println!("pattern:     {}", pattern);
    println!("pubsub glob: {}", pubsub::to_glob(&pattern));
    println!("topic key:   {}", topic::to_binding_key(&pattern));
    Ok(())
}

async fn cmd_demo(
    settings: &Settings,
    broker: Option<BrokerKind>,
    amount: f64,
    user: &str,
) -> Result<()> {
    let mut settings = settings.clone();
    if let Some(kind) = broker {
        settings.broker.kind = kind;
    }

    println!("Running payment demo on the {} broker...", settings.broker.kind);
    let report = demo::run(
        &settings,
        demo::PaymentRequestMessage {
            amount,
            user_id: user.to_string(),
            payment_method: "credit_card".to_string(),
        },
    )
    .await?;

    println!("\nRequest channel: {}", report.request_channel);
    println!("Response channel: {}", report.response_context.channel);
    println!(
        "Response: {} {} for {} ({:.2})",
        report.response.transaction_id,
        report.response.status,
        report.response.user_id,
        report.response.amount
    );
    println!("\nDispatch stats ({}):", report.adapter);
    println!(
        "  received={} delivered={} handlers={} failures={} dropped={}",
        report.stats.received,
        report.stats.delivered,
        report.stats.handler_invocations,
        report.stats.handler_failures,
        report.stats.routing_errors()
    );
    Ok(())
}

fn cmd_config(settings: &Settings, path: Option<&PathBuf>, init: bool) -> Result<()> {
    let path = match path {
        Some(p) => p.clone(),
        None => get_settings_path()?,
    };

    if init {
        if path.exists() {
            println!("Settings already exist at {}", path.display());
        } else {
            save_settings_to(&Settings::default(), &path)?;
            println!("Wrote default settings to {}", path.display());
        }
        return Ok(());
    }

    println!("# {}", path.display());
    println!("{}", serde_json::to_string_pretty(settings)?);
    Ok(())
}
